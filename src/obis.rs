//! OBIS codes, the quantity registry and units.
//!
//! Both wire formats name their values with OBIS codes. The binary format
//! carries them as 6-byte octet strings; P1 telegrams spell them as text
//! labels. Both map into [`Quantity`], which is what consumers see.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A six-group OBIS identifier `A-B:C.D.E.F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObisCode(pub [u8; 6]);

impl ObisCode {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        ObisCode([a, b, c, d, e, f])
    }

    /// Reads an OBIS code from a 6-byte octet string.
    pub fn from_octets(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(ObisCode)
    }

    /// The code with the billing-period group (F) forced to 255, which is how
    /// the registry keys its entries.
    pub fn without_billing_period(self) -> Self {
        let mut g = self.0;
        g[5] = 255;
        ObisCode(g)
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{}-{}:{}.{}.{}.{}", a, b, c, d, e, g)
    }
}

impl Serialize for ObisCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parses `A-B:C.D.E`, `A-B:C.D.E.F` and `A-B:C.D.E*F`.
impl FromStr for ObisCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (medium, rest) = s.split_once('-').ok_or_else(|| format!("missing '-': {}", s))?;
        let (channel, rest) = rest
            .split_once(':')
            .ok_or_else(|| format!("missing ':': {}", s))?;

        let mut groups = vec![medium, channel];
        let (cde, f) = match rest.split_once('*') {
            Some((cde, f)) => (cde, Some(f)),
            None => (rest, None),
        };
        groups.extend(cde.split('.'));
        if let Some(f) = f {
            groups.push(f);
        }
        if groups.len() == 5 {
            groups.push("255");
        }
        if groups.len() != 6 {
            return Err(format!("expected 5 or 6 groups: {}", s));
        }

        let mut out = [0u8; 6];
        for (slot, g) in out.iter_mut().zip(&groups) {
            *slot = g
                .trim()
                .parse()
                .map_err(|_| format!("bad group {:?} in {}", g, s))?;
        }
        Ok(ObisCode(out))
    }
}

/// Physical unit of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "kW")]
    KiloWatt,
    #[serde(rename = "var")]
    Var,
    #[serde(rename = "kvar")]
    KiloVar,
    #[serde(rename = "Wh")]
    WattHour,
    #[serde(rename = "kWh")]
    KiloWattHour,
    #[serde(rename = "varh")]
    VarHour,
    #[serde(rename = "kvarh")]
    KiloVarHour,
    #[serde(rename = "A")]
    Ampere,
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "Hz")]
    Hertz,
    #[serde(rename = "")]
    None,
}

impl Unit {
    /// Maps a DLMS unit enumeration value (IEC 62056-62 table).
    pub fn from_dlms(code: u8) -> Option<Self> {
        match code {
            27 => Some(Unit::Watt),
            29 => Some(Unit::Var),
            30 => Some(Unit::WattHour),
            32 => Some(Unit::VarHour),
            33 => Some(Unit::Ampere),
            35 => Some(Unit::Volt),
            44 => Some(Unit::Hertz),
            255 => Some(Unit::None),
            _ => None,
        }
    }

    /// Maps a P1 unit token such as `kWh`. Case-insensitive, since meters
    /// disagree on `kvar` vs `kVAr`.
    pub fn from_p1_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "w" => Some(Unit::Watt),
            "kw" => Some(Unit::KiloWatt),
            "var" => Some(Unit::Var),
            "kvar" => Some(Unit::KiloVar),
            "wh" => Some(Unit::WattHour),
            "kwh" => Some(Unit::KiloWattHour),
            "varh" => Some(Unit::VarHour),
            "kvarh" => Some(Unit::KiloVarHour),
            "a" => Some(Unit::Ampere),
            "v" => Some(Unit::Volt),
            "hz" => Some(Unit::Hertz),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::Watt => "W",
            Unit::KiloWatt => "kW",
            Unit::Var => "var",
            Unit::KiloVar => "kvar",
            Unit::WattHour => "Wh",
            Unit::KiloWattHour => "kWh",
            Unit::VarHour => "varh",
            Unit::KiloVarHour => "kvarh",
            Unit::Ampere => "A",
            Unit::Volt => "V",
            Unit::Hertz => "Hz",
            Unit::None => "",
        };
        f.write_str(s)
    }
}

/// Broad class of a quantity. Decides whether the configured scale factor
/// applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityKind {
    Power,
    Current,
    Energy,
    Voltage,
    Frequency,
    DateTime,
    Identification,
    Other,
}

impl QuantityKind {
    pub fn is_scalable(self) -> bool {
        matches!(
            self,
            QuantityKind::Power | QuantityKind::Current | QuantityKind::Energy
        )
    }
}

/// Registry of the quantities this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    ListVersion,
    MeterId,
    MeterType,
    MeterClock,
    ActivePowerImport,
    ActivePowerExport,
    ReactivePowerImport,
    ReactivePowerExport,
    ActivePowerImportL1,
    ActivePowerExportL1,
    ActivePowerImportL2,
    ActivePowerExportL2,
    ActivePowerImportL3,
    ActivePowerExportL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    VoltageL1,
    VoltageL2,
    VoltageL3,
    Frequency,
    ActiveEnergyImport,
    ActiveEnergyExport,
    ReactiveEnergyImport,
    ReactiveEnergyExport,
    /// A code not in the registry, kept so meter extensions stay visible.
    Unmapped(ObisCode),
}

/// Registry entries keyed by OBIS code with F = 255.
const REGISTRY: &[(ObisCode, Quantity)] = &[
    (ObisCode::new(1, 1, 0, 2, 129, 255), Quantity::ListVersion),
    (ObisCode::new(0, 0, 96, 1, 0, 255), Quantity::MeterId),
    (ObisCode::new(0, 0, 96, 1, 7, 255), Quantity::MeterType),
    (ObisCode::new(0, 0, 1, 0, 0, 255), Quantity::MeterClock),
    (ObisCode::new(1, 0, 1, 7, 0, 255), Quantity::ActivePowerImport),
    (ObisCode::new(1, 0, 2, 7, 0, 255), Quantity::ActivePowerExport),
    (ObisCode::new(1, 0, 3, 7, 0, 255), Quantity::ReactivePowerImport),
    (ObisCode::new(1, 0, 4, 7, 0, 255), Quantity::ReactivePowerExport),
    (ObisCode::new(1, 0, 21, 7, 0, 255), Quantity::ActivePowerImportL1),
    (ObisCode::new(1, 0, 22, 7, 0, 255), Quantity::ActivePowerExportL1),
    (ObisCode::new(1, 0, 41, 7, 0, 255), Quantity::ActivePowerImportL2),
    (ObisCode::new(1, 0, 42, 7, 0, 255), Quantity::ActivePowerExportL2),
    (ObisCode::new(1, 0, 61, 7, 0, 255), Quantity::ActivePowerImportL3),
    (ObisCode::new(1, 0, 62, 7, 0, 255), Quantity::ActivePowerExportL3),
    (ObisCode::new(1, 0, 31, 7, 0, 255), Quantity::CurrentL1),
    (ObisCode::new(1, 0, 51, 7, 0, 255), Quantity::CurrentL2),
    (ObisCode::new(1, 0, 71, 7, 0, 255), Quantity::CurrentL3),
    (ObisCode::new(1, 0, 32, 7, 0, 255), Quantity::VoltageL1),
    (ObisCode::new(1, 0, 52, 7, 0, 255), Quantity::VoltageL2),
    (ObisCode::new(1, 0, 72, 7, 0, 255), Quantity::VoltageL3),
    (ObisCode::new(1, 0, 14, 7, 0, 255), Quantity::Frequency),
    (ObisCode::new(1, 0, 1, 8, 0, 255), Quantity::ActiveEnergyImport),
    (ObisCode::new(1, 0, 2, 8, 0, 255), Quantity::ActiveEnergyExport),
    (ObisCode::new(1, 0, 3, 8, 0, 255), Quantity::ReactiveEnergyImport),
    (ObisCode::new(1, 0, 4, 8, 0, 255), Quantity::ReactiveEnergyExport),
    // Alternate identification codes used by pair-list meters.
    (ObisCode::new(1, 0, 0, 0, 5, 255), Quantity::MeterId),
    (ObisCode::new(1, 0, 96, 1, 1, 255), Quantity::MeterType),
];

impl Quantity {
    /// Looks up a binary-format OBIS code. Some meters send B = 1 instead
    /// of B = 0 for the electricity channel, so that is tried as well.
    pub fn from_obis(code: ObisCode) -> Self {
        let key = code.without_billing_period();
        if let Some(q) = lookup(key) {
            return q;
        }
        let [a, b, c, d, e, f] = key.0;
        if a == 1 && b == 1 {
            if let Some(q) = lookup(ObisCode::new(1, 0, c, d, e, f)) {
                return q;
            }
        }
        Quantity::Unmapped(code)
    }

    /// The registry code for this quantity.
    pub fn obis(self) -> ObisCode {
        match self {
            Quantity::Unmapped(code) => code,
            q => REGISTRY
                .iter()
                .find(|(_, r)| *r == q)
                .map(|(code, _)| *code)
                .unwrap_or(ObisCode([0; 6])),
        }
    }

    pub fn kind(self) -> QuantityKind {
        use Quantity::*;
        match self {
            ListVersion | MeterId | MeterType => QuantityKind::Identification,
            MeterClock => QuantityKind::DateTime,
            ActivePowerImport | ActivePowerExport | ReactivePowerImport
            | ReactivePowerExport | ActivePowerImportL1 | ActivePowerExportL1
            | ActivePowerImportL2 | ActivePowerExportL2 | ActivePowerImportL3
            | ActivePowerExportL3 => QuantityKind::Power,
            CurrentL1 | CurrentL2 | CurrentL3 => QuantityKind::Current,
            VoltageL1 | VoltageL2 | VoltageL3 => QuantityKind::Voltage,
            Frequency => QuantityKind::Frequency,
            ActiveEnergyImport | ActiveEnergyExport | ReactiveEnergyImport
            | ReactiveEnergyExport => QuantityKind::Energy,
            Unmapped(_) => QuantityKind::Other,
        }
    }

    /// Unit used when the binary format carries none.
    pub fn default_unit(self) -> Unit {
        use Quantity::*;
        match self {
            ReactivePowerImport | ReactivePowerExport => Unit::Var,
            ReactiveEnergyImport | ReactiveEnergyExport => Unit::VarHour,
            ActiveEnergyImport | ActiveEnergyExport => Unit::WattHour,
            Frequency => Unit::Hertz,
            _ => match self.kind() {
                QuantityKind::Power => Unit::Watt,
                QuantityKind::Current => Unit::Ampere,
                QuantityKind::Voltage => Unit::Volt,
                _ => Unit::None,
            },
        }
    }

    /// Stable snake_case name used in JSON output.
    pub fn key(self) -> String {
        use Quantity::*;
        let s = match self {
            ListVersion => "list_version",
            MeterId => "meter_id",
            MeterType => "meter_type",
            MeterClock => "meter_clock",
            ActivePowerImport => "active_power_import",
            ActivePowerExport => "active_power_export",
            ReactivePowerImport => "reactive_power_import",
            ReactivePowerExport => "reactive_power_export",
            ActivePowerImportL1 => "active_power_import_l1",
            ActivePowerExportL1 => "active_power_export_l1",
            ActivePowerImportL2 => "active_power_import_l2",
            ActivePowerExportL2 => "active_power_export_l2",
            ActivePowerImportL3 => "active_power_import_l3",
            ActivePowerExportL3 => "active_power_export_l3",
            CurrentL1 => "current_l1",
            CurrentL2 => "current_l2",
            CurrentL3 => "current_l3",
            VoltageL1 => "voltage_l1",
            VoltageL2 => "voltage_l2",
            VoltageL3 => "voltage_l3",
            Frequency => "frequency",
            ActiveEnergyImport => "active_energy_import",
            ActiveEnergyExport => "active_energy_export",
            ReactiveEnergyImport => "reactive_energy_import",
            ReactiveEnergyExport => "reactive_energy_export",
            Unmapped(code) => return format!("unmapped_{}", code),
        };
        s.to_string()
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

fn lookup(key: ObisCode) -> Option<Quantity> {
    REGISTRY
        .iter()
        .find(|(code, _)| *code == key)
        .map(|(_, q)| *q)
}
