use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;

use crate::obis::{ObisCode, Quantity, Unit};

/// Structural layout of the meter's telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeterVariant {
    /// Array of register structures carrying OBIS code, value and scaler (Aidon-style).
    VariantA,
    /// Structure of alternating OBIS code / value pairs (Kamstrup-style).
    VariantB,
    /// Structure of bare values identified by position (Kaifa-style).
    VariantC,
    /// Line-oriented ASCII telegram.
    P1Ascii,
}

impl fmt::Display for MeterVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MeterVariant::VariantA => "register array (A)",
            MeterVariant::VariantB => "code/value pairs (B)",
            MeterVariant::VariantC => "positional list (C)",
            MeterVariant::P1Ascii => "P1 ASCII",
        };
        f.write_str(s)
    }
}

/// A value as it came off the wire, before scaling.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Integer(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    Octets(Vec<u8>),
}

/// Which copy of a quantity a field is, when a list reports it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrigin {
    Instantaneous,
    ListCopy,
}

/// One quantity extracted from a validated frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub quantity: Quantity,
    pub raw: RawValue,
    /// Power-of-ten exponent applied to numeric raw values.
    pub scale_exponent: i8,
    pub unit: Unit,
    pub origin: FieldOrigin,
}

impl DecodedField {
    pub fn new(quantity: Quantity, raw: RawValue, scale_exponent: i8, unit: Unit) -> Self {
        DecodedField {
            quantity,
            raw,
            scale_exponent,
            unit,
            origin: FieldOrigin::Instantaneous,
        }
    }

    /// The numeric value with the wire exponent applied, if numeric.
    pub fn scaled_number(&self) -> Option<f64> {
        let raw = match self.raw {
            RawValue::Integer(v) => v as f64,
            RawValue::Float(v) => v,
            _ => return None,
        };
        Some(apply_exponent(raw, self.scale_exponent))
    }
}

/// Multiplies by 10^exp. Negative exponents divide so that values such as
/// 1500 × 10^-3 come out exact.
pub fn apply_exponent(value: f64, exp: i8) -> f64 {
    if exp >= 0 {
        value * 10f64.powi(exp as i32)
    } else {
        value / 10f64.powi(-(exp as i32))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MeasuredValue {
    Number(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub quantity: Quantity,
    pub obis: ObisCode,
    pub value: MeasuredValue,
    pub unit: Unit,
}

impl Measurement {
    pub fn number(&self) -> Option<f64> {
        match self.value {
            MeasuredValue::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.value {
            MeasuredValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// All measurements from one telegram. Built only by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSet {
    variant: MeterVariant,
    captured_at: DateTime<Local>,
    measurements: Vec<Measurement>,
}

impl MeasurementSet {
    pub(crate) fn new(
        variant: MeterVariant,
        captured_at: DateTime<Local>,
        measurements: Vec<Measurement>,
    ) -> Self {
        MeasurementSet {
            variant,
            captured_at,
            measurements,
        }
    }

    pub fn variant(&self) -> MeterVariant {
        self.variant
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn get(&self, quantity: Quantity) -> Option<&Measurement> {
        self.measurements.iter().find(|m| m.quantity == quantity)
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Identity of the meter, if the telegram carried identification fields.
    pub fn meter_info(&self) -> Option<MeterInfo> {
        let text = |q| self.get(q).and_then(|m| m.text()).map(str::to_string);
        let meter_id = text(Quantity::MeterId);
        let meter_type = text(Quantity::MeterType);
        if meter_id.is_none() && meter_type.is_none() {
            return None;
        }
        let list_version = text(Quantity::ListVersion).unwrap_or_default();
        let meter_type = meter_type.unwrap_or_default();
        let manufacturer = manufacturer_of(self.variant, &list_version, &meter_type);
        Some(MeterInfo {
            manufacturer,
            meter_type,
            list_version,
            meter_id: meter_id.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeterInfo {
    pub manufacturer: String,
    pub meter_type: String,
    pub list_version: String,
    pub meter_id: String,
}

impl MeterInfo {
    pub fn unique_id(&self) -> String {
        format!("{}-{}-{}", self.manufacturer, self.meter_type, self.meter_id).to_lowercase()
    }
}

// Binary list versions are prefixed by the manufacturer ("AIDON_V0001",
// "Kamstrup_V0001", "KFM_001"); P1 identification lines start with the
// three letter flag id ("ELL5\253833635_A").
fn manufacturer_of(variant: MeterVariant, list_version: &str, meter_type: &str) -> String {
    match variant {
        MeterVariant::P1Ascii => meter_type.chars().take(3).collect(),
        _ => list_version
            .split('_')
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}
