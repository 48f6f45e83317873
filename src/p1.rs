//! P1 ASCII telegram decoding.
//!
//! ```text
//! /ELL5\253833635_A
//!
//! 0-0:1.0.0(210217184019W)
//! 1-0:1.8.0(00006678.394*kWh)
//! 1-0:1.7.0(0001.727*kW)
//! ...
//! !7945
//! ```
//!
//! The CRC-16/IBM after `!` covers everything from `/` through `!`.

use chrono::NaiveDateTime;
use log::debug;

use crate::crc16;
use crate::error::DecodeError;
use crate::meter::{DecodedField, RawValue};
use crate::obis::{ObisCode, Quantity, QuantityKind, Unit};

pub const START: u8 = b'/';
pub const END: u8 = b'!';

/// Validates a telegram (from `/` through the checksum line) and returns
/// the fields for every recognised line.
pub fn decode_telegram(telegram: &[u8]) -> Result<Vec<DecodedField>, DecodeError> {
    if telegram.first() != Some(&START) {
        return Err(DecodeError::structure("telegram does not start with '/'"));
    }
    let bang = telegram
        .iter()
        .position(|&b| b == END)
        .ok_or_else(|| DecodeError::structure("telegram has no end marker"))?;

    let checksum_line = std::str::from_utf8(&telegram[bang + 1..])
        .map_err(|_| DecodeError::structure("checksum line is not ASCII"))?
        .trim();
    if checksum_line.len() != 4 {
        return Err(DecodeError::structure(format!(
            "expected 4 hex digit checksum, got {:?}",
            checksum_line
        )));
    }
    let expected = u16::from_str_radix(checksum_line, 16)
        .map_err(|_| DecodeError::structure(format!("bad checksum {:?}", checksum_line)))?;
    let calculated = crc16::ibm(&telegram[..=bang]);
    if expected != calculated {
        return Err(DecodeError::ChecksumMismatch {
            expected,
            calculated,
        });
    }

    let text = std::str::from_utf8(&telegram[1..bang])
        .map_err(|_| DecodeError::structure("telegram is not ASCII"))?;
    let mut lines = text.lines();

    let mut fields = Vec::new();
    if let Some(ident) = lines.next().map(str::trim).filter(|l| !l.is_empty()) {
        fields.push(DecodedField::new(
            Quantity::MeterType,
            RawValue::Text(ident.to_string()),
            0,
            Unit::None,
        ));
    }
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(field) = parse_obis_line(trimmed) {
            fields.push(field);
        }
    }
    Ok(fields)
}

/// Unit assumed when a line carries none. P1 meters report power and
/// energy in kilo units.
fn default_unit(quantity: Quantity) -> Unit {
    match quantity.default_unit() {
        Unit::Watt => Unit::KiloWatt,
        Unit::Var => Unit::KiloVar,
        Unit::WattHour => Unit::KiloWattHour,
        Unit::VarHour => Unit::KiloVarHour,
        unit => unit,
    }
}

/// Parse a single OBIS data line like `1-0:1.8.0(0011404.409*kWh)`.
/// Labels are looked up in the OBIS registry; unknown ones yield `None`.
fn parse_obis_line(line: &str) -> Option<DecodedField> {
    let (raw_code, raw_value) = match (line.find('('), line.find(')')) {
        (Some(open), Some(close)) if open < close => (&line[..open], &line[open + 1..close]),
        _ => return None,
    };

    let quantity = match raw_code.parse::<ObisCode>().map(Quantity::from_obis) {
        Ok(Quantity::Unmapped(_)) | Err(_) => {
            debug!("Ignoring OBIS code: {}", raw_code);
            return None;
        }
        Ok(quantity) => quantity,
    };

    let (value, unit_token) = match raw_value.split_once('*') {
        Some((value, unit)) => (value.trim(), Some(unit.trim())),
        None => (raw_value.trim(), None),
    };

    match quantity.kind() {
        QuantityKind::DateTime => {
            return match parse_timestamp(value) {
                Some(ts) => Some(DecodedField::new(quantity, RawValue::DateTime(ts), 0, Unit::None)),
                None => {
                    debug!("Unparseable timestamp {:?} on {}", value, raw_code);
                    None
                }
            };
        }
        QuantityKind::Identification => {
            return Some(DecodedField::new(
                quantity,
                RawValue::Text(value.to_string()),
                0,
                Unit::None,
            ));
        }
        _ => {}
    }

    let unit = unit_token
        .and_then(Unit::from_p1_token)
        .unwrap_or_else(|| default_unit(quantity));
    match parse_decimal(value) {
        Some((mantissa, exponent)) => Some(DecodedField::new(
            quantity,
            RawValue::Integer(mantissa),
            exponent,
            unit,
        )),
        None => {
            debug!("Unparseable value {:?} on {}", value, raw_code);
            None
        }
    }
}

/// Splits `01.500` into mantissa 1500 and exponent -3. Integers get
/// exponent 0.
fn parse_decimal(value: &str) -> Option<(i64, i8)> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let exponent = -i8::try_from(frac_part.len()).ok()?;
    let mantissa: i64 = format!("{}{}", int_part, frac_part).parse().ok()?;
    Some((if negative { -mantissa } else { mantissa }, exponent))
}

/// `YYMMDDhhmmssX` where X is the DST flag (W winter, S summer).
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let digits = value.get(..12)?;
    NaiveDateTime::parse_from_str(digits, "%y%m%d%H%M%S").ok()
}

/// Appends the CRC line to a telegram body ending in `!`.
#[cfg(test)]
pub(crate) fn with_checksum(body: &str) -> String {
    format!("{}{:04X}\r\n", body, crc16::ibm(body.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
/ELL5\\253833635_A\r\n\
\r\n\
0-0:1.0.0(210217184019W)\r\n\
1-0:1.8.0(00006678.394*kWh)\r\n\
1-0:2.8.0(00000000.000*kWh)\r\n\
1-0:1.7.0(0001.727*kW)\r\n\
1-0:21.7.0(0001.023*kW)\r\n\
1-0:32.7.0(240.3*V)\r\n\
1-0:31.7.0(004.2*A)\r\n\
0-0:96.13.0(free text)\r\n\
!";

    fn get(fields: &[DecodedField], q: Quantity) -> &DecodedField {
        fields.iter().find(|f| f.quantity == q).unwrap()
    }

    #[test]
    fn parse_power_line() {
        let f = parse_obis_line("1-0:1.7.0(01.500*kW)").unwrap();
        assert_eq!(f.quantity, Quantity::ActivePowerImport);
        assert_eq!(f.raw, RawValue::Integer(1500));
        assert_eq!(f.scale_exponent, -3);
        assert_eq!(f.unit, Unit::KiloWatt);
        assert!((f.scaled_number().unwrap() - 1.5).abs() < 0.001);
    }

    #[test]
    fn parse_consumption_total() {
        let f = parse_obis_line("1-0:1.8.0*255(0002686.675*kWh)").unwrap();
        assert_eq!(f.quantity, Quantity::ActiveEnergyImport);
        assert!((f.scaled_number().unwrap() - 2686.675).abs() < 0.001);
    }

    #[test]
    fn parse_voltage() {
        let f = parse_obis_line("1-0:52.7.0*255(233.2*V)").unwrap();
        assert_eq!(f.quantity, Quantity::VoltageL2);
        assert_eq!(f.unit, Unit::Volt);
        assert!((f.scaled_number().unwrap() - 233.2).abs() < 0.01);
    }

    #[test]
    fn missing_unit_uses_label_default() {
        let f = parse_obis_line("1-0:31.7.0(12)").unwrap();
        assert_eq!(f.unit, Unit::Ampere);
        assert_eq!(f.raw, RawValue::Integer(12));
        assert_eq!(f.scale_exponent, 0);
    }

    #[test]
    fn parse_timestamp_line() {
        let f = parse_obis_line("0-0:1.0.0(210217184019W)").unwrap();
        match f.raw {
            RawValue::DateTime(ts) => assert_eq!(ts.to_string(), "2021-02-17 18:40:19"),
            other => panic!("expected timestamp, got {:?}", other),
        }
    }

    #[test]
    fn unknown_code_ignored() {
        assert!(parse_obis_line("0-0:C.1.6*255(FDF5)").is_none());
        assert!(parse_obis_line("0-0:96.13.0(hello)").is_none());
    }

    #[test]
    fn labels_resolve_through_registry() {
        for (label, quantity, unit) in [
            ("1-0:3.7.0(0000.120)", Quantity::ReactivePowerImport, Unit::KiloVar),
            ("1-0:2.8.0(00000012.000)", Quantity::ActiveEnergyExport, Unit::KiloWattHour),
            ("1-0:4.8.0*255(1)", Quantity::ReactiveEnergyExport, Unit::KiloVarHour),
            ("1-0:14.7.0(49.98)", Quantity::Frequency, Unit::Hertz),
            ("1-1:32.7.0(230.1)", Quantity::VoltageL1, Unit::Volt),
        ] {
            let f = parse_obis_line(label).unwrap();
            assert_eq!(f.quantity, quantity, "{}", label);
            assert_eq!(f.unit, unit, "{}", label);
        }
    }

    #[test]
    fn identification_line_is_text() {
        let f = parse_obis_line("0-0:96.1.0(4530303435303033)").unwrap();
        assert_eq!(f.quantity, Quantity::MeterId);
        assert_eq!(f.raw, RawValue::Text("4530303435303033".into()));
    }

    #[test]
    fn malformed_line_ignored() {
        assert!(parse_obis_line("garbage without parens").is_none());
        assert!(parse_obis_line("1-0:1.7.0(abc*kW)").is_none());
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(parse_decimal("01.500"), Some((1500, -3)));
        assert_eq!(parse_decimal("240"), Some((240, 0)));
        assert_eq!(parse_decimal("-0.5"), Some((-5, -1)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("1.2.3"), None);
    }

    #[test]
    fn decode_full_telegram() {
        let telegram = with_checksum(BODY);
        let fields = decode_telegram(telegram.as_bytes()).unwrap();
        assert_eq!(fields.len(), 8);
        assert_eq!(
            get(&fields, Quantity::MeterType).raw,
            RawValue::Text("ELL5\\253833635_A".into())
        );
        let power = get(&fields, Quantity::ActivePowerImport);
        assert!((power.scaled_number().unwrap() - 1.727).abs() < 0.0001);
        assert!((get(&fields, Quantity::CurrentL1).scaled_number().unwrap() - 4.2).abs() < 0.001);
        assert!(matches!(get(&fields, Quantity::MeterClock).raw, RawValue::DateTime(_)));
    }

    #[test]
    fn checksum_mismatch_rejects_telegram() {
        let telegram = with_checksum(BODY).replace("0001.727", "0001.728");
        assert!(matches!(
            decode_telegram(telegram.as_bytes()),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_checksum_is_rejected() {
        let telegram = format!("{}\r\n", BODY);
        assert!(matches!(
            decode_telegram(telegram.as_bytes()),
            Err(DecodeError::UnknownStructure(_))
        ));
    }

    #[test]
    fn lowercase_checksum_accepted() {
        let telegram = with_checksum(BODY).to_lowercase();
        // Lower-casing changes the body too, so recompute over the new body.
        let body = &telegram[..telegram.find('!').unwrap() + 1];
        let fixed = format!("{}{:04x}\r\n", body, crc16::ibm(body.as_bytes()));
        assert!(decode_telegram(fixed.as_bytes()).is_ok());
    }
}
