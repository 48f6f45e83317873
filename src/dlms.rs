//! DLMS/COSEM data-notification decoding.
//!
//! The information field of a HAN frame is a data-notification APDU:
//!
//! ```text
//! 0x0F | invoke-id-and-priority(4) | date-time (optional) | notification body
//! ```
//!
//! The body is A-XDR encoded `Data`: a tag byte followed by a fixed-size
//! value, or by a length/element count and the content. Arrays and
//! structures nest. Which list layout a meter uses is not announced in the
//! frame, so the layout is inferred from the shape of the body and then
//! held per connection (see [`MeterVariant`]).

use chrono::{NaiveDate, NaiveDateTime};
use log::debug;
use nom::bytes::complete::take;
use nom::error::{ErrorKind, ParseError};
use nom::number::complete::{
    be_f32, be_f64, be_i16, be_i32, be_i64, be_i8, be_u16, be_u32, be_u64, be_u8,
};
use nom::IResult;

use crate::error::DecodeError;
use crate::meter::{DecodedField, FieldOrigin, MeterVariant, RawValue};
use crate::obis::{ObisCode, Quantity, QuantityKind, Unit};

const DATA_NOTIFICATION: u8 = 0x0F;
const DATE_TIME_LEN: usize = 12;
const MAX_DEPTH: usize = 16;

const TAG_NULL: u8 = 0x00;
const TAG_ARRAY: u8 = 0x01;
const TAG_STRUCTURE: u8 = 0x02;
const TAG_BOOLEAN: u8 = 0x03;
const TAG_BIT_STRING: u8 = 0x04;
const TAG_DOUBLE_LONG: u8 = 0x05;
const TAG_DOUBLE_LONG_UNSIGNED: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x09;
const TAG_VISIBLE_STRING: u8 = 0x0A;
const TAG_UTF8_STRING: u8 = 0x0C;
const TAG_BCD: u8 = 0x0D;
const TAG_INTEGER: u8 = 0x0F;
const TAG_LONG: u8 = 0x10;
const TAG_UNSIGNED: u8 = 0x11;
const TAG_LONG_UNSIGNED: u8 = 0x12;
const TAG_LONG64: u8 = 0x14;
const TAG_LONG64_UNSIGNED: u8 = 0x15;
const TAG_ENUM: u8 = 0x16;
const TAG_FLOAT32: u8 = 0x17;
const TAG_FLOAT64: u8 = 0x18;
const TAG_DATE_TIME: u8 = 0x19;
const TAG_DATE: u8 = 0x1A;
const TAG_TIME: u8 = 0x1B;

/// A decoded A-XDR `Data` value.
#[derive(Debug, Clone, PartialEq)]
pub enum CosemData {
    Null,
    Array(Vec<CosemData>),
    Structure(Vec<CosemData>),
    Boolean(bool),
    BitString(Vec<u8>),
    DoubleLong(i32),
    DoubleLongUnsigned(u32),
    OctetString(Vec<u8>),
    VisibleString(String),
    Utf8String(String),
    Bcd(u8),
    Integer(i8),
    Long(i16),
    Unsigned(u8),
    LongUnsigned(u16),
    Long64(i64),
    Long64Unsigned(u64),
    Enum(u8),
    Float32(f32),
    Float64(f64),
    DateTime([u8; DATE_TIME_LEN]),
    Date([u8; 5]),
    Time([u8; 4]),
    /// A tag this decoder does not know. Its declared length was skipped.
    Unknown { tag: u8, len: usize },
}

impl CosemData {
    fn as_obis(&self) -> Option<ObisCode> {
        match self {
            CosemData::OctetString(bytes) => ObisCode::from_octets(bytes),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        Some(match *self {
            CosemData::Boolean(b) => b as i64,
            CosemData::DoubleLong(v) => v as i64,
            CosemData::DoubleLongUnsigned(v) => v as i64,
            CosemData::Bcd(v) => v as i64,
            CosemData::Integer(v) => v as i64,
            CosemData::Long(v) => v as i64,
            CosemData::Unsigned(v) => v as i64,
            CosemData::LongUnsigned(v) => v as i64,
            CosemData::Long64(v) => v,
            CosemData::Long64Unsigned(v) => i64::try_from(v).ok()?,
            CosemData::Enum(v) => v as i64,
            _ => return None,
        })
    }
}

/// Parser error carrying enough detail to tell truncation from garbage.
#[derive(Debug, Clone, PartialEq)]
pub enum AxdrError {
    Truncated { needed: usize, available: usize },
    Invalid(String),
}

impl<'a> ParseError<&'a [u8]> for AxdrError {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Eof => AxdrError::Truncated {
                needed: input.len() + 1,
                available: input.len(),
            },
            other => AxdrError::Invalid(format!("{:?}", other)),
        }
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<nom::Err<AxdrError>> for DecodeError {
    fn from(err: nom::Err<AxdrError>) -> Self {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => match e {
                AxdrError::Truncated { needed, available } => {
                    DecodeError::TruncatedFrame { needed, available }
                }
                AxdrError::Invalid(msg) => DecodeError::UnknownStructure(msg),
            },
            nom::Err::Incomplete(_) => DecodeError::TruncatedFrame {
                needed: 1,
                available: 0,
            },
        }
    }
}

type PResult<'a, T> = IResult<&'a [u8], T, AxdrError>;

fn truncated<'a, T>(needed: usize, available: usize) -> PResult<'a, T> {
    Err(nom::Err::Failure(AxdrError::Truncated { needed, available }))
}

fn invalid<'a, T>(msg: impl Into<String>) -> PResult<'a, T> {
    Err(nom::Err::Failure(AxdrError::Invalid(msg.into())))
}

fn take_exact(input: &[u8], n: usize) -> PResult<'_, &[u8]> {
    if input.len() < n {
        return truncated(n, input.len());
    }
    take(n)(input)
}

/// A-XDR length: one byte below 0x80, else 0x80 | n followed by n bytes.
fn axdr_length(input: &[u8]) -> PResult<'_, usize> {
    let (input, first) = be_u8(input)?;
    if first & 0x80 == 0 {
        return Ok((input, first as usize));
    }
    let n = (first & 0x7F) as usize;
    if n == 0 || n > 4 {
        return invalid(format!("length field of {} bytes", n));
    }
    let (input, bytes) = take_exact(input, n)?;
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((input, len))
}

fn fixed<const N: usize>(input: &[u8]) -> PResult<'_, [u8; N]> {
    let (input, bytes) = take_exact(input, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok((input, out))
}

/// Parses one `Data` value, depth first.
pub fn parse_data(input: &[u8]) -> PResult<'_, CosemData> {
    parse_data_at(input, 0)
}

fn parse_data_at(input: &[u8], depth: usize) -> PResult<'_, CosemData> {
    use CosemData::*;

    let (input, tag) = be_u8(input)?;
    match tag {
        TAG_NULL => Ok((input, Null)),
        TAG_ARRAY | TAG_STRUCTURE => {
            if depth >= MAX_DEPTH {
                return invalid("data nested too deep");
            }
            let (mut input, count) = axdr_length(input)?;
            // Every element takes at least one byte.
            if count > input.len() {
                return truncated(count, input.len());
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let (rest, item) = parse_data_at(input, depth + 1)?;
                items.push(item);
                input = rest;
            }
            Ok((input, if tag == TAG_ARRAY { Array(items) } else { Structure(items) }))
        }
        TAG_BOOLEAN => be_u8(input).map(|(i, v)| (i, Boolean(v != 0))),
        TAG_BIT_STRING => {
            let (input, bits) = axdr_length(input)?;
            let (input, bytes) = take_exact(input, bits.div_ceil(8))?;
            Ok((input, BitString(bytes.to_vec())))
        }
        TAG_DOUBLE_LONG => be_i32(input).map(|(i, v)| (i, DoubleLong(v))),
        TAG_DOUBLE_LONG_UNSIGNED => be_u32(input).map(|(i, v)| (i, DoubleLongUnsigned(v))),
        TAG_OCTET_STRING => {
            let (input, len) = axdr_length(input)?;
            let (input, bytes) = take_exact(input, len)?;
            Ok((input, OctetString(bytes.to_vec())))
        }
        TAG_VISIBLE_STRING | TAG_UTF8_STRING => {
            let (input, len) = axdr_length(input)?;
            let (input, bytes) = take_exact(input, len)?;
            let s = String::from_utf8_lossy(bytes).into_owned();
            Ok((input, if tag == TAG_VISIBLE_STRING { VisibleString(s) } else { Utf8String(s) }))
        }
        TAG_BCD => be_u8(input).map(|(i, v)| (i, Bcd(v))),
        TAG_INTEGER => be_i8(input).map(|(i, v)| (i, Integer(v))),
        TAG_LONG => be_i16(input).map(|(i, v)| (i, Long(v))),
        TAG_UNSIGNED => be_u8(input).map(|(i, v)| (i, Unsigned(v))),
        TAG_LONG_UNSIGNED => be_u16(input).map(|(i, v)| (i, LongUnsigned(v))),
        TAG_LONG64 => be_i64(input).map(|(i, v)| (i, Long64(v))),
        TAG_LONG64_UNSIGNED => be_u64(input).map(|(i, v)| (i, Long64Unsigned(v))),
        TAG_ENUM => be_u8(input).map(|(i, v)| (i, Enum(v))),
        TAG_FLOAT32 => be_f32(input).map(|(i, v)| (i, Float32(v))),
        TAG_FLOAT64 => be_f64(input).map(|(i, v)| (i, Float64(v))),
        TAG_DATE_TIME => fixed::<DATE_TIME_LEN>(input).map(|(i, v)| (i, DateTime(v))),
        TAG_DATE => fixed::<5>(input).map(|(i, v)| (i, Date(v))),
        TAG_TIME => fixed::<4>(input).map(|(i, v)| (i, Time(v))),
        other => {
            let (input, len) = axdr_length(input)?;
            let (input, _) = take_exact(input, len)?;
            debug!("Skipping unknown data tag 0x{:02X} ({} bytes)", other, len);
            Ok((input, Unknown { tag: other, len }))
        }
    }
}

/// Decodes a 12-byte COSEM date-time. Unspecified fields (0xFF) in the
/// time of day read as zero. The deviation and status bytes are ignored:
/// the result is meter-local time.
pub fn cosem_datetime(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() != DATE_TIME_LEN {
        return None;
    }
    let year = u16::from_be_bytes([bytes[0], bytes[1]]);
    let unspecified = |b: u8| if b == 0xFF { 0 } else { b as u32 };
    NaiveDate::from_ymd_opt(year as i32, bytes[2] as u32, bytes[3] as u32)?.and_hms_opt(
        unspecified(bytes[5]),
        unspecified(bytes[6]),
        unspecified(bytes[7]),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub invoke_id: u32,
    pub datetime: Option<NaiveDateTime>,
    pub body: CosemData,
}

fn parse_notification(input: &[u8]) -> PResult<'_, Notification> {
    let (input, tag) = be_u8(input)?;
    if tag != DATA_NOTIFICATION {
        return invalid(format!("APDU tag 0x{:02X} is not a data-notification", tag));
    }
    let (input, invoke_id) = be_u32(input)?;

    // The date-time is an optional octet string: absent (0x00), bare length
    // 0x0C followed by the value, or a full octet-string element.
    let (input, marker) = be_u8(input)?;
    let (input, datetime) = match marker {
        0x00 => (input, None),
        0x0C => {
            let (input, raw) = take_exact(input, DATE_TIME_LEN)?;
            (input, cosem_datetime(raw))
        }
        TAG_OCTET_STRING => {
            let (input, len) = axdr_length(input)?;
            let (input, raw) = take_exact(input, len)?;
            (input, cosem_datetime(raw))
        }
        other => return invalid(format!("unexpected date-time marker 0x{:02X}", other)),
    };

    let (input, body) = parse_data(input)?;
    Ok((
        input,
        Notification {
            invoke_id,
            datetime,
            body,
        },
    ))
}

/// Decodes the APDU carried by a binary frame.
pub fn decode_notification(apdu: &[u8]) -> Result<Notification, DecodeError> {
    let (rest, notification) = parse_notification(apdu)?;
    if !rest.is_empty() {
        debug!("Ignoring {} bytes after notification body", rest.len());
    }
    Ok(notification)
}

/// Infers the list layout from the shape of a notification body.
pub fn detect_variant(body: &CosemData) -> Option<MeterVariant> {
    match body {
        CosemData::Array(items)
            if !items.is_empty() && items.iter().all(is_register_structure) =>
        {
            Some(MeterVariant::VariantA)
        }
        CosemData::Structure(items) if is_pair_list(items) => Some(MeterVariant::VariantB),
        CosemData::Structure(items) if positional_layout(items.len()).is_some() => {
            Some(MeterVariant::VariantC)
        }
        _ => None,
    }
}

fn is_register_structure(item: &CosemData) -> bool {
    matches!(item, CosemData::Structure(fields)
        if fields.len() >= 2 && fields[0].as_obis().is_some())
}

fn pair_offset(items: &[CosemData]) -> usize {
    match items.first() {
        Some(CosemData::VisibleString(_)) => 1,
        _ => 0,
    }
}

fn is_pair_list(items: &[CosemData]) -> bool {
    let pairs = &items[pair_offset(items)..];
    !pairs.is_empty()
        && pairs.len() % 2 == 0
        && pairs.iter().step_by(2).all(|c| c.as_obis().is_some())
}

/// Quantities by position for positional (Kaifa-style) lists, keyed by
/// list length.
fn positional_layout(len: usize) -> Option<Vec<Quantity>> {
    use Quantity::*;

    const HEAD: [Quantity; 7] = [
        ListVersion,
        MeterId,
        MeterType,
        ActivePowerImport,
        ActivePowerExport,
        ReactivePowerImport,
        ReactivePowerExport,
    ];
    const ONE_PHASE: [Quantity; 2] = [CurrentL1, VoltageL1];
    const THREE_PHASE: [Quantity; 6] = [CurrentL1, CurrentL2, CurrentL3, VoltageL1, VoltageL2, VoltageL3];
    const HOURLY: [Quantity; 5] = [
        MeterClock,
        ActiveEnergyImport,
        ActiveEnergyExport,
        ReactiveEnergyImport,
        ReactiveEnergyExport,
    ];

    let layout = match len {
        1 => vec![ActivePowerImport],
        9 => [&HEAD[..], &ONE_PHASE[..]].concat(),
        13 => [&HEAD[..], &THREE_PHASE[..]].concat(),
        14 => [&HEAD[..], &ONE_PHASE[..], &HOURLY[..]].concat(),
        18 => [&HEAD[..], &THREE_PHASE[..], &HOURLY[..]].concat(),
        _ => return None,
    };
    Some(layout)
}

/// Exponent applied when a layout carries no scaler on the wire.
fn default_exponent(variant: MeterVariant, quantity: Quantity) -> i8 {
    match (variant, quantity.kind()) {
        (MeterVariant::VariantB, QuantityKind::Current) => -2,
        (MeterVariant::VariantB, QuantityKind::Energy) => 1,
        (MeterVariant::VariantC, QuantityKind::Current) => -3,
        (MeterVariant::VariantC, QuantityKind::Voltage) => -1,
        _ => 0,
    }
}

fn raw_value(data: &CosemData, quantity: Quantity) -> Option<RawValue> {
    if let Some(v) = data.as_integer() {
        return Some(RawValue::Integer(v));
    }
    match data {
        CosemData::Long64Unsigned(v) => Some(RawValue::Float(*v as f64)),
        CosemData::Float32(v) => Some(RawValue::Float(*v as f64)),
        CosemData::Float64(v) => Some(RawValue::Float(*v)),
        CosemData::VisibleString(s) | CosemData::Utf8String(s) => Some(RawValue::Text(s.clone())),
        CosemData::DateTime(raw) => Some(
            cosem_datetime(raw)
                .map(RawValue::DateTime)
                .unwrap_or_else(|| RawValue::Octets(raw.to_vec())),
        ),
        CosemData::OctetString(bytes) => Some(match quantity.kind() {
            QuantityKind::DateTime => cosem_datetime(bytes)
                .map(RawValue::DateTime)
                .unwrap_or_else(|| RawValue::Octets(bytes.clone())),
            QuantityKind::Identification => {
                RawValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            _ => RawValue::Octets(bytes.clone()),
        }),
        CosemData::BitString(bytes) => Some(RawValue::Octets(bytes.clone())),
        _ => None,
    }
}

// Field plus whether its exponent came from the wire.
type Extracted = (DecodedField, bool);

fn field(
    variant: MeterVariant,
    quantity: Quantity,
    value: &CosemData,
    scaler_unit: Option<(i8, Option<Unit>)>,
) -> Option<Extracted> {
    let Some(raw) = raw_value(value, quantity) else {
        debug!("No usable value for {:?}: {:?}", quantity, value);
        return None;
    };
    let (exponent, unit, wire) = match scaler_unit {
        Some((scaler, unit)) => (scaler, unit.unwrap_or_else(|| quantity.default_unit()), true),
        None => (default_exponent(variant, quantity), quantity.default_unit(), false),
    };
    Some((DecodedField::new(quantity, raw, exponent, unit), wire))
}

fn scaler_unit(data: &CosemData) -> Option<(i8, Option<Unit>)> {
    match data {
        CosemData::Structure(su) if su.len() == 2 => {
            let scaler = su[0].as_integer()?;
            let unit = su[1].as_integer().and_then(|u| Unit::from_dlms(u as u8));
            Some((scaler as i8, unit))
        }
        _ => None,
    }
}

fn extract_registers(items: &[CosemData]) -> Vec<Extracted> {
    items
        .iter()
        .filter_map(|item| {
            let CosemData::Structure(parts) = item else {
                debug!("Skipping non-register element {:?}", item);
                return None;
            };
            let quantity = Quantity::from_obis(parts.first()?.as_obis()?);
            let su = parts.get(2).and_then(scaler_unit);
            field(MeterVariant::VariantA, quantity, parts.get(1)?, su)
        })
        .collect()
}

fn extract_pairs(items: &[CosemData]) -> Result<Vec<Extracted>, DecodeError> {
    let offset = pair_offset(items);
    let mut out = Vec::with_capacity(items.len() / 2 + 1);
    if let Some(CosemData::VisibleString(version)) = items.first().filter(|_| offset == 1) {
        out.push((
            DecodedField::new(Quantity::ListVersion, RawValue::Text(version.clone()), 0, Unit::None),
            false,
        ));
    }
    for pair in items[offset..].chunks(2) {
        let [code, value] = pair else {
            return Err(DecodeError::structure("dangling code without value"));
        };
        let code = code
            .as_obis()
            .ok_or_else(|| DecodeError::structure("expected OBIS code in pair list"))?;
        out.extend(field(MeterVariant::VariantB, Quantity::from_obis(code), value, None));
    }
    Ok(out)
}

fn extract_positional(items: &[CosemData]) -> Result<Vec<Extracted>, DecodeError> {
    let layout = positional_layout(items.len()).ok_or_else(|| {
        DecodeError::structure(format!("no positional layout with {} elements", items.len()))
    })?;
    Ok(layout
        .into_iter()
        .zip(items)
        .filter_map(|(quantity, value)| field(MeterVariant::VariantC, quantity, value, None))
        .collect())
}

/// Marks repeated quantities: the occurrence with an on-wire scaler is the
/// instantaneous one, else the first; the rest are list copies.
fn mark_duplicates(extracted: Vec<Extracted>) -> Vec<DecodedField> {
    let mut fields: Vec<DecodedField> = Vec::with_capacity(extracted.len());
    let mut wire: Vec<bool> = Vec::with_capacity(extracted.len());
    for (mut f, has_wire_scaler) in extracted {
        if let Some(i) = fields
            .iter()
            .position(|e| e.quantity == f.quantity && e.origin == FieldOrigin::Instantaneous)
        {
            if has_wire_scaler && !wire[i] {
                fields[i].origin = FieldOrigin::ListCopy;
            } else {
                f.origin = FieldOrigin::ListCopy;
            }
        }
        fields.push(f);
        wire.push(has_wire_scaler);
    }
    fields
}

/// Result of decoding one binary telegram.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryTelegram {
    pub variant: MeterVariant,
    pub fields: Vec<DecodedField>,
}

/// Decodes a DLMS APDU into fields. With `expected` set, the body must have
/// that variant's shape; a mismatch is an `UnknownStructure` error.
pub fn decode_payload(
    apdu: &[u8],
    expected: Option<MeterVariant>,
) -> Result<BinaryTelegram, DecodeError> {
    let notification = decode_notification(apdu)?;
    let detected = detect_variant(&notification.body)
        .ok_or_else(|| DecodeError::structure("notification body has no known list layout"))?;
    if let Some(expected) = expected {
        if expected != detected {
            return Err(DecodeError::structure(format!(
                "expected {} layout, frame has {}",
                expected, detected
            )));
        }
    }

    let extracted = match (&notification.body, detected) {
        (CosemData::Array(items), MeterVariant::VariantA) => extract_registers(items),
        (CosemData::Structure(items), MeterVariant::VariantB) => extract_pairs(items)?,
        (CosemData::Structure(items), _) => extract_positional(items)?,
        _ => return Err(DecodeError::structure("body shape does not match layout")),
    };
    let mut fields = mark_duplicates(extracted);

    if let Some(clock) = notification.datetime {
        if !fields.iter().any(|f| f.quantity == Quantity::MeterClock) {
            fields.push(DecodedField::new(
                Quantity::MeterClock,
                RawValue::DateTime(clock),
                0,
                Unit::None,
            ));
        }
    }

    Ok(BinaryTelegram {
        variant: detected,
        fields,
    })
}
