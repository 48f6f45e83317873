use chrono::{DateTime, Local};

use crate::error::ConfigError;
use crate::meter::{
    apply_exponent, DecodedField, FieldOrigin, MeasuredValue, Measurement, MeasurementSet,
    MeterVariant, RawValue,
};

/// User multiplier for power, current and energy values. Always positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleConfig(f64);

impl ScaleConfig {
    pub fn new(factor: f64) -> Result<Self, ConfigError> {
        if factor.is_finite() && factor > 0.0 {
            Ok(ScaleConfig(factor))
        } else {
            Err(ConfigError::InvalidScaleFactor(factor))
        }
    }

    pub fn factor(self) -> f64 {
        self.0
    }
}

impl Default for ScaleConfig {
    fn default() -> Self {
        ScaleConfig(1.0)
    }
}

/// Turns decoded fields into a measurement set.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    scale: ScaleConfig,
}

impl Normalizer {
    pub fn new(scale: ScaleConfig) -> Self {
        Normalizer { scale }
    }

    /// Normalizes fields captured now.
    pub fn normalize(&self, variant: MeterVariant, fields: Vec<DecodedField>) -> MeasurementSet {
        self.normalize_at(variant, fields, Local::now())
    }

    pub fn normalize_at(
        &self,
        variant: MeterVariant,
        fields: Vec<DecodedField>,
        captured_at: DateTime<Local>,
    ) -> MeasurementSet {
        let measurements = dedup(fields)
            .into_iter()
            .map(|field| self.measurement(field))
            .collect();
        MeasurementSet::new(variant, captured_at, measurements)
    }

    fn measurement(&self, field: DecodedField) -> Measurement {
        let factor = if field.quantity.kind().is_scalable() {
            self.scale.factor()
        } else {
            1.0
        };
        let value = match field.raw {
            RawValue::Integer(v) => {
                MeasuredValue::Number(apply_exponent(v as f64, field.scale_exponent) * factor)
            }
            RawValue::Float(v) => {
                MeasuredValue::Number(apply_exponent(v, field.scale_exponent) * factor)
            }
            RawValue::Text(s) => MeasuredValue::Text(s),
            RawValue::DateTime(ts) => MeasuredValue::Timestamp(ts),
            RawValue::Octets(bytes) => {
                MeasuredValue::Text(bytes.iter().map(|b| format!("{:02x}", b)).collect())
            }
        };
        Measurement {
            quantity: field.quantity,
            obis: field.quantity.obis(),
            value,
            unit: field.unit,
        }
    }
}

// One field per quantity, in first-seen order. The instantaneous
// occurrence wins over list copies, otherwise the first one does.
fn dedup(fields: Vec<DecodedField>) -> Vec<DecodedField> {
    let mut kept: Vec<DecodedField> = Vec::with_capacity(fields.len());
    for field in fields {
        match kept.iter_mut().find(|k| k.quantity == field.quantity) {
            Some(existing) => {
                if existing.origin == FieldOrigin::ListCopy
                    && field.origin == FieldOrigin::Instantaneous
                {
                    *existing = field;
                }
            }
            None => kept.push(field),
        }
    }
    kept
}
