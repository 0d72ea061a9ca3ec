//! Fixed-point encoding for monetary fields.
//!
//! A `scaled_float` field stores `round(value * scaling_factor)` as an integer.
//! All arithmetic goes through [`BigDecimal`] so that repeated rebuilds never
//! accumulate binary floating-point drift.

use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by the scaled-float codec.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScaledFloatError {
    /// The value cannot be read as a decimal number.
    #[error("Not a decimal number: {0}")]
    NotANumber(String),

    /// The scaled value does not fit into an `i64`.
    #[error("Scaled value out of range: {0}")]
    OutOfRange(String),

    /// The scaling factor must be a positive integer.
    #[error("Invalid scaling factor: {0}")]
    InvalidFactor(u64),
}

/// Codec for one scaled-float field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledFloat {
    factor: u64,
}

impl ScaledFloat {
    /// Create a codec for the given scaling factor.
    pub fn new(factor: u64) -> Result<Self, ScaledFloatError> {
        if factor == 0 {
            return Err(ScaledFloatError::InvalidFactor(factor));
        }
        Ok(Self { factor })
    }

    /// The scaling factor.
    pub fn factor(&self) -> u64 {
        self.factor
    }

    /// Number of fractional digits implied by a power-of-ten factor.
    fn fraction_digits(&self) -> Option<i64> {
        let mut factor = self.factor;
        let mut digits = 0;
        while factor > 1 {
            if factor % 10 != 0 {
                return None;
            }
            factor /= 10;
            digits += 1;
        }
        Some(digits)
    }

    /// Encode a decimal string (`"1234.5"`) into its scaled integer (`123450`).
    ///
    /// Digits beyond the scale are rounded half away from zero.
    pub fn encode_str(&self, raw: &str) -> Result<i64, ScaledFloatError> {
        let value = BigDecimal::from_str(raw.trim())
            .map_err(|_| ScaledFloatError::NotANumber(raw.to_string()))?;
        self.encode_decimal(&value)
    }

    /// Encode an exact decimal.
    pub fn encode_decimal(&self, value: &BigDecimal) -> Result<i64, ScaledFloatError> {
        let scaled = value * BigDecimal::from(self.factor);
        let truncated = scaled.with_scale(0);
        let remainder = &scaled - &truncated;

        let half = BigDecimal::from_str("0.5").map_err(|e| ScaledFloatError::NotANumber(e.to_string()))?;
        let rounded = if remainder.abs() >= half {
            if remainder > BigDecimal::zero() {
                truncated + BigDecimal::from(1)
            } else {
                truncated - BigDecimal::from(1)
            }
        } else {
            truncated
        };

        rounded
            .to_i64()
            .ok_or_else(|| ScaledFloatError::OutOfRange(value.to_string()))
    }

    /// Encode a JSON value as delivered by the source query.
    ///
    /// Numbers are read from their literal text (`serde_json` keeps it with
    /// `arbitrary_precision`), so a `NUMERIC` wider than an `f64` mantissa keeps
    /// every digit. Numeric strings are accepted.
    pub fn encode_value(&self, value: &Value) -> Result<i64, ScaledFloatError> {
        match value {
            Value::Number(number) => self.encode_str(&number.to_string()),
            Value::String(s) => self.encode_str(s),
            other => Err(ScaledFloatError::NotANumber(other.to_string())),
        }
    }

    /// Decode a scaled integer back into its decimal value.
    ///
    /// For power-of-ten factors the result carries exactly as many fractional
    /// digits as the factor implies (`123450` at scale 100 decodes to `1234.50`).
    pub fn decode(&self, encoded: i64) -> BigDecimal {
        let value = BigDecimal::from(encoded) / BigDecimal::from(self.factor);
        match self.fraction_digits() {
            Some(digits) => value.with_scale(digits),
            None => value.normalized(),
        }
    }
}
