//! Linear calibration of raw readings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default calibration scale.
pub const DEFAULT_SCALE: f64 = 1.0;

/// Default calibration offset.
pub const DEFAULT_OFFSET: f64 = 0.0;

/// Per-device linear calibration: `value * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub scale: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: DEFAULT_OFFSET,
            scale: DEFAULT_SCALE,
        }
    }
}

impl Calibration {
    pub fn new(offset: f64, scale: f64) -> Self {
        Self { offset, scale }
    }

    /// Build a calibration from untyped input, coercing each field.
    ///
    /// Finite numbers and numeric strings are kept as given, including an
    /// explicit zero. Anything else falls back to the default for that field.
    pub fn coerce(offset: &Value, scale: &Value) -> Self {
        Self {
            offset: coerce_factor(offset, DEFAULT_OFFSET),
            scale: coerce_factor(scale, DEFAULT_SCALE),
        }
    }

    /// Apply this calibration to a raw reading.
    pub fn apply(&self, raw: f64) -> f64 {
        calibrate(raw, self.scale, self.offset)
    }

    pub fn is_identity(&self) -> bool {
        self.scale == DEFAULT_SCALE && self.offset == DEFAULT_OFFSET
    }
}

/// `raw * scale + offset`.
pub fn calibrate(raw: f64, scale: f64, offset: f64) -> f64 {
    raw * scale + offset
}

/// Coerce a JSON value to a finite number, or return `default`.
pub fn coerce_factor(value: &Value, default: f64) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(default)
}
