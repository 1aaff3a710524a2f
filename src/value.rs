//! Tagged telemetry values.
//!
//! Values arrive loosely typed (JSON) and are coerced exactly once at ingest
//! into [`Value`]. Everything downstream dispatches on the tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower bound (exclusive) of a plausible unix-seconds timestamp.
pub const MIN_EPOCH_SECS: i64 = 1_000_000_000;

/// Upper bound (exclusive) of a plausible unix-seconds timestamp. Anything
/// above is assumed to be milliseconds or garbage.
pub const MAX_EPOCH_SECS: i64 = 9_000_000_000;

/// Returns whether `ts` looks like a unix timestamp in seconds.
pub fn is_valid_epoch_secs(ts: i64) -> bool {
    ts > MIN_EPOCH_SECS && ts < MAX_EPOCH_SECS
}

/// A single telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Storage partition of a value. The numeric codes are persisted in the
/// store's dimension table and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Number = 0,
    Text = 1,
    Bool = 2,
}

impl ValueKind {
    /// All partitions, in code order.
    pub const ALL: [ValueKind; 3] = [ValueKind::Number, ValueKind::Text, ValueKind::Bool];

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Number),
            1 => Some(Self::Text),
            2 => Some(Self::Bool),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Table name of the partition.
    pub fn table(self) -> &'static str {
        match self {
            Self::Number => "ts_number",
            Self::Text => "ts_string",
            Self::Bool => "ts_bool",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
            Self::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Reasons a raw value cannot be stored.
#[derive(Error, Debug, PartialEq)]
pub enum CoerceError {
    #[error("null value")]
    Null,

    #[error("non-finite number")]
    NonFinite,

    #[error("unsupported value type: {0}")]
    Unsupported(&'static str),
}

/// Coerces a loosely-typed JSON value into a storable [`Value`].
///
/// Strings that survive a round trip through `f64` become numbers,
/// `"true"` and `"false"` become booleans, any other string stays text.
pub fn coerce(raw: &serde_json::Value) -> Result<Value, CoerceError> {
    match raw {
        serde_json::Value::Null => Err(CoerceError::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => Ok(Value::Number(f)),
            _ => Err(CoerceError::NonFinite),
        },
        serde_json::Value::String(s) => Ok(coerce_str(s)),
        serde_json::Value::Array(_) => Err(CoerceError::Unsupported("array")),
        serde_json::Value::Object(_) => Err(CoerceError::Unsupported("object")),
    }
}

fn coerce_str(s: &str) -> Value {
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() && f.to_string() == s {
            return Value::Number(f);
        }
    }

    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Text(s.to_string()),
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
