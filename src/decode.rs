//! Turns a minion's raw return value into a typed result.
//!
//! Decoding never fails the caller: every mismatch becomes a
//! [`CallError`] stored in that minion's slot.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CallError, CallResult, DecodingError};

const NOT_AVAILABLE_SUFFIX: &str = "' is not available.";

/// Coarse JSON type of a value, used to report decoding mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
    /// The mismatch path no longer resolves to a value (missing field).
    Missing,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Boolean,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }
}

impl std::fmt::Display for JsonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JsonKind::Null => "null",
            JsonKind::Boolean => "boolean",
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
            JsonKind::Missing => "missing",
        };
        write!(f, "{s}")
    }
}

/// Decode the return value of `function` into `T`.
///
/// The master reports an unknown function as a plain string return
/// (`'test.pong' is not available.`), which would otherwise surface as a
/// confusing type mismatch, so it is checked before deserializing.
pub fn decode_return<T: DeserializeOwned>(function: &str, value: &Value) -> CallResult<T> {
    if let Some(missing) = not_available(value) {
        // Prefer the name the minion reported; fall back to what was called.
        let function = if missing.is_empty() { function } else { missing };
        return Err(CallError::FunctionNotAvailable {
            function: function.to_string(),
        });
    }

    serde_path_to_error::deserialize::<_, T>(value.clone()).map_err(|err| {
        let segments: Vec<&serde_path_to_error::Segment> = err.path().iter().collect();
        let observed = lookup(value, &segments).map_or(JsonKind::Missing, JsonKind::of);
        CallError::Decoding(DecodingError {
            path: json_path(&segments),
            observed,
            detail: err.inner().to_string(),
        })
    })
}

/// The function name carried by a "not available" sentinel, if `value` is one.
fn not_available(value: &Value) -> Option<&str> {
    let text = value.as_str()?;
    text.strip_prefix('\'')?.strip_suffix(NOT_AVAILABLE_SUFFIX)
}

fn json_path(segments: &[&serde_path_to_error::Segment]) -> String {
    use serde_path_to_error::Segment;

    let mut path = String::from("$");
    for segment in segments {
        match segment {
            Segment::Seq { index } => path.push_str(&format!("[{index}]")),
            Segment::Map { key } => {
                path.push('.');
                path.push_str(key);
            }
            Segment::Enum { variant } => {
                path.push('.');
                path.push_str(variant);
            }
            Segment::Unknown => path.push_str(".?"),
        }
    }
    path
}

fn lookup<'v>(value: &'v Value, segments: &[&serde_path_to_error::Segment]) -> Option<&'v Value> {
    use serde_path_to_error::Segment;

    segments.iter().try_fold(value, |current, segment| match segment {
        Segment::Seq { index } => current.get(*index),
        Segment::Map { key } | Segment::Enum { variant: key } => current.get(key.as_str()),
        Segment::Unknown => None,
    })
}
