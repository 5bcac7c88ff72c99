//! Dynamic SQL values.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::{Error, TypeError};

/// A dynamically-typed SQL value.
///
/// This enum represents all scalar values an attribute can hold and is used
/// for parameter binding and result fetching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

/// Declared scalar type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    BigInt,
    Double,
    Decimal,
    Text,
    Bytes,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Hash the value with a tag byte per variant.
    ///
    /// Doubles hash by bit pattern after folding `-0.0` into `0.0`, so equal
    /// values hash equally. NaN never compares equal and must not be used as a key.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // Int and BigInt compare unequal, but share the tag so widened keys collide early
            Value::Int(i) => {
                2u8.hash(state);
                i64::from(*i).hash(state);
            }
            Value::BigInt(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Double(f) => {
                3u8.hash(state);
                let f = if *f == 0.0 { 0.0 } else { *f };
                f.to_bits().hash(state);
            }
            Value::Decimal(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Text(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                6u8.hash(state);
                b.hash(state);
            }
            Value::Date(d) => {
                7u8.hash(state);
                d.hash(state);
            }
            Value::Timestamp(ts) => {
                8u8.hash(state);
                ts.hash(state);
            }
            Value::Uuid(u) => {
                9u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                10u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

impl ValueKind {
    /// SQL-ish name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Bool => "BOOLEAN",
            ValueKind::Int => "INTEGER",
            ValueKind::BigInt => "BIGINT",
            ValueKind::Double => "DOUBLE",
            ValueKind::Decimal => "DECIMAL",
            ValueKind::Text => "TEXT",
            ValueKind::Bytes => "BLOB",
            ValueKind::Date => "DATE",
            ValueKind::Timestamp => "TIMESTAMP",
            ValueKind::Uuid => "UUID",
            ValueKind::Json => "JSON",
        }
    }

    /// Floating point kinds cannot take part in keys.
    pub const fn is_float(self) -> bool {
        matches!(self, ValueKind::Double)
    }

    /// Integer kinds may be auto-generated by storage.
    pub const fn is_integer(self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::BigInt)
    }

    /// Convert a non-null value to this kind.
    ///
    /// Integers widen/narrow between `Int` and `BigInt` when lossless, integers
    /// widen to `Double`; everything else must already match.
    pub fn coerce(self, value: Value) -> Result<Value> {
        let converted = match (self, value) {
            (_, Value::Null) => Some(Value::Null),
            (ValueKind::Bool, v @ Value::Bool(_)) => Some(v),
            (ValueKind::Int, v @ Value::Int(_)) => Some(v),
            (ValueKind::Int, Value::BigInt(i)) => i32::try_from(i).ok().map(Value::Int),
            (ValueKind::BigInt, v @ Value::BigInt(_)) => Some(v),
            (ValueKind::BigInt, Value::Int(i)) => Some(Value::BigInt(i64::from(i))),
            (ValueKind::Double, v @ Value::Double(_)) => Some(v),
            (ValueKind::Double, Value::Int(i)) => Some(Value::Double(f64::from(i))),
            (ValueKind::Double, Value::BigInt(i)) => Some(Value::Double(i as f64)),
            (ValueKind::Decimal, v @ Value::Decimal(_)) => Some(v),
            (ValueKind::Text, v @ Value::Text(_)) => Some(v),
            (ValueKind::Bytes, v @ Value::Bytes(_)) => Some(v),
            (ValueKind::Date, v @ Value::Date(_)) => Some(v),
            (ValueKind::Timestamp, v @ Value::Timestamp(_)) => Some(v),
            (ValueKind::Uuid, v @ Value::Uuid(_)) => Some(v),
            (ValueKind::Json, v @ Value::Json(_)) => Some(v),
            (kind, other) => {
                return Err(Error::Type(TypeError {
                    expected: kind.name(),
                    actual: other.type_name().to_string(),
                    attribute: None,
                }));
            }
        };
        converted.ok_or_else(|| {
            Error::Type(TypeError {
                expected: self.name(),
                actual: "out-of-range integer".to_string(),
                attribute: None,
            })
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "BIGINT",
                actual: value.type_name().to_string(),
                attribute: None,
            })
        })
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(Error::Type(TypeError {
                expected: "TEXT",
                actual: other.type_name().to_string(),
                attribute: None,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash_into(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_coerce_integers() {
        assert_eq!(ValueKind::BigInt.coerce(Value::Int(7)).unwrap(), Value::BigInt(7));
        assert_eq!(ValueKind::Int.coerce(Value::BigInt(7)).unwrap(), Value::Int(7));
        assert!(ValueKind::Int.coerce(Value::BigInt(i64::MAX)).is_err());
        assert_eq!(ValueKind::Double.coerce(Value::Int(2)).unwrap(), Value::Double(2.0));
    }

    #[test]
    fn test_coerce_mismatch_reports_kind() {
        let err = ValueKind::Int.coerce(Value::Text("x".into())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Type error: expected INTEGER, found TEXT"
        );
    }

    #[test]
    fn test_coerce_null_passes_through() {
        assert_eq!(ValueKind::Text.coerce(Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_hash_is_stable_for_equal_values() {
        assert_eq!(hash_of(&Value::Text("a".into())), hash_of(&Value::Text("a".into())));
        assert_ne!(hash_of(&Value::Text("a".into())), hash_of(&Value::Text("b".into())));
        assert_eq!(hash_of(&Value::Double(0.0)), hash_of(&Value::Double(-0.0)));
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }
}
