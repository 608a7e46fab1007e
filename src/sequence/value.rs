use crate::error::FabricError;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceType {
    Number,
    BigInt,
    Serial,
    Uuid,
}

impl SequenceType {
    pub fn is_numeric(self) -> bool {
        matches!(self, SequenceType::Number | SequenceType::BigInt)
    }
}

impl fmt::Display for SequenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceType::Number => write!(f, "number"),
            SequenceType::BigInt => write!(f, "bigint"),
            SequenceType::Serial => write!(f, "serial"),
            SequenceType::Uuid => write!(f, "uuid"),
        }
    }
}

/// A sequence's `current` value.
///
/// Numbers are JSON numbers on the ledger; bigints are decimal strings so
/// they survive JSON number precision limits; serial and uuid values are
/// plain strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceValue {
    Number(i64),
    BigInt(U256),
    Text(String),
}

impl SequenceValue {
    pub fn to_json(&self) -> Value {
        match self {
            SequenceValue::Number(n) => Value::from(*n),
            SequenceValue::BigInt(n) => Value::String(n.to_string()),
            SequenceValue::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn from_json(kind: SequenceType, value: &Value) -> Result<Self, FabricError> {
        let bad = || {
            FabricError::internal(format!("sequence value {value} is not a valid {kind}"))
        };
        match kind {
            SequenceType::Number => match value {
                Value::Number(n) => n.as_i64().map(SequenceValue::Number).ok_or_else(bad),
                Value::String(s) => s.parse().map(SequenceValue::Number).map_err(|_| bad()),
                _ => Err(bad()),
            },
            SequenceType::BigInt => match value {
                Value::Number(n) => n
                    .as_u64()
                    .map(|n| SequenceValue::BigInt(U256::from(n)))
                    .ok_or_else(bad),
                Value::String(s) => U256::from_dec_str(s)
                    .map(SequenceValue::BigInt)
                    .map_err(|_| bad()),
                _ => Err(bad()),
            },
            SequenceType::Serial | SequenceType::Uuid => match value {
                Value::String(s) => Ok(SequenceValue::Text(s.clone())),
                Value::Number(n) => Ok(SequenceValue::Text(n.to_string())),
                _ => Err(bad()),
            },
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SequenceValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SequenceValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Adds `delta`; only defined for numeric values.
    pub(crate) fn checked_add(&self, delta: u64) -> Result<SequenceValue, FabricError> {
        match self {
            SequenceValue::Number(n) => i64::try_from(delta)
                .ok()
                .and_then(|d| n.checked_add(d))
                .map(SequenceValue::Number)
                .ok_or_else(|| FabricError::internal(format!("sequence overflow at {n}"))),
            SequenceValue::BigInt(n) => n
                .checked_add(U256::from(delta))
                .map(SequenceValue::BigInt)
                .ok_or_else(|| FabricError::internal(format!("sequence overflow at {n}"))),
            SequenceValue::Text(_) => Err(FabricError::internal(
                "arithmetic is not defined for text sequences",
            )),
        }
    }
}

impl fmt::Display for SequenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceValue::Number(n) => write!(f, "{n}"),
            SequenceValue::BigInt(n) => write!(f, "{n}"),
            SequenceValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SequenceValue {
    fn from(n: i64) -> Self {
        SequenceValue::Number(n)
    }
}

impl From<U256> for SequenceValue {
    fn from(n: U256) -> Self {
        SequenceValue::BigInt(n)
    }
}

impl From<&str> for SequenceValue {
    fn from(s: &str) -> Self {
        SequenceValue::Text(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bigint_survives_json_as_decimal_string() {
        let big = SequenceValue::BigInt(U256::from(u64::MAX) + U256::from(10u64));
        let json = big.to_json();
        assert_eq!(json, json!("18446744073709551625"));
        assert_eq!(
            SequenceValue::from_json(SequenceType::BigInt, &json).expect("decode"),
            big
        );
    }

    #[test]
    fn type_mismatch_is_internal_error() {
        let err = SequenceValue::from_json(SequenceType::Number, &json!([1]))
            .expect_err("array is not a number");
        assert_eq!(err.code_str(), "internal");
    }

    #[test]
    fn numeric_addition_detects_overflow() {
        assert_eq!(
            SequenceValue::Number(10).checked_add(5).expect("add"),
            SequenceValue::Number(15)
        );
        assert!(SequenceValue::Number(i64::MAX).checked_add(1).is_err());
        assert!(SequenceValue::Text("a".into()).checked_add(1).is_err());
    }
}
