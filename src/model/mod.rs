pub mod registry;
pub mod spec;

pub use registry::ModelRegistry;
pub use spec::{
    AuditFields, FieldSpec, MirrorSpec, ModelSpec, SegregationDescriptor, SegregationGroup,
    SegregationKind,
};

use crate::error::FabricError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Flat attribute map as stored on the ledger (or as a model serializes).
pub type Record = Map<String, Value>;

/// A persisted model type.
///
/// `spec()` is called once when a repository for the type is built; the
/// result is registered with the adapter and never re-read.
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn spec() -> ModelSpec;

    /// Field-level validation messages; empty means valid.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

pub fn to_record<M: Serialize>(model: &M) -> Result<Record, FabricError> {
    match serde_json::to_value(model)? {
        Value::Object(map) => Ok(map),
        other => Err(FabricError::Validation(format!(
            "model must serialize to an object, got {other}"
        ))),
    }
}

pub fn from_record<M: DeserializeOwned>(record: Record) -> Result<M, FabricError> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Renders a primary-key value as the string used in composite keys.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_string_accepts_strings_and_numbers() {
        assert_eq!(id_string(&json!("a")).as_deref(), Some("a"));
        assert_eq!(id_string(&json!(42)).as_deref(), Some("42"));
        assert_eq!(id_string(&json!("")), None);
        assert_eq!(id_string(&Value::Null), None);
    }

    #[test]
    fn non_object_models_are_rejected() {
        let err = to_record(&5).expect_err("scalar");
        assert_eq!(err.code_str(), "validation");
    }
}
