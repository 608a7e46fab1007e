use crate::error::FabricError;
use crate::sequence::value::{SequenceType, SequenceValue};
use primitive_types::U256;
use uuid::Uuid;

/// Configuration of one named sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOptions {
    /// Defaults to `{table}_pk` when the sequence backs a primary key.
    pub name: Option<String>,
    pub kind: SequenceType,
    /// Value `current()` reports before the first increment. `None` makes a
    /// read of an absent sequence fatal.
    pub start_with: Option<SequenceValue>,
    pub increment_by: u64,
}

impl SequenceOptions {
    pub fn number() -> Self {
        Self {
            name: None,
            kind: SequenceType::Number,
            start_with: Some(SequenceValue::Number(0)),
            increment_by: 1,
        }
    }

    pub fn bigint() -> Self {
        Self {
            name: None,
            kind: SequenceType::BigInt,
            start_with: Some(SequenceValue::BigInt(U256::zero())),
            increment_by: 1,
        }
    }

    pub fn serial() -> Self {
        Self {
            name: None,
            kind: SequenceType::Serial,
            start_with: Some(SequenceValue::Text("0".to_string())),
            increment_by: 1,
        }
    }

    pub fn uuid() -> Self {
        Self {
            name: None,
            kind: SequenceType::Uuid,
            start_with: Some(SequenceValue::Text(Uuid::nil().to_string())),
            increment_by: 1,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn start_with(mut self, start: impl Into<SequenceValue>) -> Self {
        self.start_with = Some(start.into());
        self
    }

    pub fn without_start(mut self) -> Self {
        self.start_with = None;
        self
    }

    pub fn increment_by(mut self, step: u64) -> Self {
        self.increment_by = step;
        self
    }

    pub fn validate(&self) -> Result<(), FabricError> {
        if self.increment_by == 0 {
            return Err(FabricError::invalid_config("increment_by must be > 0"));
        }
        if self.name.as_deref().is_some_and(str::is_empty) {
            return Err(FabricError::invalid_config("sequence name must not be empty"));
        }
        if let Some(start) = &self.start_with {
            let consistent = match (self.kind, start) {
                (SequenceType::Number, SequenceValue::Number(_))
                | (SequenceType::BigInt, SequenceValue::BigInt(_))
                | (SequenceType::Serial, SequenceValue::Text(_)) => true,
                (SequenceType::Uuid, SequenceValue::Text(s)) => Uuid::parse_str(s).is_ok(),
                _ => false,
            };
            if !consistent {
                return Err(FabricError::invalid_config(format!(
                    "start value {start} does not match sequence type {}",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}
