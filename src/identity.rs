use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller identity as presented by the transaction creator.
///
/// `id` is the X.509 subject string Fabric hands back from `getID()`,
/// `msp_id` names the organization. Attributes come from the enrollment
/// certificate and are read-only once issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub msp_id: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default, skip_deserializing)]
    internal_system: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>, msp_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msp_id: msp_id.into(),
            attributes: BTreeMap::new(),
            internal_system: false,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn get_id(&self) -> &str {
        &self.id
    }

    pub fn get_msp_id(&self) -> &str {
        &self.msp_id
    }

    pub fn get_attribute_value(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn assert_attribute_value(&self, name: &str, expected: &str) -> bool {
        self.get_attribute_value(name) == Some(expected)
    }

    /// In-process maintenance identity acting for `msp_id`. Bypasses the
    /// mirror write guard; never produced by deserialization.
    pub fn system(msp_id: impl Into<String>) -> Self {
        Self {
            id: "system".to_string(),
            msp_id: msp_id.into(),
            attributes: BTreeMap::new(),
            internal_system: true,
        }
    }

    pub fn is_internal_system(&self) -> bool {
        self.internal_system && self.id == "system"
    }
}
