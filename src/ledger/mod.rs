//! Ledger storage primitives.
//!
//! `LedgerStub` is the seam between this crate and the chaincode shim: the
//! world-state and private-data read/write calls, structured queries, composite
//! keys, transaction metadata and event emission. Implementations are handed
//! to a [`crate::context::Context`] once per transaction.

pub mod memory;

use crate::error::FabricError;
use crate::identity::Identity;
use async_trait::async_trait;

pub use memory::{CollectionPolicy, LedgerEvent, MemoryLedger, MemoryStub};

const COMPOSITE_KEY_NAMESPACE: char = '\u{0000}';
const MAX_UNICODE_RUNE: char = '\u{10FFFF}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponseMetadata {
    pub fetched_records_count: usize,
    pub bookmark: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedQueryResult {
    pub results: Vec<KvPair>,
    pub metadata: QueryResponseMetadata,
}

#[async_trait]
pub trait LedgerStub: Send + Sync {
    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, FabricError>;

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), FabricError>;

    async fn delete_state(&self, key: &str) -> Result<(), FabricError>;

    async fn get_private_data(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, FabricError>;

    async fn put_private_data(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), FabricError>;

    async fn delete_private_data(&self, collection: &str, key: &str) -> Result<(), FabricError>;

    async fn get_query_result(&self, query: &str) -> Result<Vec<KvPair>, FabricError>;

    async fn get_query_result_with_pagination(
        &self,
        query: &str,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<PagedQueryResult, FabricError>;

    async fn get_private_data_query_result(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<Vec<KvPair>, FabricError>;

    fn set_event(&self, name: &str, payload: Vec<u8>) -> Result<(), FabricError>;

    fn get_tx_id(&self) -> String;

    /// Transaction timestamp in milliseconds since the Unix epoch.
    fn get_date_timestamp(&self) -> u64;

    fn get_creator(&self) -> Identity;

    fn create_composite_key(
        &self,
        object_type: &str,
        attributes: &[&str],
    ) -> Result<String, FabricError> {
        create_composite_key(object_type, attributes)
    }
}

/// Builds a Fabric composite key: `\0{type}\0{attr}\0...`.
pub fn create_composite_key(object_type: &str, attributes: &[&str]) -> Result<String, FabricError> {
    validate_composite_key_part(object_type)?;
    let mut key = String::with_capacity(
        2 + object_type.len() + attributes.iter().map(|a| a.len() + 1).sum::<usize>(),
    );
    key.push(COMPOSITE_KEY_NAMESPACE);
    key.push_str(object_type);
    key.push(COMPOSITE_KEY_NAMESPACE);
    for attr in attributes {
        validate_composite_key_part(attr)?;
        key.push_str(attr);
        key.push(COMPOSITE_KEY_NAMESPACE);
    }
    Ok(key)
}

pub fn split_composite_key(key: &str) -> Option<(String, Vec<String>)> {
    let rest = key.strip_prefix(COMPOSITE_KEY_NAMESPACE)?;
    let mut parts = rest
        .split(COMPOSITE_KEY_NAMESPACE)
        .map(str::to_string)
        .collect::<Vec<_>>();
    // trailing separator leaves one empty element
    if parts.last().is_some_and(String::is_empty) {
        parts.pop();
    }
    if parts.is_empty() {
        return None;
    }
    let object_type = parts.remove(0);
    Some((object_type, parts))
}

fn validate_composite_key_part(part: &str) -> Result<(), FabricError> {
    if part
        .chars()
        .any(|c| c == COMPOSITE_KEY_NAMESPACE || c == MAX_UNICODE_RUNE)
    {
        return Err(FabricError::Validation(format!(
            "composite key part {part:?} contains a reserved character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_layout_matches_shim() {
        let key = create_composite_key("orders", &["42"]).expect("key");
        assert_eq!(key, "\u{0}orders\u{0}42\u{0}");
        let (ty, attrs) = split_composite_key(&key).expect("split");
        assert_eq!(ty, "orders");
        assert_eq!(attrs, vec!["42".to_string()]);
    }

    #[test]
    fn composite_key_rejects_namespace_char() {
        let err = create_composite_key("orders", &["a\u{0}b"]).expect_err("reserved");
        assert_eq!(err.code_str(), "validation");
    }
}
