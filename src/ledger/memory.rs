//! In-process ledger used by tests, tooling and offline replay.
//!
//! One [`MemoryLedger`] plays the role of the peer's state database; each call
//! to [`MemoryLedger::stub`] opens a transaction handle bound to a creator
//! identity, a fresh tx id and a monotonically increasing timestamp. Private
//! collections enforce their membership policy on read (and optionally on
//! write), as a peer does for `getPrivateData` from a non-member org.

use crate::error::{FabricError, ResourceType};
use crate::identity::Identity;
use crate::ledger::{KvPair, LedgerStub, PagedQueryResult, QueryResponseMetadata};
use crate::query::plan::MangoQuery;
use crate::query::selector::{matches, sort_documents};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const GENESIS_TIMESTAMP_MS: u64 = 1_700_000_000_000;
const TX_TIMESTAMP_STEP_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPolicy {
    pub members: BTreeSet<String>,
    pub member_only_read: bool,
    pub member_only_write: bool,
}

impl CollectionPolicy {
    pub fn members(msp_ids: &[&str]) -> Self {
        Self {
            members: msp_ids.iter().map(|m| (*m).to_string()).collect(),
            member_only_read: true,
            member_only_write: false,
        }
    }

    pub fn member_only_write(mut self, member_only_write: bool) -> Self {
        self.member_only_write = member_only_write;
        self
    }

    fn can_read(&self, msp_id: &str) -> bool {
        !self.member_only_read || self.members.contains(msp_id)
    }

    fn can_write(&self, msp_id: &str) -> bool {
        !self.member_only_write || self.members.contains(msp_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub tx_id: String,
    pub name: String,
    pub payload: Vec<u8>,
}

impl LedgerEvent {
    pub fn payload_json(&self) -> Result<Value, FabricError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Debug)]
struct CollectionState {
    policy: CollectionPolicy,
    entries: BTreeMap<String, KvEntry>,
}

#[derive(Debug, Default)]
struct LedgerState {
    world: BTreeMap<String, KvEntry>,
    collections: BTreeMap<String, CollectionState>,
    events: Vec<LedgerEvent>,
    tx_counter: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_collection(&self, name: impl Into<String>, policy: CollectionPolicy) {
        self.state.lock().collections.insert(
            name.into(),
            CollectionState {
                policy,
                entries: BTreeMap::new(),
            },
        );
    }

    /// Opens a transaction handle for `creator`.
    pub fn stub(&self, creator: Identity) -> Arc<MemoryStub> {
        let tx = {
            let mut state = self.state.lock();
            state.tx_counter += 1;
            state.tx_counter
        };
        Arc::new(MemoryStub {
            ledger: self.clone(),
            creator,
            tx_id: format!("tx-{tx:08}"),
            timestamp_ms: GENESIS_TIMESTAMP_MS + tx * TX_TIMESTAMP_STEP_MS,
        })
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.state.lock().events.clone()
    }

    /// Raw world-state read bypassing any transaction context.
    pub fn world_state(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().world.get(key).map(|e| e.value.clone())
    }

    /// Raw private-data read bypassing membership checks.
    pub fn private_data(&self, collection: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.entries.get(key))
            .map(|e| e.value.clone())
    }

    /// [`MemoryLedger::world_state`] decoded as JSON; `None` for absent or
    /// non-JSON values.
    pub fn world_json(&self, key: &str) -> Option<Value> {
        self.world_state(key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn private_json(&self, collection: &str, key: &str) -> Option<Value> {
        self.private_data(collection, key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn world_keys(&self) -> Vec<String> {
        self.state.lock().world.keys().cloned().collect()
    }

    pub fn collection_keys(&self, collection: &str) -> Vec<String> {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn upsert_entry(entries: &mut BTreeMap<String, KvEntry>, key: &str, value: Vec<u8>, now: u64) {
    match entries.get_mut(key) {
        Some(entry) => {
            entry.value = value;
            entry.version += 1;
        }
        None => {
            entries.insert(
                key.to_string(),
                KvEntry {
                    value,
                    version: 1,
                    created_at: now,
                },
            );
        }
    }
}

fn run_query<'a>(
    entries: impl Iterator<Item = (&'a String, &'a KvEntry)>,
    query: &MangoQuery,
) -> Result<Vec<KvPair>, FabricError> {
    let mut hits = Vec::new();
    for (key, entry) in entries {
        let Ok(doc) = serde_json::from_slice::<Value>(&entry.value) else {
            continue;
        };
        if matches(&query.selector, &doc)? {
            hits.push((key.clone(), doc));
        }
    }
    sort_documents(&mut hits, &query.sort, |(_, doc)| doc);
    let mut out = Vec::with_capacity(hits.len());
    for (key, doc) in hits {
        let doc = project(doc, &query.fields);
        out.push(KvPair {
            key,
            value: serde_json::to_vec(&doc)?,
        });
    }
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    Ok(out)
}

fn project(doc: Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return doc;
    }
    match doc {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| fields.iter().any(|f| f == k))
                .collect(),
        ),
        other => other,
    }
}

pub struct MemoryStub {
    ledger: MemoryLedger,
    creator: Identity,
    tx_id: String,
    timestamp_ms: u64,
}

impl MemoryStub {
    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut CollectionState) -> Result<T, FabricError>,
    ) -> Result<T, FabricError> {
        let mut state = self.ledger.state.lock();
        let coll = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| FabricError::not_found(ResourceType::Collection, collection))?;
        f(coll)
    }

    fn check_read(&self, collection: &str, policy: &CollectionPolicy) -> Result<(), FabricError> {
        if policy.can_read(&self.creator.msp_id) {
            return Ok(());
        }
        Err(FabricError::PermissionDenied(format!(
            "tx creator {} does not have read access permission on private data collection {collection}",
            self.creator.msp_id
        )))
    }
}

#[async_trait]
impl LedgerStub for MemoryStub {
    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, FabricError> {
        Ok(self.ledger.world_state(key))
    }

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), FabricError> {
        if key.is_empty() {
            return Err(FabricError::Validation("key must not be empty".into()));
        }
        let mut state = self.ledger.state.lock();
        upsert_entry(&mut state.world, key, value, self.timestamp_ms);
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> Result<(), FabricError> {
        self.ledger.state.lock().world.remove(key);
        Ok(())
    }

    async fn get_private_data(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, FabricError> {
        self.with_collection(collection, |coll| {
            self.check_read(collection, &coll.policy)?;
            Ok(coll.entries.get(key).map(|e| e.value.clone()))
        })
    }

    async fn put_private_data(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), FabricError> {
        let now = self.timestamp_ms;
        self.with_collection(collection, |coll| {
            if !coll.policy.can_write(&self.creator.msp_id) {
                return Err(FabricError::PermissionDenied(format!(
                    "tx creator {} cannot write to private data collection {collection}",
                    self.creator.msp_id
                )));
            }
            upsert_entry(&mut coll.entries, key, value, now);
            Ok(())
        })
    }

    async fn delete_private_data(&self, collection: &str, key: &str) -> Result<(), FabricError> {
        self.with_collection(collection, |coll| {
            if !coll.policy.can_write(&self.creator.msp_id) {
                return Err(FabricError::PermissionDenied(format!(
                    "tx creator {} cannot delete from private data collection {collection}",
                    self.creator.msp_id
                )));
            }
            coll.entries.remove(key);
            Ok(())
        })
    }

    async fn get_query_result(&self, query: &str) -> Result<Vec<KvPair>, FabricError> {
        let query = MangoQuery::parse(query)?;
        let state = self.ledger.state.lock();
        run_query(state.world.iter(), &query)
    }

    async fn get_query_result_with_pagination(
        &self,
        query: &str,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<PagedQueryResult, FabricError> {
        let mut query = MangoQuery::parse(query)?;
        query.limit = None;
        let offset = match bookmark.filter(|b| !b.is_empty()) {
            Some(b) => b
                .parse::<usize>()
                .map_err(|_| FabricError::Validation(format!("malformed bookmark {b:?}")))?,
            None => 0,
        };
        let all = {
            let state = self.ledger.state.lock();
            run_query(state.world.iter(), &query)?
        };
        let page_size = page_size.max(1);
        let results: Vec<KvPair> = all.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + results.len();
        let bookmark = if next < all.len() {
            next.to_string()
        } else {
            String::new()
        };
        Ok(PagedQueryResult {
            metadata: QueryResponseMetadata {
                fetched_records_count: results.len(),
                bookmark,
            },
            results,
        })
    }

    async fn get_private_data_query_result(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<Vec<KvPair>, FabricError> {
        let query = MangoQuery::parse(query)?;
        self.with_collection(collection, |coll| {
            self.check_read(collection, &coll.policy)?;
            run_query(coll.entries.iter(), &query)
        })
    }

    fn set_event(&self, name: &str, payload: Vec<u8>) -> Result<(), FabricError> {
        if name.is_empty() {
            return Err(FabricError::Validation("event name must not be empty".into()));
        }
        let mut state = self.ledger.state.lock();
        // one event per transaction; the last call wins
        state.events.retain(|e| e.tx_id != self.tx_id);
        state.events.push(LedgerEvent {
            tx_id: self.tx_id.clone(),
            name: name.to_string(),
            payload,
        });
        Ok(())
    }

    fn get_tx_id(&self) -> String {
        self.tx_id.clone()
    }

    fn get_date_timestamp(&self) -> u64 {
        self.timestamp_ms
    }

    fn get_creator(&self) -> Identity {
        self.creator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).expect("encode")
    }

    #[tokio::test]
    async fn private_reads_enforce_membership() {
        let ledger = MemoryLedger::new();
        ledger.define_collection("OrgACollection", CollectionPolicy::members(&["OrgA"]));
        let org_a = ledger.stub(Identity::new("alice", "OrgA"));
        let org_b = ledger.stub(Identity::new("bob", "OrgB"));

        org_a
            .put_private_data("OrgACollection", "k", b"secret".to_vec())
            .await
            .expect("write");
        assert_eq!(
            org_a
                .get_private_data("OrgACollection", "k")
                .await
                .expect("read"),
            Some(b"secret".to_vec())
        );
        let err = org_b
            .get_private_data("OrgACollection", "k")
            .await
            .expect_err("non-member");
        assert_eq!(err.code_str(), "permission_denied");
    }

    #[tokio::test]
    async fn undefined_collection_is_not_found() {
        let ledger = MemoryLedger::new();
        let stub = ledger.stub(Identity::new("alice", "OrgA"));
        let err = stub
            .put_private_data("nope", "k", Vec::new())
            .await
            .expect_err("missing collection");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn paginated_query_walks_bookmarks() {
        let ledger = MemoryLedger::new();
        let stub = ledger.stub(Identity::new("alice", "OrgA"));
        for i in 0..5 {
            stub.put_state(&format!("k{i}"), doc(json!({"t": "x", "n": i})))
                .await
                .expect("put");
        }
        let q = r#"{"selector":{"t":"x"},"sort":[{"n":"desc"}]}"#;
        let first = stub
            .get_query_result_with_pagination(q, 2, None)
            .await
            .expect("page 1");
        assert_eq!(first.metadata.fetched_records_count, 2);
        assert_eq!(first.results[0].key, "k4");
        let second = stub
            .get_query_result_with_pagination(q, 2, Some(&first.metadata.bookmark))
            .await
            .expect("page 2");
        assert_eq!(second.results[0].key, "k2");
        let third = stub
            .get_query_result_with_pagination(q, 2, Some(&second.metadata.bookmark))
            .await
            .expect("page 3");
        assert_eq!(third.results.len(), 1);
        assert!(third.metadata.bookmark.is_empty());
    }

    #[tokio::test]
    async fn last_event_per_transaction_wins() {
        let ledger = MemoryLedger::new();
        let stub = ledger.stub(Identity::new("alice", "OrgA"));
        stub.set_event("a", b"1".to_vec()).expect("event");
        stub.set_event("b", b"2".to_vec()).expect("event");
        let events = ledger.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "b");
    }

    #[test]
    fn stubs_get_increasing_timestamps() {
        let ledger = MemoryLedger::new();
        let a = ledger.stub(Identity::new("alice", "OrgA"));
        let b = ledger.stub(Identity::new("alice", "OrgA"));
        assert!(b.get_date_timestamp() > a.get_date_timestamp());
        assert_ne!(a.get_tx_id(), b.get_tx_id());
    }
}
