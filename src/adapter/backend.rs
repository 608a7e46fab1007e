//! World-state vs. private-collection storage strategies.
//!
//! The routing decision is taken once per call by [`backend_for`]; everything
//! downstream talks to a `StorageBackend` and never branches on where the
//! bytes live.

use crate::context::Context;
use crate::error::FabricError;
use crate::ledger::{KvPair, LedgerStub};
use crate::model::Record;
use crate::query::MangoQuery;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub rows: Vec<(String, Record)>,
    pub fetched: usize,
    /// `None` once the result set is exhausted.
    pub bookmark: Option<String>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// `None` for world state, the collection name otherwise.
    fn collection(&self) -> Option<&str>;

    async fn get(&self, key: &str) -> Result<Option<Record>, FabricError>;

    async fn put(&self, key: &str, record: &Record) -> Result<(), FabricError>;

    async fn delete(&self, key: &str) -> Result<(), FabricError>;

    async fn query(&self, query: &MangoQuery) -> Result<Vec<(String, Record)>, FabricError>;

    async fn query_page(
        &self,
        query: &MangoQuery,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<RawPage, FabricError>;

    fn describe(&self) -> String {
        match self.collection() {
            Some(c) => format!("private collection '{c}'"),
            None => "world state".to_string(),
        }
    }
}

pub struct WorldStateBackend {
    stub: Arc<dyn LedgerStub>,
}

impl WorldStateBackend {
    pub fn new(stub: Arc<dyn LedgerStub>) -> Self {
        Self { stub }
    }
}

pub struct PrivateCollectionBackend {
    stub: Arc<dyn LedgerStub>,
    collection: String,
}

impl PrivateCollectionBackend {
    pub fn new(stub: Arc<dyn LedgerStub>, collection: impl Into<String>) -> Self {
        Self {
            stub,
            collection: collection.into(),
        }
    }
}

/// Picks the backend for one call from the context's routing flags.
pub fn backend_for(ctx: &Context) -> Box<dyn StorageBackend> {
    match ctx.segregated() {
        Some(collection) => Box::new(PrivateCollectionBackend::new(
            Arc::clone(ctx.stub()),
            collection,
        )),
        None => Box::new(WorldStateBackend::new(Arc::clone(ctx.stub()))),
    }
}

pub fn private_backend(ctx: &Context, collection: &str) -> PrivateCollectionBackend {
    PrivateCollectionBackend::new(Arc::clone(ctx.stub()), collection)
}

pub fn world_backend(ctx: &Context) -> WorldStateBackend {
    WorldStateBackend::new(Arc::clone(ctx.stub()))
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Record, FabricError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(FabricError::Validation(format!(
            "stored value is not a JSON object: {other}"
        ))),
    }
}

fn encode(record: &Record) -> Result<Vec<u8>, FabricError> {
    Ok(serde_json::to_vec(record)?)
}

fn decode_rows(pairs: Vec<KvPair>) -> Result<Vec<(String, Record)>, FabricError> {
    pairs
        .into_iter()
        .map(|kv| decode(&kv.value).map(|r| (kv.key, r)))
        .collect()
}

fn bookmark_of(raw: String) -> Option<String> {
    if raw.is_empty() { None } else { Some(raw) }
}

#[async_trait]
impl StorageBackend for WorldStateBackend {
    fn collection(&self) -> Option<&str> {
        None
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, FabricError> {
        self.stub
            .get_state(key)
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn put(&self, key: &str, record: &Record) -> Result<(), FabricError> {
        self.stub.put_state(key, encode(record)?).await
    }

    async fn delete(&self, key: &str) -> Result<(), FabricError> {
        self.stub.delete_state(key).await
    }

    async fn query(&self, query: &MangoQuery) -> Result<Vec<(String, Record)>, FabricError> {
        decode_rows(self.stub.get_query_result(&query.to_json()?).await?)
    }

    async fn query_page(
        &self,
        query: &MangoQuery,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<RawPage, FabricError> {
        let page = self
            .stub
            .get_query_result_with_pagination(&query.to_json()?, page_size, bookmark)
            .await?;
        Ok(RawPage {
            fetched: page.metadata.fetched_records_count,
            bookmark: bookmark_of(page.metadata.bookmark),
            rows: decode_rows(page.results)?,
        })
    }
}

#[async_trait]
impl StorageBackend for PrivateCollectionBackend {
    fn collection(&self) -> Option<&str> {
        Some(&self.collection)
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, FabricError> {
        self.stub
            .get_private_data(&self.collection, key)
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn put(&self, key: &str, record: &Record) -> Result<(), FabricError> {
        self.stub
            .put_private_data(&self.collection, key, encode(record)?)
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), FabricError> {
        self.stub.delete_private_data(&self.collection, key).await
    }

    async fn query(&self, query: &MangoQuery) -> Result<Vec<(String, Record)>, FabricError> {
        decode_rows(
            self.stub
                .get_private_data_query_result(&self.collection, &query.to_json()?)
                .await?,
        )
    }

    /// Private data has no paginated query primitive; pages are cut locally
    /// with a numeric offset bookmark.
    async fn query_page(
        &self,
        query: &MangoQuery,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<RawPage, FabricError> {
        let offset = match bookmark.filter(|b| !b.is_empty()) {
            Some(b) => b
                .parse::<usize>()
                .map_err(|_| FabricError::Validation(format!("malformed bookmark {b:?}")))?,
            None => 0,
        };
        let mut unbounded = query.clone();
        unbounded.limit = None;
        let all = self.query(&unbounded).await?;
        let total = all.len();
        let rows: Vec<_> = all.into_iter().skip(offset).take(page_size.max(1)).collect();
        let next = offset + rows.len();
        Ok(RawPage {
            fetched: rows.len(),
            bookmark: (next < total).then(|| next.to_string()),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SEGREGATED;
    use crate::identity::Identity;
    use crate::ledger::{CollectionPolicy, MemoryLedger};
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn routing_follows_segregated_flag() {
        let ledger = MemoryLedger::new();
        ledger.define_collection("c1", CollectionPolicy::members(&["OrgA"]));
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));

        let world = backend_for(&ctx);
        assert_eq!(world.collection(), None);
        world
            .put("k", &record(json!({"a": 1})))
            .await
            .expect("world put");

        let pinned = ctx.child().with(SEGREGATED, "c1");
        let private = backend_for(&pinned);
        assert_eq!(private.collection(), Some("c1"));
        private
            .put("k", &record(json!({"b": 2})))
            .await
            .expect("private put");

        assert!(ledger.world_state("k").is_some());
        assert!(ledger.private_data("c1", "k").is_some());
        assert_eq!(
            world.get("k").await.expect("get"),
            Some(record(json!({"a": 1})))
        );
    }

    #[tokio::test]
    async fn malformed_stored_json_is_a_serialization_error() {
        let ledger = MemoryLedger::new();
        let stub = ledger.stub(Identity::new("alice", "OrgA"));
        stub.put_state("bad", b"{oops".to_vec()).await.expect("put");
        let ctx = Context::new(stub);
        let err = world_backend(&ctx).get("bad").await.expect_err("malformed");
        assert_eq!(err.code_str(), "serialization");
    }

    #[tokio::test]
    async fn private_pages_use_offset_bookmarks() {
        let ledger = MemoryLedger::new();
        ledger.define_collection("c1", CollectionPolicy::members(&["OrgA"]));
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));
        let backend = private_backend(&ctx, "c1");
        for i in 0..3 {
            backend
                .put(&format!("k{i}"), &record(json!({"t": "x", "n": i})))
                .await
                .expect("put");
        }
        let q = MangoQuery {
            selector: json!({"t": "x"}),
            fields: Vec::new(),
            sort: Vec::new(),
            limit: None,
            bookmark: None,
        };
        let first = backend.query_page(&q, 2, None).await.expect("page");
        assert_eq!(first.fetched, 2);
        let second = backend
            .query_page(&q, 2, first.bookmark.as_deref())
            .await
            .expect("page");
        assert_eq!(second.fetched, 1);
        assert_eq!(second.bookmark, None);
    }
}
