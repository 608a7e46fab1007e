//! Storage adapter: translates model records to and from ledger records and
//! routes every read and write to world state or private collections
//! according to the operation's [`Context`].

pub mod backend;

pub use backend::{
    PrivateCollectionBackend, RawPage, StorageBackend, WorldStateBackend, backend_for,
};

use crate::config::AdapterConfig;
use crate::context::Context;
use crate::error::{FabricError, ResourceType};
use crate::ledger::create_composite_key;
use crate::model::{ModelRegistry, ModelSpec, Record, id_string};
use crate::query::MangoQuery;
use crate::segregation::Routing;
use crate::sequence::{Base36Serial, NamedLocks, SequenceOptions, SerialGenerator, Sequence};
use backend::{private_backend, world_backend};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A model record split for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub id: String,
    pub key: String,
    /// World-state record in column space, table marker included.
    pub record: Record,
    /// Field-space values that are not persisted with `record`.
    pub transient: Record,
    /// Column-space payload per private collection.
    pub segregated: BTreeMap<String, Record>,
    /// Nothing goes to world state.
    pub fully_segregated: bool,
}

impl PreparedRecord {
    /// Public record with every private payload folded in.
    pub fn merged(&self) -> Record {
        let mut out = self.record.clone();
        for payload in self.segregated.values() {
            for (k, v) in payload {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

struct AdapterInner {
    config: AdapterConfig,
    registry: ModelRegistry,
    locks: NamedLocks,
    serial: Arc<dyn SerialGenerator>,
}

#[derive(Clone)]
pub struct FabricAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for FabricAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricAdapter")
            .field("config", &self.inner.config)
            .field("models", &self.inner.registry.len())
            .finish()
    }
}

impl FabricAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, FabricError> {
        Self::with_serial_generator(config, Arc::new(Base36Serial::default()))
    }

    pub fn with_serial_generator(
        config: AdapterConfig,
        serial: Arc<dyn SerialGenerator>,
    ) -> Result<Self, FabricError> {
        config.validate()?;
        info!(
            table_field = %config.table_field,
            reserved = ?config.reserved_fields,
            emit_events = config.emit_events,
            uuid_retry_limit = ?config.uuid_retry_limit,
            "fabric adapter initialized"
        );
        Ok(Self {
            inner: Arc::new(AdapterInner {
                config,
                registry: ModelRegistry::new(),
                locks: NamedLocks::new(),
                serial,
            }),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn locks(&self) -> &NamedLocks {
        &self.inner.locks
    }

    pub fn serial(&self) -> &dyn SerialGenerator {
        self.inner.serial.as_ref()
    }

    pub fn register(&self, spec: ModelSpec) -> Result<Arc<ModelSpec>, FabricError> {
        self.inner.registry.register(spec)
    }

    pub fn sequence(&self, options: SequenceOptions) -> Result<Sequence, FabricError> {
        Sequence::new(self.clone(), options)
    }

    /// Sequence backing `spec`'s primary key, if it declares one.
    pub fn pk_sequence(&self, spec: &ModelSpec) -> Result<Option<Sequence>, FabricError> {
        match (&spec.pk_sequence, spec.pk_sequence_name()) {
            (Some(options), Some(name)) => self.sequence(options.clone().named(name)).map(Some),
            _ => Ok(None),
        }
    }

    pub fn key_for(&self, spec: &ModelSpec, id: &str) -> Result<String, FabricError> {
        create_composite_key(&spec.table, &[id])
    }

    /// Splits a field-space model record into its world-state record,
    /// private payloads and transient remainder. Segregated fields go only
    /// where `routing` sends them.
    pub fn prepare(
        &self,
        spec: &ModelSpec,
        model: &Record,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<PreparedRecord, FabricError> {
        let pk_value = model.get(&spec.primary_key).cloned().unwrap_or(Value::Null);
        let id = id_string(&pk_value).ok_or_else(|| {
            FabricError::Validation(format!(
                "model '{}' is missing its primary key '{}'",
                spec.name, spec.primary_key
            ))
        })?;
        let key = self.key_for(spec, &id)?;
        let table_field = &self.inner.config.table_field;
        let pinned = ctx.segregated().is_some();

        let mut record = Record::new();
        let mut transient = Record::new();
        let mut segregated: BTreeMap<String, Record> = BTreeMap::new();

        for (field, value) in model {
            if spec.is_transient(field) {
                transient.insert(field.clone(), value.clone());
                continue;
            }
            let column = spec.column(field);
            if self.inner.config.is_reserved(&column) {
                return Err(FabricError::invalid_config(format!(
                    "field '{field}' of model '{}' maps to reserved attribute '{column}'",
                    spec.name
                )));
            }
            if !pinned && !spec.segregation_of(field).is_empty() {
                let mut routed = false;
                for collection in routing.destinations(field) {
                    segregated
                        .entry(collection.clone())
                        .or_default()
                        .insert(column.clone(), value.clone());
                    routed = true;
                }
                if !routed {
                    transient.insert(field.clone(), value.clone());
                }
                continue;
            }
            record.insert(column, value.clone());
        }
        record.insert(table_field.clone(), Value::from(spec.table.as_str()));

        let fully_segregated = !pinned && routing.fully_segregated && !segregated.is_empty();
        let pk_column = spec.column(&spec.primary_key);
        for payload in segregated.values_mut() {
            if fully_segregated {
                for (k, v) in &record {
                    payload.entry(k.clone()).or_insert_with(|| v.clone());
                }
            } else {
                payload.insert(pk_column.clone(), pk_value.clone());
                payload.insert(table_field.clone(), Value::from(spec.table.as_str()));
            }
        }

        Ok(PreparedRecord {
            id,
            key,
            record,
            transient,
            segregated,
            fully_segregated,
        })
    }

    /// Maps a stored record back to field space and restores transient
    /// values. A transient value colliding with a stored one is an error.
    pub fn revert(
        &self,
        spec: &ModelSpec,
        stored: Record,
        id: &str,
        transient: Option<&Record>,
    ) -> Result<Record, FabricError> {
        let config = &self.inner.config;
        let mut out = Record::new();
        for (column, value) in stored {
            if column == config.table_field || config.is_reserved(&column) {
                continue;
            }
            out.insert(spec.field_for_column(&column), value);
        }
        out.entry(spec.primary_key.clone())
            .or_insert_with(|| Value::from(id));
        if let Some(transient) = transient {
            for (field, value) in transient {
                if out.get(field).is_some_and(|v| !v.is_null()) {
                    return Err(FabricError::internal(format!(
                        "transient field '{field}' collides with a stored attribute of {} '{id}'",
                        spec.name
                    )));
                }
                out.insert(field.clone(), value.clone());
            }
        }
        Ok(out)
    }

    /// Reads the first readable copy in `collections`; unreadable ones are
    /// skipped.
    async fn first_private(
        &self,
        ctx: &Context,
        collections: &[String],
        key: &str,
    ) -> Result<Option<Record>, FabricError> {
        for collection in collections {
            match private_backend(ctx, collection).get(key).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(FabricError::PermissionDenied(reason)) => {
                    debug!(%collection, %reason, "collection not readable");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub async fn create(
        &self,
        spec: &ModelSpec,
        prepared: &PreparedRecord,
        ctx: &Context,
    ) -> Result<Record, FabricError> {
        let exists = || FabricError::AlreadyExists {
            resource_type: ResourceType::Record,
            resource_id: format!("{}:{}", spec.table, prepared.id),
        };
        if let Some(collection) = ctx.segregated() {
            let backend = private_backend(ctx, &collection);
            if backend.get(&prepared.key).await?.is_some() {
                return Err(exists());
            }
            let merged = prepared.merged();
            backend.put(&prepared.key, &merged).await?;
            debug!(table = %spec.table, id = %prepared.id, %collection, "created pinned record");
            return Ok(merged);
        }

        if prepared.fully_segregated {
            let collections: Vec<String> = prepared.segregated.keys().cloned().collect();
            if self.first_private(ctx, &collections, &prepared.key).await?.is_some() {
                return Err(exists());
            }
        } else {
            let world = world_backend(ctx);
            if world.get(&prepared.key).await?.is_some() {
                return Err(exists());
            }
            world.put(&prepared.key, &prepared.record).await?;
        }
        for (collection, payload) in &prepared.segregated {
            private_backend(ctx, collection)
                .put(&prepared.key, payload)
                .await?;
        }
        debug!(
            table = %spec.table,
            id = %prepared.id,
            collections = prepared.segregated.len(),
            "created record"
        );
        Ok(prepared.merged())
    }

    /// Reads the world-state record and folds in every readable private
    /// payload `routing` names.
    pub async fn read(
        &self,
        spec: &ModelSpec,
        id: &str,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<Record, FabricError> {
        let key = self.key_for(spec, id)?;
        let missing = || FabricError::not_found(ResourceType::Record, format!("{}:{id}", spec.table));

        if let Some(collection) = ctx.segregated() {
            return private_backend(ctx, &collection)
                .get(&key)
                .await?
                .ok_or_else(missing);
        }

        let mut record = if routing.fully_segregated {
            Record::new()
        } else {
            world_backend(ctx).get(&key).await?.ok_or_else(missing)?
        };
        self.merge_private(&key, &mut record, routing, ctx).await?;
        if record.is_empty() {
            return Err(missing());
        }
        Ok(record)
    }

    /// Folds readable private payloads stored under `key` into `record`.
    pub async fn merge_private(
        &self,
        key: &str,
        record: &mut Record,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<(), FabricError> {
        for collection in &routing.read {
            match private_backend(ctx, collection).get(key).await {
                Ok(Some(payload)) => {
                    for (k, v) in payload {
                        record.insert(k, v);
                    }
                }
                Ok(None) => {}
                Err(FabricError::PermissionDenied(reason)) => {
                    debug!(%collection, %key, %reason, "skipping unreadable private payload");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn update(
        &self,
        spec: &ModelSpec,
        prepared: &PreparedRecord,
        ctx: &Context,
    ) -> Result<Record, FabricError> {
        let missing = || {
            FabricError::not_found(ResourceType::Record, format!("{}:{}", spec.table, prepared.id))
        };
        if let Some(collection) = ctx.segregated() {
            let backend = private_backend(ctx, &collection);
            if backend.get(&prepared.key).await?.is_none() {
                return Err(missing());
            }
            let merged = prepared.merged();
            backend.put(&prepared.key, &merged).await?;
            return Ok(merged);
        }

        if prepared.fully_segregated {
            let collections: Vec<String> = prepared.segregated.keys().cloned().collect();
            if self.first_private(ctx, &collections, &prepared.key).await?.is_none() {
                return Err(missing());
            }
        } else {
            let world = world_backend(ctx);
            if world.get(&prepared.key).await?.is_none() {
                return Err(missing());
            }
            world.put(&prepared.key, &prepared.record).await?;
        }
        for (collection, payload) in &prepared.segregated {
            private_backend(ctx, collection)
                .put(&prepared.key, payload)
                .await?;
        }
        debug!(table = %spec.table, id = %prepared.id, "updated record");
        Ok(prepared.merged())
    }

    /// Writes the full record into `collection` without an existence check.
    /// The writer need not be able to read the collection.
    pub async fn replicate(
        &self,
        spec: &ModelSpec,
        prepared: &PreparedRecord,
        collection: &str,
        ctx: &Context,
    ) -> Result<Record, FabricError> {
        let merged = prepared.merged();
        private_backend(ctx, collection)
            .put(&prepared.key, &merged)
            .await?;
        debug!(table = %spec.table, id = %prepared.id, %collection, "replicated record");
        Ok(merged)
    }

    /// Removes the copy held in `collection`, if any.
    pub async fn evict(
        &self,
        spec: &ModelSpec,
        id: &str,
        collection: &str,
        ctx: &Context,
    ) -> Result<(), FabricError> {
        let key = self.key_for(spec, id)?;
        private_backend(ctx, collection).delete(&key).await
    }

    /// Removes the record everywhere the context routes it; returns what was
    /// readable before removal.
    pub async fn delete(
        &self,
        spec: &ModelSpec,
        id: &str,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<Record, FabricError> {
        let key = self.key_for(spec, id)?;
        let previous = self.read(spec, id, routing, ctx).await?;

        if let Some(collection) = ctx.segregated() {
            private_backend(ctx, &collection).delete(&key).await?;
            return Ok(previous);
        }
        if !routing.fully_segregated {
            world_backend(ctx).delete(&key).await?;
        }
        for collection in &routing.read {
            private_backend(ctx, collection).delete(&key).await?;
        }
        debug!(table = %spec.table, %id, "deleted record");
        Ok(previous)
    }

    /// Runs a Mango query against the store the context routes to.
    pub async fn raw(
        &self,
        query: &MangoQuery,
        ctx: &Context,
    ) -> Result<Vec<(String, Record)>, FabricError> {
        let backend = backend_for(ctx);
        debug!(backend = %backend.describe(), "raw query");
        backend.query(query).await
    }

    pub async fn raw_paged(
        &self,
        query: &MangoQuery,
        page_size: usize,
        bookmark: Option<&str>,
        ctx: &Context,
    ) -> Result<RawPage, FabricError> {
        let page_size = self.inner.config.clamp_page_size(Some(page_size));
        backend_for(ctx).query_page(query, page_size, bookmark).await
    }

    /// Query rows with readable private payloads merged in. Fully segregated
    /// models are queried across every readable collection instead.
    pub async fn query_merged(
        &self,
        query: &MangoQuery,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<Vec<(String, Record)>, FabricError> {
        if ctx.segregated().is_some() {
            return self.raw(query, ctx).await;
        }
        if routing.fully_segregated {
            let mut rows: Vec<(String, Record)> = Vec::new();
            for collection in &routing.read {
                let found = match private_backend(ctx, collection).query(query).await {
                    Ok(found) => found,
                    Err(FabricError::PermissionDenied(reason)) => {
                        debug!(%collection, %reason, "skipping unreadable collection");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                for (key, record) in found {
                    match rows.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, existing)) => existing.extend(record),
                        None => rows.push((key, record)),
                    }
                }
            }
            return Ok(rows);
        }
        let mut rows = world_backend(ctx).query(query).await?;
        for (key, record) in rows.iter_mut() {
            self.merge_private(key, record, routing, ctx).await?;
        }
        Ok(rows)
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

    fn spec() -> ModelSpec {
        ModelSpec::new("Asset")
            .table("assets")
            .field("name")
            .add_field(crate::model::FieldSpec::new("label").column("lbl"))
            .private_field("secret", "c1")
            .transient_field("scratch")
    }

    fn secret_in_c1() -> Routing {
        let mut routing = Routing::default();
        routing.write_to("c1", ["secret"]);
        routing.read_from(["c1"]);
        routing
    }

    fn setup() -> (MemoryLedger, FabricAdapter, Context) {
        let ledger = MemoryLedger::new();
        ledger.define_collection("c1", CollectionPolicy::members(&["OrgA"]));
        let adapter = FabricAdapter::new(AdapterConfig::default()).expect("adapter");
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));
        (ledger, adapter, ctx)
    }

    #[test]
    fn prepare_maps_columns_and_splits_payloads() {
        let (_ledger, adapter, ctx) = setup();
        let prepared = adapter
            .prepare(
                &spec(),
                &record(json!({"id": "a1", "name": "n", "label": "l", "secret": "s", "scratch": 1})),
                &secret_in_c1(),
                &ctx,
            )
            .expect("prepare");
        assert_eq!(prepared.record.get("lbl"), Some(&json!("l")));
        assert!(!prepared.record.contains_key("secret"));
        assert_eq!(prepared.record.get("??table"), Some(&json!("assets")));
        assert_eq!(prepared.segregated["c1"].get("secret"), Some(&json!("s")));
        assert_eq!(prepared.transient.get("scratch"), Some(&json!(1)));
        assert!(!prepared.fully_segregated);
    }

    #[test]
    fn reserved_columns_are_rejected() {
        let (_ledger, adapter, ctx) = setup();
        let spec = ModelSpec::new("Bad").add_field(crate::model::FieldSpec::new("rev").column("_rev"));
        let err = adapter
            .prepare(&spec, &record(json!({"id": "x", "rev": 1})), &Routing::default(), &ctx)
            .expect_err("reserved");
        assert_eq!(err.code_str(), "invalid_config");
    }

    #[test]
    fn revert_rejects_transient_collisions() {
        let (_ledger, adapter, _ctx) = setup();
        let stored = record(json!({"id": "a1", "lbl": "l", "??table": "assets"}));
        let out = adapter
            .revert(&spec(), stored.clone(), "a1", None)
            .expect("revert");
        assert_eq!(out.get("label"), Some(&json!("l")));
        assert!(!out.contains_key("??table"));

        let clash = record(json!({"label": "other"}));
        let err = adapter
            .revert(&spec(), stored, "a1", Some(&clash))
            .expect_err("collision");
        assert_eq!(err.code_str(), "internal");
    }

    #[tokio::test]
    async fn create_read_update_delete_round_trip() {
        let (ledger, adapter, ctx) = setup();
        let spec = spec();
        let routing = secret_in_c1();
        let prepared = adapter
            .prepare(&spec, &record(json!({"id": "a1", "name": "n", "secret": "s"})), &routing, &ctx)
            .expect("prepare");
        adapter.create(&spec, &prepared, &ctx).await.expect("create");
        let err = adapter.create(&spec, &prepared, &ctx).await.expect_err("duplicate");
        assert_eq!(err.code_str(), "already_exists");

        let key = adapter.key_for(&spec, "a1").expect("key");
        assert!(ledger.world_json(&key).expect("world")["secret"].is_null());
        assert_eq!(ledger.private_json("c1", &key).expect("private")["secret"], "s");

        let read = adapter.read(&spec, "a1", &routing, &ctx).await.expect("read");
        assert_eq!(read.get("secret"), Some(&json!("s")));

        let missing = adapter
            .prepare(&spec, &record(json!({"id": "zz", "name": "n"})), &routing, &ctx)
            .expect("prepare");
        assert!(adapter.update(&spec, &missing, &ctx).await.expect_err("absent").is_not_found());

        adapter.delete(&spec, "a1", &routing, &ctx).await.expect("delete");
        assert!(ledger.world_state(&key).is_none());
        assert!(ledger.private_data("c1", &key).is_none());
        assert!(adapter.read(&spec, "a1", &routing, &ctx).await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn pinned_context_writes_one_merged_copy() {
        let (ledger, adapter, ctx) = setup();
        let spec = spec();
        let pinned = ctx.child().with(SEGREGATED, "c1");
        let prepared = adapter
            .prepare(&spec, &record(json!({"id": "a1", "name": "n", "secret": "s"})), &secret_in_c1(), &pinned)
            .expect("prepare");
        assert!(prepared.segregated.is_empty());
        adapter.create(&spec, &prepared, &pinned).await.expect("create");
        let key = adapter.key_for(&spec, "a1").expect("key");
        assert!(ledger.world_state(&key).is_none());
        assert_eq!(ledger.private_json("c1", &key).expect("copy")["secret"], "s");
    }

    #[tokio::test]
    async fn replicas_are_written_without_read_access() {
        let (ledger, adapter, ctx) = setup();
        ledger.define_collection("replica", CollectionPolicy::members(&["OrgB"]));
        let spec = spec();
        let pinned = ctx.child().with(SEGREGATED, "replica");
        let prepared = adapter
            .prepare(&spec, &record(json!({"id": "a1", "name": "n"})), &Routing::default(), &pinned)
            .expect("prepare");
        adapter
            .replicate(&spec, &prepared, "replica", &pinned)
            .await
            .expect("replicate");
        let key = adapter.key_for(&spec, "a1").expect("key");
        assert_eq!(ledger.private_json("replica", &key).expect("copy")["name"], "n");

        adapter
            .evict(&spec, "a1", "replica", &pinned)
            .await
            .expect("evict");
        assert!(ledger.collection_keys("replica").is_empty());
    }
}
