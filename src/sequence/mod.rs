//! Named ledger-backed sequences.
//!
//! A sequence is a single record under the `??sequence` table holding the
//! last issued value and a version counter. Every increment is a
//! read-modify-write under the adapter's per-name lock; the version counter
//! turns a lost race against another endorser into a [`FabricError::Conflict`].

pub mod lock;
pub mod options;
pub mod serial;
pub mod value;

pub use lock::{NamedLockGuard, NamedLocks};
pub use options::SequenceOptions;
pub use serial::{Base36Serial, SerialGenerator};
pub use value::{SequenceType, SequenceValue};

use crate::adapter::FabricAdapter;
use crate::adapter::backend::{StorageBackend, private_backend, world_backend};
use crate::context::Context;
use crate::error::{FabricError, ResourceType};
use crate::ledger::create_composite_key;
use crate::model::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Table sequences are stored under.
pub const SEQUENCE_TABLE: &str = "??sequence";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRecord {
    pub id: String,
    pub current: Value,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SequenceRecord {
    fn to_stored(&self, table_field: &str) -> Result<Record, FabricError> {
        let mut record = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(FabricError::internal("sequence record is not an object")),
        };
        record.insert(table_field.to_string(), Value::from(SEQUENCE_TABLE));
        Ok(record)
    }

    fn from_stored(mut record: Record, table_field: &str) -> Result<Self, FabricError> {
        record.remove(table_field);
        Ok(serde_json::from_value(Value::Object(record))?)
    }
}

#[derive(Clone)]
pub struct Sequence {
    adapter: FabricAdapter,
    name: String,
    options: SequenceOptions,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl Sequence {
    pub fn new(adapter: FabricAdapter, options: SequenceOptions) -> Result<Self, FabricError> {
        options.validate()?;
        let name = options
            .name
            .clone()
            .ok_or_else(|| FabricError::invalid_config("sequence requires a name"))?;
        Ok(Self {
            adapter,
            name,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &SequenceOptions {
        &self.options
    }

    fn key(&self) -> Result<String, FabricError> {
        create_composite_key(SEQUENCE_TABLE, &[self.name.as_str()])
    }

    /// Stores the sequence is mirrored to, primary first. World state is
    /// skipped when the owning model is fully segregated.
    fn targets(&self, ctx: &Context) -> Vec<Box<dyn StorageBackend>> {
        let seg = ctx.get_sequence_segregation(&self.name).unwrap_or_default();
        let mut out: Vec<Box<dyn StorageBackend>> = Vec::new();
        if !seg.fully_segregated || seg.collections.is_empty() {
            out.push(Box::new(world_backend(ctx)));
        }
        for collection in &seg.collections {
            out.push(Box::new(private_backend(ctx, collection)));
        }
        out
    }

    async fn read_record(&self, ctx: &Context) -> Result<Option<SequenceRecord>, FabricError> {
        let key = self.key()?;
        let table_field = &self.adapter.config().table_field;
        for backend in self.targets(ctx) {
            match backend.get(&key).await {
                Ok(Some(stored)) => return SequenceRecord::from_stored(stored, table_field).map(Some),
                Ok(None) => return Ok(None),
                Err(FabricError::PermissionDenied(reason)) => {
                    debug!(sequence = %self.name, backend = %backend.describe(), %reason, "skipping unreadable sequence store");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn start_value(&self) -> Result<SequenceValue, FabricError> {
        self.options
            .start_with
            .clone()
            .ok_or_else(|| FabricError::not_found(ResourceType::Sequence, &self.name))
    }

    fn cached(&self, ctx: &Context) -> Result<Option<(SequenceValue, u64)>, FabricError> {
        match ctx.cached_sequence_value(&self.name) {
            None => Ok(None),
            Some(entry) => {
                SequenceValue::from_json(self.options.kind, &entry.value).map(|v| Some((v, entry.version)))
            }
        }
    }

    /// Picks the value to advance from. The stored record wins unless this
    /// context wrote a newer version that the stub does not reflect yet.
    fn resolve(
        &self,
        record: Option<&SequenceRecord>,
        ctx: &Context,
    ) -> Result<SequenceValue, FabricError> {
        match (record, self.cached(ctx)?) {
            (Some(r), Some((value, version))) if version > r.version => Ok(value),
            (Some(r), _) => SequenceValue::from_json(self.options.kind, &r.current),
            (None, Some((value, _))) => Ok(value),
            (None, None) => self.start_value(),
        }
    }

    /// Last issued value, or the start value when nothing was issued yet.
    pub async fn current(&self, ctx: &Context) -> Result<SequenceValue, FabricError> {
        let record = self.read_record(ctx).await?;
        self.resolve(record.as_ref(), ctx)
    }

    pub async fn next(&self, ctx: &Context) -> Result<SequenceValue, FabricError> {
        self.increment(None, ctx).await
    }

    /// Allocates `count` consecutive values with a single ledger write.
    pub async fn range(&self, count: u64, ctx: &Context) -> Result<Vec<SequenceValue>, FabricError> {
        if !self.options.kind.is_numeric() {
            return Err(FabricError::invalid_config(format!(
                "range is not supported for {} sequences",
                self.options.kind
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let step = self.options.increment_by;
        let delta = count
            .checked_mul(step)
            .ok_or_else(|| FabricError::invalid_config("range size overflows"))?;
        let (current, last) = self.advance_locked(delta, ctx).await?;

        let mut values = Vec::with_capacity(count as usize);
        let mut cursor = current;
        for _ in 0..count {
            cursor = cursor.checked_add(step)?;
            values.push(cursor.clone());
        }
        if values.last() != Some(&last) {
            return Err(FabricError::internal(format!(
                "sequence {} moved during range allocation: expected {}, stored {last}",
                self.name,
                cursor
            )));
        }
        Ok(values)
    }

    /// Advances by `delta` (default: one step) and returns the new value.
    pub async fn increment(
        &self,
        delta: Option<u64>,
        ctx: &Context,
    ) -> Result<SequenceValue, FabricError> {
        let step = self.options.increment_by;
        let delta = delta.unwrap_or(step);
        if delta == 0 || delta % step != 0 {
            return Err(FabricError::invalid_config(format!(
                "increment {delta} is not a multiple of step {step} for sequence {}",
                self.name
            )));
        }

        self.advance_locked(delta, ctx).await.map(|(_, next)| next)
    }

    /// Advances under the per-name lock, returning the value advanced from
    /// and the value written.
    async fn advance_locked(
        &self,
        delta: u64,
        ctx: &Context,
    ) -> Result<(SequenceValue, SequenceValue), FabricError> {
        let step = self.options.increment_by;
        let _guard = self.adapter.locks().acquire(&self.name).await;
        let retry_limit = self.adapter.config().uuid_retry_limit;
        let mut attempts: u32 = 0;
        loop {
            let record = self.read_record(ctx).await?;
            let current = self.resolve(record.as_ref(), ctx)?;
            let next = self.advance(&current, delta / step, delta)?;

            match self.persist(record.as_ref(), &next, ctx).await {
                Ok(version) => {
                    ctx.cache_sequence_value(&self.name, next.to_json(), version);
                    debug!(sequence = %self.name, value = %next, version, "sequence advanced");
                    return Ok((current, next));
                }
                Err(e) if e.is_conflict() && self.options.kind == SequenceType::Uuid => {
                    attempts += 1;
                    if retry_limit.is_some_and(|limit| attempts >= limit) {
                        warn!(sequence = %self.name, attempts, "giving up on conflicting uuid");
                        return Err(e);
                    }
                    debug!(sequence = %self.name, attempts, "uuid conflict, regenerating");
                    ctx.forget_sequence_value(&self.name);
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn advance(
        &self,
        current: &SequenceValue,
        steps: u64,
        delta: u64,
    ) -> Result<SequenceValue, FabricError> {
        match self.options.kind {
            SequenceType::Number | SequenceType::BigInt => current.checked_add(delta),
            SequenceType::Serial => {
                let previous = current.as_text().unwrap_or_default();
                self.adapter
                    .serial()
                    .next(previous, steps)
                    .map(SequenceValue::Text)
            }
            SequenceType::Uuid => {
                let mut value = current.to_string();
                for _ in 0..steps {
                    value = Uuid::new_v5(
                        &Uuid::NAMESPACE_OID,
                        format!("{}:{value}", self.name).as_bytes(),
                    )
                    .to_string();
                }
                Ok(SequenceValue::Text(value))
            }
        }
    }

    /// Writes `next` to every target and returns the primary's new version.
    /// The primary target must still hold the version that was read; replicas
    /// are upserted.
    async fn persist(
        &self,
        read: Option<&SequenceRecord>,
        next: &SequenceValue,
        ctx: &Context,
    ) -> Result<u64, FabricError> {
        let key = self.key()?;
        let table_field = &self.adapter.config().table_field;
        let now = ctx.timestamp();
        let expected = read.map(|r| r.version);
        let mut written = 0;

        for (i, backend) in self.targets(ctx).iter().enumerate() {
            let existing = backend
                .get(&key)
                .await?
                .map(|stored| SequenceRecord::from_stored(stored, table_field))
                .transpose()?;
            if i == 0 {
                let found = existing.as_ref().map(|r| r.version);
                if found != expected {
                    return Err(FabricError::Conflict(format!(
                        "sequence {} changed concurrently (expected version {expected:?}, found {found:?})",
                        self.name
                    )));
                }
            }
            let record = match self.update_record(backend.as_ref(), &key, existing, next, now).await {
                Err(e) if e.is_not_found() => self.create_record(backend.as_ref(), &key, next, now).await?,
                other => other?,
            };
            if i == 0 {
                written = record.version;
            }
            debug!(sequence = %self.name, backend = %backend.describe(), version = record.version, "persisted sequence");
        }
        Ok(written)
    }

    async fn update_record(
        &self,
        backend: &dyn StorageBackend,
        key: &str,
        existing: Option<SequenceRecord>,
        next: &SequenceValue,
        now: u64,
    ) -> Result<SequenceRecord, FabricError> {
        let mut record =
            existing.ok_or_else(|| FabricError::not_found(ResourceType::Sequence, &self.name))?;
        record.current = next.to_json();
        record.version += 1;
        record.updated_at = now;
        backend
            .put(key, &record.to_stored(&self.adapter.config().table_field)?)
            .await?;
        Ok(record)
    }

    async fn create_record(
        &self,
        backend: &dyn StorageBackend,
        key: &str,
        next: &SequenceValue,
        now: u64,
    ) -> Result<SequenceRecord, FabricError> {
        let record = SequenceRecord {
            id: self.name.clone(),
            current: next.to_json(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        backend
            .put(key, &record.to_stored(&self.adapter.config().table_field)?)
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::identity::Identity;
    use crate::ledger::{CollectionPolicy, MemoryLedger};

    fn setup() -> (MemoryLedger, FabricAdapter, Context) {
        let ledger = MemoryLedger::new();
        let adapter = FabricAdapter::new(AdapterConfig::default()).expect("adapter");
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));
        (ledger, adapter, ctx)
    }

    #[tokio::test]
    async fn current_falls_back_to_start_value() {
        let (_ledger, adapter, ctx) = setup();
        let seq = adapter
            .sequence(SequenceOptions::number().named("s").start_with(7))
            .expect("seq");
        assert_eq!(seq.current(&ctx).await.expect("current"), SequenceValue::Number(7));

        let strict = adapter
            .sequence(SequenceOptions::number().named("strict").without_start())
            .expect("seq");
        assert!(strict.current(&ctx).await.expect_err("no start").is_not_found());
    }

    #[tokio::test]
    async fn increments_must_be_step_multiples() {
        let (_ledger, adapter, ctx) = setup();
        let seq = adapter
            .sequence(SequenceOptions::number().named("s").increment_by(5))
            .expect("seq");
        let err = seq.increment(Some(7), &ctx).await.expect_err("not multiple");
        assert_eq!(err.code_str(), "invalid_config");
        assert_eq!(seq.increment(Some(10), &ctx).await.expect("ok"), SequenceValue::Number(10));
    }

    #[tokio::test]
    async fn record_carries_version_and_table_marker() {
        let (ledger, adapter, ctx) = setup();
        let seq = adapter.sequence(SequenceOptions::number().named("s")).expect("seq");
        seq.next(&ctx).await.expect("next");
        seq.next(&ctx).await.expect("next");
        let key = create_composite_key(SEQUENCE_TABLE, &["s"]).expect("key");
        let stored = ledger.world_json(&key).expect("stored");
        assert_eq!(stored["version"], 2);
        assert_eq!(stored["current"], 2);
        assert_eq!(stored["??table"], SEQUENCE_TABLE);
    }

    #[tokio::test]
    async fn serial_sequences_use_the_generator() {
        let (_ledger, adapter, ctx) = setup();
        let seq = adapter.sequence(SequenceOptions::serial().named("ser")).expect("seq");
        assert_eq!(seq.next(&ctx).await.expect("next").to_string(), "00000001");
        assert_eq!(seq.next(&ctx).await.expect("next").to_string(), "00000002");
        let err = seq.range(2, &ctx).await.expect_err("no range for serial");
        assert_eq!(err.code_str(), "invalid_config");
    }

    #[tokio::test]
    async fn fully_segregated_sequences_skip_world_state() {
        let (ledger, adapter, ctx) = setup();
        ledger.define_collection("c1", CollectionPolicy::members(&["OrgA"]));
        ctx.set_sequence_segregation("s", true, ["c1"]);
        let seq = adapter.sequence(SequenceOptions::number().named("s")).expect("seq");
        seq.next(&ctx).await.expect("next");
        let key = create_composite_key(SEQUENCE_TABLE, &["s"]).expect("key");
        assert!(ledger.world_state(&key).is_none());
        assert!(ledger.private_data("c1", &key).is_some());
    }

    #[tokio::test]
    async fn uuid_values_are_deterministic_per_predecessor() {
        let (_ledger, adapter, ctx) = setup();
        let seq = adapter.sequence(SequenceOptions::uuid().named("u")).expect("seq");
        let a = seq.next(&ctx).await.expect("first");
        let b = seq.next(&ctx).await.expect("second");
        assert_ne!(a, b);
        let expected = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("u:{}", Uuid::nil()).as_bytes());
        assert_eq!(a.to_string(), expected.to_string());
    }
}
