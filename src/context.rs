//! Per-operation execution context.
//!
//! A [`Context`] is created once per top-level operation (a repository call or
//! a chaincode transaction entry) and passed by reference through every
//! sub-call. Flags accumulate; nothing is ever removed during the operation.
//! Child contexts share the parent's ledger handle, identity and routing
//! state, so collection routing registered anywhere in the chain is visible to
//! every participant of the operation.

use crate::error::{FabricError, ResourceType};
use crate::identity::Identity;
use crate::ledger::LedgerStub;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Private collection every read and write of the operation is pinned to.
pub const SEGREGATED: &str = "segregated";
pub const IGNORE_HANDLERS: &str = "ignoreHandlers";
pub const IGNORE_VALIDATION: &str = "ignoreValidation";
/// Set when reads were rerouted to a mirror collection.
pub const MIRROR_READ: &str = "mirrorRead";
pub const FULLY_SEGREGATED: &str = "fullySegregated";

const SEQUENCE_CACHE_PREFIX: &str = "sequence::";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSegregation {
    pub fully_segregated: bool,
    pub collections: Vec<String>,
}

#[derive(Debug, Default)]
struct RoutingState {
    write_to: BTreeMap<String, BTreeSet<String>>,
    read_from: Vec<String>,
    fully_segregated: bool,
    sequences: HashMap<String, SequenceSegregation>,
}

struct ContextInner {
    parent: Option<Weak<ContextInner>>,
    children: Mutex<Vec<Arc<ContextInner>>>,
    stub: Arc<dyn LedgerStub>,
    identity: Identity,
    flags: Mutex<BTreeMap<String, Value>>,
    routing: Arc<Mutex<RoutingState>>,
    last_timestamp: Arc<AtomicU64>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tx_id", &self.inner.stub.get_tx_id())
            .field("identity", &self.inner.identity)
            .field("flags", &*self.inner.flags.lock())
            .finish()
    }
}

impl Context {
    /// Opens a context for the transaction behind `stub`, acting as its creator.
    pub fn new(stub: Arc<dyn LedgerStub>) -> Self {
        let identity = stub.get_creator();
        Self::with_identity(stub, identity)
    }

    pub fn with_identity(stub: Arc<dyn LedgerStub>, identity: Identity) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                parent: None,
                children: Mutex::new(Vec::new()),
                stub,
                identity,
                flags: Mutex::new(BTreeMap::new()),
                routing: Arc::new(Mutex::new(RoutingState::default())),
                last_timestamp: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Derives a scoped child. The child reads through to this context's
    /// flags; flags it sets stay local but are reachable from here through
    /// [`Context::get_from_children`]. Routing state is shared.
    pub fn child(&self) -> Context {
        let child = Arc::new(ContextInner {
            parent: Some(Arc::downgrade(&self.inner)),
            children: Mutex::new(Vec::new()),
            stub: Arc::clone(&self.inner.stub),
            identity: self.inner.identity.clone(),
            flags: Mutex::new(BTreeMap::new()),
            routing: Arc::clone(&self.inner.routing),
            last_timestamp: Arc::clone(&self.inner.last_timestamp),
        });
        self.inner.children.lock().push(Arc::clone(&child));
        Context { inner: child }
    }

    pub fn stub(&self) -> &Arc<dyn LedgerStub> {
        &self.inner.stub
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn msp_id(&self) -> &str {
        &self.inner.identity.msp_id
    }

    /// Ledger timestamp in ms; never goes backwards within one operation.
    pub fn timestamp(&self) -> u64 {
        let ts = self.inner.stub.get_date_timestamp();
        let prev = self.inner.last_timestamp.fetch_max(ts, Ordering::AcqRel);
        prev.max(ts)
    }

    pub fn accumulate<K, I>(&self, partial: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut flags = self.inner.flags.lock();
        for (key, value) in partial {
            flags.insert(key.into(), value);
        }
    }

    pub fn put(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), FabricError> {
        let value = serde_json::to_value(value)?;
        self.accumulate([(key.into(), value)]);
        Ok(())
    }

    /// Chainable form of [`Context::put`] for plain JSON values.
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.accumulate([(key.into(), value.into())]);
        self
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let mut current = Some(Arc::clone(&self.inner));
        while let Some(ctx) = current {
            if let Some(v) = ctx.flags.lock().get(key) {
                return Some(v.clone());
            }
            current = ctx.parent.as_ref().and_then(Weak::upgrade);
        }
        None
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, FabricError> {
        self.get_or_none(key)?
            .ok_or_else(|| FabricError::not_found(ResourceType::Flag, key))
    }

    pub fn get_or_none<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FabricError> {
        self.lookup(key)
            .map(|v| serde_json::from_value(v).map_err(FabricError::from))
            .transpose()
    }

    /// Looks up `key` on this context, then depth-first through every child
    /// derived from it.
    pub fn get_from_children<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, FabricError> {
        fn walk(ctx: &ContextInner, key: &str) -> Option<Value> {
            if let Some(v) = ctx.flags.lock().get(key) {
                return Some(v.clone());
            }
            let children = ctx.children.lock().clone();
            children.iter().find_map(|c| walk(c, key))
        }
        walk(&self.inner, key)
            .map(|v| serde_json::from_value(v).map_err(FabricError::from))
            .transpose()
    }

    pub fn segregated(&self) -> Option<String> {
        self.lookup(SEGREGATED)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn flag(&self, key: &str) -> bool {
        self.lookup(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn ignore_handlers(&self) -> bool {
        self.flag(IGNORE_HANDLERS)
    }

    pub fn ignore_validation(&self) -> bool {
        self.flag(IGNORE_VALIDATION)
    }

    pub fn is_mirror_read(&self) -> bool {
        self.flag(MIRROR_READ)
    }

    pub fn write_to(&self, collection: &str, fields: impl IntoIterator<Item = impl Into<String>>) {
        let mut routing = self.inner.routing.lock();
        routing
            .write_to
            .entry(collection.to_string())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
    }

    pub fn read_from<S: AsRef<str>>(&self, collections: impl IntoIterator<Item = S>) {
        let mut routing = self.inner.routing.lock();
        for c in collections {
            let c = c.as_ref();
            if !routing.read_from.iter().any(|existing| existing == c) {
                routing.read_from.push(c.to_string());
            }
        }
    }

    pub fn write_manifest(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.inner.routing.lock().write_to.clone()
    }

    pub fn read_collections(&self) -> Vec<String> {
        self.inner.routing.lock().read_from.clone()
    }

    pub fn mark_fully_segregated(&self) {
        self.inner.routing.lock().fully_segregated = true;
        self.accumulate([(FULLY_SEGREGATED, Value::Bool(true))]);
    }

    pub fn is_fully_segregated(&self) -> bool {
        self.inner.routing.lock().fully_segregated
    }

    pub fn set_sequence_segregation(
        &self,
        sequence: &str,
        fully_segregated: bool,
        collections: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let mut routing = self.inner.routing.lock();
        let entry = routing.sequences.entry(sequence.to_string()).or_default();
        entry.fully_segregated |= fully_segregated;
        for c in collections {
            let c = c.into();
            if !entry.collections.contains(&c) {
                entry.collections.push(c);
            }
        }
    }

    pub fn get_sequence_segregation(&self, sequence: &str) -> Option<SequenceSegregation> {
        self.inner.routing.lock().sequences.get(sequence).cloned()
    }

    pub(crate) fn cache_sequence_value(&self, sequence: &str, value: Value, version: u64) {
        let entry = serde_json::json!({ "value": value, "version": version });
        self.accumulate([(format!("{SEQUENCE_CACHE_PREFIX}{sequence}"), entry)]);
    }

    /// Last value this context wrote for `sequence`, with the version it
    /// was written at.
    pub(crate) fn cached_sequence_value(&self, sequence: &str) -> Option<CachedSequence> {
        let key = format!("{SEQUENCE_CACHE_PREFIX}{sequence}");
        let raw = self
            .lookup(&key)
            .or_else(|| self.get_from_children::<Value>(&key).ok().flatten())?;
        serde_json::from_value(raw).ok()
    }

    pub(crate) fn forget_sequence_value(&self, sequence: &str) {
        // additive store: a null entry shadows any cached value up the chain
        self.accumulate([(format!("{SEQUENCE_CACHE_PREFIX}{sequence}"), Value::Null)]);
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct CachedSequence {
    pub value: Value,
    pub version: u64,
}
