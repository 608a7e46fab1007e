//! Fixed-stage segregation pipeline run around every repository operation.
//!
//! Stages for a model are derived once from its [`ModelSpec`] and run in
//! priority order: mirror guard (20), mirror read (30), extraction (35),
//! primary-key generation (60), per-collection routing (95). Mirror
//! synchronization is the only after-write stage.

use crate::adapter::FabricAdapter;
use crate::context::{Context, MIRROR_READ, SEGREGATED};
use crate::error::FabricError;
use crate::model::{ModelSpec, Record, SegregationGroup, id_string};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Operation::Read)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    MirrorGuard,
    MirrorRead,
    Extract,
    PrimaryKey,
    Collections,
    MirrorSync,
}

impl Stage {
    pub fn priority(self) -> u16 {
        match self {
            Stage::MirrorGuard => 20,
            Stage::MirrorRead => 30,
            Stage::Extract => 35,
            Stage::PrimaryKey => 60,
            Stage::Collections | Stage::MirrorSync => 95,
        }
    }

    pub fn runs_after_write(self) -> bool {
        matches!(self, Stage::MirrorSync)
    }

    fn applies_to(self, op: Operation) -> bool {
        match self {
            Stage::MirrorGuard | Stage::MirrorSync => op.is_write(),
            Stage::MirrorRead => op == Operation::Read,
            Stage::PrimaryKey => op == Operation::Create,
            Stage::Extract | Stage::Collections => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageEntry {
    pub stage: Stage,
    /// Handlers sharing a group key run once per operation.
    pub group: String,
    group_spec: Option<SegregationGroup>,
}

/// Work the repository must perform once the primary write succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterWrite {
    /// Copy the written record into `collection` (or remove it on delete).
    MirrorSync { collection: String },
}

/// Where one record's segregated fields live, resolved for that record
/// alone. The adapter stores and reads by this rather than by the routing
/// accumulated on the context, which spans every record the operation
/// touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    /// Collection to the fields written into it.
    pub write: BTreeMap<String, BTreeSet<String>>,
    /// Collections consulted on read and delete, in resolution order.
    pub read: Vec<String>,
    /// Nothing of the record lives in world state.
    pub fully_segregated: bool,
}

impl Routing {
    pub fn write_to(&mut self, collection: &str, fields: impl IntoIterator<Item = impl Into<String>>) {
        self.write
            .entry(collection.to_string())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
    }

    pub fn read_from<S: AsRef<str>>(&mut self, collections: impl IntoIterator<Item = S>) {
        for c in collections {
            let c = c.as_ref();
            if !self.read.iter().any(|existing| existing == c) {
                self.read.push(c.to_string());
            }
        }
    }

    /// Collections `field` is written into.
    pub fn destinations<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.write
            .iter()
            .filter(move |(_, fields)| fields.contains(field))
            .map(|(collection, _)| collection)
    }
}

#[derive(Debug, Clone)]
pub struct SegregationPipeline {
    spec: Arc<ModelSpec>,
    entries: Vec<StageEntry>,
}

impl SegregationPipeline {
    pub fn for_model(spec: Arc<ModelSpec>) -> Self {
        let mut entries = Vec::new();
        let mut push = |stage: Stage, group: String, group_spec: Option<SegregationGroup>| {
            entries.push(StageEntry {
                stage,
                group,
                group_spec,
            })
        };
        if spec.mirror.is_some() {
            push(Stage::MirrorGuard, "mirror".into(), None);
            push(Stage::MirrorRead, "mirror".into(), None);
            push(Stage::MirrorSync, "mirror".into(), None);
        }
        if spec.is_segregated() {
            push(Stage::Extract, "segregation".into(), None);
        }
        if spec.pk_sequence.is_some() {
            push(Stage::PrimaryKey, "pk".into(), None);
        }
        for group in spec.segregation_groups() {
            push(Stage::Collections, group.key.clone(), Some(group));
        }
        // stable: groups keep declaration order within a priority
        entries.sort_by_key(|e| (e.stage.runs_after_write(), e.stage.priority()));
        Self { spec, entries }
    }

    pub fn spec(&self) -> &Arc<ModelSpec> {
        &self.spec
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageEntry> {
        self.entries.iter()
    }

    /// Runs every before-write stage applicable to `op` and returns the
    /// routing resolved for `record`. The context accumulates the same
    /// routing across every record of the operation.
    pub async fn before(
        &self,
        op: Operation,
        record: &mut Record,
        ctx: &Context,
        adapter: &FabricAdapter,
    ) -> Result<Routing, FabricError> {
        let mut routing = Routing::default();
        if ctx.ignore_handlers() {
            return Ok(routing);
        }
        for entry in &self.entries {
            if entry.stage.runs_after_write() || !entry.stage.applies_to(op) {
                continue;
            }
            match entry.stage {
                Stage::MirrorGuard => self.guard_mirror(op, ctx)?,
                Stage::MirrorRead => self.route_mirror_read(ctx)?,
                Stage::Extract => {
                    if !ctx.is_mirror_read() {
                        self.extract(op, record, ctx, &mut routing)?;
                    }
                }
                Stage::PrimaryKey => self.generate_pk(record, ctx, adapter).await?,
                Stage::Collections => {
                    if let Some(group) = &entry.group_spec {
                        if !ctx.is_mirror_read() {
                            self.route_group(op, group, record, ctx, &mut routing)?;
                        }
                    }
                }
                Stage::MirrorSync => {}
            }
        }
        Ok(routing)
    }

    /// After-write work for `op`; empty when handlers are suppressed.
    pub fn after(&self, op: Operation, ctx: &Context) -> Result<Vec<AfterWrite>, FabricError> {
        if ctx.ignore_handlers() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in &self.entries {
            if entry.stage == Stage::MirrorSync && entry.stage.applies_to(op) {
                if let Some(collection) = self.mirror_collection(ctx)? {
                    out.push(AfterWrite::MirrorSync { collection });
                }
            }
        }
        Ok(out)
    }

    fn mirror_collection(&self, ctx: &Context) -> Result<Option<String>, FabricError> {
        match &self.spec.mirror {
            Some(mirror) => mirror
                .resolver
                .resolve(&self.spec.name, Some(&mirror.msp_id), ctx)
                .map(Some),
            None => Ok(None),
        }
    }

    fn guard_mirror(&self, op: Operation, ctx: &Context) -> Result<(), FabricError> {
        let Some(mirror) = &self.spec.mirror else {
            return Ok(());
        };
        if mirror.applies_to(ctx.msp_id()) && !ctx.identity().is_internal_system() {
            return Err(FabricError::PermissionDenied(format!(
                "organization '{}' only has mirror access to {} and cannot {op} it",
                ctx.msp_id(),
                self.spec.name
            )));
        }
        Ok(())
    }

    fn route_mirror_read(&self, ctx: &Context) -> Result<(), FabricError> {
        let Some(mirror) = &self.spec.mirror else {
            return Ok(());
        };
        if !mirror.applies_to(ctx.msp_id()) {
            return Ok(());
        }
        if let Some(collection) = self.mirror_collection(ctx)? {
            debug!(model = %self.spec.name, %collection, msp = %ctx.msp_id(), "routing read to mirror");
            ctx.accumulate([
                (SEGREGATED, Value::String(collection)),
                (MIRROR_READ, Value::Bool(true)),
            ]);
        }
        Ok(())
    }

    /// Owning organization: the `owned_by` value when set, else the caller's.
    /// On create an empty owner is filled with the caller's organization.
    fn owner_org(&self, op: Operation, record: &mut Record, ctx: &Context) -> Option<String> {
        if let Some(owner_field) = &self.spec.owned_by {
            let owner = record
                .get(owner_field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            match owner {
                Some(org) => return Some(org),
                None if op == Operation::Create && !ctx.msp_id().is_empty() => {
                    record.insert(owner_field.clone(), Value::from(ctx.msp_id()));
                }
                None => {}
            }
        }
        Some(ctx.msp_id().to_string()).filter(|s| !s.is_empty())
    }

    fn extract(
        &self,
        op: Operation,
        record: &mut Record,
        ctx: &Context,
        routing: &mut Routing,
    ) -> Result<(), FabricError> {
        let groups = self.spec.segregation_groups();
        let org = self.owner_org(op, record, ctx);
        if org.is_none() && groups.iter().any(|g| g.resolver.needs_org()) {
            return Err(FabricError::Validation(format!(
                "no owning organization for segregated model {}",
                self.spec.name
            )));
        }
        let mut collections: Vec<String> = Vec::new();
        for group in &groups {
            let collection = group.resolver.resolve(&self.spec.name, org.as_deref(), ctx)?;
            if !collections.contains(&collection) {
                collections.push(collection);
            }
        }
        ctx.read_from(&collections);
        routing.read_from(&collections);
        let fully = self.spec.is_fully_segregated();
        if fully {
            ctx.mark_fully_segregated();
            routing.fully_segregated = true;
        }
        if let Some(sequence) = self.spec.pk_sequence_name() {
            ctx.set_sequence_segregation(&sequence, fully, collections.iter().cloned());
        }
        debug!(model = %self.spec.name, ?org, ?collections, fully, "extracted segregation");
        Ok(())
    }

    async fn generate_pk(
        &self,
        record: &mut Record,
        ctx: &Context,
        adapter: &FabricAdapter,
    ) -> Result<(), FabricError> {
        let pk = &self.spec.primary_key;
        if record.get(pk).and_then(id_string).is_some() {
            return Ok(());
        }
        if let Some(sequence) = adapter.pk_sequence(&self.spec)? {
            let value = sequence.next(ctx).await?;
            debug!(model = %self.spec.name, sequence = %sequence.name(), %value, "generated primary key");
            record.insert(pk.clone(), value.to_json());
        }
        Ok(())
    }

    fn route_group(
        &self,
        op: Operation,
        group: &SegregationGroup,
        record: &Record,
        ctx: &Context,
        routing: &mut Routing,
    ) -> Result<(), FabricError> {
        let org = if group.resolver.needs_org() {
            self.route_org(record, ctx)
        } else {
            None
        };
        let mut resolved: Option<(String, &str)> = None;
        for field in &group.fields {
            let collection = group.resolver.resolve(&self.spec.name, org.as_deref(), ctx)?;
            match &resolved {
                Some((first, first_field)) if *first != collection => {
                    return Err(FabricError::invalid_config(format!(
                        "fields '{first_field}' and '{field}' of {} share a segregation marker but resolve to '{first}' and '{collection}'",
                        self.spec.name
                    )));
                }
                Some(_) => {}
                None => resolved = Some((collection, field.as_str())),
            }
        }
        let Some((collection, _)) = resolved else {
            return Ok(());
        };
        match op {
            Operation::Create | Operation::Update => {
                ctx.write_to(&collection, group.fields.iter().cloned());
                routing.write_to(&collection, group.fields.iter().cloned());
            }
            Operation::Read | Operation::Delete => {
                ctx.read_from([collection.as_str()]);
                routing.read_from([collection.as_str()]);
            }
        }
        Ok(())
    }

    fn route_org(&self, record: &Record, ctx: &Context) -> Option<String> {
        self.spec
            .owned_by
            .as_ref()
            .and_then(|f| record.get(f))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| Some(ctx.msp_id().to_string()).filter(|s| !s.is_empty()))
    }
}
