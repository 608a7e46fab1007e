//! Typed repository façade over the adapter and segregation pipeline.

use crate::adapter::FabricAdapter;
use crate::context::{Context, IGNORE_HANDLERS, SEGREGATED};
use crate::error::FabricError;
use crate::events::{self, EventKind};
use crate::ledger::split_composite_key;
use crate::model::{Model, ModelSpec, Record, from_record, id_string, to_record};
use crate::query::{Condition, MangoQuery, Order, Page, Query};
use crate::segregation::{AfterWrite, Operation, Routing, SegregationPipeline};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

pub struct Repository<M: Model> {
    adapter: FabricAdapter,
    spec: Arc<ModelSpec>,
    pipeline: SegregationPipeline,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for Repository<M> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            spec: Arc::clone(&self.spec),
            pipeline: self.pipeline.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> std::fmt::Debug for Repository<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("model", &self.spec.name)
            .field("table", &self.spec.table)
            .finish()
    }
}

impl<M: Model> Repository<M> {
    /// Registers `M` with the adapter (once) and builds its pipeline.
    pub fn new(adapter: &FabricAdapter) -> Result<Self, FabricError> {
        let spec = adapter.register(M::spec())?;
        Ok(Self {
            adapter: adapter.clone(),
            pipeline: SegregationPipeline::for_model(Arc::clone(&spec)),
            spec,
            _model: PhantomData,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn adapter(&self) -> &FabricAdapter {
        &self.adapter
    }

    pub fn pipeline(&self) -> &SegregationPipeline {
        &self.pipeline
    }

    pub async fn create(&self, model: M, ctx: &Context) -> Result<M, FabricError> {
        let (record, routing, errors) = self.stage(Operation::Create, to_record(&model)?, ctx).await?;
        fail_on(&self.spec.name, errors)?;
        let written = self.write(Operation::Create, record, &routing, ctx).await?;
        self.emit(EventKind::Create, std::slice::from_ref(&written), ctx)?;
        from_record(written)
    }

    pub async fn read(&self, id: &str, ctx: &Context) -> Result<M, FabricError> {
        from_record(self.read_record(id, ctx).await?)
    }

    pub async fn update(&self, model: M, ctx: &Context) -> Result<M, FabricError> {
        let (record, routing, errors) = self.stage(Operation::Update, to_record(&model)?, ctx).await?;
        fail_on(&self.spec.name, errors)?;
        let written = self.write(Operation::Update, record, &routing, ctx).await?;
        self.emit(EventKind::Update, std::slice::from_ref(&written), ctx)?;
        from_record(written)
    }

    pub async fn delete(&self, id: &str, ctx: &Context) -> Result<M, FabricError> {
        let removed = self.delete_record(id, ctx).await?;
        self.emit(EventKind::Delete, std::slice::from_ref(&removed), ctx)?;
        from_record(removed)
    }

    /// Update when the record exists, create otherwise.
    pub async fn upsert(&self, model: M, ctx: &Context) -> Result<M, FabricError> {
        match self.update(model.clone(), ctx).await {
            Err(e) if e.is_not_found() => self.create(model, ctx).await,
            other => other,
        }
    }

    /// Creates every model or none: all validation failures are reported
    /// together before anything is written.
    pub async fn create_all(&self, models: Vec<M>, ctx: &Context) -> Result<Vec<M>, FabricError> {
        self.write_all(Operation::Create, EventKind::CreateAll, models, ctx)
            .await
    }

    pub async fn update_all(&self, models: Vec<M>, ctx: &Context) -> Result<Vec<M>, FabricError> {
        self.write_all(Operation::Update, EventKind::UpdateAll, models, ctx)
            .await
    }

    pub async fn read_all(&self, ids: &[&str], ctx: &Context) -> Result<Vec<M>, FabricError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(from_record(self.read_record(id, ctx).await?)?);
        }
        Ok(out)
    }

    pub async fn delete_all(&self, ids: &[&str], ctx: &Context) -> Result<Vec<M>, FabricError> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.push(self.delete_record(id, ctx).await?);
        }
        self.emit(EventKind::DeleteAll, &removed, ctx)?;
        removed.into_iter().map(from_record).collect()
    }

    /// Query builder over this model's table.
    pub fn select(&self) -> QueryBuilder<'_, M> {
        QueryBuilder {
            repo: self,
            query: Query::select(&[]).from(&self.spec.table),
        }
    }

    pub fn select_fields(&self, fields: &[&str]) -> QueryBuilder<'_, M> {
        QueryBuilder {
            repo: self,
            query: Query::select(fields).from(&self.spec.table),
        }
    }

    /// Runs `query` with read routing applied; rows come back as models.
    pub async fn query(&self, query: &Query, ctx: &Context) -> Result<Vec<M>, FabricError> {
        let (mut mango, routing) = self.compile(query, ctx).await?;
        mango.fields.clear();
        let rows = self.adapter.query_merged(&mango, &routing, ctx).await?;
        rows.into_iter()
            .map(|(key, row)| self.revert_row(&key, row).and_then(from_record))
            .collect()
    }

    /// Runs an already compiled Mango query with read routing applied.
    pub async fn query_mango(&self, mango: &MangoQuery, ctx: &Context) -> Result<Vec<M>, FabricError> {
        let mut probe = Record::new();
        let routing = self
            .pipeline
            .before(Operation::Read, &mut probe, ctx, &self.adapter)
            .await?;
        let rows = self.adapter.query_merged(mango, &routing, ctx).await?;
        rows.into_iter()
            .map(|(key, row)| self.revert_row(&key, row).and_then(from_record))
            .collect()
    }

    /// Like [`Repository::query`] but honours the field projection and
    /// returns field-space records.
    pub async fn query_records(&self, query: &Query, ctx: &Context) -> Result<Vec<Record>, FabricError> {
        let (mango, routing) = self.compile(query, ctx).await?;
        let rows = self.adapter.query_merged(&mango, &routing, ctx).await?;
        rows.into_iter()
            .map(|(key, row)| self.revert_row(&key, row))
            .collect()
    }

    /// Executes a hand-written Mango query against the routed store.
    pub async fn raw(&self, query: &MangoQuery, ctx: &Context) -> Result<Vec<Record>, FabricError> {
        Ok(self
            .adapter
            .raw(query, ctx)
            .await?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    async fn compile(&self, query: &Query, ctx: &Context) -> Result<(MangoQuery, Routing), FabricError> {
        let mut probe = Record::new();
        let routing = self
            .pipeline
            .before(Operation::Read, &mut probe, ctx, &self.adapter)
            .await?;
        let spec = &self.spec;
        let mango = query.compile(&self.adapter.config().table_field, &|f: &str| spec.column(f))?;
        Ok((mango, routing))
    }

    fn revert_row(&self, key: &str, row: Record) -> Result<Record, FabricError> {
        let id = split_composite_key(key)
            .and_then(|(_, attrs)| attrs.into_iter().next())
            .or_else(|| row.get(&self.spec.primary_key).and_then(id_string))
            .unwrap_or_default();
        self.adapter.revert(&self.spec, row, &id, None)
    }

    fn id_of(&self, record: &Record) -> Result<String, FabricError> {
        record
            .get(&self.spec.primary_key)
            .and_then(id_string)
            .ok_or_else(|| {
                FabricError::Validation(format!(
                    "{} is missing its primary key '{}'",
                    self.spec.name, self.spec.primary_key
                ))
            })
    }

    fn probe(&self, id: &str) -> Record {
        let mut probe = Record::new();
        probe.insert(self.spec.primary_key.clone(), Value::from(id));
        probe
    }

    /// Before-write stages, audit stamping and validation. Returns the
    /// staged record, its routing and any validation messages.
    async fn stage(
        &self,
        op: Operation,
        mut record: Record,
        ctx: &Context,
    ) -> Result<(Record, Routing, Vec<String>), FabricError> {
        let routing = self
            .pipeline
            .before(op, &mut record, ctx, &self.adapter)
            .await?;
        let previous = match op {
            Operation::Update => {
                let id = self.id_of(&record)?;
                Some(self.adapter.read(&self.spec, &id, &routing, ctx).await?)
            }
            _ => None,
        };
        if !ctx.ignore_handlers() {
            self.stamp(op, &mut record, previous.as_ref(), ctx);
        }
        let errors = if ctx.ignore_validation() {
            Vec::new()
        } else {
            self.validation_errors(&record)
        };
        Ok((record, routing, errors))
    }

    fn stamp(&self, op: Operation, record: &mut Record, previous: Option<&Record>, ctx: &Context) {
        let Some(audit) = &self.spec.audit else {
            return;
        };
        let now = Value::from(ctx.timestamp());
        let who = Value::from(ctx.identity().get_id());
        let carried = |field: &str, fallback: &Value| {
            previous
                .and_then(|p| p.get(field))
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| fallback.clone())
        };
        let version = previous
            .and_then(|p| p.get(&audit.version))
            .and_then(Value::as_u64)
            .map_or(1, |v| v + 1);
        if op == Operation::Update {
            record.insert(audit.created_at.clone(), carried(&audit.created_at, &now));
            record.insert(audit.created_by.clone(), carried(&audit.created_by, &who));
        } else {
            record.insert(audit.created_at.clone(), now.clone());
            record.insert(audit.created_by.clone(), who.clone());
        }
        record.insert(audit.updated_at.clone(), now);
        record.insert(audit.updated_by.clone(), who);
        record.insert(audit.version.clone(), Value::from(version));
    }

    fn validation_errors(&self, record: &Record) -> Vec<String> {
        let mut errors: Vec<String> = self
            .spec
            .declared_fields()
            .filter(|f| f.required)
            .filter(|f| record.get(&f.name).is_none_or(Value::is_null))
            .map(|f| format!("field '{}' is required", f.name))
            .collect();
        match from_record::<M>(record.clone()) {
            Ok(model) => errors.extend(model.validate()),
            Err(e) => errors.push(e.to_string()),
        }
        errors
    }

    async fn write(
        &self,
        op: Operation,
        record: Record,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<Record, FabricError> {
        let (id, written) = self.store(op, record, routing, ctx).await?;
        self.after_write(op, &written, &id, ctx).await?;
        Ok(written)
    }

    /// Prepares and persists one record; no after-write stages.
    async fn store(
        &self,
        op: Operation,
        record: Record,
        routing: &Routing,
        ctx: &Context,
    ) -> Result<(String, Record), FabricError> {
        let prepared = self.adapter.prepare(&self.spec, &record, routing, ctx)?;
        let stored = match op {
            Operation::Create => self.adapter.create(&self.spec, &prepared, ctx).await?,
            Operation::Update => self.adapter.update(&self.spec, &prepared, ctx).await?,
            other => {
                return Err(FabricError::internal(format!("{other} is not a record write")));
            }
        };
        let written = self
            .adapter
            .revert(&self.spec, stored, &prepared.id, Some(&prepared.transient))?;
        Ok((prepared.id, written))
    }

    async fn write_all(
        &self,
        op: Operation,
        kind: EventKind,
        models: Vec<M>,
        ctx: &Context,
    ) -> Result<Vec<M>, FabricError> {
        let mut staged = Vec::with_capacity(models.len());
        let mut failures = Vec::new();
        for (i, model) in models.iter().enumerate() {
            let (record, routing, errors) = self.stage(op, to_record(model)?, ctx).await?;
            failures.extend(errors.into_iter().map(|e| format!("[{i}] {e}")));
            staged.push((record, routing));
        }
        fail_on(&self.spec.name, failures)?;

        let mut written = Vec::with_capacity(staged.len());
        for (record, routing) in staged {
            written.push(self.write(op, record, &routing, ctx).await?);
        }
        self.emit(kind, &written, ctx)?;
        written.into_iter().map(from_record).collect()
    }

    async fn read_record(&self, id: &str, ctx: &Context) -> Result<Record, FabricError> {
        let mut probe = self.probe(id);
        let routing = self
            .pipeline
            .before(Operation::Read, &mut probe, ctx, &self.adapter)
            .await?;
        let stored = self.adapter.read(&self.spec, id, &routing, ctx).await?;
        self.adapter.revert(&self.spec, stored, id, None)
    }

    async fn delete_record(&self, id: &str, ctx: &Context) -> Result<Record, FabricError> {
        let mut probe = self.probe(id);
        let routing = self
            .pipeline
            .before(Operation::Delete, &mut probe, ctx, &self.adapter)
            .await?;
        let stored = self.adapter.delete(&self.spec, id, &routing, ctx).await?;
        let removed = self.adapter.revert(&self.spec, stored, id, None)?;
        self.after_write(Operation::Delete, &removed, id, ctx).await?;
        Ok(removed)
    }

    async fn after_write(
        &self,
        op: Operation,
        record: &Record,
        id: &str,
        ctx: &Context,
    ) -> Result<(), FabricError> {
        for action in self.pipeline.after(op, ctx)? {
            match action {
                AfterWrite::MirrorSync { collection } => {
                    let mirror_ctx = ctx
                        .child()
                        .with(SEGREGATED, collection.as_str())
                        .with(IGNORE_HANDLERS, true);
                    debug!(model = %self.spec.name, %id, %collection, %op, "syncing mirror");
                    self.sync_mirror(op, record, id, &collection, &mirror_ctx)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Mirror copies are written blind: the writing organization usually
    /// cannot read the mirror collection.
    async fn sync_mirror(
        &self,
        op: Operation,
        record: &Record,
        id: &str,
        collection: &str,
        mirror_ctx: &Context,
    ) -> Result<(), FabricError> {
        if op == Operation::Delete {
            return self
                .adapter
                .evict(&self.spec, id, collection, mirror_ctx)
                .await;
        }
        let prepared = self
            .adapter
            .prepare(&self.spec, record, &Routing::default(), mirror_ctx)?;
        self.adapter
            .replicate(&self.spec, &prepared, collection, mirror_ctx)
            .await
            .map(|_| ())
    }

    fn emit(&self, kind: EventKind, records: &[Record], ctx: &Context) -> Result<(), FabricError> {
        if !self.adapter.config().emit_events || !self.spec.events || ctx.ignore_handlers() {
            return Ok(());
        }
        let ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.get(&self.spec.primary_key).and_then(id_string))
            .collect();
        let owner = self.event_owner(records);
        events::emit(ctx, &self.spec.table, kind, owner.as_deref(), &ids)
    }

    /// Owner suffix shared by every record, if any.
    fn event_owner(&self, records: &[Record]) -> Option<String> {
        let field = self.spec.owned_by.as_ref()?;
        let mut owners = records
            .iter()
            .map(|r| r.get(field).and_then(Value::as_str).unwrap_or_default());
        let first = owners.next()?;
        if first.is_empty() || owners.any(|o| o != first) {
            return None;
        }
        Some(first.to_string())
    }
}

fn fail_on(model: &str, errors: Vec<String>) -> Result<(), FabricError> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(FabricError::Validation(format!(
        "{model} failed validation: {}",
        errors.join("; ")
    )))
}

pub struct QueryBuilder<'a, M: Model> {
    repo: &'a Repository<M>,
    query: Query,
}

impl<'a, M: Model> QueryBuilder<'a, M> {
    pub fn where_(mut self, condition: Condition) -> Self {
        self.query = self.query.where_(condition);
        self
    }

    pub fn order_by(mut self, field: &str, order: Order) -> Self {
        self.query = self.query.order_by(field, order);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.query = self.query.limit(n);
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub async fn execute(self, ctx: &Context) -> Result<Vec<M>, FabricError> {
        self.repo.query(&self.query, ctx).await
    }

    pub async fn execute_records(self, ctx: &Context) -> Result<Vec<Record>, FabricError> {
        self.repo.query_records(&self.query, ctx).await
    }

    /// Pages of `page_size` rows (clamped to the adapter's limits).
    pub fn paginate(self, page_size: usize) -> Paginator<'a, M> {
        let page_size = self.repo.adapter.config().clamp_page_size(Some(page_size));
        Paginator {
            repo: self.repo,
            query: self.query,
            page_size,
            bookmarks: vec![None],
            last_page: None,
            current: 0,
        }
    }
}

/// Bookmark-driven pagination. Bookmarks of visited pages are kept so any
/// earlier page can be fetched again; later pages are reached by walking
/// forward.
pub struct Paginator<'a, M: Model> {
    repo: &'a Repository<M>,
    query: Query,
    page_size: usize,
    /// `bookmarks[i]` fetches page `i + 1`.
    bookmarks: Vec<Option<String>>,
    last_page: Option<usize>,
    current: usize,
}

impl<M: Model> Paginator<'_, M> {
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Last page fetched, 0 before the first fetch.
    pub fn current_page(&self) -> usize {
        self.current
    }

    /// Number of the final page once the walk has reached it.
    pub fn last_page(&self) -> Option<usize> {
        self.last_page
    }

    pub async fn next(&mut self, ctx: &Context) -> Result<Page<M>, FabricError> {
        self.page(self.current + 1, ctx).await
    }

    /// Fetches page `n` (1-based). Past the end an empty page is returned.
    pub async fn page(&mut self, n: usize, ctx: &Context) -> Result<Page<M>, FabricError> {
        if n == 0 {
            return Err(FabricError::Validation("pages are numbered from 1".into()));
        }
        while self.bookmarks.len() < n {
            if self.last_page.is_some() {
                return Ok(empty_page(n));
            }
            let walk = self.bookmarks.len();
            self.fetch(walk, ctx).await?;
        }
        self.fetch(n, ctx).await
    }

    async fn fetch(&mut self, n: usize, ctx: &Context) -> Result<Page<M>, FabricError> {
        if self.last_page.is_some_and(|last| n > last) {
            return Ok(empty_page(n));
        }
        let (mut mango, routing) = self.repo.compile(&self.query, ctx).await?;
        mango.fields.clear();
        let bookmark = self.bookmarks.get(n - 1).cloned().flatten();
        let raw = self
            .repo
            .adapter
            .raw_paged(&mango, self.page_size, bookmark.as_deref(), ctx)
            .await?;
        match &raw.bookmark {
            Some(next) if self.bookmarks.len() == n => self.bookmarks.push(Some(next.clone())),
            Some(_) => {}
            None => self.last_page = Some(n),
        }
        self.current = n;
        let mut items = Vec::with_capacity(raw.rows.len());
        for (key, mut row) in raw.rows {
            if ctx.segregated().is_none() {
                self.repo.adapter.merge_private(&key, &mut row, &routing, ctx).await?;
            }
            items.push(from_record(self.repo.revert_row(&key, row)?)?);
        }
        debug!(model = %self.repo.spec.name, page = n, fetched = raw.fetched, "fetched page");
        Ok(Page {
            items,
            page: n,
            fetched: raw.fetched,
            bookmark: raw.bookmark,
        })
    }
}

fn empty_page<T>(n: usize) -> Page<T> {
    Page {
        items: Vec::new(),
        page: n,
        fetched: 0,
        bookmark: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::identity::Identity;
    use crate::ledger::MemoryLedger;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        text: String,
    }

    impl Model for Note {
        fn spec() -> ModelSpec {
            ModelSpec::new("Note").table("notes").add_field(
                crate::model::FieldSpec::new("text").required(),
            )
        }

        fn validate(&self) -> Vec<String> {
            if self.text.len() > 10 {
                vec!["text too long".to_string()]
            } else {
                Vec::new()
            }
        }
    }

    fn setup() -> (MemoryLedger, Repository<Note>) {
        let ledger = MemoryLedger::new();
        let adapter = FabricAdapter::new(AdapterConfig::default()).expect("adapter");
        (ledger, Repository::new(&adapter).expect("repo"))
    }

    fn note(id: &str, text: &str) -> Note {
        Note {
            id: id.into(),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn bulk_validation_reports_every_failure_and_writes_nothing() {
        let (ledger, repo) = setup();
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));
        let err = repo
            .create_all(
                vec![note("a", "ok"), note("b", "far too long"), note("c", "also too long")],
                &ctx,
            )
            .await
            .expect_err("invalid batch");
        let message = err.to_string();
        assert!(message.contains("[1] text too long"), "{message}");
        assert!(message.contains("[2] text too long"), "{message}");
        assert!(ledger.world_keys().is_empty());
    }

    #[tokio::test]
    async fn ignore_validation_skips_checks() {
        let (ledger, repo) = setup();
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")))
            .with(crate::context::IGNORE_VALIDATION, true);
        repo.create(note("a", "way more than ten"), &ctx)
            .await
            .expect("validation ignored");
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let (ledger, repo) = setup();
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));
        repo.upsert(note("a", "one"), &ctx).await.expect("create");
        repo.upsert(note("a", "two"), &ctx).await.expect("update");
        assert_eq!(repo.read("a", &ctx).await.expect("read").text, "two");
    }

    #[tokio::test]
    async fn page_zero_is_rejected() {
        let (ledger, repo) = setup();
        let ctx = Context::new(ledger.stub(Identity::new("alice", "OrgA")));
        let mut pages = repo.select().paginate(2);
        assert_eq!(pages.page(0, &ctx).await.expect_err("zero").code_str(), "validation");
    }
}
