use async_trait::async_trait;
use fabstore::ledger::{KvPair, PagedQueryResult, create_composite_key};
use fabstore::sequence::SEQUENCE_TABLE;
use fabstore::{
    AdapterConfig, Context, FabricAdapter, FabricError, Identity, LedgerStub, MemoryLedger,
    Sequence, SequenceOptions, SequenceValue,
};
use primitive_types::U256;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

fn adapter() -> FabricAdapter {
    FabricAdapter::new(AdapterConfig::offline()).expect("adapter")
}

fn ctx(ledger: &MemoryLedger) -> Context {
    Context::new(ledger.stub(Identity::new("issuer", "OrgA")))
}

fn numbers(values: &[i64]) -> Vec<SequenceValue> {
    values.iter().copied().map(SequenceValue::Number).collect()
}

#[tokio::test]
async fn unpersisted_sequence_reports_its_start_then_advances() {
    let ledger = MemoryLedger::new();
    let seq = adapter()
        .sequence(SequenceOptions::number().named("order-seq").start_with(1_i64))
        .expect("sequence");

    let ctx = ctx(&ledger);
    assert_eq!(seq.current(&ctx).await.expect("current"), SequenceValue::Number(1));
    assert_eq!(seq.next(&ctx).await.expect("next"), SequenceValue::Number(2));
    assert_eq!(seq.current(&ctx).await.expect("current"), SequenceValue::Number(2));

    // a later transaction sees the persisted value, not the start
    let later = self::ctx(&ledger);
    assert_eq!(seq.current(&later).await.expect("current"), SequenceValue::Number(2));
}

#[tokio::test]
async fn range_allocates_consecutive_steps_in_one_write() {
    let ledger = MemoryLedger::new();
    let seq = adapter()
        .sequence(SequenceOptions::number().named("batch").increment_by(5))
        .expect("sequence");
    let setup = ctx(&ledger);
    seq.next(&setup).await.expect("next");
    seq.next(&setup).await.expect("next");

    let ctx = ctx(&ledger);
    assert_eq!(seq.current(&ctx).await.expect("current"), SequenceValue::Number(10));
    let values = seq.range(3, &ctx).await.expect("range");
    assert_eq!(values, numbers(&[15, 20, 25]));
    assert_eq!(seq.current(&ctx).await.expect("current"), SequenceValue::Number(25));

    let key = create_composite_key(SEQUENCE_TABLE, &["batch"]).expect("key");
    let stored = ledger.world_json(&key).expect("stored");
    assert_eq!(stored["current"], 25);
    assert_eq!(stored["version"], 3);
}

#[tokio::test]
async fn increments_must_be_multiples_of_the_step() {
    let ledger = MemoryLedger::new();
    let seq = adapter()
        .sequence(SequenceOptions::number().named("stepped").increment_by(5))
        .expect("sequence");
    let ctx = ctx(&ledger);

    let err = seq.increment(Some(7), &ctx).await.expect_err("not a multiple");
    assert_eq!(err.code_str(), "invalid_config");
    let err = seq.increment(Some(0), &ctx).await.expect_err("zero");
    assert_eq!(err.code_str(), "invalid_config");

    assert_eq!(seq.increment(Some(15), &ctx).await.expect("increment"), SequenceValue::Number(15));
    assert_eq!(seq.range(0, &ctx).await.expect("empty range"), Vec::new());
}

#[tokio::test]
async fn interleaved_transactions_never_reissue_a_value() {
    let ledger = MemoryLedger::new();
    let adapter = adapter();
    let numbers_seq = adapter
        .sequence(SequenceOptions::number().named("interleaved"))
        .expect("sequence");
    let uuids = adapter
        .sequence(SequenceOptions::uuid().named("interleaved-ids"))
        .expect("sequence");
    let (a, b) = (ctx(&ledger), ctx(&ledger));

    let a1 = numbers_seq.next(&a).await.expect("a1");
    let b1 = numbers_seq.next(&b).await.expect("b1");
    let a2 = numbers_seq.next(&a).await.expect("a2");
    assert_eq!(vec![a1, b1, a2.clone()], numbers(&[1, 2, 3]));
    assert_eq!(numbers_seq.current(&a).await.expect("current"), a2);
    assert_eq!(numbers_seq.current(&b).await.expect("current"), a2);

    let a1 = uuids.next(&a).await.expect("a1");
    let b1 = uuids.next(&b).await.expect("b1");
    let a2 = uuids.next(&a).await.expect("a2");
    assert_ne!(a1, b1);
    assert_ne!(b1, a2);
    assert_ne!(a1, a2);

    let key = create_composite_key(SEQUENCE_TABLE, &["interleaved-ids"]).expect("key");
    let stored = ledger.world_json(&key).expect("stored");
    assert_eq!(stored["version"], 3);
    assert_eq!(stored["current"], a2.to_string());
}

#[tokio::test]
async fn absent_sequence_without_start_is_not_found() {
    let ledger = MemoryLedger::new();
    let seq = adapter()
        .sequence(SequenceOptions::number().named("strict").without_start())
        .expect("sequence");
    let err = seq.current(&ctx(&ledger)).await.expect_err("absent");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn bigint_sequences_cross_the_i64_range() {
    let ledger = MemoryLedger::new();
    let start = U256::from(u64::MAX);
    let seq = adapter()
        .sequence(SequenceOptions::bigint().named("wide").start_with(start))
        .expect("sequence");
    let ctx = ctx(&ledger);
    let next = seq.next(&ctx).await.expect("next");
    assert_eq!(next, SequenceValue::BigInt(start + U256::one()));
    assert_eq!(seq.current(&self::ctx(&ledger)).await.expect("current"), next);
}

#[tokio::test]
async fn string_sequences_reject_ranges() {
    let ledger = MemoryLedger::new();
    let adapter = adapter();
    for options in [
        SequenceOptions::serial().named("serial"),
        SequenceOptions::uuid().named("uuid"),
    ] {
        let seq = adapter.sequence(options).expect("sequence");
        let err = seq.range(2, &ctx(&ledger)).await.expect_err("range");
        assert_eq!(err.code_str(), "invalid_config");
    }
}

#[tokio::test]
async fn same_adapter_serializes_concurrent_increments() {
    let ledger = MemoryLedger::new();
    let adapter = adapter();
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let seq = adapter
            .sequence(SequenceOptions::number().named("hot"))
            .expect("sequence");
        let ctx = ctx(&ledger);
        tasks.spawn(async move { seq.next(&ctx).await });
    }
    let mut issued = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        issued.push(joined.expect("join").expect("next"));
    }
    issued.sort_by_key(|v| v.as_i64());
    assert_eq!(issued, numbers(&(1..=16).collect::<Vec<_>>()));
}

/// Lets a competing writer advance the same sequence right before the
/// caller's version check, the way a concurrent endorsement would.
struct RacingStub {
    inner: Arc<dyn LedgerStub>,
    gets: AtomicUsize,
    race_on: usize,
    competitor: Mutex<Option<(Sequence, Context)>>,
}

#[async_trait]
impl LedgerStub for RacingStub {
    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, FabricError> {
        let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.race_on {
            if let Some((seq, ctx)) = self.competitor.lock().await.take() {
                seq.next(&ctx).await?;
            }
        }
        self.inner.get_state(key).await
    }

    async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), FabricError> {
        self.inner.put_state(key, value).await
    }

    async fn delete_state(&self, key: &str) -> Result<(), FabricError> {
        self.inner.delete_state(key).await
    }

    async fn get_private_data(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, FabricError> {
        self.inner.get_private_data(collection, key).await
    }

    async fn put_private_data(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), FabricError> {
        self.inner.put_private_data(collection, key, value).await
    }

    async fn delete_private_data(&self, collection: &str, key: &str) -> Result<(), FabricError> {
        self.inner.delete_private_data(collection, key).await
    }

    async fn get_query_result(&self, query: &str) -> Result<Vec<KvPair>, FabricError> {
        self.inner.get_query_result(query).await
    }

    async fn get_query_result_with_pagination(
        &self,
        query: &str,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<PagedQueryResult, FabricError> {
        self.inner
            .get_query_result_with_pagination(query, page_size, bookmark)
            .await
    }

    async fn get_private_data_query_result(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<Vec<KvPair>, FabricError> {
        self.inner.get_private_data_query_result(collection, query).await
    }

    fn set_event(&self, name: &str, payload: Vec<u8>) -> Result<(), FabricError> {
        self.inner.set_event(name, payload)
    }

    fn get_tx_id(&self) -> String {
        self.inner.get_tx_id()
    }

    fn get_date_timestamp(&self) -> u64 {
        self.inner.get_date_timestamp()
    }

    fn get_creator(&self) -> Identity {
        self.inner.get_creator()
    }
}

/// The loser's first read (get #1) sees no record; the competitor commits
/// during the loser's version check (get #2).
fn racing_context(ledger: &MemoryLedger, config: AdapterConfig) -> (Sequence, Context, Sequence) {
    let rival = FabricAdapter::new(AdapterConfig::offline())
        .expect("adapter")
        .sequence(SequenceOptions::uuid().named("ids"))
        .expect("sequence");
    let stub = RacingStub {
        inner: ledger.stub(Identity::new("loser", "OrgA")),
        gets: AtomicUsize::new(0),
        race_on: 2,
        competitor: Mutex::new(Some((rival.clone(), ctx(ledger)))),
    };
    let loser = FabricAdapter::new(config)
        .expect("adapter")
        .sequence(SequenceOptions::uuid().named("ids"))
        .expect("sequence");
    (loser, Context::new(Arc::new(stub)), rival)
}

#[tokio::test]
async fn uuid_conflict_regenerates_from_the_winning_value() {
    let ledger = MemoryLedger::new();
    let (loser, ctx_loser, rival) = racing_context(&ledger, AdapterConfig::offline());

    let value = loser.next(&ctx_loser).await.expect("loser eventually wins");
    let winner = rival.current(&ctx(&ledger)).await.expect("current");
    assert_eq!(winner, value, "the stored value is the loser's regenerated one");

    let key = create_composite_key(SEQUENCE_TABLE, &["ids"]).expect("key");
    let stored = ledger.world_json(&key).expect("stored");
    assert_eq!(stored["version"], 2);

    // the regenerated value is the successor of the competitor's value
    let fresh = MemoryLedger::new();
    let replay = adapter()
        .sequence(SequenceOptions::uuid().named("ids"))
        .expect("sequence");
    let replay_ctx = ctx(&fresh);
    let first = replay.next(&replay_ctx).await.expect("first");
    let second = replay.next(&replay_ctx).await.expect("second");
    assert_ne!(first, value);
    assert_eq!(second, value);
}

#[tokio::test]
async fn uuid_conflicts_stop_at_the_retry_limit() {
    let ledger = MemoryLedger::new();
    let (loser, ctx_loser, _rival) =
        racing_context(&ledger, AdapterConfig::offline().with_uuid_retry_limit(1));
    let err = loser.next(&ctx_loser).await.expect_err("conflict");
    assert!(err.is_conflict(), "{err}");
}
