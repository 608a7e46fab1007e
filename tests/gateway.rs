use async_trait::async_trait;
use fabstore::config::DEFAULT_TABLE_FIELD;
use fabstore::gateway::{CommitStatus, EndorsedTransaction, Proposal, SerializedContract};
use fabstore::{
    AdapterConfig, Context, FabricAdapter, FabricError, GatewayClient, GatewayConfig,
    GatewayConnector, GatewayTransport, Identity, LedgerStub, MemoryLedger, Model, ModelSpec, Query,
    RemoteRepository, Repository, attr,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ticket {
    id: String,
    seat: String,
    price: u64,
}

impl Model for Ticket {
    fn spec() -> ModelSpec {
        ModelSpec::new("Ticket")
            .table("tickets")
            .field("seat")
            .field("price")
    }
}

fn ticket(id: &str, price: u64) -> Ticket {
    Ticket {
        id: id.into(),
        seat: format!("row-{id}"),
        price,
    }
}

/// Peer stand-in: runs the contract against an in-memory ledger.
struct Peer {
    ledger: MemoryLedger,
    contract: SerializedContract<Ticket>,
    latency: Option<Duration>,
    commit_code: Option<String>,
    closes: AtomicUsize,
}

struct Connection {
    peer: Arc<Peer>,
    identity: Identity,
    proposals: Mutex<Vec<Proposal>>,
}

impl Connection {
    async fn run(&self, proposal: &Proposal) -> Result<(String, Vec<u8>), FabricError> {
        self.proposals.lock().push(proposal.clone());
        if let Some(latency) = self.peer.latency {
            tokio::time::sleep(latency).await;
        }
        let stub = self.peer.ledger.stub(self.identity.clone());
        let ctx = Context::new(stub.clone());
        let result = self
            .peer
            .contract
            .invoke(&proposal.function, &proposal.args, &ctx)
            .await?;
        Ok((stub.get_tx_id(), result))
    }
}

#[async_trait]
impl GatewayTransport for Connection {
    async fn evaluate(&self, proposal: &Proposal) -> Result<Vec<u8>, FabricError> {
        self.run(proposal).await.map(|(_, result)| result)
    }

    async fn endorse(&self, proposal: &Proposal) -> Result<EndorsedTransaction, FabricError> {
        let (tx_id, result) = self.run(proposal).await?;
        Ok(EndorsedTransaction { tx_id, result })
    }

    async fn submit(&self, _transaction: &EndorsedTransaction) -> Result<(), FabricError> {
        Ok(())
    }

    async fn commit_status(&self, _tx_id: &str) -> Result<CommitStatus, FabricError> {
        Ok(match &self.peer.commit_code {
            Some(code) => CommitStatus::Invalid(code.clone()),
            None => CommitStatus::Valid,
        })
    }

    async fn close(&self) -> Result<(), FabricError> {
        self.peer.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct PeerConnector(Arc<Peer>);

#[async_trait]
impl GatewayConnector for PeerConnector {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn GatewayTransport>, FabricError> {
        Ok(Arc::new(Connection {
            peer: Arc::clone(&self.0),
            identity: identity.clone(),
            proposals: Mutex::new(Vec::new()),
        }))
    }
}

fn peer(latency: Option<Duration>, commit_code: Option<&str>) -> Arc<Peer> {
    let adapter = FabricAdapter::new(AdapterConfig::chaincode()).expect("adapter");
    let repo: Repository<Ticket> = Repository::new(&adapter).expect("repo");
    Arc::new(Peer {
        ledger: MemoryLedger::new(),
        contract: SerializedContract::new(repo),
        latency,
        commit_code: commit_code.map(str::to_string),
        closes: AtomicUsize::new(0),
    })
}

fn remote(peer: &Arc<Peer>) -> RemoteRepository<Ticket> {
    RemoteRepository::new(
        Arc::new(PeerConnector(Arc::clone(peer))),
        Identity::new("box-office", "OrgA"),
        GatewayConfig::new("tickets-channel", "tickets"),
    )
    .expect("remote")
}

#[tokio::test]
async fn remote_crud_reaches_the_contract() {
    let peer = peer(None, None);
    let remote = remote(&peer);

    let created = remote.create(&ticket("t1", 40)).await.expect("create");
    assert_eq!(created, ticket("t1", 40));
    assert_eq!(remote.read("t1").await.expect("read"), ticket("t1", 40));

    let updated = remote.update(&ticket("t1", 55)).await.expect("update");
    assert_eq!(updated.price, 55);

    remote
        .create_all(&[ticket("t2", 10), ticket("t3", 90)])
        .await
        .expect("create all");
    let both = remote.read_all(&["t2", "t3"]).await.expect("read all");
    assert_eq!(both, vec![ticket("t2", 10), ticket("t3", 90)]);

    let pricey = remote
        .query(
            &Query::select(&[]).from("tickets").where_(attr("price").gt(50)),
            DEFAULT_TABLE_FIELD,
        )
        .await
        .expect("query");
    let mut ids: Vec<&str> = pricey.iter().map(|t| t.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["t1", "t3"]);

    remote.delete_all(&["t2", "t3"]).await.expect("delete all");
    remote.delete("t1").await.expect("delete");
    assert!(remote.read("t1").await.expect_err("gone").is_not_found());

    assert!(peer.ledger.world_keys().is_empty());
    assert_eq!(peer.ledger.events().len(), 5);
}

#[tokio::test]
async fn every_call_closes_its_connection() {
    let peer = peer(None, None);
    let remote = remote(&peer);
    remote.create(&ticket("t1", 1)).await.expect("create");
    remote.read("missing").await.expect_err("not found");
    remote.read("t1").await.expect("read");
    assert_eq!(peer.closes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_peers_hit_the_deadline() {
    let peer = peer(Some(Duration::from_secs(30)), None);
    let remote = remote(&peer);
    let err = remote.read("t1").await.expect_err("timeout");
    assert_eq!(err.code_str(), "timeout");
    assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidated_transactions_map_to_errors() {
    let conflicted = peer(None, Some("MVCC_READ_CONFLICT"));
    let err = remote(&conflicted)
        .create(&ticket("t1", 1))
        .await
        .expect_err("mvcc");
    assert!(err.is_conflict(), "{err}");

    let rejected = peer(None, Some("ENDORSEMENT_POLICY_FAILURE"));
    let err = remote(&rejected)
        .create(&ticket("t1", 1))
        .await
        .expect_err("policy");
    assert_eq!(err.code_str(), "internal");
}

#[tokio::test]
async fn client_builds_proposals_from_its_config() {
    let peer = peer(None, None);
    let connection = Arc::new(Connection {
        peer: Arc::clone(&peer),
        identity: Identity::new("box-office", "OrgA"),
        proposals: Mutex::new(Vec::new()),
    });
    let client = GatewayClient::new(
        connection.clone(),
        GatewayConfig::new("tickets-channel", "tickets").contract("TicketContract"),
    )
    .expect("client");
    let bytes = client
        .submit("create", vec![r#"{"id":"t7","seat":"a1","price":3}"#.to_string()])
        .await
        .expect("submit");
    let created: Ticket = serde_json::from_slice(&bytes).expect("decode");
    assert_eq!(created.id, "t7");

    let err = client
        .evaluate("transfer", vec!["t7".to_string()])
        .await
        .expect_err("unknown function");
    assert_eq!(err.code_str(), "validation");

    let sent = connection.proposals.lock().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].channel, "tickets-channel");
    assert_eq!(sent[0].contract.as_deref(), Some("TicketContract"));
    assert_eq!(sent[1].function, "transfer");

    assert!(GatewayClient::new(connection, GatewayConfig::new("", "tickets")).is_err());
}
