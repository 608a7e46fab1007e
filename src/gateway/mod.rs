//! Client-side access to a deployed contract through a Fabric gateway.
//!
//! The wire protocol is behind [`GatewayTransport`]; this module owns the
//! per-call deadlines, the submit (endorse, submit, commit status) vs.
//! evaluate split, and closing the connection on every exit path.

pub mod contract;

pub use contract::{ContractFunction, SerializedContract};

use crate::config::GatewayConfig;
use crate::error::FabricError;
use crate::identity::Identity;
use crate::model::{Model, to_record};
use crate::query::{MangoQuery, Query};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub channel: String,
    pub chaincode: String,
    pub contract: Option<String>,
    pub function: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndorsedTransaction {
    pub tx_id: String,
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    Valid,
    /// Validation code reported by the committing peer.
    Invalid(String),
}

#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn evaluate(&self, proposal: &Proposal) -> Result<Vec<u8>, FabricError>;

    async fn endorse(&self, proposal: &Proposal) -> Result<EndorsedTransaction, FabricError>;

    async fn submit(&self, transaction: &EndorsedTransaction) -> Result<(), FabricError>;

    async fn commit_status(&self, tx_id: &str) -> Result<CommitStatus, FabricError>;

    async fn close(&self) -> Result<(), FabricError>;
}

/// Opens one transport per remote call, signed as `identity`.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn GatewayTransport>, FabricError>;
}

async fn with_deadline<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = Result<T, FabricError>>,
) -> Result<T, FabricError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(FabricError::Timeout {
            operation: format!("{operation} exceeded {limit:?}"),
        }),
    }
}

pub struct GatewayClient {
    transport: Arc<dyn GatewayTransport>,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(transport: Arc<dyn GatewayTransport>, config: GatewayConfig) -> Result<Self, FabricError> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn proposal(&self, function: &str, args: Vec<String>) -> Proposal {
        Proposal {
            channel: self.config.channel.clone(),
            chaincode: self.config.chaincode.clone(),
            contract: self.config.contract.clone(),
            function: function.to_string(),
            args,
        }
    }

    /// Read-only call; never reaches the orderer.
    pub async fn evaluate(&self, function: &str, args: Vec<String>) -> Result<Vec<u8>, FabricError> {
        let proposal = self.proposal(function, args);
        debug!(function, chaincode = %self.config.chaincode, "evaluate");
        with_deadline(
            "evaluate",
            self.config.deadlines.evaluate,
            self.transport.evaluate(&proposal),
        )
        .await
    }

    /// State-changing call: endorse, submit, then wait for the commit status.
    pub async fn submit(&self, function: &str, args: Vec<String>) -> Result<Vec<u8>, FabricError> {
        let deadlines = self.config.deadlines;
        let proposal = self.proposal(function, args);
        let tx = with_deadline("endorse", deadlines.endorse, self.transport.endorse(&proposal)).await?;
        debug!(function, tx_id = %tx.tx_id, "endorsed");
        with_deadline("submit", deadlines.submit, self.transport.submit(&tx)).await?;
        let status = with_deadline(
            "commit status",
            deadlines.commit_status,
            self.transport.commit_status(&tx.tx_id),
        )
        .await?;
        match status {
            CommitStatus::Valid => Ok(tx.result),
            CommitStatus::Invalid(code) if code.contains("MVCC") || code.contains("PHANTOM") => {
                Err(FabricError::Conflict(format!("transaction {} invalidated: {code}", tx.tx_id)))
            }
            CommitStatus::Invalid(code) => Err(FabricError::internal(format!(
                "transaction {} invalidated: {code}",
                tx.tx_id
            ))),
        }
    }

    pub async fn close(&self) -> Result<(), FabricError> {
        self.transport.close().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Submit,
    Evaluate,
}

/// Repository surface of a remote contract. Writes are submitted, reads are
/// evaluated; every call opens and closes its own connection.
pub struct RemoteRepository<M: Model> {
    connector: Arc<dyn GatewayConnector>,
    identity: Identity,
    config: GatewayConfig,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> RemoteRepository<M> {
    pub fn new(
        connector: Arc<dyn GatewayConnector>,
        identity: Identity,
        config: GatewayConfig,
    ) -> Result<Self, FabricError> {
        config.validate()?;
        Ok(Self {
            connector,
            identity,
            config,
            _model: PhantomData,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn call(
        &self,
        dispatch: Dispatch,
        function: ContractFunction,
        args: Vec<String>,
    ) -> Result<Vec<u8>, FabricError> {
        // config was validated when the repository was built
        let client = GatewayClient {
            transport: self.connector.connect(&self.identity).await?,
            config: self.config.clone(),
        };
        let result = match dispatch {
            Dispatch::Submit => client.submit(function.as_str(), args).await,
            Dispatch::Evaluate => client.evaluate(function.as_str(), args).await,
        };
        let closed = client.close().await;
        match (result, closed) {
            (Ok(bytes), Ok(())) => Ok(bytes),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(%close_err, "closing gateway connection failed after a failed call");
                Err(e)
            }
        }
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        dispatch: Dispatch,
        function: ContractFunction,
        args: Vec<String>,
    ) -> Result<T, FabricError> {
        let bytes = self.call(dispatch, function, args).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn encode(model: &M) -> Result<String, FabricError> {
        Ok(serde_json::to_string(&to_record(model)?)?)
    }

    pub async fn create(&self, model: &M) -> Result<M, FabricError> {
        self.call_json(Dispatch::Submit, ContractFunction::Create, vec![Self::encode(model)?])
            .await
    }

    pub async fn read(&self, id: &str) -> Result<M, FabricError> {
        self.call_json(Dispatch::Evaluate, ContractFunction::Read, vec![id.to_string()])
            .await
    }

    pub async fn update(&self, model: &M) -> Result<M, FabricError> {
        self.call_json(Dispatch::Submit, ContractFunction::Update, vec![Self::encode(model)?])
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<M, FabricError> {
        self.call_json(Dispatch::Submit, ContractFunction::Delete, vec![id.to_string()])
            .await
    }

    pub async fn create_all(&self, models: &[M]) -> Result<Vec<M>, FabricError> {
        let records = models.iter().map(to_record).collect::<Result<Vec<_>, _>>()?;
        self.call_json(
            Dispatch::Submit,
            ContractFunction::CreateAll,
            vec![serde_json::to_string(&records)?],
        )
        .await
    }

    pub async fn read_all(&self, ids: &[&str]) -> Result<Vec<M>, FabricError> {
        self.call_json(
            Dispatch::Evaluate,
            ContractFunction::ReadAll,
            vec![serde_json::to_string(ids)?],
        )
        .await
    }

    pub async fn update_all(&self, models: &[M]) -> Result<Vec<M>, FabricError> {
        let records = models.iter().map(to_record).collect::<Result<Vec<_>, _>>()?;
        self.call_json(
            Dispatch::Submit,
            ContractFunction::UpdateAll,
            vec![serde_json::to_string(&records)?],
        )
        .await
    }

    pub async fn delete_all(&self, ids: &[&str]) -> Result<Vec<M>, FabricError> {
        self.call_json(
            Dispatch::Submit,
            ContractFunction::DeleteAll,
            vec![serde_json::to_string(ids)?],
        )
        .await
    }

    /// Compiles `query` locally and evaluates it on the contract.
    pub async fn query(&self, query: &Query, table_field: &str) -> Result<Vec<M>, FabricError> {
        let spec = M::spec();
        let mango = query.compile(table_field, &|f: &str| spec.column(f))?;
        self.query_mango(&mango).await
    }

    pub async fn query_mango(&self, mango: &MangoQuery) -> Result<Vec<M>, FabricError> {
        self.call_json(Dispatch::Evaluate, ContractFunction::Query, vec![mango.to_json()?])
            .await
    }
}
