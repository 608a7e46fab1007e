//! Persistence adapter mapping typed models onto a Hyperledger Fabric ledger:
//! world state, private data collections and mirror collections, with
//! ledger-backed sequences and chaincode events.
//!
//! A chaincode entry point builds one [`FabricAdapter`] per process, one
//! [`Repository`] per model type and one [`Context`] per transaction:
//!
//! ```ignore
//! let adapter = FabricAdapter::new(AdapterConfig::chaincode())?;
//! let orders: Repository<Order> = Repository::new(&adapter)?;
//! let ctx = Context::new(stub);
//! let created = orders.create(order, &ctx).await?;
//! ```

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod model;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod segregation;
pub mod sequence;

pub use adapter::{FabricAdapter, PreparedRecord, StorageBackend};
pub use config::{AdapterConfig, GatewayConfig, GatewayDeadlines};
pub use context::Context;
pub use error::{FabricError, FabricErrorCode, ResourceType};
pub use gateway::{GatewayClient, GatewayConnector, GatewayTransport, RemoteRepository};
pub use identity::Identity;
pub use ledger::{LedgerStub, MemoryLedger};
pub use model::{Model, ModelRegistry, ModelSpec};
pub use query::{Condition, Order, Page, Query, attr};
pub use repository::{Paginator, QueryBuilder, Repository};
pub use resolver::CollectionResolver;
pub use segregation::{Operation, Routing, SegregationPipeline};
pub use sequence::{Sequence, SequenceOptions, SequenceType, SequenceValue};
