//! Kiln Core - coordination kernel for a fleet of build masters
//!
//! A shared relational store whose uniqueness constraints arbitrate:
//! - exclusive ownership claims on shared resources
//! - slug-unique, append-only, completion-gated build logs
//!
//! plus hierarchical path addressing over the stored entities, an
//! in-process mutation event bus, and per-connection worker sessions
//! (authentication, keepalive, graceful shutdown, teardown).

pub mod bus;
pub mod claims;
pub mod db;
pub mod entities;
pub mod error;
pub mod identifiers;
pub mod logs;
pub mod realm;
pub mod router;
pub mod session;

pub use bus::{Event, EventBus, EventKind};
pub use claims::{ClaimRow, ClaimStore, ResourceKind};
pub use db::Db;
pub use entities::EntityStore;
pub use error::{KilnError, Result};
pub use logs::{LogData, LogStore};
pub use realm::{InMemoryRealm, Realm};
pub use router::{LogEndpoint, LogsEndpoint, PathParam, PathParams};
pub use session::signal::{FileMtimeSignal, SignalSource};
pub use session::transport::{JsonChannel, RpcChannel, RpcHandler};
pub use session::worker::{WorkerCommandHandler, WorkerConnection, record_hostname};
pub use session::{
    ConnectTarget, MasterSessionHandler, NoopHooks, SessionConfig, SessionConfigBuilder,
    SessionHooks, SessionState, ShutdownTrigger, WorkerSession,
};
