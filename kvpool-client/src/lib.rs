//! # kvpool Client
//!
//! Purpose: An async, pooled client for Redis-compatible key-value stores,
//! with priority-aware connection checkout, per-call database selection and
//! a script-backed pattern delete.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse sessions; create them lazily under a
//!    bounded retry policy.
//! 2. **Single Release Point**: Every command goes through `Dispatcher`,
//!    which always gives the connection back.
//! 3. **Strategy Pattern**: Backends plug in through `Connector`/`Transport`.
//! 4. **Protocol Clarity**: RESP2 is encoded and parsed explicitly.
//!
//! ## Layers
//!
//! ```text
//! Store ──> Dispatcher ──> Pool ──> ConnectionFactory ──> Connector
//!   └──> BulkDelete ──┘
//! ```

mod connection;
mod dispatcher;
mod factory;
mod pool;
mod resp;
mod script;
mod store;
mod tcp;
mod transport;

pub use connection::Connection;
pub use dispatcher::Dispatcher;
pub use factory::ConnectionFactory;
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use script::{BulkDelete, DELETE_BY_PATTERN_SCRIPT, MAX_RELOADS};
pub use store::{decode_value, encode_value, KeyTtl, Store};
pub use tcp::{TcpConnector, TcpTransport};
pub use transport::{Connector, Transport};

pub use kvpool_common::{
    AcquireError, BackendParams, ClientConfig, CommandError, ConfigError, ConnectionError, Error,
    KvResult, PoolConfig, Reply, RetryPolicy, ScriptError, TransportError,
};
