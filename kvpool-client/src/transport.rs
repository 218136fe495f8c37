//! # Transport Capability
//!
//! Purpose: The only surface the pool needs from a backend session. The
//! pool never sees sockets or wire encoding; it opens, drives and closes
//! sessions through these two traits.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `TcpConnector` talks RESP2 over TCP; tests plug in
//!    an in-memory backend through the same traits.
//! 2. **Object Safety**: Sessions are boxed so pool types stay non-generic.

use async_trait::async_trait;

use kvpool_common::{BackendParams, Reply, TransportError};

/// Opens sessions to a backend.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes one session. Called once per factory attempt.
    async fn connect(&self, params: &BackendParams) -> Result<Box<dyn Transport>, TransportError>;
}

/// One live session to the backend.
#[async_trait]
pub trait Transport: Send {
    /// Sends one command and waits for its reply.
    ///
    /// Error replies are returned as `Ok(Reply::Error(..))`; `Err` means the
    /// session itself failed.
    async fn send_command(&mut self, name: &str, args: &[&[u8]]) -> Result<Reply, TransportError>;

    /// Switches the session to another logical database.
    async fn select_database(&mut self, index: u32) -> Result<(), TransportError>;

    /// Closes the session, first flushing pending state when `flush` is set.
    async fn close(&mut self, flush: bool) -> Result<(), TransportError>;
}
