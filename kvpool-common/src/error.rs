//! # Error Taxonomy
//!
//! Purpose: One error type per failure domain (transport, connection
//! creation, acquisition, command, script, configuration) with a crate-wide
//! `Error` that wraps them all.
//!
//! ## Design Principles
//! 1. **Values, Not Panics**: Every backend failure reaches the caller as an
//!    `Err`; nothing here terminates the pool.
//! 2. **Diagnosable**: Errors carry the command, database or backend target
//!    involved, with secrets redacted.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::BackendParams;

/// Result type used across the workspace.
pub type KvResult<T> = Result<T, Error>;

/// Failures reported by a transport capability.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Reply framing or parse error.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// Connect did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered a handshake or SELECT with an error reply.
    #[error("rejected by backend: {0}")]
    Rejected(String),
}

impl TransportError {
    /// True when the transport itself is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Rejected(_))
    }
}

/// Connection creation exhausted its retry bound.
#[derive(Debug, Error)]
#[error("connection failed: {attempts} attempts to {params} exhausted: {source}")]
pub struct ConnectionError {
    /// Target parameters; the password is redacted when printed.
    pub params: BackendParams,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Failure of the last attempt.
    #[source]
    pub source: TransportError,
}

/// A connection could not be handed to the caller.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Waited in the queue longer than the configured acquire timeout.
    #[error("pool {pool}: timed out after {waited:?} waiting for a connection")]
    Timeout { pool: String, waited: Duration },
    /// SELECT failed on the acquired connection.
    #[error("pool {pool}: failed to select database {database}: {source}")]
    Select {
        pool: String,
        database: u32,
        #[source]
        source: TransportError,
    },
    /// The pool is draining or drained.
    #[error("pool {pool} is draining and no longer accepts acquires")]
    Draining { pool: String },
}

/// The backend rejected or failed a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Error reply from the backend.
    #[error("{command} failed: {message}")]
    Server { command: String, message: String },
    /// Transport failure while the command was in flight.
    #[error("{command} failed in transit: {source}")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
    /// Reply type did not match what the command returns.
    #[error("unexpected {kind} reply to {command}")]
    UnexpectedReply { command: String, kind: &'static str },
}

impl CommandError {
    /// Returns the server message for error replies.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            CommandError::Server { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Failures specific to the cached bulk-delete script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The backend kept reporting the script identifier as unknown.
    #[error("script {sha} unknown to backend after {reloads} reload(s)")]
    UnknownScript { sha: String, reloads: u32 },
    /// The shared load request failed; every coalesced caller sees it.
    #[error("script load failed: {0}")]
    Load(#[source] Arc<Error>),
}

/// Invalid static configuration, reported at construction or setter time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True when the error is a NOSCRIPT reply from the backend.
    pub fn is_unknown_script(&self) -> bool {
        match self {
            Error::Command(err) => err
                .server_message()
                .map(|message| message.starts_with("NOSCRIPT"))
                .unwrap_or(false),
            _ => false,
        }
    }
}
