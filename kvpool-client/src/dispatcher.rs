//! # Command Dispatcher
//!
//! Purpose: The single path from callers to the backend. Each call acquires
//! a connection, sends exactly one command and releases the connection
//! before the result is surfaced.
//!
//! ## Design Principles
//! 1. **Single Release Point**: Higher layers never touch connection
//!    lifetime, so they cannot leak one.
//! 2. **No Retries**: A failed command is reported as-is; retry policy
//!    belongs to the caller.

use kvpool_common::{CommandError, KvResult, Reply};

use crate::pool::{Pool, PoolStatus};

/// Sends single commands through a pool. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    pool: Pool,
    default_priority: u8,
}

impl Dispatcher {
    pub fn new(pool: Pool) -> Self {
        Dispatcher {
            pool,
            default_priority: 0,
        }
    }

    /// Priority used by `send`.
    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Sends one command at the default priority on any database.
    pub async fn send(&self, command: &str, args: &[&[u8]]) -> KvResult<Reply> {
        self.send_with(command, args, self.default_priority, None).await
    }

    /// Sends one command on a connection acquired with `priority` and,
    /// when given, switched to `database`.
    ///
    /// Error replies become `CommandError::Server`.
    pub async fn send_with(
        &self,
        command: &str,
        args: &[&[u8]],
        priority: u8,
        database: Option<u32>,
    ) -> KvResult<Reply> {
        let mut conn = self.pool.acquire(priority, database).await?;
        let result = conn.send(command, args).await;
        // Unhealthy connections are closed by the pool on release.
        self.pool.release(conn);

        match result {
            Ok(Reply::Error(message)) => {
                let message = String::from_utf8_lossy(&message).into_owned();
                tracing::debug!(command, %message, "command rejected");
                Err(CommandError::Server {
                    command: command.to_string(),
                    message,
                }
                .into())
            }
            Ok(reply) => Ok(reply),
            Err(source) => {
                tracing::warn!(command, error = %source, "command failed in transit");
                Err(CommandError::Transport {
                    command: command.to_string(),
                    source,
                }
                .into())
            }
        }
    }

    /// Uploads a script and returns the identifier the backend assigned.
    pub async fn load_script(&self, source: &str) -> KvResult<String> {
        let reply = self.send("SCRIPT", &[b"LOAD", source.as_bytes()]).await?;
        match reply.as_bytes() {
            Some(sha) => Ok(String::from_utf8_lossy(sha).into_owned()),
            None => Err(unexpected("SCRIPT LOAD", &reply).into()),
        }
    }

    /// Runs a loaded script by identifier.
    pub async fn eval_sha(&self, sha: &str, keys: &[&[u8]], args: &[&[u8]]) -> KvResult<Reply> {
        let numkeys = keys.len().to_string();
        let mut full: Vec<&[u8]> = Vec::with_capacity(2 + keys.len() + args.len());
        full.push(sha.as_bytes());
        full.push(numkeys.as_bytes());
        full.extend_from_slice(keys);
        full.extend_from_slice(args);
        self.send("EVALSHA", &full).await
    }
}

/// Builds the error for a reply of the wrong shape.
pub(crate) fn unexpected(command: &str, reply: &Reply) -> CommandError {
    CommandError::UnexpectedReply {
        command: command.to_string(),
        kind: reply.kind(),
    }
}
