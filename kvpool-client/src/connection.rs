//! Pooled backend session plus the bookkeeping the pool needs about it.

use std::fmt;

use kvpool_common::{Reply, TransportError};

use crate::transport::Transport;

/// One live session owned by a pool.
///
/// Checked-out state is tracked by the pool, not here.
pub struct Connection {
    id: u64,
    transport: Box<dyn Transport>,
    database: u32,
    healthy: bool,
}

impl Connection {
    pub(crate) fn new(id: u64, transport: Box<dyn Transport>, database: u32) -> Self {
        Connection {
            id,
            transport,
            database,
            healthy: true,
        }
    }

    /// Pool-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Currently selected logical database.
    pub fn database(&self) -> u32 {
        self.database
    }

    /// False once a transport failure was seen, or while a reply is still
    /// outstanding; the pool destroys such connections on release.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Sends one command. Transport failures mark the connection unhealthy.
    ///
    /// The connection counts as unhealthy until the reply is read, so a
    /// caller dropped mid-command never recycles a session with a reply
    /// still in flight.
    pub async fn send(&mut self, name: &str, args: &[&[u8]]) -> Result<Reply, TransportError> {
        self.healthy = false;
        let result = self.transport.send_command(name, args).await;
        self.healthy = result.is_ok();
        result
    }

    pub(crate) async fn select(&mut self, database: u32) -> Result<(), TransportError> {
        self.healthy = false;
        match self.transport.select_database(database).await {
            Ok(()) => {
                self.healthy = true;
                self.database = database;
                Ok(())
            }
            Err(err) => {
                // A rejected SELECT still consumed its reply.
                self.healthy = err.is_recoverable();
                Err(err)
            }
        }
    }

    pub(crate) async fn close(&mut self, flush: bool) -> Result<(), TransportError> {
        self.healthy = false;
        self.transport.close(flush).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("healthy", &self.healthy)
            .finish()
    }
}
