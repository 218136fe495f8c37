//! # Connection Factory
//!
//! Purpose: Produce one live `Connection`, retrying transient connect
//! failures a bounded number of times with exponential backoff.
//!
//! ## Design Principles
//! 1. **Per-Call Attempt Counter**: The counter lives on the `create` stack
//!    frame, so concurrent creates never share retry state.
//! 2. **Errors As Values**: Exhaustion yields a `ConnectionError` carrying the
//!    redacted target; the pool routes it to the one caller that asked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kvpool_common::{BackendParams, ConnectionError, RetryPolicy, TransportError};

use crate::connection::Connection;
use crate::transport::{Connector, Transport};

/// Creates connections for one backend target.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    params: BackendParams,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, params: BackendParams, retry: RetryPolicy) -> Self {
        ConnectionFactory {
            connector,
            params,
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn params(&self) -> &BackendParams {
        &self.params
    }

    /// Opens a connection, retrying up to `retry.max_retries` times.
    pub async fn create(&self) -> Result<Connection, ConnectionError> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!(backend = %self.params, attempt, max_attempts, "connecting");
            match self.connect_once().await {
                Ok(transport) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(backend = %self.params, attempt, connection = id, "connected");
                    return Ok(Connection::new(id, transport, self.params.database));
                }
                Err(err) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        backend = %self.params,
                        attempt,
                        max_attempts,
                        error = %err,
                        retry_in = ?delay,
                        "connect attempt failed"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    tracing::error!(backend = %self.params, attempts = attempt, error = %err, "connection failed");
                    return Err(ConnectionError {
                        params: self.params.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self.retry.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.connector.connect(&self.params))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?,
            None => self.connector.connect(&self.params).await,
        }
    }
}
