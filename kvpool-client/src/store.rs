//! # Store Facade
//!
//! Purpose: Convenience data operations on top of the dispatcher, with JSON
//! value handling and a default TTL policy for writes.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Store` hides pooling, scripting and reply shapes.
//! 2. **Strings Stay Raw**: Plain strings are stored byte-for-byte; every other
//!    JSON value is stored as JSON text and parsed back on read.
//! 3. **Fail Fast**: The default TTL is validated when set, not when used.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use kvpool_common::{validate_default_ttl, ClientConfig, ConfigError, KvResult, Reply};

use crate::dispatcher::{unexpected, Dispatcher};
use crate::factory::ConnectionFactory;
use crate::pool::{Pool, PoolStatus};
use crate::script::BulkDelete;
use crate::tcp::TcpConnector;
use crate::transport::Connector;

/// TTL state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Data-access facade over one pool.
pub struct Store {
    dispatcher: Dispatcher,
    bulk: BulkDelete,
    default_ttl: Option<u64>,
}

impl Store {
    /// Builds a store talking RESP2 over TCP to `config.backend`.
    pub fn connect(config: ClientConfig) -> KvResult<Self> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Builds a store over a custom connector.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> KvResult<Self> {
        config.validate()?;
        let factory = ConnectionFactory::new(connector, config.backend, config.retry);
        let pool = Pool::new(config.pool, factory)?;
        let dispatcher = Dispatcher::new(pool);
        Ok(Store {
            bulk: BulkDelete::with_chunk_size(dispatcher.clone(), config.scan_chunk_size),
            dispatcher,
            default_ttl: config.default_ttl_secs,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Pool {
        self.dispatcher.pool()
    }

    pub fn status(&self) -> PoolStatus {
        self.dispatcher.status()
    }

    pub fn default_ttl(&self) -> Option<u64> {
        self.default_ttl
    }

    /// Changes the TTL attached by `set` and `getset`; `Some(0)` is rejected.
    pub fn set_default_ttl(&mut self, ttl_secs: Option<u64>) -> Result<(), ConfigError> {
        validate_default_ttl(ttl_secs)?;
        self.default_ttl = ttl_secs;
        Ok(())
    }

    /// Sends an arbitrary command through the pool.
    pub async fn command(&self, name: &str, args: &[&[u8]]) -> KvResult<Reply> {
        self.dispatcher.send(name, args).await
    }

    /// Fetches raw bytes. Returns `Ok(None)` when the key is missing.
    pub async fn get_raw(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        match self.dispatcher.send("GET", &[key.as_bytes()]).await? {
            Reply::Bulk(data) => Ok(data),
            other => Err(unexpected("GET", &other).into()),
        }
    }

    /// Fetches a value, decoding JSON payloads.
    pub async fn get(&self, key: &str) -> KvResult<Option<Value>> {
        Ok(self.get_raw(key).await?.map(|raw| decode_value(&raw)))
    }

    /// Fetches a value and deserializes it into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Stores a value, attaching the default TTL when one is configured.
    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> KvResult<()> {
        let ttl = self.default_ttl.map(Duration::from_secs);
        self.write(key, &encode_value(value)?, ttl).await
    }

    /// Stores a value that expires after `ttl` (whole seconds).
    pub async fn set_with_ttl<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
    ) -> KvResult<()> {
        self.write(key, &encode_value(value)?, Some(ttl)).await
    }

    async fn write(&self, key: &str, payload: &[u8], ttl: Option<Duration>) -> KvResult<()> {
        let reply = match ttl {
            Some(ttl) => {
                let seconds = ttl.as_secs().max(1).to_string();
                self.dispatcher
                    .send("SET", &[key.as_bytes(), payload, b"EX", seconds.as_bytes()])
                    .await?
            }
            None => self.dispatcher.send("SET", &[key.as_bytes(), payload]).await?,
        };
        match reply {
            Reply::Simple(_) => Ok(()),
            other => Err(unexpected("SET", &other).into()),
        }
    }

    /// Replaces a value and returns the previous one.
    pub async fn getset<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> KvResult<Option<Value>> {
        let payload = encode_value(value)?;
        let previous = match self.dispatcher.send("GETSET", &[key.as_bytes(), &payload]).await? {
            Reply::Bulk(data) => data,
            other => return Err(unexpected("GETSET", &other).into()),
        };
        if let Some(ttl) = self.default_ttl {
            self.expire(key, Duration::from_secs(ttl)).await?;
        }
        Ok(previous.map(|raw| decode_value(&raw)))
    }

    /// Deletes keys. Returns how many existed.
    pub async fn del(&self, keys: &[&str]) -> KvResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let args: Vec<&[u8]> = keys.iter().map(|key| key.as_bytes()).collect();
        match self.dispatcher.send("DEL", &args).await? {
            Reply::Integer(count) => Ok(count.max(0) as u64),
            other => Err(unexpected("DEL", &other).into()),
        }
    }

    /// Sets a time-to-live on a key (whole seconds, at least one). Returns
    /// true when the TTL was set.
    pub async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let seconds = ttl.as_secs().max(1).to_string();
        match self.dispatcher.send("EXPIRE", &[key.as_bytes(), seconds.as_bytes()]).await? {
            Reply::Integer(value) => Ok(value == 1),
            other => Err(unexpected("EXPIRE", &other).into()),
        }
    }

    /// Returns TTL status for a key.
    pub async fn ttl(&self, key: &str) -> KvResult<KeyTtl> {
        match self.dispatcher.send("TTL", &[key.as_bytes()]).await? {
            Reply::Integer(-2) => Ok(KeyTtl::Missing),
            Reply::Integer(-1) => Ok(KeyTtl::NoExpiry),
            Reply::Integer(value) if value >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(value as u64))),
            other => Err(unexpected("TTL", &other).into()),
        }
    }

    /// Lists keys matching a glob pattern.
    ///
    /// Blocks the backend for the whole keyspace walk; prefer `delete_all`
    /// for bulk removal.
    pub async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        match self.dispatcher.send("KEYS", &[pattern.as_bytes()]).await? {
            Reply::Array(items) => items
                .iter()
                .map(|item| -> KvResult<String> {
                    match item.as_bytes() {
                        Some(key) => Ok(String::from_utf8_lossy(key).into_owned()),
                        None => Err(unexpected("KEYS", item).into()),
                    }
                })
                .collect(),
            other => Err(unexpected("KEYS", &other).into()),
        }
    }

    /// Pings the backend and returns its answer.
    pub async fn ping(&self) -> KvResult<String> {
        let reply = self.dispatcher.send("PING", &[]).await?;
        match reply.as_bytes() {
            Some(text) => Ok(String::from_utf8_lossy(text).into_owned()),
            None => Err(unexpected("PING", &reply).into()),
        }
    }

    /// Deletes every key matching `pattern` (all keys when `None`).
    pub async fn delete_all(&self, pattern: Option<&str>) -> KvResult<u64> {
        self.bulk.delete_all(pattern).await
    }

    /// Drains the underlying pool.
    pub async fn drain(&self) {
        self.dispatcher.pool().drain().await
    }
}

/// Strings are stored as-is; everything else as JSON text.
pub fn encode_value<V: Serialize + ?Sized>(value: &V) -> KvResult<Vec<u8>> {
    match serde_json::to_value(value)? {
        Value::String(text) => Ok(text.into_bytes()),
        other => Ok(serde_json::to_vec(&other)?),
    }
}

/// Parses JSON payloads; anything else, including JSON strings, comes back
/// as the raw text.
pub fn decode_value(raw: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::String(_)) | Err(_) => Value::String(String::from_utf8_lossy(raw).into_owned()),
        Ok(parsed) => parsed,
    }
}
