//! In-memory backend used by the integration tests.
//!
//! Implements enough of the command set for the store facade, emulates the
//! delete-by-pattern script chunk by chunk, and exposes knobs for injecting
//! connect, select, command and script-cache failures plus slow selects,
//! closes and script loads.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use kvpool_client::{
    BackendParams, ClientConfig, Connector, PoolConfig, Reply, RetryPolicy, Transport, TransportError,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with instant retries and a fixed pool name.
pub fn test_config(max_size: usize) -> ClientConfig {
    ClientConfig {
        pool: PoolConfig {
            name: Some("test".to_string()),
            max_size,
            ..PoolConfig::default()
        },
        retry: RetryPolicy {
            retry_backoff_ms: 0,
            connect_timeout_ms: None,
            ..RetryPolicy::default()
        },
        ..ClientConfig::default()
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

#[derive(Default)]
struct MockState {
    databases: HashMap<u32, BTreeMap<String, Entry>>,
    scripts: HashSet<String>,
    connect_failures: u32,
    select_failures: u32,
    noscript_replies: u32,
    script_load_failures: u32,
    script_load_delay: Duration,
    select_delay: Duration,
    close_delay: Duration,
    connects: u32,
    script_loads: u32,
    scan_chunks: u32,
    sessions_open: usize,
    sessions_closed: usize,
    flushed_closes: usize,
    selects: Vec<u32>,
}

impl MockState {
    fn keyspace(&mut self, db: u32) -> &mut BTreeMap<String, Entry> {
        let now = Instant::now();
        let space = self.databases.entry(db).or_default();
        space.retain(|_, entry| !entry.is_expired(now));
        space
    }

    fn execute(&mut self, db: u32, name: &str, args: &[&[u8]]) -> Result<Reply, TransportError> {
        let text: Vec<String> = args.iter().map(|arg| String::from_utf8_lossy(arg).into_owned()).collect();
        let reply = match (name.to_ascii_uppercase().as_str(), text.as_slice()) {
            ("PING", []) => Reply::Simple(b"PONG".to_vec()),
            ("PING", [payload]) => bulk(payload.as_bytes()),
            ("GET", [key]) => match self.keyspace(db).get(key) {
                Some(entry) => bulk(&entry.value),
                None => Reply::Bulk(None),
            },
            ("SET", [key, _]) => {
                self.store(db, key, args[1], None);
                ok()
            }
            ("SET", [key, _, ex, seconds]) if ex.eq_ignore_ascii_case("EX") => {
                let seconds: u64 = match seconds.parse() {
                    Ok(value) if value > 0 => value,
                    _ => return Ok(error("ERR invalid expire time in 'set' command")),
                };
                self.store(db, key, args[1], Some(Duration::from_secs(seconds)));
                ok()
            }
            ("GETSET", [key, _]) => {
                let previous = self.keyspace(db).remove(key).map(|entry| entry.value);
                self.store(db, key, args[1], None);
                Reply::Bulk(previous)
            }
            ("DEL", keys) | ("UNLINK", keys) if !keys.is_empty() => {
                let space = self.keyspace(db);
                let removed = keys.iter().filter(|key| space.remove(*key).is_some()).count();
                Reply::Integer(removed as i64)
            }
            ("EXPIRE", [key, seconds]) => {
                let seconds: u64 = match seconds.parse() {
                    Ok(value) => value,
                    Err(_) => return Ok(error("ERR value is not an integer or out of range")),
                };
                match self.keyspace(db).get_mut(key) {
                    Some(entry) => {
                        entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                        Reply::Integer(1)
                    }
                    None => Reply::Integer(0),
                }
            }
            ("TTL", [key]) => match self.keyspace(db).get(key) {
                None => Reply::Integer(-2),
                Some(Entry { expires_at: None, .. }) => Reply::Integer(-1),
                Some(Entry {
                    expires_at: Some(deadline),
                    ..
                }) => Reply::Integer(deadline.saturating_duration_since(Instant::now()).as_secs() as i64),
            },
            ("KEYS", [pattern]) => Reply::Array(
                self.keyspace(db)
                    .keys()
                    .filter(|key| glob_match(pattern.as_bytes(), key.as_bytes()))
                    .map(|key| bulk(key.as_bytes()))
                    .collect(),
            ),
            ("SCRIPT", [sub, source]) if sub.eq_ignore_ascii_case("LOAD") => {
                self.script_loads += 1;
                if self.script_load_failures > 0 {
                    self.script_load_failures -= 1;
                    return Ok(error("ERR Error compiling script"));
                }
                let sha = script_sha(source);
                self.scripts.insert(sha.clone());
                bulk(sha.as_bytes())
            }
            ("EVALSHA", [sha, numkeys, pattern, count]) if numkeys == "0" => {
                if self.noscript_replies > 0 {
                    self.noscript_replies -= 1;
                    self.scripts.clear();
                }
                if !self.scripts.contains(sha) {
                    return Ok(error("NOSCRIPT No matching script. Please use EVAL."));
                }
                let count: usize = match count.parse() {
                    Ok(value) if value > 0 => value,
                    _ => return Ok(error("ERR invalid COUNT")),
                };
                Reply::Integer(self.delete_by_pattern(db, pattern, count) as i64)
            }
            ("FAIL", _) => error("ERR simulated failure"),
            ("BREAK", _) => return Err(TransportError::Closed),
            _ => error(&format!("ERR unknown command '{}'", name)),
        };
        Ok(reply)
    }

    fn store(&mut self, db: u32, key: &str, value: &[u8], ttl: Option<Duration>) {
        let entry = Entry {
            value: value.to_vec(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.keyspace(db).insert(key.to_string(), entry);
    }

    /// Same walk as the server-side script: one SCAN chunk of `count` keys
    /// at a time, unlinking the matches, until the cursor wraps.
    fn delete_by_pattern(&mut self, db: u32, pattern: &str, count: usize) -> usize {
        let snapshot: Vec<String> = self.keyspace(db).keys().cloned().collect();
        let mut deleted = 0;
        let mut cursor = 0;
        loop {
            self.scan_chunks += 1;
            let end = (cursor + count).min(snapshot.len());
            let space = self.keyspace(db);
            for key in &snapshot[cursor..end] {
                if glob_match(pattern.as_bytes(), key.as_bytes()) && space.remove(key).is_some() {
                    deleted += 1;
                }
            }
            cursor = end;
            if cursor >= snapshot.len() {
                return deleted;
            }
        }
    }
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn insert(&self, db: u32, key: &str, value: &str) {
        self.state.lock().store(db, key, value.as_bytes(), None);
    }

    pub fn keys(&self, db: u32) -> Vec<String> {
        self.state.lock().keyspace(db).keys().cloned().collect()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    pub fn fail_next_selects(&self, count: u32) {
        self.state.lock().select_failures = count;
    }

    pub fn evict_scripts_next(&self, count: u32) {
        self.state.lock().noscript_replies = count;
    }

    pub fn fail_next_script_loads(&self, count: u32) {
        self.state.lock().script_load_failures = count;
    }

    pub fn delay_script_loads(&self, delay: Duration) {
        self.state.lock().script_load_delay = delay;
    }

    pub fn delay_selects(&self, delay: Duration) {
        self.state.lock().select_delay = delay;
    }

    pub fn delay_closes(&self, delay: Duration) {
        self.state.lock().close_delay = delay;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn script_loads(&self) -> u32 {
        self.state.lock().script_loads
    }

    pub fn scan_chunks(&self) -> u32 {
        self.state.lock().scan_chunks
    }

    pub fn sessions_open(&self) -> usize {
        self.state.lock().sessions_open
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().sessions_closed
    }

    pub fn flushed_closes(&self) -> usize {
        self.state.lock().flushed_closes
    }

    pub fn selects(&self) -> Vec<u32> {
        self.state.lock().selects.clone()
    }
}

#[async_trait]
impl Connector for MockBackend {
    async fn connect(&self, params: &BackendParams) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        state.sessions_open += 1;
        Ok(Box::new(MockSession {
            backend: self.clone(),
            db: params.database,
            open: true,
            closed: false,
        }))
    }
}

struct MockSession {
    backend: MockBackend,
    db: u32,
    open: bool,
    closed: bool,
}

#[async_trait]
impl Transport for MockSession {
    async fn send_command(&mut self, name: &str, args: &[&[u8]]) -> Result<Reply, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if name.eq_ignore_ascii_case("SCRIPT") {
            let delay = self.backend.state.lock().script_load_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        let result = self.backend.state.lock().execute(self.db, name, args);
        if result.is_err() {
            self.open = false;
        }
        result
    }

    async fn select_database(&mut self, index: u32) -> Result<(), TransportError> {
        let delay = self.backend.state.lock().select_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.backend.state.lock();
        if state.select_failures > 0 {
            state.select_failures -= 1;
            return Err(TransportError::Rejected("ERR DB index is out of range".to_string()));
        }
        state.selects.push(index);
        self.db = index;
        Ok(())
    }

    async fn close(&mut self, flush: bool) -> Result<(), TransportError> {
        let delay = self.backend.state.lock().close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.backend.state.lock();
        if !self.closed {
            state.sessions_open = state.sessions_open.saturating_sub(1);
            state.sessions_closed += 1;
            if flush {
                state.flushed_closes += 1;
            }
        }
        self.open = false;
        self.closed = true;
        Ok(())
    }
}

fn ok() -> Reply {
    Reply::Simple(b"OK".to_vec())
}

fn bulk(data: &[u8]) -> Reply {
    Reply::Bulk(Some(data.to_vec()))
}

fn error(message: &str) -> Reply {
    Reply::Error(message.as_bytes().to_vec())
}

fn script_sha(source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Glob match supporting `*`, `?` and literal bytes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
