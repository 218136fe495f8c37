//! # Bulk Delete
//!
//! Purpose: Delete every key matching a glob pattern with a server-side
//! script, so keys never travel to the client and each `SCAN` chunk bounds
//! the work done per step.
//!
//! ## Design Principles
//! 1. **Load Once, Execute Many**: The script is uploaded on first use and
//!    invoked by identifier afterwards.
//! 2. **Coalesced Loads**: Concurrent callers share one in-flight load.
//! 3. **Bounded Recovery**: A `NOSCRIPT` reply triggers a reload and retry,
//!    at most `MAX_RELOADS` times per call.
//!
//! ## Handle States
//!
//! ```text
//! NotLoaded ──load──> Loading ──ok──> Loaded(sha)
//!     ^                  │               │
//!     └──────failed──────┘               │
//!     └──────────────NOSCRIPT────────────┘
//! ```

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use kvpool_common::{Error, KvResult, ScriptError, DEFAULT_SCAN_CHUNK_SIZE};

use crate::dispatcher::{unexpected, Dispatcher};

/// SCAN/UNLINK loop run by the backend. ARGV[1] is the pattern, ARGV[2]
/// the chunk size.
pub const DELETE_BY_PATTERN_SCRIPT: &str = r#"
local cursor = "0"
local deleted = 0
repeat
    local page = redis.call("SCAN", cursor, "MATCH", ARGV[1], "COUNT", ARGV[2])
    cursor = page[1]
    local keys = page[2]
    for i = 1, #keys do
        deleted = deleted + redis.call("UNLINK", keys[i])
    end
until cursor == "0"
return deleted
"#;

/// Reloads attempted per `delete_all` call after `NOSCRIPT` replies.
pub const MAX_RELOADS: u32 = 1;

type LoadFuture = Shared<BoxFuture<'static, Result<String, Arc<Error>>>>;

enum HandleState {
    NotLoaded,
    Loading { generation: u64, load: LoadFuture },
    Loaded { sha: String },
}

struct ScriptHandle {
    state: HandleState,
    // Distinguishes load attempts so a stale result never overwrites a newer one.
    generation: u64,
}

/// Pattern delete backed by a cached server-side script.
pub struct BulkDelete {
    dispatcher: Dispatcher,
    chunk_size: u32,
    handle: Mutex<ScriptHandle>,
}

impl BulkDelete {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self::with_chunk_size(dispatcher, DEFAULT_SCAN_CHUNK_SIZE)
    }

    pub fn with_chunk_size(dispatcher: Dispatcher, chunk_size: u32) -> Self {
        BulkDelete {
            dispatcher,
            chunk_size: chunk_size.max(1),
            handle: Mutex::new(ScriptHandle {
                state: HandleState::NotLoaded,
                generation: 0,
            }),
        }
    }

    /// Identifier of the loaded script, if any.
    pub fn loaded_sha(&self) -> Option<String> {
        match &self.handle.lock().state {
            HandleState::Loaded { sha } => Some(sha.clone()),
            _ => None,
        }
    }

    /// Deletes every key matching `pattern` (`*` when `None`) and returns how
    /// many were removed.
    ///
    /// # Errors
    /// - `ScriptError::Load` when uploading the script failed.
    /// - `ScriptError::UnknownScript` when the backend keeps evicting it.
    /// - Any other command error from the execution, unchanged.
    pub async fn delete_all(&self, pattern: Option<&str>) -> KvResult<u64> {
        let pattern = pattern.unwrap_or("*");
        let chunk = self.chunk_size.to_string();
        let mut reloads = 0;

        loop {
            let sha = self.script_sha().await?;
            let outcome = self
                .dispatcher
                .eval_sha(&sha, &[], &[pattern.as_bytes(), chunk.as_bytes()])
                .await;
            match outcome {
                Ok(reply) => {
                    let deleted = reply
                        .as_integer()
                        .ok_or_else(|| unexpected("EVALSHA", &reply))?;
                    tracing::debug!(pattern, deleted, "bulk delete finished");
                    return Ok(deleted.max(0) as u64);
                }
                Err(err) if err.is_unknown_script() => {
                    self.invalidate(&sha);
                    if reloads >= MAX_RELOADS {
                        return Err(ScriptError::UnknownScript { sha, reloads }.into());
                    }
                    reloads += 1;
                    tracing::warn!(%sha, reloads, "script evicted by backend, reloading");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the cached identifier, loading the script if needed.
    async fn script_sha(&self) -> KvResult<String> {
        let (generation, load) = {
            let mut guard = self.handle.lock();
            let handle = &mut *guard;
            match &handle.state {
                HandleState::Loaded { sha } => return Ok(sha.clone()),
                HandleState::Loading { generation, load } => (*generation, load.clone()),
                HandleState::NotLoaded => {
                    handle.generation += 1;
                    let generation = handle.generation;
                    let dispatcher = self.dispatcher.clone();
                    let load = async move {
                        dispatcher
                            .load_script(DELETE_BY_PATTERN_SCRIPT)
                            .await
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    handle.state = HandleState::Loading {
                        generation,
                        load: load.clone(),
                    };
                    tracing::debug!(generation, "loading bulk delete script");
                    (generation, load)
                }
            }
        };

        let result = load.await;

        let mut handle = self.handle.lock();
        let current = matches!(
            &handle.state,
            HandleState::Loading { generation: active, .. } if *active == generation
        );
        match result {
            Ok(sha) => {
                if current {
                    handle.state = HandleState::Loaded { sha: sha.clone() };
                }
                Ok(sha)
            }
            Err(err) => {
                if current {
                    handle.state = HandleState::NotLoaded;
                }
                Err(ScriptError::Load(err).into())
            }
        }
    }

    /// Forgets `sha` if it is still the cached identifier.
    fn invalidate(&self, sha: &str) {
        let mut handle = self.handle.lock();
        if matches!(&handle.state, HandleState::Loaded { sha: cached } if cached == sha) {
            handle.state = HandleState::NotLoaded;
        }
    }
}
