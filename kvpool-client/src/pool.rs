//! # Connection Pool
//!
//! Purpose: Keep a bounded set of reusable backend sessions, hand them out
//! by priority, and take them back deterministically.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle sessions are reused before new ones are
//!    created, and new ones are created lazily up to `max_size`.
//! 2. **Single Lock**: All bookkeeping (idle set, in-use ids, live count,
//!    wait queue) sits behind one mutex that is never held across `.await`.
//! 3. **Direct Hand-Off**: A released connection goes straight to the best
//!    waiter (highest priority, then oldest) instead of racing through the
//!    idle set.
//! 4. **Cancellation Safety**: Reserved slots, queued waiters and checked-out
//!    connections are guards; dropping an acquire or a destroy at any point
//!    returns whatever it held.
//!
//! ## Slot Accounting
//!
//! ```text
//! live = idle + in_use + creating
//!
//! acquire ──> idle? ──yes──> in_use
//!               │no
//!               ├─ live < max ──> reserve slot ──> factory.create ──> in_use
//!               └─ else ──> wait queue ──> Grant::Ready(conn) | Grant::Slot
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use kvpool_common::{AcquireError, KvResult, PoolConfig};

use crate::connection::Connection;
use crate::factory::ConnectionFactory;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    /// Live connections, including ones being created.
    pub size: usize,
    /// Idle connections ready for the next acquire.
    pub available: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Acquires waiting in the queue.
    pub pending: usize,
    pub max_size: usize,
}

/// What a queued waiter receives.
enum Grant {
    /// A connection, already marked in use.
    Ready(Connection),
    /// Permission to create a connection in a freed slot.
    Slot,
}

/// Queue order: higher priority first, then FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaiterKey {
    priority: u8,
    seq: u64,
}

impl Ord for WaiterKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for WaiterKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    live: usize,
    in_use: HashSet<u64>,
    waiters: BTreeMap<WaiterKey, oneshot::Sender<Grant>>,
    next_seq: u64,
    draining: bool,
}

impl PoolState {
    /// Prefers an idle connection already on `database`.
    fn take_idle(&mut self, database: Option<u32>) -> Option<Connection> {
        if let Some(index) = database {
            if let Some(pos) = self.idle.iter().position(|conn| conn.database() == index) {
                return self.idle.remove(pos);
            }
        }
        self.idle.pop_front()
    }

    fn enqueue(&mut self, priority: u8, tx: oneshot::Sender<Grant>) -> WaiterKey {
        let key = WaiterKey {
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.waiters.insert(key, tx);
        key
    }

    fn is_settled(&self) -> bool {
        self.live == self.idle.len()
    }
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    factory: ConnectionFactory,
    state: Mutex<PoolState>,
    // Signalled whenever a connection or slot comes back during drain.
    returned: Notify,
}

impl PoolInner {
    fn draining_error(&self) -> AcquireError {
        AcquireError::Draining {
            pool: self.name.clone(),
        }
    }

    /// Gives `conn` to the best waiter, or parks it in the idle set.
    fn hand_off(&self, state: &mut PoolState, mut conn: Connection) {
        while let Some((key, tx)) = state.waiters.pop_first() {
            let id = conn.id();
            state.in_use.insert(id);
            match tx.send(Grant::Ready(conn)) {
                Ok(()) => {
                    tracing::trace!(pool = %self.name, connection = id, priority = key.priority, "handed off");
                    return;
                }
                Err(Grant::Ready(back)) => {
                    state.in_use.remove(&id);
                    conn = back;
                }
                Err(Grant::Slot) => unreachable!("hand-off sends connection grants only"),
            }
        }
        state.idle.push_back(conn);
        if state.draining {
            self.returned.notify_waiters();
        }
    }

    /// Passes a freed slot to the best waiter, or shrinks the live count.
    fn free_slot_locked(&self, state: &mut PoolState) {
        while let Some((_, tx)) = state.waiters.pop_first() {
            if tx.send(Grant::Slot).is_ok() {
                return;
            }
        }
        state.live = state.live.saturating_sub(1);
        if state.draining {
            self.returned.notify_waiters();
        }
    }

    fn free_slot(&self) {
        let mut state = self.state.lock();
        self.free_slot_locked(&mut state);
    }

    /// Returns a checked-out connection. Unhealthy ones are closed instead.
    fn check_in(self: &Arc<Self>, conn: Connection) {
        let mut state = self.state.lock();
        state.in_use.remove(&conn.id());
        if conn.is_healthy() {
            self.hand_off(&mut state, conn);
            return;
        }
        drop(state);

        tracing::debug!(pool = %self.name, connection = conn.id(), "discarding unhealthy connection");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    let _slot = SlotReservation::new(&inner);
                    discard(&inner.name, conn, false).await;
                });
            }
            Err(_) => {
                drop(conn);
                self.free_slot();
            }
        }
    }

    /// Removes a waiter that gave up, reclaiming a grant that raced with it.
    fn abandon(&self, key: WaiterKey, rx: &mut oneshot::Receiver<Grant>) {
        let mut state = self.state.lock();
        if state.waiters.remove(&key).is_some() {
            return;
        }
        // Grants are sent under this lock, so anything sent is visible now.
        rx.close();
        match rx.try_recv() {
            Ok(Grant::Ready(conn)) => {
                state.in_use.remove(&conn.id());
                self.hand_off(&mut state, conn);
            }
            Ok(Grant::Slot) => self.free_slot_locked(&mut state),
            Err(_) => {}
        }
    }
}

/// Frees a slot when dropped, unless committed first.
///
/// Guards both a creation in progress and a close in progress.
struct SlotReservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> SlotReservation<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        SlotReservation { inner, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.free_slot();
        }
    }
}

/// A queued acquire. Dropping it unsettled removes it from the queue.
struct Waiter<'a> {
    inner: &'a PoolInner,
    key: WaiterKey,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Waiter<'_> {
    async fn recv(&mut self) -> Result<Grant, oneshot::error::RecvError> {
        let result = (&mut self.rx).await;
        self.settled = true;
        result
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.abandon(self.key, &mut self.rx);
        }
    }
}

enum Checkout {
    Create,
    Wait(WaiterKey, oneshot::Receiver<Grant>),
}

/// Connection pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Builds a pool. No connection is opened until the first acquire.
    pub fn new(config: PoolConfig, factory: ConnectionFactory) -> KvResult<Self> {
        config.validate()?;
        let name = config.resolved_name();
        tracing::info!(
            pool = %name,
            backend = %factory.params(),
            max_size = config.max_size,
            "pool created"
        );
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_size),
            live: 0,
            in_use: HashSet::with_capacity(config.max_size),
            waiters: BTreeMap::new(),
            next_seq: 0,
            draining: false,
        };
        Ok(Pool {
            inner: Arc::new(PoolInner {
                name,
                config,
                factory,
                state: Mutex::new(state),
                returned: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            name: self.inner.name.clone(),
            size: state.live,
            available: state.idle.len(),
            in_use: state.in_use.len(),
            pending: state.waiters.len(),
            max_size: self.inner.config.max_size,
        }
    }

    /// Checks out a connection.
    ///
    /// Higher `priority` values are served first; values at or above
    /// `priority_range` are clamped. When `database` is given the connection
    /// is switched to it before being returned.
    ///
    /// # Errors
    /// - `ConnectionError` when a new connection was needed and the factory
    ///   gave up.
    /// - `AcquireError::Timeout` when the queue wait exceeded the timeout.
    /// - `AcquireError::Select` when switching databases failed; the
    ///   connection stays in the pool.
    /// - `AcquireError::Draining` once `drain` has started.
    pub async fn acquire(&self, priority: u8, database: Option<u32>) -> KvResult<PooledConnection> {
        let priority = priority.min(self.inner.config.priority_range.saturating_sub(1));
        let checked_out = self.checkout(priority, database).await?;
        // Guarded from here on: dropping this future mid-SELECT checks the
        // connection back in, and the pending reply gets it discarded.
        let mut conn = PooledConnection {
            pool: Arc::clone(&self.inner),
            conn: Some(checked_out),
        };

        if let Some(index) = database {
            if conn.database() != index {
                if let Err(source) = conn.select(index).await {
                    tracing::warn!(
                        pool = %self.inner.name,
                        connection = conn.id(),
                        database = index,
                        error = %source,
                        "database selection failed"
                    );
                    drop(conn);
                    return Err(AcquireError::Select {
                        pool: self.inner.name.clone(),
                        database: index,
                        source,
                    }
                    .into());
                }
            }
        }

        Ok(conn)
    }

    async fn checkout(&self, priority: u8, database: Option<u32>) -> KvResult<Connection> {
        let step = {
            let mut state = self.inner.state.lock();
            if state.draining {
                return Err(self.inner.draining_error().into());
            }
            if let Some(conn) = state.take_idle(database) {
                state.in_use.insert(conn.id());
                return Ok(conn);
            }
            if state.live < self.inner.config.max_size {
                state.live += 1;
                Checkout::Create
            } else {
                let (tx, rx) = oneshot::channel();
                Checkout::Wait(state.enqueue(priority, tx), rx)
            }
        };

        let grant = match step {
            Checkout::Create => Grant::Slot,
            Checkout::Wait(key, rx) => self.wait(key, rx).await?,
        };

        match grant {
            Grant::Ready(conn) => Ok(conn),
            Grant::Slot => self.create_in_slot().await,
        }
    }

    async fn wait(&self, key: WaiterKey, rx: oneshot::Receiver<Grant>) -> KvResult<Grant> {
        tracing::debug!(pool = %self.inner.name, priority = key.priority, "waiting for a connection");
        let started = Instant::now();
        let mut waiter = Waiter {
            inner: &self.inner,
            key,
            rx,
            settled: false,
        };

        let received = match self.inner.config.acquire_timeout() {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, waiter.recv()).await;
                match outcome {
                    Ok(received) => received,
                    Err(_) => {
                        drop(waiter);
                        tracing::warn!(pool = %self.inner.name, waited = ?limit, "acquire timed out");
                        return Err(AcquireError::Timeout {
                            pool: self.inner.name.clone(),
                            waited: started.elapsed(),
                        }
                        .into());
                    }
                }
            }
            None => waiter.recv().await,
        };

        // A dropped sender means drain discarded the queue.
        received.map_err(|_| self.inner.draining_error().into())
    }

    async fn create_in_slot(&self) -> KvResult<Connection> {
        let reservation = SlotReservation::new(&self.inner);
        let conn = self.inner.factory.create().await?;
        reservation.commit();
        self.inner.state.lock().in_use.insert(conn.id());
        Ok(conn)
    }

    /// Returns a connection for reuse.
    ///
    /// Connections that saw a transport failure are closed instead.
    pub fn release(&self, mut conn: PooledConnection) {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            tracing::warn!(pool = %self.inner.name, "release of a connection owned by another pool");
            return;
        }
        if let Some(conn) = conn.conn.take() {
            self.inner.check_in(conn);
        }
    }

    /// Closes a connection the caller found unusable and frees its slot.
    pub async fn destroy(&self, mut conn: PooledConnection) {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            tracing::warn!(pool = %self.inner.name, "destroy of a connection owned by another pool");
            return;
        }
        let conn = match conn.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        self.inner.state.lock().in_use.remove(&conn.id());
        // Freed on drop, so a cancelled close still gives the slot back.
        let _slot = SlotReservation::new(&self.inner);
        discard(&self.inner.name, conn, true).await;
    }

    /// Opens connections until `min_size` are live. Returns how many opened.
    pub async fn warm_up(&self) -> KvResult<usize> {
        let mut opened = 0;
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.draining || state.live >= self.inner.config.min_size {
                    break;
                }
                state.live += 1;
            }
            let reservation = SlotReservation::new(&self.inner);
            let conn = self.inner.factory.create().await?;
            reservation.commit();
            let mut state = self.inner.state.lock();
            self.inner.hand_off(&mut state, conn);
            opened += 1;
        }
        Ok(opened)
    }

    /// Stops accepting acquires, waits for every outstanding connection to
    /// come back, then closes them all.
    ///
    /// Must not run concurrently with itself.
    pub async fn drain(&self) {
        let rejected = {
            let mut state = self.inner.state.lock();
            state.draining = true;
            std::mem::take(&mut state.waiters)
        };
        tracing::info!(pool = %self.inner.name, rejected = rejected.len(), "draining pool");
        drop(rejected);

        loop {
            let notified = self.inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if state.is_settled() {
                    break;
                }
                tracing::debug!(
                    pool = %self.inner.name,
                    outstanding = state.live - state.idle.len(),
                    "waiting for connections to return"
                );
            }
            notified.await;
        }

        let idle: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            state.live -= state.idle.len();
            state.idle.drain(..).collect()
        };
        let closed = idle.len();
        for conn in idle {
            discard(&self.inner.name, conn, true).await;
        }
        tracing::info!(pool = %self.inner.name, closed, "pool drained");
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

/// A checked-out connection.
///
/// Return it with `Pool::release` or `Pool::destroy`; if it is simply
/// dropped it goes back to the pool as if released.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("conn", &self.conn)
            .finish()
    }
}

/// Closes a connection, logging instead of propagating close failures.
async fn discard(pool: &str, mut conn: Connection, flush: bool) {
    let id = conn.id();
    match conn.close(flush).await {
        Ok(()) => tracing::debug!(pool, connection = id, "connection closed"),
        Err(err) => tracing::warn!(pool, connection = id, error = %err, "error while closing connection"),
    }
}
