// ABOUTME: Bounded pool of connections to the office service
// ABOUTME: Leases probed connections as handles, recycles them under a reuse limit, destroys the rest

//! Connection Pool
//!
//! The `ConnectionPool` shares a small number of expensive connections among
//! many tasks:
//! - Allocates up to `capacity` connections through its `ConnectionFactory`
//! - Probes idle connections before handing them out
//! - Recycles returned connections while they answer and are under the reuse limit
//! - Destroys everything else, letting the factory react (e.g. restart the process)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ConnectionPool                       │
//! │  allocation lock ── count ≤ capacity                     │
//! │        │                                                 │
//! │        ▼                                                 │
//! │  ┌───────────┐  take   ┌──────────────────┐  close       │
//! │  │ IdleQueue │ ──────▶ │ ConnectionHandle │ ──────┐      │
//! │  └───────────┘         └──────────────────┘       │      │
//! │        ▲                    release (probe, reuse)│      │
//! │        └──────────────────────────────────────────┘      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let pool = ConnectionPool::new(2, factory);
//! let handle = pool.get_connection().await?;
//! let loader = handle.loader().await?;
//! handle.close().await?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tracing::{debug, error, info, warn};

use super::bootstrap::SupervisorError;
use super::config::PoolSettings;
use super::connection::{Connection, ConnectionError};
use super::factory::{ConnectionFactory, FactoryError};
use super::handle::ConnectionHandle;
use super::metrics::PoolMetrics;

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Creating a connection failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Starting the supervised process failed
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// The pool has been shut down
    #[error("Pool is shut down")]
    ShutDown,

    /// Pool bookkeeping is inconsistent
    #[error("Internal pool error: {0}")]
    Internal(String),
}

impl From<FactoryError> for PoolError {
    fn from(error: FactoryError) -> Self {
        match error {
            FactoryError::Connection(e) => Self::Connection(e),
            FactoryError::Supervisor(e) => Self::Supervisor(e),
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Proof that the allocation lock is held
pub(crate) type AllocationGuard<'a> = MutexGuard<'a, ()>;

// === Backoff ===

/// Exponential backoff calculator for repeated probe failures
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_attempt: 0,
        }
    }

    /// Returns `min(base * 2^attempt, max)` and advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.current_attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        self.current_attempt = self.current_attempt.saturating_add(1);

        std::cmp::min(delay, self.max)
    }

    pub const fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

// === Connection State ===

/// One pooled connection and how often it has been leased
pub struct ConnectionState {
    id: u64,
    connection: Arc<dyn Connection>,
    uses: u32,
}

impl ConnectionState {
    /// Pool-unique identifier
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Number of times this connection has been leased
    pub const fn uses(&self) -> u32 {
        self.uses
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn mark_used(&mut self) {
        self.uses = self.uses.saturating_add(1);
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("uses", &self.uses)
            .finish_non_exhaustive()
    }
}

// === Idle Queue ===

/// Capacity-bounded FIFO of idle states.
///
/// The semaphore holds one permit per queued entry, never more, so a task
/// that acquires a permit always finds an entry unless the queue was drained.
struct IdleQueue {
    entries: parking_lot::Mutex<VecDeque<ConnectionState>>,
    available: Semaphore,
    capacity: usize,
}

impl IdleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            capacity,
        }
    }

    /// Queue a state, handing it back if the queue is full
    fn offer(&self, state: ConnectionState) -> Result<(), ConnectionState> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(state);
        }
        entries.push_back(state);
        drop(entries);
        self.available.add_permits(1);
        Ok(())
    }

    /// Wait for the next idle state. Cancel safe.
    async fn take(&self) -> PoolResult<ConnectionState> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| PoolError::ShutDown)?;
        permit.forget();

        match self.entries.lock().pop_front() {
            Some(state) => Ok(state),
            None if self.available.is_closed() => Err(PoolError::ShutDown),
            None => Err(PoolError::Internal(
                "idle permit granted without an idle connection".to_string(),
            )),
        }
    }

    /// Stop handing out entries and return everything still queued
    fn close_and_drain(&self) -> Vec<ConnectionState> {
        self.available.close();
        self.entries.lock().drain(..).collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// === Pool Stats ===

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Maximum live connections
    pub capacity: usize,
    /// Connections allocated and not yet destroyed
    pub live: usize,
    /// Connections waiting in the idle queue
    pub idle: usize,
    /// Current reuse limit (`<= 0` is unlimited)
    pub reuse_count: i64,
}

// === Connection Pool ===

/// Bounded pool of connections to one office service
pub struct ConnectionPool {
    capacity: usize,
    factory: Arc<dyn ConnectionFactory>,
    idle: IdleQueue,

    /// Serialises allocate, release and destroy
    allocation: Mutex<()>,

    /// Live connections; changed only under the allocation lock, except by `abandon`
    count: AtomicUsize,

    reuse_count: AtomicI64,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    probe_backoff_base: Duration,
    probe_backoff_max: Duration,
    metrics: PoolMetrics,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity)
            .field("live", &self.count.load(Ordering::SeqCst))
            .field("idle", &self.idle.len())
            .field("reuse_count", &self.reuse_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool with default settings and the given capacity
    pub fn new(capacity: usize, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Self::with_settings(
            &PoolSettings {
                capacity,
                ..PoolSettings::default()
            },
            factory,
        )
    }

    /// Create a pool from settings. A capacity of zero is raised to one.
    pub fn with_settings(settings: &PoolSettings, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let capacity = settings.capacity.max(1);
        Arc::new(Self {
            capacity,
            factory,
            idle: IdleQueue::new(capacity),
            allocation: Mutex::new(()),
            count: AtomicUsize::new(0),
            reuse_count: AtomicI64::new(settings.reuse_count),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            probe_backoff_base: settings.probe_backoff_base,
            probe_backoff_max: settings.probe_backoff_max,
            metrics: PoolMetrics::new(),
        })
    }

    /// Maximum simultaneously live connections
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Uses allowed before a connection is destroyed; `<= 0` is unlimited
    pub fn reuse_count(&self) -> i64 {
        self.reuse_count.load(Ordering::SeqCst)
    }

    /// Change the reuse limit. Applies to connections as they are returned.
    pub fn set_reuse_count(&self, count: i64) {
        self.reuse_count.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            live: self.count.load(Ordering::SeqCst),
            idle: self.idle.len(),
            reuse_count: self.reuse_count(),
        }
    }

    pub const fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Lease a connection, waiting at most `timeout` for one to become idle.
    ///
    /// Returns `Ok(None)` on timeout. The timeout bounds only the wait; any
    /// allocation needed first runs to completion. The connection is not
    /// probed before it is handed out.
    pub async fn get_connection_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> PoolResult<Option<ConnectionHandle>> {
        self.allocate().await?;

        match tokio::time::timeout(timeout, self.idle.take()).await {
            Ok(state) => Ok(Some(ConnectionHandle::new(Arc::clone(self), state?))),
            Err(_) => {
                self.metrics.acquire_timed_out();
                debug!(timeout_ms = timeout.as_millis(), "Timed out waiting for a connection");
                Ok(None)
            }
        }
    }

    /// Lease a responsive connection, waiting as long as it takes.
    ///
    /// Idle connections failing the probe are destroyed and replaced; repeated
    /// failures back off exponentially. Not cancel safe once an idle
    /// connection has been taken: dropping the future then loses that slot.
    pub async fn get_connection(self: &Arc<Self>) -> PoolResult<ConnectionHandle> {
        let mut backoff = ExponentialBackoff::new(self.probe_backoff_base, self.probe_backoff_max);
        let mut failures = 0u32;

        loop {
            self.allocate().await?;
            let state = self.idle.take().await?;

            let guard = self.allocation.lock().await;
            if Self::is_responsive(&state).await {
                drop(guard);
                return Ok(ConnectionHandle::new(Arc::clone(self), state));
            }

            warn!(id = state.id, uses = state.uses, "Idle connection unresponsive, replacing it");
            self.metrics.probe_failed();
            self.destroy(&guard, state).await;
            drop(guard);

            failures = failures.saturating_add(1);
            if failures > 1 {
                let delay = backoff.next_delay();
                debug!(failures = failures, delay_ms = delay.as_millis(), "Backing off before next probe");
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Destroy all idle connections and refuse further leases.
    ///
    /// Leased connections are destroyed as they are returned.
    pub async fn shutdown(&self) {
        let guard = self.allocation.lock().await;
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let idle = self.idle.close_and_drain();
        info!(idle = idle.len(), live = self.count.load(Ordering::SeqCst), "Shutting down connection pool");
        for state in idle {
            self.destroy(&guard, state).await;
        }
    }

    /// Fill the pool up to capacity
    async fn allocate(&self) -> PoolResult<()> {
        let guard = self.allocation.lock().await;
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        while self.count.load(Ordering::SeqCst) < self.capacity {
            let state = self.create().await?;
            self.count.fetch_add(1, Ordering::SeqCst);

            if let Err(state) = self.idle.offer(state) {
                error!(id = state.id, "Idle queue rejected a new connection");
                self.destroy(&guard, state).await;
                break;
            }
        }

        Ok(())
    }

    /// Build one connection through the factory
    async fn create(&self) -> PoolResult<ConnectionState> {
        let connection: Arc<dyn Connection> = Arc::from(self.factory.create().await?);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let state = ConnectionState {
            id,
            connection,
            uses: 0,
        };
        Self::watch(&state);

        self.metrics.connection_created();
        debug!(id = id, "Connection created");
        Ok(state)
    }

    /// Install the pool's close listener, dropping any a lessee registered
    fn watch(state: &ConnectionState) {
        let id = state.id;
        state.connection.set_listener(Box::new(move || {
            debug!(id = id, "Pooled connection closed");
        }));
    }

    /// Close a state and give its slot back. Close failures are logged only.
    async fn destroy(&self, _guard: &AllocationGuard<'_>, state: ConnectionState) {
        let id = state.id;
        if let Err(e) = state.connection.close().await {
            warn!(id = id, error = %e, "Error closing connection");
        }

        self.count.fetch_sub(1, Ordering::SeqCst);
        self.metrics.connection_destroyed();
        debug!(id = id, uses = state.uses, "Connection destroyed");

        self.factory.on_destroy().await;
    }

    /// Take back a leased state: recycle it if healthy and under the reuse limit
    pub(crate) async fn release(&self, state: ConnectionState) {
        let guard = self.allocation.lock().await;

        if self.is_shut_down() {
            debug!(id = state.id, "Pool shut down, destroying returned connection");
            self.destroy(&guard, state).await;
            return;
        }

        let reuse = self.reuse_count();
        if reuse > 0 && i64::from(state.uses) >= reuse {
            debug!(id = state.id, uses = state.uses, limit = reuse, "Reuse limit reached");
            self.destroy(&guard, state).await;
            return;
        }

        if !Self::is_responsive(&state).await {
            warn!(id = state.id, "Returned connection unresponsive");
            self.metrics.probe_failed();
            self.destroy(&guard, state).await;
            return;
        }

        Self::watch(&state);
        match self.idle.offer(state) {
            Ok(()) => self.metrics.connection_recycled(),
            Err(state) => {
                error!(id = state.id, "Idle queue rejected a returned connection");
                self.destroy(&guard, state).await;
            }
        }
    }

    /// Give up on a state when no runtime is left to close it
    pub(crate) fn abandon(&self, state: ConnectionState) {
        warn!(id = state.id, "Abandoning connection without closing it");
        drop(state);
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.metrics.connection_destroyed();
    }

    async fn is_responsive(state: &ConnectionState) -> bool {
        match state.connection.loader().await {
            Ok(_) => true,
            Err(e) => {
                debug!(id = state.id, error = %e, "Loader probe failed");
                false
            }
        }
    }
}
