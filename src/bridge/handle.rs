// ABOUTME: Leased connection handed out by the pool
//
// A ConnectionHandle delegates every call to the pooled connection and returns
// it to the pool on close. Dropping a handle without closing it still returns
// the connection, and reports the leak with the thread and backtrace that
// acquired it.

use std::backtrace::Backtrace;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use super::connection::{CloseListener, Connection, ConnectionError, Loader, ServiceObject};
use super::pool::{ConnectionPool, ConnectionState};

/// Single-use lease on a pooled connection
pub struct ConnectionHandle {
    pool: Arc<ConnectionPool>,
    state: Mutex<Option<ConnectionState>>,
    acquired_by: String,
    acquired_at: Backtrace,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &*self.state.lock())
            .field("acquired_by", &self.acquired_by)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(pool: Arc<ConnectionPool>, mut state: ConnectionState) -> Self {
        state.mark_used();
        let thread = std::thread::current();
        let acquired_by = format!(
            "{} ({:?})",
            thread.name().unwrap_or("<unnamed>"),
            thread.id()
        );

        Self {
            pool,
            state: Mutex::new(Some(state)),
            acquired_by,
            acquired_at: Backtrace::force_capture(),
        }
    }

    /// Id of the leased connection, `None` once closed
    pub fn id(&self) -> Option<u64> {
        self.state.lock().as_ref().map(ConnectionState::id)
    }

    /// Leases of the underlying connection including this one; 0 once closed
    pub fn uses(&self) -> u32 {
        self.state.lock().as_ref().map_or(0, ConnectionState::uses)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Thread that acquired this handle
    pub fn acquired_by(&self) -> &str {
        &self.acquired_by
    }

    fn connection(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.state
            .lock()
            .as_ref()
            .map(|state| Arc::clone(state.connection()))
            .ok_or(ConnectionError::Closed)
    }
}

#[async_trait]
impl Connection for ConnectionHandle {
    async fn service(&self, name: &str) -> Result<ServiceObject, ConnectionError> {
        self.connection()?.service(name).await
    }

    async fn loader(&self) -> Result<Loader, ConnectionError> {
        self.connection()?.loader().await
    }

    fn set_listener(&self, listener: CloseListener) {
        match self.connection() {
            Ok(connection) => connection.set_listener(listener),
            Err(_) => warn!("Listener registered on a closed connection handle"),
        }
    }

    /// Return the connection to the pool. Closing twice is a no-op.
    async fn close(&self) -> Result<(), ConnectionError> {
        let Some(state) = self.state.lock().take() else {
            return Ok(());
        };

        // Released on its own task so a cancelled close still returns the slot
        let release = PendingRelease::new(Arc::clone(&self.pool), state);
        if let Err(e) = tokio::spawn(release.run()).await {
            error!(error = %e, "Connection release task failed");
        }
        Ok(())
    }
}

/// A state on its way back to the pool.
///
/// If the task carrying it is dropped before it runs, as happens when the
/// runtime is shutting down, the state is abandoned so its slot is freed.
struct PendingRelease {
    pool: Arc<ConnectionPool>,
    state: Option<ConnectionState>,
}

impl PendingRelease {
    fn new(pool: Arc<ConnectionPool>, state: ConnectionState) -> Self {
        Self {
            pool,
            state: Some(state),
        }
    }

    async fn run(mut self) {
        if let Some(state) = self.state.take() {
            self.pool.release(state).await;
        }
    }
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.abandon(state);
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(state) = self.state.get_mut().take() else {
            return;
        };

        self.pool.metrics().handle_leaked();
        warn!(
            id = state.id(),
            acquired_by = %self.acquired_by,
            backtrace = %self.acquired_at,
            "Connection handle dropped without close, releasing it"
        );

        let release = PendingRelease::new(Arc::clone(&self.pool), state);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release.run());
            }
            Err(_) => drop(release),
        }
    }
}
