// ABOUTME: Connection factories used by the pool to build new connections
// ABOUTME: Direct transport connections, or connections to a supervised process started on demand

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::bootstrap::{BootstrapService, SupervisorError};
use super::connection::{Connection, ConnectionError};
use super::transport::{BridgeConnection, Endpoint};

/// Errors raised while creating a connection
#[derive(Error, Debug)]
pub enum FactoryError {
    /// Opening the transport failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Starting or reaching the supervised process failed
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Builds connections for a pool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create one new connection
    async fn create(&self) -> Result<Box<dyn Connection>, FactoryError>;

    /// Called after the pool destroyed one of this factory's connections
    async fn on_destroy(&self) {}
}

/// Opens connections straight to a known endpoint; no process management
#[derive(Debug, Clone)]
pub struct DirectFactory {
    endpoint: Endpoint,
    settle: Duration,
}

impl DirectFactory {
    pub fn new(endpoint: Endpoint, settle: Duration) -> Self {
        Self { endpoint, settle }
    }
}

#[async_trait]
impl ConnectionFactory for DirectFactory {
    async fn create(&self) -> Result<Box<dyn Connection>, FactoryError> {
        let connection = BridgeConnection::open_with_settle(&self.endpoint, self.settle).await?;
        Ok(Box::new(connection))
    }
}

/// Starts the supervised process when needed and connects to it.
///
/// A running process that refuses connections is stopped and started again.
///
/// With `restart_on_destroy` set, every destroyed connection stops the process
/// so the next allocation boots a fresh one.
pub struct BootstrapFactory {
    service: Arc<BootstrapService>,
    restart_on_destroy: bool,
}

impl BootstrapFactory {
    pub fn new(service: Arc<BootstrapService>) -> Self {
        Self {
            service,
            restart_on_destroy: false,
        }
    }

    /// Factory for a pool that restarts the process on every destroy
    pub fn restarting(service: Arc<BootstrapService>) -> Self {
        Self {
            service,
            restart_on_destroy: true,
        }
    }

    pub fn service(&self) -> &Arc<BootstrapService> {
        &self.service
    }
}

#[async_trait]
impl ConnectionFactory for BootstrapFactory {
    async fn create(&self) -> Result<Box<dyn Connection>, FactoryError> {
        if self.service.is_running() {
            match self.service.connection().await {
                Ok(connection) => return Ok(Box::new(connection)),
                Err(e) => {
                    warn!(error = %e, "Office process not answering, restarting it");
                    self.service.stop().await;
                }
            }
        }

        match self.service.start().await {
            Ok(endpoint) => debug!(endpoint = %endpoint, "Started office process for pool"),
            // Lost a race with another creator; the process is up either way
            Err(SupervisorError::AlreadyRunning(pid)) => {
                debug!(pid = pid, "Office process already running");
            }
            Err(e) => return Err(e.into()),
        }

        let connection = self.service.connection().await?;
        Ok(Box::new(connection))
    }

    async fn on_destroy(&self) {
        if self.restart_on_destroy {
            info!("Connection destroyed, stopping office process for restart");
            self.service.stop().await;
        }
    }
}
