// ABOUTME: Office bridge: pooled, supervised connections to a headless office service
//
// The office process is slow to start and prone to leaks and hangs, so callers
// share a few connections through a bounded pool instead of opening their own.
//
// Key components:
// - connection: capability trait for one live channel
// - protocol/transport: newline-delimited JSON-RPC over a pipe or a TCP socket
// - bootstrap: starts, watches and stops the office process
// - factory: how the pool builds connections (direct, or via bootstrap)
// - pool/handle: bounded leasing with probes, reuse limits and leak reporting
// - stub: protocol server standing in for the office suite

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod factory;
pub mod handle;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod stub;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenient access
pub use bootstrap::{BootstrapService, ServiceState, SupervisorError};
pub use config::{BridgeConfig, ConfigError, PoolSettings, ServiceSettings, TransportSettings};
pub use connection::{CloseListener, Connection, ConnectionError, Loader, ServiceObject};
pub use factory::{BootstrapFactory, ConnectionFactory, DirectFactory, FactoryError};
pub use handle::ConnectionHandle;
pub use pool::{ConnectionPool, PoolError, PoolResult, PoolStats};
pub use transport::{BridgeConnection, Endpoint};
