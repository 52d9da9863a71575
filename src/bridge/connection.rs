// ABOUTME: Capability surface of a live channel to the office service
// ABOUTME: Connection trait, the remote objects it hands out, and its error type

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use super::protocol::{ObjectRef, RpcError};

/// Callback fired once when a connection closes, locally or because the peer went away
pub type CloseListener = Box<dyn Fn() + Send + Sync>;

/// Errors raised by a connection or while establishing one
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Could not reach the endpoint
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        /// Endpoint that was dialled
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The service refused to hand out the named object
    #[error("Service '{name}' unavailable: {message}")]
    ServiceUnavailable {
        /// Requested service name
        name: String,
        /// Reason given by the remote side
        message: String,
    },

    /// Any other error reported by the remote side
    #[error(transparent)]
    Remote(#[from] RpcError),

    /// The peer sent something that is not a valid protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The channel (or the lease wrapping it) has been closed
    #[error("Connection closed")]
    Closed,

    /// Transport not available on this platform
    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    /// I/O failure on an established channel
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// True when the endpoint is not accepting connections yet.
    ///
    /// A freshly spawned service needs a while before it listens; this is
    /// the condition the bootstrap loop keeps retrying on.
    pub fn is_not_listening(&self) -> bool {
        match self {
            Self::ConnectFailed { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }
}

/// A service object resolved by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceObject {
    /// Name the object was requested under
    pub name: String,
    /// Remote reference
    pub reference: ObjectRef,
}

/// The component loader used to open documents in the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loader {
    /// Remote reference
    pub reference: ObjectRef,
}

/// One live channel to the office service.
///
/// Implemented by the pipe/socket transport and by the pool's lease handle,
/// which delegates to the pooled transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Resolve a service object by name
    async fn service(&self, name: &str) -> Result<ServiceObject, ConnectionError>;

    /// Resolve the component loader. Also used as the responsiveness probe.
    async fn loader(&self) -> Result<Loader, ConnectionError>;

    /// Register a callback fired when the channel closes. Replaces any previous listener.
    fn set_listener(&self, listener: CloseListener);

    /// Close the channel. Closing an already closed channel is a no-op.
    async fn close(&self) -> Result<(), ConnectionError>;
}
