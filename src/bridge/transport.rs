// ABOUTME: Pipe and socket transports for the office bridge
// ABOUTME: Endpoint addressing, --accept argument parsing, and the JSON-RPC client connection

//! Transports.
//!
//! Both transports speak the same newline-delimited JSON-RPC once connected;
//! they only differ in how the endpoint is located:
//!
//! - `pipe,name=uno<n>` maps to a Unix domain socket named `<n>` inside a pipe
//!   directory shared with the spawned service
//! - `socket,host=<h>,port=<p>` is a plain TCP connection
//!
//! The socket transport waits a short settle delay after closing so that a
//! service restarted right away does not trip over the half-closed socket.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::{CloseListener, Connection, ConnectionError, Loader, ServiceObject};
use super::protocol::{
    encode_line, ObjectRef, Request, Response, DESKTOP_SERVICE, ERROR_SERVICE_UNAVAILABLE,
    METHOD_INITIALIZE, METHOD_LOADER, METHOD_SERVICE, METHOD_TERMINATE,
};

/// Environment variable telling a spawned service where pipe endpoints live
pub const PIPE_DIR_ENV: &str = "OFFICE_BRIDGE_PIPE_DIR";

/// Default port for the socket transport
pub const DEFAULT_PORT: u16 = 8100;

/// Default host for the socket transport
pub const DEFAULT_HOST: &str = "localhost";

/// Default settle delay applied after closing a socket connection
pub const DEFAULT_SOCKET_SETTLE: Duration = Duration::from_millis(100);

/// Where a service listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Named pipe, realised as a Unix domain socket in `dir`
    Pipe {
        /// Pipe name, `uno<n>` for generated endpoints
        name: String,
        /// Directory holding the socket file
        dir: PathBuf,
    },
    /// TCP socket
    Socket {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl Endpoint {
    /// Create a pipe endpoint with a fresh random name.
    ///
    /// Names are `uno` followed by a non-negative 63-bit integer so repeated
    /// starts never collide with a socket left behind by a previous process.
    pub fn random_pipe(dir: impl Into<PathBuf>) -> Self {
        let suffix = rand::random::<u64>() >> 1;
        Self::Pipe {
            name: format!("uno{suffix}"),
            dir: dir.into(),
        }
    }

    /// Connection parameters as they appear in `--accept=` and `uno:` URLs
    pub fn parameters(&self) -> String {
        match self {
            Self::Pipe { name, .. } => format!("pipe,name={name}"),
            Self::Socket { host, port } => format!("socket,host={host},port={port}"),
        }
    }

    /// The `--accept=` command-line argument for this endpoint
    pub fn accept_arg(&self) -> String {
        format!("--accept={};urp;", self.parameters())
    }

    /// Socket file backing a pipe endpoint
    pub fn pipe_path(&self) -> Option<PathBuf> {
        match self {
            Self::Pipe { name, dir } => Some(dir.join(name)),
            Self::Socket { .. } => None,
        }
    }

    /// Parse an `--accept=` value (with or without the flag prefix).
    ///
    /// `pipe_dir` supplies the directory for pipe endpoints since the pipe
    /// name alone does not carry it.
    pub fn parse_accept(value: &str, pipe_dir: &Path) -> Result<Self, ConnectionError> {
        let value = value.strip_prefix("--accept=").unwrap_or(value);
        let connection = value.split(';').next().unwrap_or_default();
        let mut parts = connection.split(',');
        let kind = parts.next().unwrap_or_default().trim();

        let mut name = None;
        let mut host = None;
        let mut port = None;
        for part in parts {
            let Some((key, val)) = part.split_once('=') else {
                return Err(ConnectionError::Protocol(format!(
                    "malformed accept parameter '{part}'"
                )));
            };
            match key.trim() {
                "name" => name = Some(val.trim().to_string()),
                "host" => host = Some(val.trim().to_string()),
                "port" => {
                    let parsed = val.trim().parse::<u16>().map_err(|e| {
                        ConnectionError::Protocol(format!("invalid port '{val}': {e}"))
                    })?;
                    port = Some(parsed);
                }
                other => debug!(key = other, "Ignoring unknown accept parameter"),
            }
        }

        match kind {
            "pipe" => {
                let name = name.filter(|n| !n.is_empty()).ok_or_else(|| {
                    ConnectionError::Protocol("pipe endpoint without a name".to_string())
                })?;
                Ok(Self::Pipe {
                    name,
                    dir: pipe_dir.to_path_buf(),
                })
            }
            "socket" => Ok(Self::Socket {
                host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: port.unwrap_or(DEFAULT_PORT),
            }),
            other => Err(ConnectionError::Unsupported(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe { name, .. } => write!(f, "pipe:{name}"),
            Self::Socket { host, port } => write!(f, "socket:{host}:{port}"),
        }
    }
}

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read and write halves of an open stream
struct Channel {
    reader: BoxedReader,
    writer: BoxedWriter,
}

/// JSON-RPC client connection over a pipe or socket endpoint
pub struct BridgeConnection {
    endpoint: Endpoint,
    channel: Mutex<Option<Channel>>,
    next_id: AtomicU64,
    listener: parking_lot::Mutex<Option<CloseListener>>,
    settle: Duration,
}

impl fmt::Debug for BridgeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConnection")
            .field("endpoint", &self.endpoint)
            .field("settle", &self.settle)
            .finish_non_exhaustive()
    }
}

impl BridgeConnection {
    /// Connect using the transport's default settle delay
    pub async fn open(endpoint: &Endpoint) -> Result<Self, ConnectionError> {
        let settle = match endpoint {
            Endpoint::Pipe { .. } => Duration::ZERO,
            Endpoint::Socket { .. } => DEFAULT_SOCKET_SETTLE,
        };
        Self::open_with_settle(endpoint, settle).await
    }

    /// Connect and perform the handshake.
    ///
    /// `settle` is slept after `close()`; the pipe transport ignores it.
    pub async fn open_with_settle(
        endpoint: &Endpoint,
        settle: Duration,
    ) -> Result<Self, ConnectionError> {
        let channel = Self::dial(endpoint).await?;
        let settle = match endpoint {
            Endpoint::Pipe { .. } => Duration::ZERO,
            Endpoint::Socket { .. } => settle,
        };

        let connection = Self {
            endpoint: endpoint.clone(),
            channel: Mutex::new(Some(channel)),
            next_id: AtomicU64::new(1),
            listener: parking_lot::Mutex::new(None),
            settle,
        };

        connection.call(METHOD_INITIALIZE, Value::Null).await?;
        debug!(endpoint = %connection.endpoint, "Bridge connection established");
        Ok(connection)
    }

    async fn dial(endpoint: &Endpoint) -> Result<Channel, ConnectionError> {
        let connect_failed = |source| ConnectionError::ConnectFailed {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Socket { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(connect_failed)?;
                stream.set_nodelay(true)?;
                let (read_half, write_half) = tokio::io::split(stream);
                Ok(Channel {
                    reader: BufReader::new(Box::new(read_half)),
                    writer: Box::new(write_half),
                })
            }
            #[cfg(unix)]
            Endpoint::Pipe { name, dir } => {
                let stream = tokio::net::UnixStream::connect(dir.join(name))
                    .await
                    .map_err(connect_failed)?;
                let (read_half, write_half) = tokio::io::split(stream);
                Ok(Channel {
                    reader: BufReader::new(Box::new(read_half)),
                    writer: Box::new(write_half),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Pipe { .. } => Err(ConnectionError::Unsupported(
                "pipe transport requires Unix domain sockets".to_string(),
            )),
        }
    }

    /// The endpoint this connection was opened against
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Ask the service to close its documents and terminate.
    ///
    /// Returns whether the remote desktop agreed to terminate.
    pub async fn terminate(&self) -> Result<bool, ConnectionError> {
        let desktop = self.service(DESKTOP_SERVICE).await?;
        let result = self
            .call(
                METHOD_TERMINATE,
                json!({ "object": desktop.reference.object, "close_documents": true }),
            )
            .await?;
        Ok(result
            .get("terminated")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Send one request and wait for its response.
    ///
    /// Any transport failure closes the channel and fires the close listener.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ConnectionError> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or(ConnectionError::Closed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_line(&Request::new(id, method, params))
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;

        match Self::exchange(channel, &line).await {
            Ok(response) => {
                if response.id.is_some_and(|rid| rid != id) {
                    return Err(ConnectionError::Protocol(format!(
                        "response id {:?} does not match request id {id}",
                        response.id
                    )));
                }
                Ok(response.into_result()?)
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, method = method, error = %e, "Bridge channel failed");
                *guard = None;
                drop(guard);
                self.notify_closed();
                Err(e)
            }
        }
    }

    async fn exchange(channel: &mut Channel, line: &str) -> Result<Response, ConnectionError> {
        channel.writer.write_all(line.as_bytes()).await?;
        channel.writer.flush().await?;

        let mut reply = String::new();
        let read = channel.reader.read_line(&mut reply).await?;
        if read == 0 {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "service closed the channel",
            )));
        }

        serde_json::from_str(reply.trim())
            .map_err(|e| ConnectionError::Protocol(format!("invalid response: {e}")))
    }

    fn notify_closed(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn object_ref(value: Value) -> Result<ObjectRef, ConnectionError> {
        serde_json::from_value(value)
            .map_err(|e| ConnectionError::Protocol(format!("invalid object reference: {e}")))
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn service(&self, name: &str) -> Result<ServiceObject, ConnectionError> {
        let result = self
            .call(METHOD_SERVICE, json!({ "name": name }))
            .await
            .map_err(|e| match e {
                ConnectionError::Remote(rpc) if rpc.code == ERROR_SERVICE_UNAVAILABLE => {
                    ConnectionError::ServiceUnavailable {
                        name: name.to_string(),
                        message: rpc.message,
                    }
                }
                other => other,
            })?;

        Ok(ServiceObject {
            name: name.to_string(),
            reference: Self::object_ref(result)?,
        })
    }

    async fn loader(&self) -> Result<Loader, ConnectionError> {
        let result = self.call(METHOD_LOADER, Value::Null).await?;
        Ok(Loader {
            reference: Self::object_ref(result)?,
        })
    }

    fn set_listener(&self, listener: CloseListener) {
        *self.listener.lock() = Some(listener);
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let channel = self.channel.lock().await.take();
        let Some(mut channel) = channel else {
            return Ok(());
        };

        let shutdown = channel.writer.shutdown().await;
        drop(channel);
        self.notify_closed();

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        debug!(endpoint = %self.endpoint, "Bridge connection closed");
        shutdown.map_err(ConnectionError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ==================== Endpoint Tests ====================

    #[test]
    fn test_random_pipe_name_format() {
        let endpoint = Endpoint::random_pipe("/tmp");
        let Endpoint::Pipe { name, dir } = &endpoint else {
            panic!("expected pipe endpoint");
        };

        assert_eq!(dir, &PathBuf::from("/tmp"));
        let digits = name.strip_prefix("uno").expect("uno prefix");
        let value: i64 = digits.parse().expect("63-bit integer suffix");
        assert!(value >= 0);
    }

    #[test]
    fn test_random_pipe_names_differ() {
        let first = Endpoint::random_pipe("/tmp");
        let second = Endpoint::random_pipe("/tmp");
        assert_ne!(first, second);
    }

    #[test]
    fn test_accept_arg() {
        let pipe = Endpoint::Pipe {
            name: "uno42".to_string(),
            dir: PathBuf::from("/tmp"),
        };
        let socket = Endpoint::Socket {
            host: "localhost".to_string(),
            port: 8100,
        };

        assert_eq!(pipe.accept_arg(), "--accept=pipe,name=uno42;urp;");
        assert_eq!(
            socket.accept_arg(),
            "--accept=socket,host=localhost,port=8100;urp;"
        );
    }

    #[test]
    fn test_parse_accept_round_trips_generated_args() {
        let dir = PathBuf::from("/var/run/office");
        let pipe = Endpoint::random_pipe(&dir);
        let socket = Endpoint::Socket {
            host: "127.0.0.1".to_string(),
            port: 2002,
        };

        assert_eq!(Endpoint::parse_accept(&pipe.accept_arg(), &dir).unwrap(), pipe);
        assert_eq!(
            Endpoint::parse_accept(&socket.accept_arg(), &dir).unwrap(),
            socket
        );
    }

    #[test]
    fn test_parse_accept_socket_defaults() {
        let endpoint = Endpoint::parse_accept("socket;urp;", Path::new("/tmp")).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Socket {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            }
        );
    }

    #[test]
    fn test_parse_accept_rejects_bad_input() {
        let dir = Path::new("/tmp");
        assert!(matches!(
            Endpoint::parse_accept("pipe;urp;", dir),
            Err(ConnectionError::Protocol(_))
        ));
        assert!(matches!(
            Endpoint::parse_accept("socket,port=huge;urp;", dir),
            Err(ConnectionError::Protocol(_))
        ));
        assert!(matches!(
            Endpoint::parse_accept("carrier-pigeon,name=x;urp;", dir),
            Err(ConnectionError::Unsupported(_))
        ));
    }

    #[test]
    fn test_endpoint_display() {
        let pipe = Endpoint::Pipe {
            name: "uno7".to_string(),
            dir: PathBuf::from("/tmp"),
        };
        assert_eq!(pipe.to_string(), "pipe:uno7");
        assert_eq!(pipe.pipe_path(), Some(PathBuf::from("/tmp/uno7")));
    }

    // ==================== Connection Tests ====================

    #[tokio::test]
    async fn test_open_refused_is_not_listening() {
        // Bind then drop to find a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::Socket {
            host: "127.0.0.1".to_string(),
            port,
        };
        let err = BridgeConnection::open(&endpoint).await.unwrap_err();
        assert!(err.is_not_listening(), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_missing_pipe_is_not_listening() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = Endpoint::random_pipe(dir.path());

        let err = BridgeConnection::open(&endpoint).await.unwrap_err();
        assert!(err.is_not_listening(), "unexpected error: {err}");
    }
}
