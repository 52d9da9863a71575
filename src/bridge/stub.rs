// ABOUTME: Minimal bridge protocol server standing in for the office suite
//
// Listens on the endpoint named by an --accept= argument and answers the
// initialize/service/loader/terminate methods. Used by the office-bridge-stub
// binary to exercise the pool and the supervisor without a real office install.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::protocol::{
    encode_line, Request, Response, ERROR_INVALID_REQUEST, ERROR_METHOD_NOT_FOUND,
    ERROR_SERVICE_UNAVAILABLE, LOADER_INTERFACE, METHOD_INITIALIZE, METHOD_LOADER, METHOD_SERVICE,
    METHOD_TERMINATE,
};
use super::transport::Endpoint;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Listening socket for either transport
enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Per-process object table; ids only need to be unique within one stub run
#[derive(Debug, Default)]
pub struct ObjectTable {
    next: AtomicU64,
}

impl ObjectTable {
    fn reference(&self, interface: &str) -> Value {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        json!({ "object": format!("obj#{id}"), "interface": interface })
    }
}

/// Answer one request.
///
/// Returns the response and whether the service should shut down afterwards.
pub fn handle_request(objects: &ObjectTable, request: &Request) -> (Response, bool) {
    let id = request.id;
    match request.method.as_str() {
        METHOD_INITIALIZE => (
            Response::success(id, json!({ "protocol": "urp", "server": "office-bridge-stub" })),
            false,
        ),
        METHOD_SERVICE => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if name.is_empty() {
                (
                    Response::failure(Some(id), ERROR_SERVICE_UNAVAILABLE, "empty service name"),
                    false,
                )
            } else {
                (Response::success(id, objects.reference(name)), false)
            }
        }
        METHOD_LOADER => (Response::success(id, objects.reference(LOADER_INTERFACE)), false),
        METHOD_TERMINATE => (Response::success(id, json!({ "terminated": true })), true),
        other => (
            Response::failure(
                Some(id),
                ERROR_METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            ),
            false,
        ),
    }
}

/// Stub office service bound to one endpoint
pub struct StubService {
    endpoint: Endpoint,
    listen_delay: Duration,
    objects: Arc<ObjectTable>,
    shutdown: Arc<Notify>,
}

impl StubService {
    /// Create a stub for `endpoint`, listening only after `listen_delay`
    pub fn new(endpoint: Endpoint, listen_delay: Duration) -> Self {
        Self {
            endpoint,
            listen_delay,
            objects: Arc::new(ObjectTable::default()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Serve until a client calls terminate
    pub async fn serve(self) -> std::io::Result<()> {
        if !self.listen_delay.is_zero() {
            debug!(delay_ms = self.listen_delay.as_millis(), "Delaying listen");
            tokio::time::sleep(self.listen_delay).await;
        }

        let listener = self.bind().await?;
        info!(endpoint = %self.endpoint, "Stub service listening");

        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    info!(endpoint = %self.endpoint, "Terminate requested, shutting down");
                    break;
                }
                accepted = Self::accept(&listener) => {
                    match accepted {
                        Ok((reader, writer)) => {
                            let objects = Arc::clone(&self.objects);
                            let shutdown = Arc::clone(&self.shutdown);
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_client(reader, writer, objects, shutdown).await
                                {
                                    warn!(error = %e, "Client handler error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Accept error"),
                    }
                }
            }
        }

        drop(listener);
        Ok(())
    }

    async fn bind(&self) -> std::io::Result<Listener> {
        match &self.endpoint {
            Endpoint::Socket { host, port } => {
                Ok(Listener::Tcp(TcpListener::bind((host.as_str(), *port)).await?))
            }
            #[cfg(unix)]
            Endpoint::Pipe { name, dir } => {
                let path = dir.join(name);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = tokio::net::UnixListener::bind(&path)?;
                Ok(Listener::Unix { listener, path })
            }
            #[cfg(not(unix))]
            Endpoint::Pipe { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "pipe transport requires Unix domain sockets",
            )),
        }
    }

    async fn accept(listener: &Listener) -> std::io::Result<(BoxedReader, BoxedWriter)> {
        match listener {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                debug!(peer = %addr, "New client connection");
                let (read_half, write_half) = stream.into_split();
                Ok((Box::new(read_half), Box::new(write_half)))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                debug!("New client connection");
                let (read_half, write_half) = stream.into_split();
                Ok((Box::new(read_half), Box::new(write_half)))
            }
        }
    }

    async fn handle_client(
        reader: BoxedReader,
        mut writer: BoxedWriter,
        objects: Arc<ObjectTable>,
        shutdown: Arc<Notify>,
    ) -> std::io::Result<()> {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                debug!("Client disconnected");
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let (response, terminate) = match serde_json::from_str::<Request>(trimmed) {
                Ok(request) => handle_request(&objects, &request),
                Err(e) => (
                    Response::failure(None, ERROR_INVALID_REQUEST, format!("invalid request: {e}")),
                    false,
                ),
            };

            let encoded = encode_line(&response).map_err(std::io::Error::other)?;
            writer.write_all(encoded.as_bytes()).await?;
            writer.flush().await?;

            if terminate {
                shutdown.notify_one();
                return Ok(());
            }
        }
    }
}
