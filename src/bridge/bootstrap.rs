// ABOUTME: Supervision of the external office process
//
// Starts the office binary with a fresh --accept= endpoint, drains its output
// into the log, polls the endpoint until the bridge answers, and stops it again
// with a terminate request falling back to a kill. The office runs in its own
// process group so a failed start never leaves a process behind, even when the
// launcher handed the endpoint off to a child of its own.

// Allow if-let/else patterns instead of map_or_else for readability
#![allow(clippy::option_if_let_else)]

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::config::ServiceSettings;
use super::connection::{Connection, ConnectionError};
use super::transport::{BridgeConnection, Endpoint, PIPE_DIR_ENV};

/// Errors raised while supervising the office process
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Process already running
    #[error("Process already running with PID {0}")]
    AlreadyRunning(u32),

    /// Process not running when expected
    #[error("Process not running")]
    NotRunning,

    /// Program could not be located on the search path
    #[error("Program not found: {}", .0.display())]
    ProgramNotFound(PathBuf),

    /// Process spawn failed
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The process started but the bridge failed in a way retrying cannot fix
    #[error("Process {pid} failed to start: {reason}")]
    ProcessStartFailed {
        /// PID of the killed process
        pid: u32,
        /// What went wrong
        reason: String,
    },

    /// The endpoint never accepted a connection within the retry budget
    #[error("Process {pid} not reachable at {endpoint} after {attempts} attempts")]
    ConnectFailed {
        /// Endpoint that was polled
        endpoint: String,
        /// Connection attempts made
        attempts: u32,
        /// PID of the killed process
        pid: u32,
    },

    /// The process exited and nothing listened within the retry budget
    #[error("Process {pid} exited during startup with code {code:?}")]
    ProcessExited {
        /// PID of the exited process
        pid: u32,
        /// Exit code, if it exited normally
        code: Option<i32>,
    },

    /// Connecting to a running process failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Lifecycle of the supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// No process
    Stopped,

    /// Process spawned, waiting for the bridge to listen
    Starting,

    /// Process up and accepting connections
    Running {
        /// Process ID
        pid: u32,
        /// Endpoint the process listens on
        endpoint: Endpoint,
    },
}

impl ServiceState {
    /// Returns true if the process is currently running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Spawned office process.
///
/// Dropping it before [`finish`](Self::finish) kills the whole process group,
/// covering a start or stop whose future was cancelled.
struct OfficeProcess {
    child: Child,
    pid: u32,
    finished: bool,
}

impl OfficeProcess {
    fn new(child: Child) -> Self {
        let pid = child.id().unwrap_or(0);
        Self {
            child,
            pid,
            finished: false,
        }
    }

    /// Exit status if the launched process itself has exited
    fn exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kill the process group and reap the launched process
    async fn kill(&mut self) {
        kill_group(self.pid);
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.child.kill().await {
                    warn!(pid = self.pid, error = %e, "Failed to kill office process");
                }
            }
        }
        self.finished = true;
    }

    /// Mark the process as gone so dropping it signals nothing
    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for OfficeProcess {
    fn drop(&mut self) {
        if !self.finished {
            kill_group(self.pid);
        }
    }
}

/// Running office process and the endpoint it was started with
struct ProcessHandle {
    process: OfficeProcess,
    endpoint: Endpoint,
}

/// Resets a `Starting` state to `Stopped` unless the start completed
struct StartingGuard<'a> {
    state: &'a SyncMutex<ServiceState>,
    armed: bool,
}

impl<'a> StartingGuard<'a> {
    fn new(state: &'a SyncMutex<ServiceState>) -> Self {
        *state.lock() = ServiceState::Starting;
        Self { state, armed: true }
    }

    fn running(mut self, pid: u32, endpoint: Endpoint) {
        *self.state.lock() = ServiceState::Running { pid, endpoint };
        self.armed = false;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = ServiceState::Stopped;
        }
    }
}

/// Supervisor for one office process at a time
pub struct BootstrapService {
    settings: ServiceSettings,

    /// Held across start and stop so they never interleave
    process: Mutex<Option<ProcessHandle>>,

    state: SyncMutex<ServiceState>,
}

impl BootstrapService {
    /// Create a supervisor; nothing is started until [`start`](Self::start)
    pub fn new(settings: ServiceSettings) -> Self {
        Self {
            settings,
            process: Mutex::new(None),
            state: SyncMutex::new(ServiceState::Stopped),
        }
    }

    /// Settings this supervisor was created with
    pub const fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        self.state.lock().clone()
    }

    /// True iff a process is held
    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }

    /// Endpoint of the running process
    pub fn endpoint(&self) -> Option<Endpoint> {
        match &*self.state.lock() {
            ServiceState::Running { endpoint, .. } => Some(endpoint.clone()),
            _ => None,
        }
    }

    /// Start the process and wait until it accepts connections.
    ///
    /// Returns the endpoint the process listens on.
    pub async fn start(&self) -> Result<Endpoint, SupervisorError> {
        let mut process = self.process.lock().await;
        if let Some(handle) = process.as_ref() {
            return Err(SupervisorError::AlreadyRunning(handle.process.pid));
        }

        let starting = StartingGuard::new(&self.state);
        let handle = self.launch().await?;

        let pid = handle.process.pid;
        let endpoint = handle.endpoint.clone();
        info!(pid = pid, endpoint = %endpoint, "Office process ready");
        starting.running(pid, endpoint.clone());
        *process = Some(handle);
        Ok(endpoint)
    }

    async fn launch(&self) -> Result<ProcessHandle, SupervisorError> {
        let program = resolve_program(&self.settings.program())?;
        let endpoint = self.settings.next_endpoint();
        let args = self.settings.command_args(&endpoint);

        debug!(program = %program.display(), args = ?args, "Spawning office process");

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Endpoint::Pipe { dir, .. } = &endpoint {
            command.env(PIPE_DIR_ENV, dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut process = OfficeProcess::new(command.spawn().map_err(SupervisorError::SpawnFailed)?);
        let pid = process.pid;
        info!(pid = pid, program = %program.display(), endpoint = %endpoint, "Office process spawned");

        if let Some(stdout) = process.child.stdout.take() {
            tokio::spawn(drain_output(stdout, pid, "CO>"));
        }
        if let Some(stderr) = process.child.stderr.take() {
            tokio::spawn(drain_output(stderr, pid, "CE>"));
        }

        match self.wait_until_listening(&mut process, &endpoint).await {
            Ok(()) => Ok(ProcessHandle { process, endpoint }),
            Err(e) => {
                error!(pid = pid, error = %e, "Office process failed to start, killing it");
                process.kill().await;
                Err(e)
            }
        }
    }

    /// Poll the endpoint until it accepts a connection.
    ///
    /// The launched process exiting does not end the wait: office launchers
    /// may hand the endpoint to a child process and exit.
    async fn wait_until_listening(
        &self,
        process: &mut OfficeProcess,
        endpoint: &Endpoint,
    ) -> Result<(), SupervisorError> {
        let pid = process.pid;
        let retries = self.settings.connect_retries;
        let mut attempts = 0u32;
        let mut exited: Option<ExitStatus> = None;

        loop {
            attempts = attempts.saturating_add(1);
            match BridgeConnection::open_with_settle(endpoint, self.settings.settle_delay(endpoint))
                .await
            {
                Ok(connection) => {
                    if let Err(e) = connection.close().await {
                        debug!(error = %e, "Error closing readiness probe connection");
                    }
                    debug!(pid = pid, attempts = attempts, "Office process accepting connections");
                    return Ok(());
                }
                Err(e) if e.is_not_listening() => {
                    if exited.is_none() {
                        match process.exit_status() {
                            Ok(Some(status)) => {
                                info!(
                                    pid = pid,
                                    code = ?status.code(),
                                    "Office launcher exited, still waiting for the endpoint"
                                );
                                exited = Some(status);
                            }
                            Ok(None) => {}
                            Err(wait_error) => {
                                debug!(pid = pid, error = %wait_error, "Status check failed");
                            }
                        }
                    }

                    if retries > 0 && attempts >= retries {
                        return Err(match exited {
                            Some(status) => SupervisorError::ProcessExited {
                                pid,
                                code: status.code(),
                            },
                            None => SupervisorError::ConnectFailed {
                                endpoint: endpoint.to_string(),
                                attempts,
                                pid,
                            },
                        });
                    }

                    debug!(
                        pid = pid,
                        attempt = attempts,
                        delay_ms = self.settings.retry_interval.as_millis(),
                        "Office process not listening yet"
                    );
                    tokio::time::sleep(self.settings.retry_interval).await;
                }
                Err(e) => {
                    return Err(SupervisorError::ProcessStartFailed {
                        pid,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Stop the process if running.
    ///
    /// Asks the office to terminate, waits up to `terminate_wait`, then kills
    /// it. Failures are logged; the process handle is always cleared.
    pub async fn stop(&self) {
        let mut process = self.process.lock().await;
        let Some(mut handle) = process.take() else {
            debug!("Stop requested but no office process is running");
            return;
        };
        *self.state.lock() = ServiceState::Stopped;

        let pid = handle.process.pid;
        info!(pid = pid, "Stopping office process");

        let exited = match self.request_terminate(&handle.endpoint).await {
            Ok(true) => {
                match tokio::time::timeout(self.settings.terminate_wait, handle.process.child.wait())
                    .await
                {
                    Ok(Ok(status)) => {
                        debug!(pid = pid, code = ?status.code(), "Office process terminated gracefully");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(pid = pid, error = %e, "Error waiting for office process");
                        false
                    }
                    Err(_) => {
                        warn!(pid = pid, "Office process did not exit in time");
                        false
                    }
                }
            }
            Ok(false) => {
                warn!(pid = pid, "Office refused to terminate");
                false
            }
            Err(e) => {
                warn!(pid = pid, error = %e, "Graceful terminate failed");
                false
            }
        };

        if exited {
            handle.process.finish();
        } else {
            warn!(pid = pid, "Killing office process");
            handle.process.kill().await;
        }
        info!(pid = pid, "Office process stopped");
    }

    async fn request_terminate(&self, endpoint: &Endpoint) -> Result<bool, ConnectionError> {
        let connection =
            BridgeConnection::open_with_settle(endpoint, self.settings.settle_delay(endpoint))
                .await?;
        let terminated = connection.terminate().await;
        if let Err(e) = connection.close().await {
            debug!(error = %e, "Error closing terminate connection");
        }
        terminated
    }

    /// Stop then start again, on a fresh endpoint
    pub async fn restart(&self) -> Result<Endpoint, SupervisorError> {
        self.stop().await;
        self.start().await
    }

    /// Open a new connection to the running process
    pub async fn connection(&self) -> Result<BridgeConnection, SupervisorError> {
        let endpoint = self.endpoint().ok_or(SupervisorError::NotRunning)?;
        let settle = self.settings.settle_delay(&endpoint);
        Ok(BridgeConnection::open_with_settle(&endpoint, settle).await?)
    }

    /// True when running and a fresh connection answers the loader probe
    pub async fn is_active(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        match self.connection().await {
            Ok(connection) => {
                let active = connection.loader().await.is_ok();
                if let Err(e) = connection.close().await {
                    debug!(error = %e, "Error closing activity probe connection");
                }
                active
            }
            Err(e) => {
                debug!(error = %e, "Activity probe could not connect");
                false
            }
        }
    }
}

/// Bare program names are looked up on the search path; anything with a
/// directory component is used as given.
fn resolve_program(program: &Path) -> Result<PathBuf, SupervisorError> {
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }
    which::which(program).map_err(|_| SupervisorError::ProgramNotFound(program.to_path_buf()))
}

/// SIGKILL every process in the group led by `pid`
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    if pgid <= 0 {
        return;
    }
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = pid, error = %e, "Failed to kill office process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn drain_output<R>(stream: R, pid: u32, prefix: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(pid = pid, "{prefix} {line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(pid = pid, error = %e, "Output stream failed");
                break;
            }
        }
    }
}
