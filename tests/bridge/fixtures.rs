// ABOUTME: Shared fixtures for bridge integration tests
//
// Provides:
// - StubDir: temporary pipe directory plus supervisor settings for the stub binary
// - free_port(): a TCP port nobody is listening on
// - process_alive(): whether a PID still exists
// - wait_for_exit(): poll until a PID is gone

use office_bridge::bridge::{ServiceSettings, TransportSettings};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Path of the stub office binary built alongside the tests
pub fn stub_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_office-bridge-stub"))
}

/// Temporary directory holding pipe sockets for one test
pub struct StubDir {
    pub dir: TempDir,
}

impl StubDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create pipe directory"),
        }
    }

    /// Settings launching the stub on a pipe in this directory
    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            program: Some(stub_program()),
            transport: TransportSettings::Pipe {
                dir: Some(self.dir.path().to_path_buf()),
            },
            connect_retries: 200,
            retry_interval: Duration::from_millis(50),
            terminate_wait: Duration::from_secs(5),
            ..ServiceSettings::default()
        }
    }

    /// Settings running `script` under `sh -c` instead of the stub
    pub fn shell_settings(&self, script: &str) -> ServiceSettings {
        ServiceSettings {
            program: Some(PathBuf::from("sh")),
            extra_args: vec!["-c".to_string(), script.to_string(), "office".to_string()],
            ..self.settings()
        }
    }
}

/// A local TCP port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// True while a process with this PID exists and is not a zombie
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Orphans are reaped by whatever runs as init, which may never happen here
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        let state = stat.rsplit_once(')').and_then(|(_, rest)| rest.trim_start().chars().next());
        if state == Some('Z') {
            return false;
        }
    }

    let pid = i32::try_from(pid).expect("pid fits in i32");
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Wait up to two seconds for a process to go away
pub async fn wait_for_exit(pid: u32) -> bool {
    for _ in 0..40 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send SIGKILL to a process
pub fn kill_process(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).expect("pid fits in i32");
    kill(Pid::from_raw(pid), Signal::SIGKILL).expect("kill process");
}
