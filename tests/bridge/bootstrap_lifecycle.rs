// ABOUTME: Lifecycle tests for the office process supervisor against the stub binary

use crate::fixtures::{free_port, process_alive, stub_program, wait_for_exit, StubDir};
use office_bridge::bridge::{
    BootstrapService, Connection, Endpoint, ServiceSettings, ServiceState, SupervisorError,
    TransportSettings,
};
use std::time::{Duration, Instant};

fn running_pid(service: &BootstrapService) -> u32 {
    match service.state() {
        ServiceState::Running { pid, .. } => pid,
        other => panic!("expected running service, got {other:?}"),
    }
}

// ==================== Start/Stop Tests ====================

#[tokio::test]
async fn test_start_and_stop_over_pipe() {
    let stub = StubDir::new();
    let service = BootstrapService::new(stub.settings());

    let endpoint = service.start().await.expect("start stub");
    assert!(service.is_running());
    assert!(matches!(endpoint, Endpoint::Pipe { ref name, .. } if name.starts_with("uno")));
    let socket = endpoint.pipe_path().expect("pipe path");
    assert!(socket.exists());
    assert!(service.is_active().await);

    let connection = service.connection().await.expect("connect");
    let loader = connection.loader().await.expect("loader");
    assert_eq!(loader.reference.interface, "com.sun.star.frame.XComponentLoader");
    connection.close().await.expect("close");

    let pid = running_pid(&service);
    service.stop().await;
    assert!(!service.is_running());
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(!process_alive(pid));
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_start_and_stop_over_socket() {
    let stub = StubDir::new();
    let port = free_port();
    let settings = ServiceSettings {
        transport: TransportSettings::Socket {
            host: "127.0.0.1".to_string(),
            port,
        },
        socket_close_settle: Duration::from_millis(10),
        ..stub.settings()
    };
    let service = BootstrapService::new(settings);

    let endpoint = service.start().await.expect("start stub");
    assert_eq!(endpoint.to_string(), format!("socket:127.0.0.1:{port}"));
    assert!(service.is_active().await);

    service.stop().await;
    assert!(!service.is_running());
    assert!(!service.is_active().await);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let stub = StubDir::new();
    let service = BootstrapService::new(stub.settings());
    service.start().await.expect("start stub");
    let pid = running_pid(&service);

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(p) if p == pid));
    assert!(service.is_running());

    service.stop().await;
}

#[tokio::test]
async fn test_slow_listener_is_waited_for() {
    let stub = StubDir::new();
    let mut settings = stub.settings();
    settings.extra_args = vec!["--listen-delay-ms".to_string(), "300".to_string()];
    let service = BootstrapService::new(settings);

    let started = Instant::now();
    service.start().await.expect("start slow stub");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(service.is_active().await);

    service.stop().await;
}

#[tokio::test]
async fn test_restart_uses_fresh_pipe() {
    let stub = StubDir::new();
    let service = BootstrapService::new(stub.settings());

    let first = service.start().await.expect("start stub");
    let first_pid = running_pid(&service);
    let second = service.restart().await.expect("restart stub");

    assert_ne!(first, second);
    assert_ne!(first_pid, running_pid(&service));
    assert!(!process_alive(first_pid));
    assert!(service.is_active().await);

    service.stop().await;
}

#[tokio::test]
async fn test_launcher_handing_off_to_child_is_waited_for() {
    let stub = StubDir::new();
    let script = format!(
        "'{}' \"$@\" --listen-delay-ms 300 &",
        stub_program().display()
    );
    let service = BootstrapService::new(stub.shell_settings(&script));

    let endpoint = service.start().await.expect("start through launcher");
    assert!(service.is_running());
    assert!(service.is_active().await);

    let socket = endpoint.pipe_path().expect("pipe path");
    service.stop().await;
    for _ in 0..40 {
        if !socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_cancelled_stop_still_clears_process() {
    let stub = StubDir::new();
    let service = BootstrapService::new(stub.settings());
    service.start().await.expect("start stub");
    let pid = running_pid(&service);

    let _ = tokio::time::timeout(Duration::ZERO, service.stop()).await;
    assert!(!service.is_running());
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(wait_for_exit(pid).await);

    service.start().await.expect("start after cancelled stop");
    service.stop().await;
}

// ==================== Start Failure Tests ====================

#[tokio::test]
async fn test_never_listening_process_is_killed() {
    let stub = StubDir::new();
    let mut settings = stub.shell_settings("exec sleep 30");
    settings.connect_retries = 3;
    let service = BootstrapService::new(settings);

    let err = service.start().await.unwrap_err();
    let SupervisorError::ConnectFailed { attempts, pid, .. } = err else {
        panic!("expected ConnectFailed, got {err}");
    };
    assert_eq!(attempts, 3);
    assert!(!process_alive(pid));
    assert!(!service.is_running());
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_process_exiting_during_startup_is_reported() {
    let stub = StubDir::new();
    let mut settings = stub.settings();
    settings.extra_args = vec!["--exit-code".to_string(), "3".to_string()];
    settings.connect_retries = 4;
    let service = BootstrapService::new(settings);

    let err = service.start().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::ProcessExited { code: Some(3), .. }),
        "unexpected error: {err}"
    );
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_failed_start_can_be_retried() {
    let stub = StubDir::new();
    let mut settings = stub.settings();
    settings.extra_args = vec!["--exit-code".to_string(), "1".to_string()];
    settings.connect_retries = 4;
    let failing = BootstrapService::new(settings);
    assert!(failing.start().await.is_err());

    let service = BootstrapService::new(stub.settings());
    service.start().await.expect("start after failure");
    service.stop().await;
}

#[tokio::test]
async fn test_failed_start_kills_handed_off_children() {
    let stub = StubDir::new();
    let pid_file = stub.dir.path().join("child.pid");
    let script = format!("sleep 30 & echo $! > '{}'", pid_file.display());
    let mut settings = stub.shell_settings(&script);
    settings.connect_retries = 4;
    let service = BootstrapService::new(settings);

    let err = service.start().await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::ProcessExited { code: Some(0), .. }),
        "unexpected error: {err}"
    );

    let child: u32 = std::fs::read_to_string(&pid_file)
        .expect("child pid written")
        .trim()
        .parse()
        .expect("numeric pid");
    assert!(wait_for_exit(child).await);
    assert_eq!(service.state(), ServiceState::Stopped);
}
