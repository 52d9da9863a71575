// ABOUTME: End-to-end pool scenarios with connections created through the supervisor

use crate::fixtures::{kill_process, wait_for_exit, StubDir};
use office_bridge::bridge::{
    BootstrapFactory, BootstrapService, Connection, ConnectionFactory, ConnectionPool,
    PoolSettings, ServiceState,
};
use std::sync::Arc;
use std::time::Duration;

fn pid_of(service: &BootstrapService) -> Option<u32> {
    match service.state() {
        ServiceState::Running { pid, .. } => Some(pid),
        _ => None,
    }
}

fn settings(capacity: usize, reuse_count: i64) -> PoolSettings {
    PoolSettings {
        capacity,
        reuse_count,
        probe_backoff_base: Duration::from_millis(10),
        probe_backoff_max: Duration::from_millis(100),
        ..PoolSettings::default()
    }
}

#[tokio::test]
async fn test_pool_boots_service_and_reuses_connection() {
    let stub = StubDir::new();
    let service = Arc::new(BootstrapService::new(stub.settings()));
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(BootstrapFactory::new(Arc::clone(&service)));
    let pool = ConnectionPool::with_settings(&settings(1, 0), factory);
    assert!(!service.is_running());

    let first = pool.get_connection().await.expect("first lease");
    let first_id = first.id();
    let pid = pid_of(&service).expect("service started by pool");
    first.loader().await.expect("loader");
    first.close().await.expect("close");

    let second = pool.get_connection().await.expect("second lease");
    assert_eq!(second.id(), first_id);
    assert_eq!(second.uses(), 2);
    assert_eq!(pid_of(&service), Some(pid));
    second.close().await.expect("close");

    pool.shutdown().await;
    service.stop().await;
}

#[tokio::test]
async fn test_restarting_pool_boots_fresh_process_per_connection() {
    let stub = StubDir::new();
    let service = Arc::new(BootstrapService::new(stub.settings()));
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(BootstrapFactory::restarting(Arc::clone(&service)));
    let pool = ConnectionPool::with_settings(&settings(1, 1), factory);

    let first = pool.get_connection().await.expect("first lease");
    let first_pid = pid_of(&service).expect("first process");
    first.close().await.expect("close");
    assert!(!service.is_running());

    let second = pool.get_connection().await.expect("second lease");
    let second_pid = pid_of(&service).expect("second process");
    assert_ne!(first_pid, second_pid);
    assert_eq!(second.uses(), 1);
    second.close().await.expect("close");

    assert_eq!(pool.metrics().snapshot().created, 2);
    pool.shutdown().await;
    service.stop().await;
}

#[tokio::test]
async fn test_pool_recovers_after_process_dies() {
    let stub = StubDir::new();
    let service = Arc::new(BootstrapService::new(stub.settings()));
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(BootstrapFactory::restarting(Arc::clone(&service)));
    let pool = ConnectionPool::with_settings(&settings(1, 0), factory);

    let handle = pool.get_connection().await.expect("first lease");
    handle.close().await.expect("close");
    let dead_pid = pid_of(&service).expect("process running");
    kill_process(dead_pid);

    let handle = pool.get_connection().await.expect("lease after crash");
    assert!(handle.loader().await.is_ok());
    assert_ne!(pid_of(&service), Some(dead_pid));
    assert!(pool.metrics().snapshot().probe_failures >= 1);
    handle.close().await.expect("close");

    pool.shutdown().await;
    service.stop().await;
}

#[tokio::test]
async fn test_plain_pool_restarts_crashed_process() {
    let stub = StubDir::new();
    let service = Arc::new(BootstrapService::new(stub.settings()));
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(BootstrapFactory::new(Arc::clone(&service)));
    let pool = ConnectionPool::with_settings(&settings(1, 0), factory);

    let handle = pool.get_connection().await.expect("first lease");
    handle.close().await.expect("close");
    let dead_pid = pid_of(&service).expect("process running");
    kill_process(dead_pid);
    assert!(wait_for_exit(dead_pid).await);

    let handle = pool.get_connection().await.expect("lease after crash");
    assert!(handle.loader().await.is_ok());
    let new_pid = pid_of(&service).expect("process restarted");
    assert_ne!(new_pid, dead_pid);
    assert!(service.is_active().await);
    handle.close().await.expect("close");

    pool.shutdown().await;
    service.stop().await;
}

#[tokio::test]
async fn test_timed_lease_while_exhausted() {
    let stub = StubDir::new();
    let service = Arc::new(BootstrapService::new(stub.settings()));
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(BootstrapFactory::new(Arc::clone(&service)));
    let pool = ConnectionPool::with_settings(&settings(1, 0), factory);

    let held = pool.get_connection().await.expect("lease");
    let waited = pool
        .get_connection_timeout(Duration::from_millis(100))
        .await
        .expect("timed lease");
    assert!(waited.is_none());

    held.close().await.expect("close");
    let next = pool
        .get_connection_timeout(Duration::from_secs(1))
        .await
        .expect("timed lease")
        .expect("connection available");
    next.close().await.expect("close");

    pool.shutdown().await;
    service.stop().await;
}
