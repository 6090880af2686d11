//! Health monitor wired to a queue client's shared status

mod common;

use std::time::Duration;

use common::client_for;
use emu_relay::health::{circuit_breaker_check, queue_connectivity_check};
use emu_relay::messaging::InMemoryBroker;
use emu_relay::{HealthMonitor, HealthStatus};

fn monitor_for(status: std::sync::Arc<emu_relay::ClientStatus>) -> HealthMonitor {
    let monitor = HealthMonitor::new("emulator-driver", Duration::from_secs(30), Duration::from_secs(5));
    monitor.register_check("broker_connection", queue_connectivity_check(status.clone()));
    monitor.register_check("circuit_breaker", circuit_breaker_check(status));
    monitor
}

#[tokio::test]
async fn test_status_follows_client_connection() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let monitor = monitor_for(client.status());

    // Not connected yet, breaker closed: one of two checks passes
    assert_eq!(monitor.check_all(), HealthStatus::Degraded);

    assert!(client.connect(1).await);
    assert_eq!(monitor.check_all(), HealthStatus::Healthy);

    client.close().await;
    assert_eq!(monitor.check("broker_connection"), HealthStatus::Unhealthy);
    assert_eq!(monitor.check("circuit_breaker"), HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_is_reported_with_error() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let mut client = client_for(&broker);
    let monitor = monitor_for(client.status());

    // Default threshold is 5; 5 attempts open the breaker
    assert!(!client.connect(5).await);

    let report = monitor.report();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    let circuit = report
        .checks
        .iter()
        .find(|check| check.name == "circuit_breaker")
        .expect("circuit check is registered");
    assert_eq!(circuit.status, HealthStatus::Unhealthy);
    assert!(circuit.error.as_deref().is_some_and(|e| e.contains("open")));
}

#[tokio::test(start_paused = true)]
async fn test_background_monitor_start_stop() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker);
    let monitor = monitor_for(client.status());

    assert!(monitor.start());
    assert!(!monitor.start());

    tokio::time::sleep(Duration::from_secs(31)).await;
    let report = monitor.report();
    assert!(report.checks.iter().all(|check| check.last_check.is_some()));
    assert_eq!(report.uptime_seconds, 31);

    assert!(monitor.stop().await);
    assert!(!monitor.is_running());
    assert!(!monitor.stop().await);
}
