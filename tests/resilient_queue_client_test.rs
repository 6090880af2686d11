//! End-to-end behaviour of the resilient queue client against the in-memory broker

mod common;

use std::time::Duration;

use common::{client_for, client_with_config, Received};
use emu_relay::messaging::InMemoryBroker;
use emu_relay::{CircuitState, MessagingError, RelayConfig};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

const PAST_FLOOR: Duration = Duration::from_millis(5_001);

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_degrades_and_drops_messages() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let mut client = client_for(&broker);

    let started = Instant::now();
    assert!(!client.connect(3).await);
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    assert_eq!(broker.connection_attempts(), 3);

    assert!(!client.is_connected());
    assert!(client.is_degraded());
    assert_eq!(client.health_snapshot().connection_failures, 1);

    assert!(!client.publish("q", "X").await.unwrap());
    assert_eq!(broker.connection_attempts(), 3);
}

#[tokio::test]
async fn test_publish_and_consume_roundtrip() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let received = Received::default();

    assert!(client.connect(3).await);
    assert!(!client.is_degraded());
    assert!(client.declare_queue("q", true).await.unwrap());
    assert!(client.consume("q", received.callback()).await.unwrap());
    assert!(client.publish("q", "HELLO").await.unwrap());

    assert_eq!(client.process_pending(Duration::ZERO).await, 1);
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert_eq!(received.bodies(), vec!["HELLO"]);
    assert_eq!(broker.unacked_count("q"), 0);
}

#[tokio::test]
async fn test_messages_arrive_in_publish_order() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let received = Received::default();

    client.connect(1).await;
    client.declare_queue("fila_comandos", true).await.unwrap();
    client.consume("fila_comandos", received.callback()).await.unwrap();
    for command in ["UP", "UP", "A", "START"] {
        assert!(client.publish("fila_comandos", command).await.unwrap());
    }

    assert_eq!(client.process_pending(Duration::ZERO).await, 4);
    assert_eq!(received.bodies(), vec!["UP", "UP", "A", "START"]);
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_backoff_grows_then_resets() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let mut client = client_for(&broker);

    assert!(!client.declare_queue("q", true).await.unwrap());
    assert!(!client.connect(1).await);
    assert_eq!(broker.connection_attempts(), 1);
    assert_eq!(client.reconnect_delay(), Duration::from_secs(5));

    // Exactly the delay is not enough
    sleep(Duration::from_secs(5)).await;
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert_eq!(broker.connection_attempts(), 1);

    sleep(Duration::from_millis(1)).await;
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert_eq!(broker.connection_attempts(), 2);
    assert_eq!(client.reconnect_delay(), Duration::from_millis(7_500));

    sleep(Duration::from_millis(7_501)).await;
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert_eq!(broker.connection_attempts(), 3);
    assert_eq!(client.reconnect_delay(), Duration::from_millis(11_250));

    broker.set_available(true);
    sleep(Duration::from_millis(11_251)).await;
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert!(client.is_connected());
    assert_eq!(broker.connection_attempts(), 4);
    assert_eq!(client.reconnect_delay(), Duration::from_secs(5));

    // Declared while degraded, restored on reconnect
    assert!(client.publish("q", "delivered").await.unwrap());
    assert_eq!(broker.drain("q"), vec![b"delivered".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_publish_never_touches_the_broker() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let mut client = client_for(&broker);

    assert!(!client.connect(1).await);
    assert_eq!(broker.connection_attempts(), 1);

    // Backoff has expired and the broker is back, yet publish stays local
    sleep(Duration::from_secs(6)).await;
    broker.set_available(true);
    assert!(!client.publish("q", "X").await.unwrap());
    assert!(!client.publish("q", "Y").await.unwrap());
    assert_eq!(broker.connection_attempts(), 1);
    assert!(client.is_degraded());
    assert!(!broker.has_queue("q"));

    // Reconnects come from the consume path
    client.process_pending(Duration::ZERO).await;
    assert_eq!(broker.connection_attempts(), 2);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_publish_on_blocked_connection_times_out() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);

    client.connect(1).await;
    client.declare_queue("q", true).await.unwrap();
    broker.block_publishes(true);

    let started = Instant::now();
    assert!(!client.publish("q", "stuck").await.unwrap());
    assert_eq!(started.elapsed(), RelayConfig::default().broker.publish_timeout());
    assert!(client.is_connected());

    broker.block_publishes(false);
    assert!(client.publish("q", "flowing").await.unwrap());
    assert_eq!(broker.drain("q"), vec![b"flowing".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_stops_retries_and_recovers() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let mut config = RelayConfig::default();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout_seconds = 60;
    let mut client = client_with_config(&broker, &config);

    assert!(!client.connect(3).await);
    assert_eq!(broker.connection_attempts(), 2);
    assert_eq!(client.circuit_breaker().state(), CircuitState::Open);
    assert!(client.is_degraded());

    // Open breaker: no network call at all
    assert!(!client.connect(3).await);
    assert_eq!(broker.connection_attempts(), 2);

    broker.set_available(true);
    sleep(Duration::from_secs(60)).await;

    assert!(client.connect(1).await);
    assert_eq!(broker.connection_attempts(), 3);
    assert_eq!(client.circuit_breaker().state(), CircuitState::Closed);
    assert_eq!(client.health_snapshot().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_severed_connection_recovers_topology() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let received = Received::default();

    client.connect(1).await;
    client.declare_queue("q", true).await.unwrap();
    client.consume("q", received.callback()).await.unwrap();
    client.publish("q", "A").await.unwrap();
    assert_eq!(client.process_pending(Duration::ZERO).await, 1);

    broker.sever_connections();
    assert!(!client.publish("q", "B").await.unwrap());
    assert!(client.is_degraded());
    assert!(!client.health_snapshot().connected);

    sleep(PAST_FLOOR).await;
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert!(client.is_connected());

    assert!(client.publish("q", "C").await.unwrap());
    assert_eq!(client.process_pending(Duration::ZERO).await, 1);
    assert_eq!(received.bodies(), vec!["A", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_queue_redeclared_after_broker_restart() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);

    client.connect(1).await;
    assert!(client.declare_queue("scratch", false).await.unwrap());

    broker.set_available(false);
    broker.set_available(true);
    assert!(!broker.has_queue("scratch"));

    sleep(PAST_FLOOR).await;
    assert!(!client.publish("scratch", "lost").await.unwrap());
    client.process_pending(Duration::ZERO).await;
    assert!(client.is_connected());

    assert!(client.publish("scratch", "x").await.unwrap());
    assert_eq!(broker.is_durable("scratch"), Some(false));
    assert_eq!(broker.queue_depth("scratch"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_registered_while_degraded_activates_on_reconnect() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let mut client = client_for(&broker);
    let received = Received::default();

    client.connect(1).await;
    assert!(!client.declare_queue("fila_eventos", true).await.unwrap());
    assert!(!client.consume("fila_eventos", received.callback()).await.unwrap());
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);

    broker.set_available(true);
    sleep(PAST_FLOOR).await;
    assert_eq!(client.process_pending(Duration::ZERO).await, 0);
    assert!(client.is_connected());

    assert!(broker.publish_direct("fila_eventos", "SCORE:100"));
    assert_eq!(client.process_pending(Duration::ZERO).await, 1);
    assert_eq!(received.bodies(), vec!["SCORE:100"]);
}

#[tokio::test]
async fn test_consume_replaces_previous_callback() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let first = Received::default();
    let second = Received::default();

    client.connect(1).await;
    client.declare_queue("q", true).await.unwrap();
    assert!(client.consume("q", first.callback()).await.unwrap());
    assert!(client.consume("q", second.callback()).await.unwrap());

    client.publish("q", "only-second").await.unwrap();
    assert_eq!(client.process_pending(Duration::ZERO).await, 1);
    assert!(first.bodies().is_empty());
    assert_eq!(second.bodies(), vec!["only-second"]);
}

#[tokio::test]
async fn test_failed_publish_returns_false_and_keeps_session() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);

    client.connect(1).await;
    client.declare_queue("q", true).await.unwrap();
    broker.fail_next_publishes(1);

    assert!(!client.publish("q", "lost").await.unwrap());
    assert!(client.is_connected());
    assert!(client.publish("q", "kept").await.unwrap());
    assert_eq!(broker.drain("q"), vec![b"kept".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_process_pending_waits_up_to_time_limit() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let received = Received::default();

    client.connect(1).await;
    client.declare_queue("q", true).await.unwrap();
    client.consume("q", received.callback()).await.unwrap();

    let publisher = broker.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        publisher.publish_direct("q", "late");
    });

    let started = Instant::now();
    assert_eq!(client.process_pending(Duration::from_secs(1)).await, 1);
    assert!(started.elapsed() <= Duration::from_secs(1));
    assert_eq!(received.bodies(), vec!["late"]);
}

#[tokio::test(start_paused = true)]
async fn test_consume_until_shutdown() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    let received = Received::default();

    client.connect(1).await;
    client.declare_queue("q", true).await.unwrap();
    client.consume("q", received.callback()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feeder = broker.clone();
    let stopper = async move {
        feeder.publish_direct("q", "one");
        sleep(Duration::from_millis(120)).await;
        feeder.publish_direct("q", "two");
        sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
    };

    let (dispatched, ()) = tokio::join!(
        client.consume_until_shutdown(shutdown_rx, Duration::from_millis(50)),
        stopper
    );
    assert_eq!(dispatched, 2);
    assert_eq!(received.bodies(), vec!["one", "two"]);
}

#[tokio::test]
async fn test_invalid_queue_names_are_caller_errors() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    client.connect(1).await;

    for name in ["", "amq.gen", "tab\there"] {
        assert!(matches!(
            client.publish(name, "X").await,
            Err(MessagingError::InvalidQueueName { .. })
        ));
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_close_then_snapshot() {
    let broker = InMemoryBroker::new();
    let mut client = client_for(&broker);
    client.connect(1).await;
    assert!(client.health_snapshot().connected);

    client.close().await;
    client.close().await;

    let snapshot = client.health_snapshot();
    assert!(!snapshot.connected);
    assert!(snapshot.degraded);
    assert_eq!(snapshot.circuit_state, CircuitState::Closed);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["connected"], false);
    assert_eq!(json["circuit_state"], "closed");
}
