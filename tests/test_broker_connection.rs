//! BrokerConnection lifecycle tests against the in-process mock broker
//!
//! Tests focus on observable behavior: what reaches the broker, which state
//! the connection reports, and what it signals to its owner.

use broker_link::resilience::{ConnectionRegistry, NetworkMonitor, NetworkState};
use broker_link::testing::mocks::{MockBrokerState, MockHandler, MockTransportFactory};
use broker_link::transport::amqp::{
    BrokerConnection, ConnectionEvent, ConnectionSettings, ConnectionState, ReconnectReason,
    ReconnectRequest, DEFAULT_CONFIRMATION_QUEUE,
};
use broker_link::transport::{BrokerError, QueueOptions, ShutdownNotice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const QUEUE: &str = "contact_sync_queue";

struct Harness {
    connection: BrokerConnection,
    reconnects: mpsc::Receiver<ReconnectRequest>,
    registry: Arc<ConnectionRegistry>,
    network: Arc<NetworkMonitor>,
    factory: MockTransportFactory,
}

impl Harness {
    fn new(network: NetworkState) -> Self {
        Self::with_settings(network, ConnectionSettings::new("amqp://localhost", QUEUE, "device-1"))
    }

    fn with_settings(network: NetworkState, settings: ConnectionSettings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let network = Arc::new(NetworkMonitor::new(network));
        let factory = MockTransportFactory::new();
        let (connection, reconnects) = BrokerConnection::new(
            settings,
            registry.clone(),
            network.clone(),
            Arc::new(factory.clone()),
        );
        Self {
            connection,
            reconnects,
            registry,
            network,
            factory,
        }
    }

    fn broker(&self) -> Arc<MockBrokerState> {
        self.factory.state()
    }
}

/// Poll `check` until it holds; also fine under paused time
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn next_matching(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    mut wanted: impl FnMut(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    loop {
        let event = events.recv().await.expect("event stream open");
        if wanted(&event) {
            return event;
        }
    }
}

fn notice(code: Option<u16>, text: &str, hard_error: bool) -> ShutdownNotice {
    ShutdownNotice {
        reply_code: code,
        reply_text: text.to_string(),
        hard_error,
        initiated_by_application: false,
    }
}

#[tokio::test]
async fn test_connect_declares_queues_and_registers_one_consumer() {
    let harness = Harness::new(NetworkState::wired());

    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert_eq!(harness.connection.state(), ConnectionState::Connected);

    let broker = harness.broker();
    assert_eq!(broker.opens(), 1);
    assert_eq!(broker.prefetch(), Some(10));
    assert_eq!(
        broker.declared_queues(),
        vec![
            (QUEUE.to_string(), QueueOptions::durable_shared()),
            (
                DEFAULT_CONFIRMATION_QUEUE.to_string(),
                QueueOptions::durable_shared()
            ),
        ]
    );

    let consumers = broker.consumers();
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].0, QUEUE);
    assert!(consumers[0].1.starts_with("device-1-contact_sync_queue-"));

    let params = broker.last_params().unwrap();
    assert!(!params.automatic_recovery);
    assert_eq!(params.username, "guest");
    assert_eq!(harness.registry.holder(QUEUE), Some(harness.connection.instance_id()));
    assert_eq!(harness.connection.consecutive_failures(), 0);

    harness.connection.cleanup().await;
}

#[tokio::test]
async fn test_second_connection_for_same_queue_is_rejected_without_side_effects() {
    let first = Harness::new(NetworkState::wired());
    assert!(first.connection.connect(Arc::new(MockHandler::new())).await);

    let other_factory = MockTransportFactory::new();
    let (second, _reconnects) = BrokerConnection::new(
        ConnectionSettings::new("amqp://localhost", QUEUE, "device-2"),
        first.registry.clone(),
        first.network.clone(),
        Arc::new(other_factory.clone()),
    );

    assert!(!second.connect(Arc::new(MockHandler::new())).await);
    assert_eq!(second.state(), ConnectionState::Disconnected);
    assert_eq!(second.consecutive_failures(), 0);
    assert!(!second.is_reconnect_pending());
    assert_eq!(other_factory.state().opens(), 0);
    assert_eq!(first.registry.holder(QUEUE), Some(first.connection.instance_id()));

    first.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsuitable_network_never_opens_a_transport() {
    let harness = Harness::new(NetworkState::unknown());

    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);

    assert_eq!(harness.connection.state(), ConnectionState::Error);
    assert_eq!(harness.broker().opens(), 0);
    assert!(!harness.registry.is_registered(QUEUE));
    assert_eq!(harness.connection.consecutive_failures(), 1);
    assert!(harness.connection.is_reconnect_pending());

    harness.connection.cleanup().await;
    assert!(!harness.connection.is_reconnect_pending());
}

#[tokio::test]
async fn test_handler_results_become_acks_and_requeued_nacks() {
    let harness = Harness::new(NetworkState::wired());
    let handler = Arc::new(MockHandler::new());
    assert!(harness.connection.connect(handler.clone()).await);
    let broker = harness.broker();

    assert!(broker.deliver(1, r#"{"id":"c-1"}"#).await);
    assert!(eventually(|| broker.acks() == vec![1]).await);

    handler.set_result(false);
    assert!(broker.deliver(2, r#"{"id":"c-2"}"#).await);
    assert!(eventually(|| broker.nacks() == vec![(2, true)]).await);

    assert_eq!(handler.handled(), vec![r#"{"id":"c-1"}"#, r#"{"id":"c-2"}"#]);
    let stats = harness.connection.stats();
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.messages_acked, 1);
    assert_eq!(stats.messages_nacked, 1);

    harness.connection.cleanup().await;
}

#[tokio::test]
async fn test_ack_order_follows_delivery_order() {
    let harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    let broker = harness.broker();

    for tag in 1..=5 {
        assert!(broker.deliver(tag, "payload").await);
    }

    assert!(eventually(|| broker.acks().len() == 5).await);
    assert_eq!(broker.acks(), vec![1, 2, 3, 4, 5]);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_handler_that_never_returns_is_nacked_with_requeue() {
    let harness = Harness::new(NetworkState::wired());
    let mut events = harness.connection.subscribe_events();
    let handler = Arc::new(MockHandler::with_delay(Duration::from_secs(3600)));
    assert!(harness.connection.connect(handler).await);

    assert!(harness.broker().deliver(7, "slow").await);

    let decided = next_matching(&mut events, |event| {
        matches!(event, ConnectionEvent::AckDecided { delivery_tag: 7, .. })
    })
    .await;
    assert_eq!(
        decided,
        ConnectionEvent::AckDecided {
            delivery_tag: 7,
            success: false
        }
    );

    let broker = harness.broker();
    assert!(eventually(|| broker.nacks() == vec![(7, true)]).await);
    assert!(broker.acks().is_empty());
    assert_eq!(harness.connection.stats().handler_timeouts, 1);

    harness.connection.cleanup().await;
}

#[tokio::test]
async fn test_publish_reaches_confirmation_queue_once() {
    let harness = Harness::new(NetworkState::wired());

    // Not connected yet: nothing is sent
    assert!(!harness.connection.publish_to_sync_success("early").await);
    assert!(harness.broker().publishes().is_empty());

    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert!(harness.connection.publish_to_sync_success(r#"{"contact_id":"c-1"}"#).await);

    assert_eq!(
        harness.broker().publishes(),
        vec![(
            DEFAULT_CONFIRMATION_QUEUE.to_string(),
            br#"{"contact_id":"c-1"}"#.to_vec()
        )]
    );

    harness.broker().set_fail_publish(true);
    assert!(!harness.connection.publish_to_sync_success("rejected").await);
    assert_eq!(harness.connection.stats().publishes_failed, 1);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_publish_times_out_without_resending() {
    let harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    harness.broker().set_publish_delay(Some(Duration::from_secs(30)));

    assert!(!harness.connection.publish_to_sync_success("slow").await);
    assert_eq!(harness.connection.stats().publish_timeouts, 1);

    // The original send still lands exactly once
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.broker().publishes().len(), 1);

    harness.connection.cleanup().await;
}

#[tokio::test]
async fn test_publish_after_disconnect_fails_fast() {
    let harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);

    harness.connection.disconnect().await;

    assert!(!harness.connection.publish_to_sync_success("late").await);
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert!(!harness.registry.is_registered(QUEUE));
    assert_eq!(harness.broker().closes(), 1);
    assert_eq!(harness.broker().cancels().len(), 1);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_clean_closure_defers_reconnect_for_takeover() {
    let mut harness = Harness::new(NetworkState::wired());
    let mut events = harness.connection.subscribe_events();
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);

    assert!(
        harness
            .broker()
            .emit_shutdown(notice(Some(200), "clean connection shutdown", false))
            .await
    );

    let scheduled = next_matching(&mut events, |event| {
        matches!(event, ConnectionEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        scheduled,
        ConnectionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(30)
        }
    );
    assert_eq!(harness.connection.consecutive_failures(), 0);

    let request = harness.reconnects.recv().await.unwrap();
    assert_eq!(request.queue, QUEUE);
    assert_eq!(request.reason, ReconnectReason::ConsumerTakeover);

    // The connection tore itself down but did not reconnect on its own
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert!(!harness.registry.is_registered(QUEUE));
    assert_eq!(harness.broker().opens(), 1);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_forced_closure_counts_as_failure() {
    let mut harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);

    assert!(
        harness
            .broker()
            .emit_shutdown(notice(Some(320), "CONNECTION_FORCED - broker forced connection closure", true))
            .await
    );

    let connection = harness.connection.clone();
    assert!(eventually(|| connection.state() == ConnectionState::Error).await);
    assert_eq!(harness.connection.consecutive_failures(), 1);
    assert!(harness.connection.last_error().is_some());

    let request = harness.reconnects.recv().await.unwrap();
    assert_eq!(request.reason, ReconnectReason::Backoff);
    assert_eq!(request.attempt, 1);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_hard_error_with_normal_code_counts_as_failure() {
    let mut harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);

    assert!(harness.broker().emit_shutdown(notice(Some(200), "OK", true)).await);

    let connection = harness.connection.clone();
    assert!(eventually(|| connection.state() == ConnectionState::Error).await);
    assert_eq!(harness.connection.consecutive_failures(), 1);

    let request = harness.reconnects.recv().await.unwrap();
    assert_eq!(request.reason, ReconnectReason::Backoff);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_broker_cancelling_consumer_counts_as_failure() {
    let harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    let tag = harness.broker().consumers()[0].1.clone();

    assert!(harness.broker().emit_consumer_cancelled(&tag).await);

    let connection = harness.connection.clone();
    assert!(eventually(|| connection.state() == ConnectionState::Error).await);
    assert!(harness.connection.is_reconnect_pending());

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_ceiling_stops_automatic_reconnects() {
    let mut settings = ConnectionSettings::new("amqp://localhost", QUEUE, "device-1");
    settings.reconnect.max_consecutive_failures = 2;
    let mut harness = Harness::with_settings(NetworkState::wired(), settings);
    let mut events = harness.connection.subscribe_events();
    let broker = harness.broker();
    broker.set_fail_open(Some(BrokerError::Transport("Connection refused".to_string())));

    // First failure schedules a reconnect, which the owner answers
    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert!(harness.connection.is_reconnect_pending());
    let request = harness.reconnects.recv().await.unwrap();
    assert_eq!(request.attempt, 1);

    // Second failure reaches the ceiling
    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert_eq!(harness.connection.consecutive_failures(), 2);
    assert!(!harness.connection.is_reconnect_pending());
    next_matching(&mut events, |event| {
        matches!(event, ConnectionEvent::ReconnectAbandoned { failures: 2 })
    })
    .await;

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(harness.reconnects.try_recv().is_err());
    assert_eq!(harness.connection.state(), ConnectionState::Error);

    // Only an explicit connect resumes
    broker.set_fail_open(None);
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert_eq!(harness.connection.consecutive_failures(), 0);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_explicit_connect_after_ceiling_rearms_reconnects() {
    let mut settings = ConnectionSettings::new("amqp://localhost", QUEUE, "device-1");
    settings.reconnect.max_consecutive_failures = 2;
    let mut harness = Harness::with_settings(NetworkState::wired(), settings);
    let broker = harness.broker();
    broker.set_fail_open(Some(BrokerError::Transport("Connection refused".to_string())));

    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert_eq!(harness.reconnects.recv().await.unwrap().attempt, 1);
    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert!(!harness.connection.is_reconnect_pending());

    // The owner retries by hand and the broker is still down
    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert_eq!(harness.connection.consecutive_failures(), 1);
    assert!(harness.connection.is_reconnect_pending());

    let request = harness.reconnects.recv().await.unwrap();
    assert_eq!(request.reason, ReconnectReason::Backoff);
    assert_eq!(request.attempt, 1);

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_failing_connect_is_not_a_failure() {
    let mut harness = Harness::new(NetworkState::wired());
    let broker = harness.broker();
    broker.set_open_delay(Some(Duration::from_secs(1)));
    broker.set_fail_open(Some(BrokerError::Transport("Connection refused".to_string())));

    let connection = harness.connection.clone();
    let connecting =
        tokio::spawn(async move { connection.connect(Arc::new(MockHandler::new())).await });
    let connection = harness.connection.clone();
    assert!(eventually(|| connection.state() == ConnectionState::Connecting).await);

    harness.connection.disconnect().await;
    assert!(!connecting.await.unwrap());

    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert_eq!(harness.connection.consecutive_failures(), 0);
    assert!(!harness.connection.is_reconnect_pending());
    assert!(!harness.registry.is_registered(QUEUE));

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(harness.reconnects.try_recv().is_err());

    harness.connection.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_successful_connect_leaves_link_down() {
    let mut harness = Harness::new(NetworkState::wired());
    let broker = harness.broker();
    broker.set_open_delay(Some(Duration::from_secs(1)));

    let connection = harness.connection.clone();
    let connecting =
        tokio::spawn(async move { connection.connect(Arc::new(MockHandler::new())).await });
    let connection = harness.connection.clone();
    assert!(eventually(|| connection.state() == ConnectionState::Connecting).await);

    harness.connection.disconnect().await;
    assert!(!connecting.await.unwrap());

    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert_eq!(harness.connection.consecutive_failures(), 0);
    assert!(!harness.registry.is_registered(QUEUE));
    assert!(!harness.connection.publish_to_sync_success("late").await);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(harness.reconnects.try_recv().is_err());

    harness.connection.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_disconnect_and_cleanup_release_once() {
    let harness = Harness::new(NetworkState::wired());
    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);

    tokio::join!(
        harness.connection.disconnect(),
        harness.connection.cleanup(),
        harness.connection.disconnect(),
        harness.connection.cleanup(),
    );
    assert!(!harness.registry.is_registered(QUEUE));

    // A newer holder must survive a late release from the old connection
    let (successor, _reconnects) = BrokerConnection::new(
        ConnectionSettings::new("amqp://localhost", QUEUE, "device-1"),
        harness.registry.clone(),
        harness.network.clone(),
        Arc::new(MockTransportFactory::new()),
    );
    assert!(successor.connect(Arc::new(MockHandler::new())).await);
    harness.connection.disconnect().await;
    assert_eq!(harness.registry.holder(QUEUE), Some(successor.instance_id()));

    // Cleaned-up connections stay down
    assert!(!harness.connection.connect(Arc::new(MockHandler::new())).await);
    successor.cleanup().await;
}

#[tokio::test]
async fn test_queue_depth_uses_passive_declare() {
    let harness = Harness::new(NetworkState::wired());
    assert_eq!(harness.connection.queue_depth().await, None);

    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    harness.broker().set_queue_depth(42);
    assert_eq!(harness.connection.queue_depth().await, Some(42));
    // Passive lookups are not recorded as declarations
    assert_eq!(harness.broker().declared_queues().len(), 2);

    harness.connection.cleanup().await;
}

#[tokio::test]
async fn test_state_stream_reports_transitions() {
    let harness = Harness::new(NetworkState::wired());
    let mut states = harness.connection.subscribe_state();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    assert!(harness.connection.connect(Arc::new(MockHandler::new())).await);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    harness.connection.disconnect().await;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    harness.connection.cleanup().await;
}
