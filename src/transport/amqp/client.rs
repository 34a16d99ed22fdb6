//! Resilient per-queue broker connection
//!
//! [`BrokerConnection`] owns one broker worker, one consumer, and three
//! bounded pipelines (inbound, ack, publish). It never reconnects on its
//! own: after a scheduled delay it tears itself down and sends a
//! [`ReconnectRequest`] to its owner, which decides whether to call
//! [`BrokerConnection::connect`] again.

use super::connection::{build_consumer_tag, BrokerError, ConnectionParams, ConnectionState, ErrorKind};
use super::health_monitor::{
    HealthMetrics, HealthMonitor, ReconnectPolicy, ReconnectReason, ReconnectionDecision,
};
use super::message_handler::{
    dispatch_with_timeout, AckDecision, HandlerOutcome, MessageHandler, OutboundPublish,
};
use super::stats::{ConnectionStats, ConnectionStatsSnapshot};
use super::worker::BrokerWorker;
use crate::resilience::error_classifier::{ErrorAnalysis, ErrorCategory, ErrorClassifier};
use crate::resilience::network::NetworkMonitor;
use crate::resilience::registry::ConnectionRegistry;
use crate::transport::{InboundMessage, QueueOptions, TransportEvent, TransportFactory};
use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Inbound delivery channel capacity
pub const INBOUND_CAPACITY: usize = 100;
/// Ack decision channel capacity
pub const ACK_CAPACITY: usize = 100;
/// Outbound publish channel capacity
pub const PUBLISH_CAPACITY: usize = 50;

const TRANSPORT_EVENT_CAPACITY: usize = 16;
const LIFECYCLE_EVENT_CAPACITY: usize = 256;
const RECONNECT_REQUEST_CAPACITY: usize = 8;

/// Default auxiliary queue for delivery confirmations
pub const DEFAULT_CONFIRMATION_QUEUE: &str = "contact_callback_queue";

/// Tunables for one [`BrokerConnection`]
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker_url: String,
    pub queue: String,
    pub confirmation_queue: String,
    /// Embedded in consumer tags
    pub client_identity: String,
    pub prefetch: u16,
    pub heartbeat: Duration,
    pub connection_timeout: Duration,
    pub handler_timeout: Duration,
    pub publish_timeout: Duration,
    /// Bound on cancel/close during disconnect
    pub close_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub worker_shutdown_grace: Duration,
}

impl ConnectionSettings {
    pub fn new(
        broker_url: impl Into<String>,
        queue: impl Into<String>,
        client_identity: impl Into<String>,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            queue: queue.into(),
            confirmation_queue: DEFAULT_CONFIRMATION_QUEUE.to_string(),
            client_identity: client_identity.into(),
            prefetch: 10,
            heartbeat: ConnectionParams::HEARTBEAT,
            connection_timeout: ConnectionParams::CONNECTION_TIMEOUT,
            handler_timeout: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            worker_shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Lifecycle and diagnostics events published by a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Error {
        kind: ErrorKind,
        category: ErrorCategory,
        message: String,
    },
    AckDecided {
        delivery_tag: u64,
        success: bool,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Automatic reconnection stopped; only an explicit `connect` resumes
    ReconnectAbandoned {
        failures: u32,
    },
}

/// Sent to the owner once a scheduled reconnect has torn the connection down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    pub queue: String,
    pub attempt: u32,
    pub reason: ReconnectReason,
}

struct Pipelines {
    publish_tx: mpsc::Sender<OutboundPublish>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipelines {
    fn close(self) {
        drop(self.publish_tx);
        for task in self.tasks {
            task.abort();
        }
    }
}

struct ConnectionInner {
    settings: ConnectionSettings,
    instance_id: Uuid,
    registry: Arc<ConnectionRegistry>,
    network: Arc<NetworkMonitor>,
    factory: Arc<dyn TransportFactory>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    reconnect_tx: mpsc::Sender<ReconnectRequest>,
    shutdown_tx: watch::Sender<bool>,
    consecutive_failures: AtomicU32,
    reconnect_attempts: AtomicU32,
    reconnect_pending: AtomicBool,
    /// Set when automatic reconnection gave up; the next explicit connect starts a fresh window
    reconnect_abandoned: AtomicBool,
    consumer_active: AtomicBool,
    registered: AtomicBool,
    cleaned_up: AtomicBool,
    /// Bumped by every disconnect so an in-flight connect sees it was superseded
    disconnects: AtomicU64,
    /// Bumped per establish so late events from a dead session are ignored
    session: AtomicU64,
    pipelines: Mutex<Option<Pipelines>>,
    consumer_tag: Mutex<Option<String>>,
    worker: Mutex<Option<Arc<BrokerWorker>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<Option<ErrorAnalysis>>,
    stats: Arc<ConnectionStats>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.reconnect_task.get_mut().take() {
            task.abort();
        }
        if let Some(pipelines) = self.pipelines.get_mut().take() {
            pipelines.close();
        }
        if *self.registered.get_mut() {
            self.registry
                .unregister(&self.settings.queue, self.instance_id);
        }
    }
}

/// Cloneable handle to one logical queue's broker connection
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<ConnectionInner>,
}

impl BrokerConnection {
    /// Create a disconnected connection and the receiver for its reconnect requests
    pub fn new(
        settings: ConnectionSettings,
        registry: Arc<ConnectionRegistry>,
        network: Arc<NetworkMonitor>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::Receiver<ReconnectRequest>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_REQUEST_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = ConnectionInner {
            settings,
            instance_id: Uuid::new_v4(),
            registry,
            network,
            factory,
            state_tx,
            events_tx,
            reconnect_tx,
            shutdown_tx,
            consecutive_failures: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_pending: AtomicBool::new(false),
            reconnect_abandoned: AtomicBool::new(false),
            consumer_active: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            disconnects: AtomicU64::new(0),
            session: AtomicU64::new(0),
            pipelines: Mutex::new(None),
            consumer_tag: Mutex::new(None),
            worker: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            last_error: Mutex::new(None),
            stats: Arc::new(ConnectionStats::default()),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            reconnect_rx,
        )
    }

    pub fn queue(&self) -> &str {
        &self.inner.settings.queue
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.reconnect_pending.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<ErrorAnalysis> {
        self.inner.last_error.lock().clone()
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot(self.consecutive_failures())
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let stats = &self.inner.stats;
        HealthMonitor::calculate_health_metrics(
            stats.connected_since(),
            stats.last_message(),
            stats.reconnects_scheduled(),
        )
    }

    /// Clear the failure ceiling so automatic reconnection can resume
    pub fn reset_failure_count(&self) {
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.inner.reconnect_abandoned.store(false, Ordering::SeqCst);
    }

    /// Establish transport, channel, queues, pipelines and the consumer
    ///
    /// Returns false without side effects when another live connection holds
    /// the queue. Any other failure releases the queue, is classified, and may
    /// schedule a reconnect. A `disconnect` that lands while this is in flight
    /// wins: the result is false and nothing is counted or scheduled.
    pub async fn connect(&self, handler: Arc<dyn MessageHandler>) -> bool {
        let inner = &self.inner;
        let queue = inner.settings.queue.as_str();

        if inner.cleaned_up.load(Ordering::SeqCst) {
            warn!(queue, "Connect called after cleanup, ignoring");
            return false;
        }

        if !inner.registry.try_register(queue, inner.instance_id) {
            warn!(queue, "Connect rejected: queue already has a live connection");
            return false;
        }
        inner.registered.store(true, Ordering::SeqCst);

        // An explicit connect supersedes any pending automatic reconnect
        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }
        inner.reconnect_pending.store(false, Ordering::SeqCst);

        if inner.reconnect_abandoned.swap(false, Ordering::SeqCst) {
            info!(
                queue,
                failures = inner.consecutive_failures.load(Ordering::SeqCst),
                "Explicit connect after automatic reconnection stopped, starting a fresh failure window"
            );
            inner.consecutive_failures.store(0, Ordering::SeqCst);
            inner.reconnect_attempts.store(0, Ordering::SeqCst);
        }

        let disconnects = inner.disconnects.load(Ordering::SeqCst);
        ConnectionStats::bump(&inner.stats.connection_attempts);
        self.set_state(ConnectionState::Connecting);

        if !inner.network.is_suitable() {
            self.release_registration();
            self.record_failure(&BrokerError::NetworkUnsuitable);
            return false;
        }

        let outcome = self.establish(handler).await;
        if inner.disconnects.load(Ordering::SeqCst) != disconnects {
            // The owner disconnected while we were connecting; its call wins
            debug!(queue, success = outcome.is_ok(), "Connect superseded by disconnect");
            self.release_registration();
            self.teardown_session().await;
            return false;
        }

        match outcome {
            Ok(()) => {
                inner.consecutive_failures.store(0, Ordering::SeqCst);
                inner.reconnect_attempts.store(0, Ordering::SeqCst);
                inner.stats.mark_connected();
                self.set_state(ConnectionState::Connected);
                true
            }
            Err(e) => {
                self.release_registration();
                self.teardown_session().await;
                self.record_failure(&e);
                false
            }
        }
    }

    async fn establish(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        let settings = &self.inner.settings;
        let transport_type = self.inner.network.current().transport;

        let mut params = ConnectionParams::from_url(&settings.broker_url, transport_type)?;
        params.heartbeat = settings.heartbeat;
        params.connection_timeout = settings.connection_timeout;

        debug!(
            queue = %settings.queue,
            endpoint = %params.endpoint(),
            buffer_size = params.socket.buffer_size,
            "Opening broker connection"
        );

        let worker = self.worker();
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        let (transport_events_tx, transport_events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);

        let endpoint = params.endpoint();
        let connect_timeout = params.connection_timeout;
        let socket_timeout = params.socket_timeout;
        bounded(
            connect_timeout,
            format!("connecting to {endpoint}"),
            worker.open(params, transport_events_tx),
        )
        .await?;

        bounded(
            socket_timeout,
            "declaring queues".to_string(),
            worker.prepare(
                settings.prefetch,
                vec![
                    (settings.queue.clone(), QueueOptions::durable_shared()),
                    (
                        settings.confirmation_queue.clone(),
                        QueueOptions::durable_shared(),
                    ),
                ],
            ),
        )
        .await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        self.start_pipelines(&worker, handler, inbound_rx, transport_events_rx, session);

        bounded(
            socket_timeout,
            "registering consumer".to_string(),
            self.register_consumer(&worker, inbound_tx),
        )
        .await
    }

    /// At most one consumer per connection, whatever the interleaving of connects
    async fn register_consumer(
        &self,
        worker: &BrokerWorker,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError> {
        let inner = &self.inner;
        if inner
            .consumer_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(queue = %inner.settings.queue, "Consumer already active");
            return Ok(());
        }

        let tag = build_consumer_tag(
            &inner.settings.client_identity,
            &inner.settings.queue,
            Utc::now(),
        );
        match worker
            .consume(inner.settings.queue.clone(), tag.clone(), deliveries)
            .await
        {
            Ok(()) => {
                info!(queue = %inner.settings.queue, consumer_tag = %tag, "Consumer registered");
                *inner.consumer_tag.lock() = Some(tag);
                Ok(())
            }
            Err(e) => {
                inner.consumer_active.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn start_pipelines(
        &self,
        worker: &Arc<BrokerWorker>,
        handler: Arc<dyn MessageHandler>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        transport_events_rx: mpsc::Receiver<TransportEvent>,
        session: u64,
    ) {
        let inner = &self.inner;
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CAPACITY);
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CAPACITY);

        let tasks = vec![
            tokio::spawn(run_inbound(
                inbound_rx,
                ack_tx,
                handler,
                inner.settings.handler_timeout,
                inner.events_tx.clone(),
                inner.stats.clone(),
            )),
            tokio::spawn(run_acks(
                ack_rx,
                worker.clone(),
                inner.events_tx.clone(),
                inner.stats.clone(),
            )),
            tokio::spawn(run_publishes(
                publish_rx,
                worker.clone(),
                inner.settings.confirmation_queue.clone(),
                inner.stats.clone(),
            )),
            tokio::spawn(run_transport_listener(
                transport_events_rx,
                Arc::downgrade(inner),
                session,
            )),
        ];

        let previous = inner.pipelines.lock().replace(Pipelines { publish_tx, tasks });
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Publish to the confirmation queue, waiting at most the publish timeout
    ///
    /// False on timeout, disconnection, or a failed publish. The message is
    /// handed to the publish pipeline exactly once.
    pub async fn publish_to_sync_success(&self, message: &str) -> bool {
        let inner = &self.inner;
        if !HealthMonitor::can_publish(self.state()) {
            debug!(queue = %inner.settings.queue, state = %self.state(), "Publish skipped, not connected");
            return false;
        }

        let publish_tx = inner
            .pipelines
            .lock()
            .as_ref()
            .map(|p| p.publish_tx.clone());
        let Some(publish_tx) = publish_tx else {
            return false;
        };

        let (reply, response) = oneshot::channel();
        let request = OutboundPublish {
            payload: message.as_bytes().to_vec(),
            reply,
        };

        let timeout = inner.settings.publish_timeout;
        let outcome = tokio::time::timeout(timeout, async move {
            if publish_tx.send(request).await.is_err() {
                return false;
            }
            response.await.unwrap_or(false)
        })
        .await;

        match outcome {
            Ok(delivered) => delivered,
            Err(_) => {
                ConnectionStats::bump(&inner.stats.publish_timeouts);
                self.emit_error(&BrokerError::PublishTimeout(timeout));
                false
            }
        }
    }

    /// Current message count of the consumed queue, via a passive declare
    pub async fn queue_depth(&self) -> Option<u32> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        let worker = self.inner.worker.lock().clone()?;
        let result = bounded(
            self.inner.settings.close_timeout,
            "queue depth lookup".to_string(),
            worker.queue_depth(self.inner.settings.queue.clone()),
        )
        .await;
        match result {
            Ok(depth) => Some(depth),
            Err(e) => {
                debug!(queue = %self.inner.settings.queue, "Queue depth lookup failed: {}", e);
                None
            }
        }
    }

    /// Idempotent teardown; the connection can be connected again afterwards
    pub async fn disconnect(&self) {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        let previous = self.set_state(ConnectionState::Disconnected);
        self.release_registration();
        self.teardown_session().await;
        if previous != ConnectionState::Disconnected {
            debug!(queue = %self.inner.settings.queue, "Disconnected");
        }
    }

    /// One-time terminal teardown, safe to race with any lifecycle call
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        if inner.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.shutdown_tx.send_replace(true);
        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }
        inner.reconnect_pending.store(false, Ordering::SeqCst);

        self.disconnect().await;

        let worker = inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown(inner.settings.worker_shutdown_grace).await;
        }
        info!(queue = %inner.settings.queue, "Connection cleaned up");
    }

    fn worker(&self) -> Arc<BrokerWorker> {
        let mut slot = self.inner.worker.lock();
        slot.get_or_insert_with(|| {
            Arc::new(BrokerWorker::spawn(
                format!("broker-{}", self.inner.settings.queue),
                self.inner.factory.clone(),
            ))
        })
        .clone()
    }

    fn release_registration(&self) {
        let inner = &self.inner;
        if inner.registered.swap(false, Ordering::SeqCst) {
            inner
                .registry
                .unregister(&inner.settings.queue, inner.instance_id);
        }
    }

    /// Close pipelines, cancel the consumer and close the transport
    async fn teardown_session(&self) {
        let inner = &self.inner;
        let pipelines = inner.pipelines.lock().take();
        if let Some(pipelines) = pipelines {
            pipelines.close();
        }
        inner.stats.mark_disconnected();

        let consumer_tag = inner.consumer_tag.lock().take();
        inner.consumer_active.store(false, Ordering::SeqCst);

        let worker = inner.worker.lock().clone();
        let Some(worker) = worker else {
            return;
        };

        let close = async {
            if let Some(tag) = consumer_tag {
                if let Err(e) = worker.cancel(tag).await {
                    debug!(queue = %inner.settings.queue, "Consumer cancel failed: {}", e);
                }
            }
            worker.close().await
        };

        match tokio::time::timeout(inner.settings.close_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(queue = %inner.settings.queue, "Transport close failed: {}", e);
            }
            Err(_) => {
                warn!(
                    queue = %inner.settings.queue,
                    timeout = ?inner.settings.close_timeout,
                    "Transport close timed out"
                );
            }
        }
    }

    fn set_state(&self, to: ConnectionState) -> ConnectionState {
        let from = self.inner.state_tx.send_replace(to);
        if from != to {
            HealthMonitor::log_state_transition(&self.inner.settings.queue, from, to);
            let _ = self
                .inner
                .events_tx
                .send(ConnectionEvent::StateChanged { from, to });
        }
        from
    }

    fn emit_error(&self, error: &BrokerError) -> ErrorAnalysis {
        let analysis = ErrorClassifier::analyze(error);
        let _ = self.inner.events_tx.send(ConnectionEvent::Error {
            kind: error.kind(),
            category: analysis.category,
            message: analysis.message.clone(),
        });
        analysis
    }

    /// Count a failure, enter Error, and schedule a reconnect if the category allows it
    fn record_failure(&self, error: &BrokerError) {
        let inner = &self.inner;
        let analysis = self.emit_error(error);
        let failures = inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        error!(
            queue = %inner.settings.queue,
            category = ?analysis.category,
            failures,
            "Broker connection failure: {}",
            analysis.message
        );
        *inner.last_error.lock() = Some(analysis.clone());
        self.set_state(ConnectionState::Error);

        if ErrorClassifier::should_retry(analysis.category, failures) {
            self.schedule_reconnect(ReconnectReason::Backoff, Some(analysis.recommended_delay));
        } else {
            warn!(
                queue = %inner.settings.queue,
                category = ?analysis.category,
                failures,
                "Not retrying this failure category automatically"
            );
            inner.reconnect_abandoned.store(true, Ordering::SeqCst);
            let _ = inner
                .events_tx
                .send(ConnectionEvent::ReconnectAbandoned { failures });
        }
    }

    fn handle_transport_event(&self, session: u64, event: TransportEvent) {
        let inner = &self.inner;
        if session != inner.session.load(Ordering::SeqCst) {
            debug!(queue = %inner.settings.queue, "Ignoring event from a previous session");
            return;
        }
        if self.state() != ConnectionState::Connected {
            debug!(queue = %inner.settings.queue, ?event, "Ignoring transport event while not connected");
            return;
        }

        match event {
            TransportEvent::Shutdown(notice) => {
                if notice.initiated_by_application {
                    debug!(queue = %inner.settings.queue, "Shutdown initiated locally");
                    return;
                }
                if notice.is_clean_closure() {
                    warn!(
                        queue = %inner.settings.queue,
                        reply_text = %notice.reply_text,
                        "Clean broker closure, assuming another consumer took over the queue"
                    );
                    self.set_state(ConnectionState::Disconnected);
                    self.schedule_reconnect(ReconnectReason::ConsumerTakeover, None);
                } else {
                    let error = match notice.reply_code {
                        Some(code) => BrokerError::Protocol {
                            code,
                            message: notice.reply_text,
                        },
                        None => BrokerError::Transport(notice.reply_text),
                    };
                    self.record_failure(&error);
                }
            }
            TransportEvent::ConsumerCancelled(tag) => {
                let current = inner.consumer_tag.lock().clone();
                if current.as_deref() == Some(tag.as_str()) {
                    self.record_failure(&BrokerError::Transport(format!(
                        "consumer {tag} cancelled"
                    )));
                }
            }
        }
    }

    /// Single-flight reconnect scheduling
    fn schedule_reconnect(&self, reason: ReconnectReason, recommended: Option<Duration>) {
        let inner = &self.inner;
        if inner
            .reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(queue = %inner.settings.queue, "Reconnect already pending");
            return;
        }

        let failures = inner.consecutive_failures.load(Ordering::SeqCst);
        let attempt = inner.reconnect_attempts.load(Ordering::SeqCst) + 1;
        let shutdown = *inner.shutdown_tx.borrow();

        match HealthMonitor::should_attempt_reconnection(
            failures,
            attempt,
            &inner.settings.reconnect,
            shutdown,
            reason,
            recommended,
        ) {
            ReconnectionDecision::Proceed { attempt, delay } => {
                inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
                inner.stats.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
                info!(
                    queue = %inner.settings.queue,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    ?reason,
                    "Reconnect scheduled"
                );
                let _ = inner
                    .events_tx
                    .send(ConnectionEvent::ReconnectScheduled { attempt, delay });

                let task = tokio::spawn(run_reconnect(
                    Arc::downgrade(inner),
                    inner.shutdown_tx.subscribe(),
                    attempt,
                    reason,
                    delay,
                ));
                *inner.reconnect_task.lock() = Some(task);
            }
            ReconnectionDecision::AbortShutdownRequested => {
                inner.reconnect_pending.store(false, Ordering::SeqCst);
                debug!(queue = %inner.settings.queue, "Shutdown requested, not reconnecting");
            }
            ReconnectionDecision::AbortCeilingReached { failures } => {
                inner.reconnect_pending.store(false, Ordering::SeqCst);
                inner.reconnect_abandoned.store(true, Ordering::SeqCst);
                error!(
                    queue = %inner.settings.queue,
                    failures,
                    "Consecutive failure ceiling reached, automatic reconnection stopped"
                );
                self.set_state(ConnectionState::Error);
                let _ = inner
                    .events_tx
                    .send(ConnectionEvent::ReconnectAbandoned { failures });
            }
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    what: String,
    operation: impl Future<Output = Result<T, BrokerError>>,
) -> Result<T, BrokerError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(format!("{what} after {limit:?}"))),
    }
}

async fn run_reconnect(
    inner: Weak<ConnectionInner>,
    mut shutdown_rx: watch::Receiver<bool>,
    attempt: u32,
    reason: ReconnectReason,
    delay: Duration,
) {
    let elapsed = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx.wait_for(|stop| *stop) => false,
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let connection = BrokerConnection { inner };

    if !elapsed {
        connection.inner.reconnect_pending.store(false, Ordering::SeqCst);
        debug!(queue = %connection.queue(), "Reconnect cancelled by shutdown");
        return;
    }

    connection.set_state(ConnectionState::Reconnecting);
    connection.disconnect().await;
    connection.inner.reconnect_pending.store(false, Ordering::SeqCst);

    let request = ReconnectRequest {
        queue: connection.queue().to_string(),
        attempt,
        reason,
    };
    if connection.inner.reconnect_tx.try_send(request).is_err() {
        warn!(queue = %connection.queue(), "Owner is not accepting reconnect requests");
    }
}

async fn run_transport_listener(
    mut events: mpsc::Receiver<TransportEvent>,
    inner: Weak<ConnectionInner>,
    session: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        BrokerConnection { inner }.handle_transport_event(session, event);
    }
}

/// Handler calls run one at a time, so ack decisions leave in delivery order
async fn run_inbound(
    mut inbound: mpsc::Receiver<InboundMessage>,
    acks: mpsc::Sender<AckDecision>,
    handler: Arc<dyn MessageHandler>,
    handler_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
    stats: Arc<ConnectionStats>,
) {
    while let Some(message) = inbound.recv().await {
        stats.mark_message();
        let outcome = dispatch_with_timeout(
            handler.as_ref(),
            message.delivery_tag,
            &message.payload,
            handler_timeout,
        )
        .await;

        if outcome == HandlerOutcome::TimedOut {
            ConnectionStats::bump(&stats.handler_timeouts);
            let error = BrokerError::HandlerTimeout(handler_timeout);
            let _ = events.send(ConnectionEvent::Error {
                kind: error.kind(),
                category: ErrorClassifier::categorize(&error),
                message: error.to_string(),
            });
        }

        let decision = AckDecision {
            delivery_tag: message.delivery_tag,
            success: outcome.is_success(),
        };
        if acks.send(decision).await.is_err() {
            debug!("Ack pipeline closed, stopping inbound pipeline");
            break;
        }
    }
}

async fn run_acks(
    mut decisions: mpsc::Receiver<AckDecision>,
    worker: Arc<BrokerWorker>,
    events: broadcast::Sender<ConnectionEvent>,
    stats: Arc<ConnectionStats>,
) {
    while let Some(decision) = decisions.recv().await {
        let _ = events.send(ConnectionEvent::AckDecided {
            delivery_tag: decision.delivery_tag,
            success: decision.success,
        });

        let result = if decision.success {
            worker.ack(decision.delivery_tag).await
        } else {
            worker.nack(decision.delivery_tag, true).await
        };

        match result {
            Ok(()) if decision.success => ConnectionStats::bump(&stats.messages_acked),
            Ok(()) => ConnectionStats::bump(&stats.messages_nacked),
            Err(e) => {
                warn!(
                    delivery_tag = decision.delivery_tag,
                    success = decision.success,
                    "Ack decision not delivered to broker: {}",
                    e
                );
            }
        }
    }
}

async fn run_publishes(
    mut requests: mpsc::Receiver<OutboundPublish>,
    worker: Arc<BrokerWorker>,
    confirmation_queue: String,
    stats: Arc<ConnectionStats>,
) {
    while let Some(request) = requests.recv().await {
        let delivered = match worker
            .publish(confirmation_queue.clone(), request.payload)
            .await
        {
            Ok(()) => {
                ConnectionStats::bump(&stats.publishes_ok);
                true
            }
            Err(e) => {
                ConnectionStats::bump(&stats.publishes_failed);
                warn!(queue = %confirmation_queue, "Publish failed: {}", e);
                false
            }
        };
        let _ = request.reply.send(delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = ConnectionSettings::new("amqp://localhost", "q", "device-1");
        assert_eq!(settings.prefetch, 10);
        assert_eq!(settings.confirmation_queue, DEFAULT_CONFIRMATION_QUEUE);
        assert_eq!(settings.handler_timeout, Duration::from_secs(60));
        assert_eq!(settings.publish_timeout, Duration::from_secs(5));
        assert_eq!(settings.reconnect.max_consecutive_failures, 100);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), BrokerError> = bounded(
            Duration::from_millis(10),
            "waiting".to_string(),
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }
}
