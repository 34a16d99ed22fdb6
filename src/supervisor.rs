//! Connection owner
//!
//! [`ConnectionSupervisor`] sits above one [`BrokerConnection`]. It gates
//! every connect on usage limits and connectivity, answers the connection's
//! reconnect requests, counts traffic in the [`UsageGovernor`], and replays
//! the [`RetryOutbox`] whenever the connection is up.

use crate::error::LinkResult;
use crate::protocol::DeliveryConfirmation;
use crate::resilience::network::NetworkMonitor;
use crate::resilience::outbox::{RetryOutbox, DEFAULT_BATCH_SIZE, DEFAULT_MAX_AGE};
use crate::resilience::usage::UsageGovernor;
use crate::transport::amqp::{
    BrokerConnection, ConnectionEvent, ConnectionState, ErrorKind, MessageHandler,
    ReconnectRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// Supervisor pacing
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// How long a gated connect waits for connectivity before trying anyway
    pub network_wait: Duration,
    pub outbox_batch_size: i64,
    pub outbox_retry_interval: Duration,
    pub outbox_sweep_interval: Duration,
    pub outbox_max_age: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            network_wait: Duration::from_secs(30),
            outbox_batch_size: DEFAULT_BATCH_SIZE,
            outbox_retry_interval: Duration::from_secs(30),
            outbox_sweep_interval: Duration::from_secs(6 * 60 * 60),
            outbox_max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Result of one gated connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The connection refused or failed; it schedules its own retry when allowed
    Failed,
    /// Usage limits refused the attempt; try again after the delay
    Deferred(Duration),
    ShuttingDown,
}

/// Counts every delivery against the daily message quota
struct CountingHandler {
    inner: Arc<dyn MessageHandler>,
    governor: Arc<UsageGovernor>,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, message: &str) -> bool {
        self.governor.record_message();
        self.inner.handle(message).await
    }
}

struct Receivers {
    reconnects: mpsc::Receiver<ReconnectRequest>,
    events: broadcast::Receiver<ConnectionEvent>,
}

/// Owner of one broker connection
pub struct ConnectionSupervisor {
    connection: BrokerConnection,
    handler: Arc<dyn MessageHandler>,
    governor: Arc<UsageGovernor>,
    outbox: Arc<RetryOutbox>,
    network: Arc<NetworkMonitor>,
    settings: SupervisorSettings,
    receivers: Mutex<Option<Receivers>>,
    shutdown_tx: watch::Sender<bool>,
    /// True while this connection is counted as active in the governor
    counted_active: AtomicBool,
    deferred_start: Mutex<Option<Duration>>,
}

impl ConnectionSupervisor {
    pub fn new(
        connection: BrokerConnection,
        reconnects: mpsc::Receiver<ReconnectRequest>,
        handler: Arc<dyn MessageHandler>,
        governor: Arc<UsageGovernor>,
        outbox: Arc<RetryOutbox>,
        network: Arc<NetworkMonitor>,
        settings: SupervisorSettings,
    ) -> Self {
        let events = connection.subscribe_events();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handler: Arc::new(CountingHandler {
                inner: handler,
                governor: governor.clone(),
            }),
            connection,
            governor,
            outbox,
            network,
            settings,
            receivers: Mutex::new(Some(Receivers { reconnects, events })),
            shutdown_tx,
            counted_active: AtomicBool::new(false),
            deferred_start: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn governor(&self) -> &Arc<UsageGovernor> {
        &self.governor
    }

    pub fn outbox(&self) -> &Arc<RetryOutbox> {
        &self.outbox
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// First gated connect; a deferral is picked up again by [`Self::run`]
    pub async fn start(&self) -> ConnectOutcome {
        info!(queue = %self.connection.queue(), "Starting broker link");
        let outcome = self.gated_connect().await;
        if let ConnectOutcome::Deferred(delay) = outcome {
            *self.deferred_start.lock() = Some(delay);
        }
        outcome
    }

    /// Usage gate, bounded wait for network, then connect
    async fn gated_connect(&self) -> ConnectOutcome {
        if self.is_shutting_down() {
            return ConnectOutcome::ShuttingDown;
        }

        if let Err(e) = self.governor.check_connection() {
            let delay = self.governor.get_retry_delay();
            warn!(
                queue = %self.connection.queue(),
                retry_in_ms = delay.as_millis() as u64,
                "Connection attempt deferred: {}",
                e
            );
            return ConnectOutcome::Deferred(delay);
        }

        if !self.network.is_suitable() {
            info!(
                queue = %self.connection.queue(),
                timeout = ?self.settings.network_wait,
                "Waiting for network before connecting"
            );
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::select! {
                _ = self.network.wait_for_network(self.settings.network_wait) => {}
                _ = wait_for_shutdown(&mut shutdown) => return ConnectOutcome::ShuttingDown,
            }
        }

        // A session that ended without us seeing it still holds a slot
        self.release_active_slot();

        if self.connection.connect(self.handler.clone()).await {
            self.governor.record_connection();
            self.counted_active.store(true, Ordering::SeqCst);
            ConnectOutcome::Connected
        } else {
            ConnectOutcome::Failed
        }
    }

    fn release_active_slot(&self) {
        if self.counted_active.swap(false, Ordering::SeqCst) {
            self.governor.record_disconnection();
        }
    }

    /// Relay a confirmation, parking it in the outbox if it is not confirmed
    ///
    /// Returns true when the broker confirmed it directly.
    pub async fn send_confirmation(&self, confirmation: &DeliveryConfirmation) -> LinkResult<bool> {
        let payload = confirmation.to_json()?;
        Ok(self.send_message(&payload).await)
    }

    /// Relay a raw payload, parking it in the outbox if it is not confirmed
    pub async fn send_message(&self, payload: &str) -> bool {
        if self.connection.publish_to_sync_success(payload).await {
            return true;
        }
        if self.outbox.enqueue(payload).await.is_none() {
            warn!(queue = %self.connection.queue(), "Confirmation lost: publish failed and outbox unavailable");
        }
        false
    }

    /// Replay parked messages oldest-first; stops at the first failure
    ///
    /// Returns how many rows were delivered.
    pub async fn drain_outbox(&self) -> usize {
        if self.governor.is_rate_limited() {
            debug!("Outbox drain skipped while rate limited");
            return 0;
        }
        if self.connection.state() != ConnectionState::Connected {
            return 0;
        }

        let batch = match self.outbox.pending_batch(self.settings.outbox_batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Failed to read retry outbox: {}", e);
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for record in batch {
            if !self.connection.publish_to_sync_success(&record.message).await {
                self.outbox.increment_retry_count(record.id).await;
                debug!(id = record.id, "Outbox replay stopped at first failed publish");
                break;
            }
            match self.outbox.mark_processed(record.id).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(id = record.id, "Delivered outbox row not marked processed: {}", e);
                }
            }
        }

        if delivered > 0 {
            info!(delivered, "Replayed messages from retry outbox");
        }
        delivered
    }

    async fn sweep_outbox(&self) {
        if let Err(e) = self.outbox.sweep(self.settings.outbox_max_age).await {
            warn!("Retry outbox sweep failed: {}", e);
        }
    }

    /// Event loop; returns after [`Self::shutdown`]
    ///
    /// Only the first call runs; later calls return immediately.
    pub async fn run(&self) {
        let receivers = self.receivers.lock().take();
        let Some(Receivers {
            mut reconnects,
            mut events,
        }) = receivers
        else {
            warn!("Supervisor loop already running");
            return;
        };

        let span = crate::lifecycle_span!(queue = %self.connection.queue());
        async move {
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut network = self.network.subscribe();
            let mut was_online = network.borrow().connected;
            let mut state = self.connection.subscribe_state();

            let mut drain = tokio::time::interval_at(
                Instant::now() + self.settings.outbox_retry_interval,
                self.settings.outbox_retry_interval,
            );
            drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweep = tokio::time::interval(self.settings.outbox_sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let retry = tokio::time::sleep(Duration::ZERO);
            tokio::pin!(retry);
            let mut retry_armed = false;
            let deferred = self.deferred_start.lock().take();
            if let Some(delay) = deferred {
                retry.as_mut().reset(Instant::now() + delay);
                retry_armed = true;
            }

            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,

                    Some(request) = reconnects.recv() => {
                        let delay = self.governor.get_retry_delay();
                        info!(
                            attempt = request.attempt,
                            reason = ?request.reason,
                            delay_ms = delay.as_millis() as u64,
                            "Reconnect requested"
                        );
                        retry.as_mut().reset(Instant::now() + delay);
                        retry_armed = true;
                    }

                    _ = &mut retry, if retry_armed => {
                        retry_armed = false;
                        match self.gated_connect().await {
                            ConnectOutcome::Deferred(delay) => {
                                retry.as_mut().reset(Instant::now() + delay);
                                retry_armed = true;
                            }
                            ConnectOutcome::Connected => {
                                self.drain_outbox().await;
                            }
                            ConnectOutcome::Failed | ConnectOutcome::ShuttingDown => {}
                        }
                    }

                    Ok(()) = network.changed() => {
                        let online = network.borrow_and_update().connected;
                        let regained = online && !was_online;
                        was_online = online;
                        if regained && self.needs_connect() {
                            info!("Network regained, clearing failure ceiling and reconnecting");
                            self.connection.reset_failure_count();
                            retry.as_mut().reset(Instant::now());
                            retry_armed = true;
                        }
                    }

                    Ok(()) = state.changed() => {
                        let current = *state.borrow_and_update();
                        if current != ConnectionState::Connected {
                            self.release_active_slot();
                        }
                    }

                    event = events.recv() => match event {
                        Ok(event) => self.observe_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Supervisor lagged behind connection events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    },

                    _ = drain.tick() => {
                        let span = crate::outbox_span!(operation = "drain");
                        self.drain_outbox().instrument(span).await;
                    }

                    _ = sweep.tick() => {
                        let span = crate::outbox_span!(operation = "sweep");
                        self.sweep_outbox().instrument(span).await;
                    }
                }
            }
            debug!("Supervisor loop stopped");
        }
        .instrument(span)
        .await
    }

    /// Not connected and nothing already on its way to connecting
    fn needs_connect(&self) -> bool {
        !matches!(
            self.connection.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) && !self.connection.is_reconnect_pending()
    }

    fn observe_event(&self, event: ConnectionEvent) {
        if let ConnectionEvent::Error { kind, message, .. } = event {
            // Per-message timeouts say nothing about the broker session
            if !matches!(
                kind,
                ErrorKind::HandlerTimeout | ErrorKind::PublishTimeout | ErrorKind::RegistryConflict
            ) {
                self.governor.record_error(&message);
            }
        }
    }

    /// Stop the loop and tear the connection down for good
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(queue = %self.connection.queue(), "Shutting down broker link");
        self.connection.cleanup().await;
        self.release_active_slot();
        self.governor.flush().await;
    }
}

/// Resolves once shutdown is requested or the sender is gone
///
/// Returns `()` so no `watch::Ref` ends up in a `select!` output.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
