//! Mock implementations for testing
//!
//! Provides an in-process broker transport and a scriptable message handler
//! so connection lifecycle and pipelines can be exercised without a broker.

use crate::transport::amqp::MessageHandler;
use crate::transport::{
    BrokerError, BrokerTransport, ConnectionParams, Envelope, InboundMessage, QueueOptions,
    ShutdownNotice, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub type PublishedMessage = (String, Vec<u8>);

/// Everything the mock broker has been asked to do, plus failure knobs
///
/// Shared by every transport a [`MockTransportFactory`] creates, so tests
/// observe the whole history of a connection across reconnects.
#[derive(Debug, Default)]
pub struct MockBrokerState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    last_params: Mutex<Option<ConnectionParams>>,
    prefetch: Mutex<Option<u16>>,
    declared_queues: Mutex<Vec<(String, QueueOptions)>>,
    consumers: Mutex<Vec<(String, String)>>,
    cancels: Mutex<Vec<String>>,
    acks: Mutex<Vec<u64>>,
    nacks: Mutex<Vec<(u64, bool)>>,
    publishes: Mutex<Vec<PublishedMessage>>,
    queue_depth: AtomicU32,
    fail_open: Mutex<Option<BrokerError>>,
    fail_consume: AtomicBool,
    fail_publish: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    publish_delay: Mutex<Option<Duration>>,
    deliveries: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockBrokerState {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<ConnectionParams> {
        self.last_params.lock().clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        *self.prefetch.lock()
    }

    pub fn declared_queues(&self) -> Vec<(String, QueueOptions)> {
        self.declared_queues.lock().clone()
    }

    /// `(queue, consumer_tag)` for every consume call that succeeded
    pub fn consumers(&self) -> Vec<(String, String)> {
        self.consumers.lock().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().clone()
    }

    /// `(delivery_tag, requeue)`
    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.nacks.lock().clone()
    }

    pub fn publishes(&self) -> Vec<PublishedMessage> {
        self.publishes.lock().clone()
    }

    pub fn set_queue_depth(&self, depth: u32) {
        self.queue_depth.store(depth, Ordering::SeqCst);
    }

    /// Every open fails with `error` until cleared with `None`
    pub fn set_fail_open(&self, error: Option<BrokerError>) {
        *self.fail_open.lock() = error;
    }

    pub fn set_fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }

    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.publish_delay.lock() = delay;
    }

    /// Push a delivery to the live consumer; false when there is none
    pub async fn deliver(&self, delivery_tag: u64, payload: &str) -> bool {
        let sender = self.deliveries.lock().clone();
        let Some(sender) = sender else {
            return false;
        };
        sender
            .send(InboundMessage {
                payload: payload.as_bytes().to_vec(),
                delivery_tag,
                envelope: Envelope {
                    routing_key: "mock".to_string(),
                    ..Envelope::default()
                },
            })
            .await
            .is_ok()
    }

    /// Simulate the broker ending the session
    pub async fn emit_shutdown(&self, notice: ShutdownNotice) -> bool {
        self.emit(TransportEvent::Shutdown(notice)).await
    }

    /// Simulate the broker cancelling a consumer
    pub async fn emit_consumer_cancelled(&self, consumer_tag: &str) -> bool {
        self.emit(TransportEvent::ConsumerCancelled(consumer_tag.to_string()))
            .await
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.events.lock().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }
}

/// Mock transport recording into a shared [`MockBrokerState`]
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<MockBrokerState>,
    open: bool,
}

impl MockTransport {
    pub fn new(state: Arc<MockBrokerState>) -> Self {
        Self { state, open: false }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open {
            Ok(())
        } else {
            Err(BrokerError::Transport("mock transport is not open".to_string()))
        }
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn open(
        &mut self,
        params: &ConnectionParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BrokerError> {
        let delay = *self.state.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.state.fail_open.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        self.state.opens.fetch_add(1, Ordering::SeqCst);
        *self.state.last_params.lock() = Some(params.clone());
        *self.state.events.lock() = Some(events);
        self.open = true;
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        *self.state.prefetch.lock() = Some(count);
        Ok(())
    }

    async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<u32, BrokerError> {
        self.ensure_open()?;
        if !options.passive {
            self.state
                .declared_queues
                .lock()
                .push((name.to_string(), options));
        }
        Ok(self.state.queue_depth.load(Ordering::SeqCst))
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.state.fail_consume.load(Ordering::SeqCst) {
            return Err(BrokerError::Protocol {
                code: 404,
                message: format!("NOT_FOUND - no queue '{queue}'"),
            });
        }
        self.state
            .consumers
            .lock()
            .push((queue.to_string(), consumer_tag.to_string()));
        *self.state.deliveries.lock() = Some(deliveries);
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.acks.lock().push(delivery_tag);
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.nacks.lock().push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let delay = *self.state.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("publish nacked by mock broker".to_string()));
        }
        self.state
            .publishes
            .lock()
            .push((queue.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.cancels.lock().push(consumer_tag.to_string());
        *self.state.deliveries.lock() = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.open {
            self.open = false;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            *self.state.deliveries.lock() = None;
            *self.state.events.lock() = None;
        }
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s over one shared state
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    state: Arc<MockBrokerState>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<MockBrokerState> {
        self.state.clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Box<dyn BrokerTransport> {
        Box::new(MockTransport::new(self.state.clone()))
    }
}

/// Handler whose verdict and latency are set by the test
#[derive(Debug)]
pub struct MockHandler {
    succeed: AtomicBool,
    delay: Mutex<Option<Duration>>,
    handled: Mutex<Vec<String>>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self {
            succeed: AtomicBool::new(true),
            delay: Mutex::new(None),
            handled: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let handler = Self::new();
        handler.set_result(false);
        handler
    }

    pub fn with_delay(delay: Duration) -> Self {
        let handler = Self::new();
        handler.set_delay(Some(delay));
        handler
    }

    pub fn set_result(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Messages the handler has started, in arrival order
    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().clone()
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for MockHandler {
    async fn handle(&self, message: &str) -> bool {
        self.handled.lock().push(message.to_string());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.succeed.load(Ordering::SeqCst)
    }
}
