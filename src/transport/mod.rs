//! Transport layer for the broker link
//!
//! This module provides the broker client abstraction and its AMQP
//! implementation. Everything above this seam talks to the broker only
//! through [`BrokerTransport`], and only from the connection's dedicated
//! broker worker.

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod amqp;

pub use amqp::connection::{BrokerError, ConnectionParams};

/// Queue declaration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Only inspect the queue; fail if it does not exist
    pub passive: bool,
}

impl QueueOptions {
    /// Durable, non-exclusive, non-auto-delete
    pub fn durable_shared() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
        }
    }

    /// Passive declaration used for queue metadata lookups
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Self::durable_shared()
        }
    }
}

/// Envelope metadata that travels with a delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
}

/// A delivery handed from the broker to the inbound pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub envelope: Envelope,
}

/// Why the broker session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotice {
    pub reply_code: Option<u16>,
    pub reply_text: String,
    pub hard_error: bool,
    pub initiated_by_application: bool,
}

impl ShutdownNotice {
    pub const NORMAL_CLOSURE: u16 = 200;

    /// Normal-closure shutdown, read as "another consumer took over the queue"
    ///
    /// This is a heuristic keyed on one broker's closure code and reply text.
    /// A hard error is never clean, whatever code it carries.
    pub fn is_clean_closure(&self) -> bool {
        !self.hard_error
            && (self.reply_code == Some(Self::NORMAL_CLOSURE)
                || self
                    .reply_text
                    .to_ascii_lowercase()
                    .contains("clean connection shutdown"))
    }
}

/// Asynchronous notifications from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection or channel was shut down
    Shutdown(ShutdownNotice),
    /// The consumer with this tag stopped receiving deliveries
    ConsumerCancelled(String),
}

/// Broker client seam
///
/// Implementations are not required to be safe for concurrent use: a
/// `BrokerConnection` only ever drives one through its broker worker.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Establish transport and channel
    async fn open(
        &mut self,
        params: &ConnectionParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries in flight
    async fn set_prefetch(&mut self, count: u16) -> Result<(), BrokerError>;

    /// Declare a queue, returning its current message count
    async fn declare_queue(&mut self, name: &str, options: QueueOptions)
    -> Result<u32, BrokerError>;

    /// Register a consumer whose deliveries are pushed into `deliveries`
    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        deliveries: mpsc::Sender<InboundMessage>,
    ) -> Result<(), BrokerError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Publish a persistent message routed to `queue`, waiting for the broker confirm
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Close channel and transport
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Creates a fresh transport for each connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn BrokerTransport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(code: Option<u16>, text: &str, hard: bool) -> ShutdownNotice {
        ShutdownNotice {
            reply_code: code,
            reply_text: text.to_string(),
            hard_error: hard,
            initiated_by_application: false,
        }
    }

    #[test]
    fn test_clean_closure_by_code() {
        assert!(notice(Some(200), "OK", false).is_clean_closure());
        assert!(!notice(Some(320), "CONNECTION_FORCED", true).is_clean_closure());
        assert!(!notice(None, "connection reset by peer", true).is_clean_closure());
    }

    #[test]
    fn test_clean_closure_by_reply_text() {
        assert!(notice(None, "clean connection shutdown; reply-code=200", false).is_clean_closure());
    }

    #[test]
    fn test_hard_error_is_never_clean() {
        assert!(!notice(Some(200), "OK", true).is_clean_closure());
        assert!(!notice(None, "clean connection shutdown; reply-code=200", true).is_clean_closure());
    }

    #[test]
    fn test_queue_options() {
        let options = QueueOptions::durable_shared();
        assert!(options.durable && !options.exclusive && !options.auto_delete);
        assert!(QueueOptions::passive().passive);
    }
}
