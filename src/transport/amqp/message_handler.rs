//! Handler seam and pipeline message types
//!
//! The inbound pipeline decodes each delivery, calls the application
//! handler under a deadline, and turns the outcome into an [`AckDecision`].

use async_trait::async_trait;
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Application callback for decoded deliveries
///
/// Returning `false` (or not returning within the handler timeout) leads to
/// a nack with requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &str) -> bool;
}

/// Ack pipeline input, consumed exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckDecision {
    pub delivery_tag: u64,
    pub success: bool,
}

/// Publish pipeline input, consumed exactly once
#[derive(Debug)]
pub struct OutboundPublish {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<bool>,
}

/// How one delivery's handling ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Delivered,
    Rejected,
    TimedOut,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Delivered)
    }
}

/// Decode a delivery body as text, replacing invalid UTF-8
pub fn decode_payload(payload: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(payload)
}

/// Run the handler for one delivery, treating a missed deadline as failure
pub async fn dispatch_with_timeout(
    handler: &dyn MessageHandler,
    delivery_tag: u64,
    payload: &[u8],
    timeout: Duration,
) -> HandlerOutcome {
    let message = decode_payload(payload);
    match tokio::time::timeout(timeout, handler.handle(&message)).await {
        Ok(true) => {
            debug!(delivery_tag, "Handler accepted delivery");
            HandlerOutcome::Delivered
        }
        Ok(false) => {
            debug!(delivery_tag, "Handler rejected delivery");
            HandlerOutcome::Rejected
        }
        Err(_) => {
            warn!(delivery_tag, ?timeout, "Handler timed out");
            HandlerOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(bool);

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _message: &str) -> bool {
            self.0
        }
    }

    struct Stuck;

    #[async_trait]
    impl MessageHandler for Stuck {
        async fn handle(&self, _message: &str) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    #[test]
    fn test_decode_payload_is_lossy() {
        assert_eq!(decode_payload(b"hello"), "hello");
        assert_eq!(decode_payload(&[0x68, 0xff]), "h\u{fffd}");
    }

    #[tokio::test]
    async fn test_dispatch_outcomes() {
        let ok = dispatch_with_timeout(&Echo(true), 1, b"{}", Duration::from_secs(1)).await;
        assert_eq!(ok, HandlerOutcome::Delivered);
        let rejected = dispatch_with_timeout(&Echo(false), 2, b"{}", Duration::from_secs(1)).await;
        assert_eq!(rejected, HandlerOutcome::Rejected);
        assert!(!rejected.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let outcome = dispatch_with_timeout(&Stuck, 3, b"{}", Duration::from_secs(60)).await;
        assert_eq!(outcome, HandlerOutcome::TimedOut);
    }
}
