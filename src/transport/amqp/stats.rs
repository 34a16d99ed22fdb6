//! Typed per-connection statistics

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Live counters shared between a connection and its pipelines
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub(crate) connection_attempts: AtomicU64,
    pub(crate) successful_connects: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) messages_acked: AtomicU64,
    pub(crate) messages_nacked: AtomicU64,
    pub(crate) handler_timeouts: AtomicU64,
    pub(crate) publishes_ok: AtomicU64,
    pub(crate) publishes_failed: AtomicU64,
    pub(crate) publish_timeouts: AtomicU64,
    pub(crate) reconnects_scheduled: AtomicU32,
    last_success: Mutex<Option<DateTime<Utc>>>,
    connected_since: Mutex<Option<Instant>>,
    last_message: Mutex<Option<Instant>>,
}

/// Serializable copy of [`ConnectionStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub connection_attempts: u64,
    pub successful_connects: u64,
    pub messages_received: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub handler_timeouts: u64,
    pub publishes_ok: u64,
    pub publishes_failed: u64,
    pub publish_timeouts: u64,
    pub reconnects_scheduled: u32,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_connected(&self) {
        Self::bump(&self.successful_connects);
        *self.last_success.lock() = Some(Utc::now());
        *self.connected_since.lock() = Some(Instant::now());
    }

    pub(crate) fn mark_disconnected(&self) {
        *self.connected_since.lock() = None;
    }

    pub(crate) fn mark_message(&self) {
        Self::bump(&self.messages_received);
        *self.last_message.lock() = Some(Instant::now());
    }

    pub fn connected_since(&self) -> Option<Instant> {
        *self.connected_since.lock()
    }

    pub fn last_message(&self) -> Option<Instant> {
        *self.last_message.lock()
    }

    pub fn reconnects_scheduled(&self) -> u32 {
        self.reconnects_scheduled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, consecutive_failures: u32) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            successful_connects: self.successful_connects.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_nacked: self.messages_nacked.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            publishes_ok: self.publishes_ok.load(Ordering::Relaxed),
            publishes_failed: self.publishes_failed.load(Ordering::Relaxed),
            publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            consecutive_failures,
            last_success: *self.last_success.lock(),
        }
    }
}
