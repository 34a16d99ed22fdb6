//! Pure health monitoring and reconnection logic for broker connections
//!
//! This module contains pure functions for reconnection decisions, state
//! transition logging, and connection health metrics.

use super::connection::ConnectionState;
use crate::resilience::error_classifier::ErrorClassifier;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Reconnection pacing for one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Base delay fed into the shared backoff function
    pub base_delay: Duration,
    /// Consecutive failures after which automatic reconnection stops
    pub max_consecutive_failures: u32,
    /// Delay used after a clean closure, read as another consumer taking over
    pub takeover_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_consecutive_failures: 100,
            takeover_delay: Duration::from_secs(30),
        }
    }
}

/// Why a reconnect is being considered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Ordinary failure; use exponential backoff
    Backoff,
    /// Clean closure; wait out the other consumer
    ConsumerTakeover,
}

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if a reconnect should be scheduled (pure function)
    ///
    /// `recommended` is the classifier's floor for the failure that caused
    /// this reconnect; the scheduled delay never undercuts it.
    pub fn should_attempt_reconnection(
        consecutive_failures: u32,
        attempt: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
        reason: ReconnectReason,
        recommended: Option<Duration>,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if consecutive_failures >= policy.max_consecutive_failures {
            return ReconnectionDecision::AbortCeilingReached {
                failures: consecutive_failures,
            };
        }

        let delay = match reason {
            ReconnectReason::ConsumerTakeover => policy.takeover_delay,
            ReconnectReason::Backoff => {
                let backoff = ErrorClassifier::backoff_delay(policy.base_delay, attempt.max(1));
                backoff.max(recommended.unwrap_or(Duration::ZERO))
            }
        };

        ReconnectionDecision::Proceed { attempt, delay }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: uptime.is_some(),
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(queue: &str, from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(queue, "Broker connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(queue, "Broker connection closed");
            }
            (ConnectionState::Connected, ConnectionState::Error) => {
                warn!(queue, "Broker connection lost");
            }
            (_, ConnectionState::Reconnecting) => {
                info!(queue, "Tearing down connection for reconnect");
            }
            (_, ConnectionState::Error) => {
                error!(queue, from = %from, "Broker connection failed");
            }
            _ => {
                info!(queue, "Broker connection state: {} -> {}", from, to);
            }
        }
    }

    /// Assess connection quality based on metrics (pure function)
    ///
    /// Idle consumers are normal here, so quality depends on uptime and
    /// reconnect churn only.
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,
            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Schedule a reconnect after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - consecutive-failure ceiling reached
    AbortCeilingReached { failures: u32 },
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Time since connection established
    pub uptime: Option<Duration>,
    /// Time since last delivery was received
    pub time_since_last_message: Option<Duration>,
    /// Reconnects scheduled over the connection's lifetime
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

/// Connection quality assessment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}
