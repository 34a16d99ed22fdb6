//! Failure classification and retry pacing
//!
//! Every retry decision in the crate goes through [`ErrorClassifier`]: the
//! connection's reconnect scheduling and the supervisor's retry pacing both
//! use [`ErrorClassifier::calculate_backoff`].

use crate::error::sanitize_error_message;
use crate::transport::amqp::connection::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static NETWORK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)connection refused|unreachable|no route to host|network is down|dns|failed to lookup|name resolution|unknown host|connection reset|broken pipe|unexpected eof|connection aborted",
    )
    .expect("network pattern is valid")
});

static TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)timed out|timeout|deadline").expect("timeout pattern is valid"));

static AUTH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)access_refused|access refused|authentication|not_allowed|login refused|invalid credentials")
        .expect("auth pattern is valid")
});

static QUOTA_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)quota").expect("quota pattern is valid"));

static RATE_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate.?limit|too many (requests|connections)|throttl")
        .expect("rate limit pattern is valid")
});

/// Failure category driving retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NetworkUnreachable,
    AuthFailure,
    ProtocolError,
    Timeout,
    QuotaExceeded,
    RateLimited,
    Unknown,
}

/// Classification result for one failure
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub recommended_delay: Duration,
    pub should_reset_connection: bool,
    pub should_check_network: bool,
    pub message: String,
}

/// Pure failure classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Ceiling applied by [`Self::calculate_backoff`]
    pub const MAX_BACKOFF_MS: u64 = 300_000;

    /// Classify a broker failure
    pub fn analyze(error: &BrokerError) -> ErrorAnalysis {
        let category = Self::categorize(error);
        let (recommended_delay, should_reset_connection, should_check_network) = match category {
            ErrorCategory::NetworkUnreachable => (Duration::from_secs(5), true, true),
            ErrorCategory::AuthFailure => (Duration::from_secs(60), true, false),
            ErrorCategory::ProtocolError => (Duration::from_secs(10), true, false),
            ErrorCategory::Timeout => (Duration::from_secs(3), true, true),
            ErrorCategory::QuotaExceeded => (Duration::from_secs(3600), true, false),
            ErrorCategory::RateLimited => (Duration::from_secs(60), true, false),
            ErrorCategory::Unknown => (Duration::from_secs(5), true, false),
        };

        ErrorAnalysis {
            category,
            recommended_delay,
            should_reset_connection,
            should_check_network,
            message: sanitize_error_message(&error.to_string()),
        }
    }

    /// Category for a broker failure, falling back to its text
    pub fn categorize(error: &BrokerError) -> ErrorCategory {
        match error {
            BrokerError::NetworkUnsuitable => ErrorCategory::NetworkUnreachable,
            BrokerError::Authentication(_) => ErrorCategory::AuthFailure,
            BrokerError::Timeout(_)
            | BrokerError::HandlerTimeout(_)
            | BrokerError::PublishTimeout(_) => ErrorCategory::Timeout,
            BrokerError::QuotaExceeded(_) => ErrorCategory::QuotaExceeded,
            BrokerError::RateLimited(_) => ErrorCategory::RateLimited,
            BrokerError::Protocol { code: 403, .. } => ErrorCategory::AuthFailure,
            BrokerError::Protocol { message, .. } => match Self::categorize_text(message) {
                ErrorCategory::Unknown => ErrorCategory::ProtocolError,
                category => category,
            },
            BrokerError::InvalidBrokerUrl(_) | BrokerError::RegistryConflict(_) => {
                ErrorCategory::ProtocolError
            }
            BrokerError::Transport(message) => match Self::categorize_text(message) {
                ErrorCategory::Unknown => ErrorCategory::NetworkUnreachable,
                category => category,
            },
            BrokerError::NotConnected { .. } | BrokerError::WorkerUnavailable => {
                ErrorCategory::Unknown
            }
        }
    }

    /// Category inferred from failure text alone
    pub fn categorize_text(message: &str) -> ErrorCategory {
        if QUOTA_PATTERN.is_match(message) {
            ErrorCategory::QuotaExceeded
        } else if RATE_LIMIT_PATTERN.is_match(message) {
            ErrorCategory::RateLimited
        } else if AUTH_PATTERN.is_match(message) {
            ErrorCategory::AuthFailure
        } else if TIMEOUT_PATTERN.is_match(message) {
            ErrorCategory::Timeout
        } else if NETWORK_PATTERN.is_match(message) {
            ErrorCategory::NetworkUnreachable
        } else {
            ErrorCategory::Unknown
        }
    }

    /// Whether attempt number `attempt` (1-based) should still be retried
    pub fn should_retry(category: ErrorCategory, attempt: u32) -> bool {
        let limit = match category {
            ErrorCategory::AuthFailure => 3,
            ErrorCategory::QuotaExceeded => 5,
            ErrorCategory::ProtocolError => 10,
            ErrorCategory::Unknown => 20,
            ErrorCategory::NetworkUnreachable
            | ErrorCategory::Timeout
            | ErrorCategory::RateLimited => 100,
        };
        attempt < limit
    }

    /// Exponential backoff in milliseconds, capped at [`Self::MAX_BACKOFF_MS`]
    pub fn calculate_backoff(base_ms: u64, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        base_ms
            .saturating_mul(1u64 << exponent)
            .min(Self::MAX_BACKOFF_MS)
    }

    /// [`Self::calculate_backoff`] over `Duration`
    pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(Self::calculate_backoff(base_ms, attempt))
    }
}
