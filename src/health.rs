//! Health check system for production monitoring
//!
//! Provides health check traits and implementations for the broker
//! connection and the retry outbox.

use crate::error::LinkResult;
use crate::resilience::outbox::RetryOutbox;
use crate::transport::amqp::{BrokerConnection, ConnectionState, HealthMonitor};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pending rows above which the outbox reports unhealthy
pub const DEFAULT_OUTBOX_BACKLOG_THRESHOLD: i64 = 1000;

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check on this component
    async fn health_check(&self) -> HealthCheckResult;

    /// Get the component name for reporting
    fn component_name(&self) -> &str;
}

/// Broker connection health: healthy only while connected
pub struct ConnectionHealthCheck {
    connection: BrokerConnection,
}

impl ConnectionHealthCheck {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl HealthCheck for ConnectionHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let component = self.component_name().to_string();

        let state = self.connection.state();
        let failures = self.connection.consecutive_failures();
        let metrics = self.connection.health_metrics();
        let quality = HealthMonitor::assess_connection_quality(&metrics);
        let healthy = state == ConnectionState::Connected;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let message = if healthy {
            format!(
                "Broker connection healthy - queue: {}, uptime: {:?}, quality: {quality:?}",
                self.connection.queue(),
                metrics.uptime.unwrap_or_default()
            )
        } else {
            format!(
                "Broker not connected - queue: {}, state: {state}, consecutive failures: {failures}, reconnects: {}, quality: {quality:?}",
                self.connection.queue(),
                metrics.reconnect_count
            )
        };

        debug!(
            queue = %self.connection.queue(),
            healthy,
            state = %state,
            ?quality,
            response_time_ms,
            "Broker connection health check"
        );

        HealthCheckResult {
            component,
            healthy,
            message: Some(message),
            response_time_ms: Some(response_time_ms),
        }
    }

    fn component_name(&self) -> &str {
        "broker_connection"
    }
}

/// Retry outbox health: readable and not backed up past a threshold
pub struct OutboxHealthCheck {
    outbox: Arc<RetryOutbox>,
    backlog_threshold: i64,
}

impl OutboxHealthCheck {
    pub fn new(outbox: Arc<RetryOutbox>) -> Self {
        Self {
            outbox,
            backlog_threshold: DEFAULT_OUTBOX_BACKLOG_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, backlog_threshold: i64) -> Self {
        self.backlog_threshold = backlog_threshold;
        self
    }
}

#[async_trait]
impl HealthCheck for OutboxHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let component = self.component_name().to_string();

        let (healthy, message) = match self.outbox.size().await {
            Ok(pending) if pending <= self.backlog_threshold => {
                (true, format!("Retry outbox healthy - {pending} pending"))
            }
            Ok(pending) => (
                false,
                format!(
                    "Retry outbox backlog {pending} exceeds {}",
                    self.backlog_threshold
                ),
            ),
            Err(e) => {
                warn!("Retry outbox health check failed: {}", e);
                (false, format!("Retry outbox unreadable: {e}"))
            }
        };

        HealthCheckResult {
            component,
            healthy,
            message: Some(message),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
        }
    }

    fn component_name(&self) -> &str {
        "retry_outbox"
    }
}

/// Aggregated health check manager
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self {
            health_checks: Vec::new(),
        }
    }

    /// Add a health check to the manager
    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    /// Run all health checks and return aggregated results
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.health_checks.len());
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// All components must be healthy for overall health
    pub async fn calculate_overall_health(&self) -> LinkResult<bool> {
        let results = self.run_health_checks().await;

        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return Ok(true);
        }

        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let overall_healthy = healthy_count == results.len();

        debug!(
            "Overall health check: {}/{} components healthy, overall={}",
            healthy_count,
            results.len(),
            overall_healthy
        );

        Ok(overall_healthy)
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new()
    }
}
