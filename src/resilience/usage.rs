//! Broker usage quotas and rate-limit backoff
//!
//! [`UsageGovernor`] keeps daily connection/message counters, an hourly
//! error counter, and a rate-limit backoff that grows whenever the broker
//! answers with quota or throttling language. Counters are persisted through
//! a [`UsageStore`] so limits survive process restarts.
//!
//! Store writes never happen under the counter lock. Inside a tokio runtime
//! they run on the blocking pool, and a burst of updates collapses into one
//! write of the latest counters.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::amqp::connection::BrokerError;

static RATE_LIMIT_PHRASES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)rate.?limit|too many (requests|connections)|throttl|quota|limit exceeded|connection limit|resource_locked",
    )
    .expect("rate limit phrases are valid")
});

static QUOTA_EXCEEDED_PHRASES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)quota.{0,20}exceeded|exceeded.{0,20}quota|over quota")
        .expect("quota phrases are valid")
});

/// Usage persistence errors
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Failed to access usage state: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode usage state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Thresholds enforced by the governor
#[derive(Debug, Clone, PartialEq)]
pub struct UsageLimits {
    pub max_daily_connections: u32,
    pub max_concurrent_connections: u32,
    pub max_daily_messages: u64,
    /// Fraction of a limit at which a one-time warning is logged
    pub warning_ratio: f64,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub quota_backoff: Duration,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            max_daily_connections: 1000,
            max_concurrent_connections: 2,
            max_daily_messages: 100_000,
            warning_ratio: 0.8,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            quota_backoff: Duration::from_secs(3600),
        }
    }
}

/// Persisted windowed counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub day: NaiveDate,
    /// Start of the current hourly window
    pub hour: DateTime<Utc>,
    pub daily_connections: u32,
    pub daily_messages: u64,
    pub hourly_errors: u32,
    pub backoff_ms: u64,
    pub rate_limited_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connection_warning_sent: bool,
    #[serde(default)]
    pub message_warning_sent: bool,
}

impl UsageCounters {
    fn fresh(now: DateTime<Utc>, floor: Duration) -> Self {
        Self {
            day: now.date_naive(),
            hour: hour_start(now),
            daily_connections: 0,
            daily_messages: 0,
            hourly_errors: 0,
            backoff_ms: duration_ms(floor),
            rate_limited_until: None,
            connection_warning_sent: false,
            message_warning_sent: false,
        }
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub daily_connections: u32,
    pub active_connections: u32,
    pub daily_messages: u64,
    pub hourly_errors: u32,
    pub backoff_ms: u64,
    pub rate_limited_until: Option<DateTime<Utc>>,
}

/// Where counters are persisted
pub trait UsageStore: Send + Sync {
    fn load(&self) -> Result<Option<UsageCounters>, UsageError>;
    fn save(&self, counters: &UsageCounters) -> Result<(), UsageError>;
}

/// JSON document on disk, replaced atomically on every save
pub struct JsonFileUsageStore {
    path: PathBuf,
}

impl JsonFileUsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UsageStore for JsonFileUsageStore {
    fn load(&self) -> Result<Option<UsageCounters>, UsageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, counters: &UsageCounters) -> Result<(), UsageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(counters)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryUsageStore {
    counters: Mutex<Option<UsageCounters>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageStore for MemoryUsageStore {
    fn load(&self) -> Result<Option<UsageCounters>, UsageError> {
        Ok(self.counters.lock().clone())
    }

    fn save(&self, counters: &UsageCounters) -> Result<(), UsageError> {
        *self.counters.lock() = Some(counters.clone());
        Ok(())
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Stages counter snapshots and writes them to the store
struct UsageWriter {
    store: Arc<dyn UsageStore>,
    /// Latest snapshot not yet written; newer snapshots replace it
    pending: Mutex<Option<UsageCounters>>,
    /// Serializes saves so an older snapshot never lands after a newer one
    saving: Mutex<()>,
    /// A background drain is scheduled or running
    draining: AtomicBool,
}

impl UsageWriter {
    fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(None),
            saving: Mutex::new(()),
            draining: AtomicBool::new(false),
        }
    }

    /// Replace the staged snapshot; call with the counter lock held to keep order
    fn stage(&self, counters: &UsageCounters) {
        *self.pending.lock() = Some(counters.clone());
    }

    /// Write staged counters, on the blocking pool when a runtime is available
    fn schedule(self: &Arc<Self>) {
        if self.pending.lock().is_none() {
            return;
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let writer = self.clone();
                runtime.spawn_blocking(move || writer.drain());
            }
            Err(_) => self.drain(),
        }
    }

    fn drain(&self) {
        loop {
            self.write_pending();
            self.draining.store(false, Ordering::SeqCst);

            // A snapshot staged after our last take but before the flag cleared
            if self.pending.lock().is_none()
                || self
                    .draining
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                return;
            }
        }
    }

    fn write_pending(&self) {
        let _serial = self.saving.lock();
        let next = self.pending.lock().take();
        if let Some(counters) = next {
            if let Err(e) = self.store.save(&counters) {
                warn!("Failed to persist usage counters: {}", e);
            }
        }
    }
}

/// Tracks usage against quotas and paces retries after rate limiting
pub struct UsageGovernor {
    limits: UsageLimits,
    writer: Arc<UsageWriter>,
    counters: Mutex<UsageCounters>,
    active_connections: AtomicU32,
    clock: Clock,
}

impl UsageGovernor {
    pub fn new(limits: UsageLimits, store: Arc<dyn UsageStore>) -> Self {
        Self::with_clock(limits, store, Arc::new(Utc::now))
    }

    /// Governor reading time from `clock`
    pub fn with_clock(limits: UsageLimits, store: Arc<dyn UsageStore>, clock: Clock) -> Self {
        let now = clock();
        let counters = match store.load() {
            Ok(Some(counters)) => counters,
            Ok(None) => UsageCounters::fresh(now, limits.min_backoff),
            Err(e) => {
                warn!("Failed to load usage counters, starting fresh: {}", e);
                UsageCounters::fresh(now, limits.min_backoff)
            }
        };

        let governor = Self {
            limits,
            writer: Arc::new(UsageWriter::new(store)),
            counters: Mutex::new(counters),
            active_connections: AtomicU32::new(0),
            clock,
        };
        {
            let mut counters = governor.counters.lock();
            governor.roll_windows(&mut counters, now);
        }
        governor.writer.schedule();
        governor
    }

    pub fn limits(&self) -> &UsageLimits {
        &self.limits
    }

    /// Gate a new connection attempt
    pub fn should_allow_connection(&self) -> bool {
        match self.check_connection() {
            Ok(()) => true,
            Err(e) => {
                warn!("Connection attempt denied: {}", e);
                false
            }
        }
    }

    /// Gate a new connection attempt, naming the limit that denied it
    pub fn check_connection(&self) -> Result<(), BrokerError> {
        let result = self.evaluate_connection();
        self.writer.schedule();
        result
    }

    fn evaluate_connection(&self) -> Result<(), BrokerError> {
        let now = (self.clock)();
        let mut counters = self.counters.lock();
        self.roll_windows(&mut counters, now);

        if let Some(until) = counters.rate_limited_until {
            if now < until {
                return Err(BrokerError::RateLimited(format!(
                    "rate-limit window active until {}",
                    until.to_rfc3339()
                )));
            }
        }

        if counters.daily_connections >= self.limits.max_daily_connections {
            return Err(BrokerError::QuotaExceeded(format!(
                "daily connection limit {} reached",
                self.limits.max_daily_connections
            )));
        }

        let active = self.active_connections.load(Ordering::SeqCst);
        if active >= self.limits.max_concurrent_connections {
            return Err(BrokerError::QuotaExceeded(format!(
                "concurrent connection limit {} reached",
                self.limits.max_concurrent_connections
            )));
        }

        self.warn_connections(&mut counters);
        Ok(())
    }

    pub fn record_connection(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        self.update(|counters, governor| {
            counters.daily_connections = counters.daily_connections.saturating_add(1);
            governor.warn_connections(counters);
        });
    }

    pub fn record_disconnection(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                Some(active.saturating_sub(1))
            });
    }

    pub fn record_message(&self) {
        self.update(|counters, governor| {
            counters.daily_messages = counters.daily_messages.saturating_add(1);
            governor.warn_messages(counters);
        });
    }

    /// Count an error; quota/rate-limit language grows the backoff
    pub fn record_error(&self, error: &str) {
        let now = (self.clock)();
        self.update(|counters, governor| {
            counters.hourly_errors = counters.hourly_errors.saturating_add(1);

            if !RATE_LIMIT_PHRASES.is_match(error) {
                return;
            }

            let backoff = if QUOTA_EXCEEDED_PHRASES.is_match(error) {
                duration_ms(governor.limits.quota_backoff)
            } else {
                counters
                    .backoff_ms
                    .saturating_mul(2)
                    .min(duration_ms(governor.limits.max_backoff))
            };
            counters.backoff_ms = backoff;
            let until = now + ChronoDuration::milliseconds(i64::try_from(backoff).unwrap_or(i64::MAX));
            counters.rate_limited_until = Some(until);
            warn!(
                backoff_ms = backoff,
                until = %until.to_rfc3339(),
                "Broker reported rate limiting, backing off"
            );
        });
    }

    /// Delay before the next retry
    ///
    /// The larger of the remaining rate-limit window and a tier derived from
    /// this hour's error count.
    pub fn get_retry_delay(&self) -> Duration {
        let now = (self.clock)();
        self.read(|counters| {
            let window = counters
                .rate_limited_until
                .and_then(|until| (until - now).to_std().ok())
                .unwrap_or(Duration::ZERO);

            window.max(error_tier_delay(counters.hourly_errors))
        })
    }

    /// True while a rate-limit window is open
    pub fn is_rate_limited(&self) -> bool {
        let now = (self.clock)();
        self.read(|counters| counters.rate_limited_until.is_some_and(|until| now < until))
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.read(|counters| UsageSnapshot {
            daily_connections: counters.daily_connections,
            active_connections: self.active_connections.load(Ordering::SeqCst),
            daily_messages: counters.daily_messages,
            hourly_errors: counters.hourly_errors,
            backoff_ms: counters.backoff_ms,
            rate_limited_until: counters.rate_limited_until,
        })
    }

    /// Write staged counters and wait until the store has them
    pub async fn flush(&self) {
        let writer = self.writer.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || writer.write_pending()).await {
            warn!("Usage counter flush did not complete: {}", e);
        }
    }

    /// Look at rolled counters; a rollover is still persisted
    fn read<T>(&self, view: impl FnOnce(&UsageCounters) -> T) -> T {
        let now = (self.clock)();
        let value = {
            let mut counters = self.counters.lock();
            self.roll_windows(&mut counters, now);
            view(&counters)
        };
        self.writer.schedule();
        value
    }

    fn update(&self, apply: impl FnOnce(&mut UsageCounters, &Self)) {
        let now = (self.clock)();
        {
            let mut counters = self.counters.lock();
            self.roll_windows(&mut counters, now);
            apply(&mut counters, self);
            self.writer.stage(&counters);
        }
        self.writer.schedule();
    }

    /// Reset counters whose window has ended; also restores the backoff floor
    fn roll_windows(&self, counters: &mut UsageCounters, now: DateTime<Utc>) {
        let mut rolled = false;

        if now.date_naive() != counters.day {
            info!(
                previous = %counters.day,
                connections = counters.daily_connections,
                messages = counters.daily_messages,
                "Daily usage window reset"
            );
            counters.day = now.date_naive();
            counters.daily_connections = 0;
            counters.daily_messages = 0;
            counters.connection_warning_sent = false;
            counters.message_warning_sent = false;
            rolled = true;
        }

        let current_hour = hour_start(now);
        if current_hour != counters.hour {
            debug!(errors = counters.hourly_errors, "Hourly error window reset");
            counters.hour = current_hour;
            counters.hourly_errors = 0;
            rolled = true;
        }

        if rolled {
            counters.backoff_ms = duration_ms(self.limits.min_backoff);
            self.writer.stage(counters);
        }
    }

    fn warn_connections(&self, counters: &mut UsageCounters) {
        let threshold = f64::from(self.limits.max_daily_connections) * self.limits.warning_ratio;
        if !counters.connection_warning_sent && f64::from(counters.daily_connections) >= threshold {
            counters.connection_warning_sent = true;
            warn!(
                used = counters.daily_connections,
                limit = self.limits.max_daily_connections,
                "Daily connection usage above warning threshold"
            );
        }
    }

    fn warn_messages(&self, counters: &mut UsageCounters) {
        let threshold = self.limits.max_daily_messages as f64 * self.limits.warning_ratio;
        if !counters.message_warning_sent && counters.daily_messages as f64 >= threshold {
            counters.message_warning_sent = true;
            warn!(
                used = counters.daily_messages,
                limit = self.limits.max_daily_messages,
                "Daily message usage above warning threshold"
            );
        }
    }
}

/// More errors this hour, longer pause
fn error_tier_delay(hourly_errors: u32) -> Duration {
    match hourly_errors {
        0..=4 => Duration::from_secs(1),
        5..=9 => Duration::from_secs(5),
        10..=19 => Duration::from_secs(30),
        20..=49 => Duration::from_secs(120),
        _ => Duration::from_secs(300),
    }
}

fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
