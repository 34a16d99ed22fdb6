//! Failure handling building blocks shared by broker connections
//!
//! Each piece here is independent of the broker client: classification,
//! queue ownership, connectivity tracking, usage quotas, and the durable
//! retry outbox.

pub mod error_classifier;
pub mod network;
pub mod outbox;
pub mod registry;
pub mod usage;

pub use error_classifier::{ErrorAnalysis, ErrorCategory, ErrorClassifier};
pub use network::{CellularGeneration, NetworkMonitor, NetworkState, SignalQuality, TransportType};
pub use outbox::{OutboxError, RetryOutbox, RetryRecord, SweepReport};
pub use registry::ConnectionRegistry;
pub use usage::{
    JsonFileUsageStore, MemoryUsageStore, UsageCounters, UsageError, UsageGovernor, UsageLimits,
    UsageSnapshot, UsageStore,
};
