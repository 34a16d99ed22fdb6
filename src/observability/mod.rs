//! Observability for the broker link
//!
//! Structured logging setup and span macros. Connection health is reported
//! through `crate::health`.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::{connection_span, lifecycle_span, outbox_span, pipeline_span};
