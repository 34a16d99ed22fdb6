//! Testing utilities and mock implementations
//!
//! Mocks here stand in for the broker so connection behaviour can be tested
//! without a running AMQP server.

pub mod mocks;

pub use mocks::*;
