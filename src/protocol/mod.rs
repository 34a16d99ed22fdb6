//! Wire messages exchanged over the broker link

pub mod messages;

pub use messages::*;
