//! Forwarding of bus messages to external sinks.

mod publisher;
mod sink;

pub use publisher::*;
pub use sink::*;
