//! Event bus carrying decoded lines from stage readers to subscribers.

mod channel;
mod event;

pub use channel::*;
pub use event::*;
