//! Decoder pipeline sessions and the registry that owns them.

mod error;
mod registry;
mod session;
mod state;

pub use error::*;
pub use registry::*;
pub use session::*;
pub use state::*;
