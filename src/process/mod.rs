//! Stage process spawning, termination and output draining.

mod error;
mod handle;
mod reader;
mod stage;

pub use error::*;
pub use handle::*;
pub use reader::*;
pub use stage::*;
