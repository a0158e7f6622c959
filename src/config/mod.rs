//! Configuration module.

mod decoders;
mod loader;
mod types;

pub use decoders::*;
pub use loader::*;
pub use types::*;
