//! HTTP control surface for starting, stopping and watching decoders.

pub mod api;
mod error;
mod handlers;
mod server;

pub use error::DashboardError;
pub use handlers::{
    decoder_status, list_decoders, reset, start_decoder, stop_decoder, stream_decoder, AppState,
};
pub use server::{DashboardConfig, DashboardServer, DEFAULT_PORT};
