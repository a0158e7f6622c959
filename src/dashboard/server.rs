//! Dashboard HTTP server with axum router and graceful shutdown.

use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{
    decoder_status, list_decoders, reset, start_decoder, stop_decoder, stream_decoder, AppState,
};
use super::DashboardError;

/// Default port for the dashboard server.
pub const DEFAULT_PORT: u16 = 5050;

/// Configuration for the dashboard server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Port to listen on.
    pub port: u16,
    /// Host address to bind to.
    pub host: String,
    /// Whether to enable permissive CORS.
    pub cors_permissive: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "127.0.0.1".to_string(),
            cors_permissive: true,
        }
    }
}

/// HTTP server exposing the supervisor registry.
pub struct DashboardServer {
    config: DashboardConfig,
    state: AppState,
}

impl DashboardServer {
    /// Create a new dashboard server with default configuration.
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self {
            config: DashboardConfig::default(),
            state,
        }
    }

    /// Set the server configuration (builder pattern).
    #[must_use]
    pub fn with_config(mut self, config: DashboardConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the configured address as a string.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Build the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let router = Router::new()
            .route("/api/decoders", get(list_decoders))
            .route("/api/decoders/:name/start", post(start_decoder))
            .route("/api/decoders/:name/stop", post(stop_decoder))
            .route("/api/decoders/:name/status", get(decoder_status))
            .route("/api/decoders/:name/stream", get(stream_decoder))
            .route("/api/reset", post(reset))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_permissive {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Run the server until `cancel` fires, then shut down gracefully.
    ///
    /// Running decoders are left alone; stopping them is the caller's job.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DashboardError> {
        let addr = self.address();
        let app = self.build_router();

        tracing::info!(address = %addr, "Starting dashboard server");

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| DashboardError::BindError {
                address: addr.clone(),
                source,
            })?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                tracing::info!("Dashboard server shutting down gracefully");
            })
            .await?;

        Ok(())
    }
}
