//! Failures of the HTTP dashboard itself, as opposed to decoder operations.

/// Why the dashboard could not start or stopped serving.
#[derive(thiserror::Error, Debug)]
pub enum DashboardError {
    /// The listen address is taken or not permitted.
    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Accepting or serving connections failed.
    #[error("Server error: {0}")]
    ServerError(#[from] std::io::Error),
}
