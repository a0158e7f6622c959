//! Supervisor error types.

use crate::process::SpawnError;

/// Errors returned by session and registry operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// A stage could not be spawned; every sibling has been reaped.
    #[error("Failed to start stage {stage} of {decoder}: {source}")]
    Spawn {
        decoder: String,
        stage: String,
        #[source]
        source: SpawnError,
    },

    /// The stage list cannot form a pipeline.
    #[error("Invalid pipeline for {decoder}: {reason}")]
    InvalidPipeline { decoder: String, reason: String },

    /// A stage was already gone before the session became active.
    #[error("Stage {stage} of {decoder} exited during startup")]
    StageExited { decoder: String, stage: String },

    /// Stages that could not be reaped, even after SIGKILL.
    #[error("Unkillable stages in {decoder}: {}", .stages.join(", "))]
    Unkillable { decoder: String, stages: Vec<String> },
}
