//! Process error types.

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The executable was not found.
    #[error("Executable not found: {command}")]
    NotFound { command: String },
    /// Permission denied when spawning.
    #[error("Permission denied: {command}")]
    PermissionDenied { command: String },
    /// Other I/O error.
    #[error("Failed to spawn {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    pub(crate) fn from_io(command: &str, err: std::io::Error) -> Self {
        let command = command.to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { command },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { command },
            _ => Self::Io {
                command,
                source: err,
            },
        }
    }
}

/// I/O fault while draining a stage's output, distinct from end-of-stream.
#[derive(thiserror::Error, Debug)]
#[error("Failed to read output of stage {stage}: {source}")]
pub struct ReadError {
    /// Stage whose stream failed.
    pub stage: String,
    #[source]
    pub source: std::io::Error,
}

/// Errors raised by a [`ProcessHandle`](super::ProcessHandle).
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    /// Spawning failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// A termination signal could not be delivered.
    #[error("Failed to signal stage {stage} (pid {pid}): {source}")]
    Signal {
        stage: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the process failed.
    #[error("Failed to wait for stage {stage}: {source}")]
    Wait {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// The process survived a forceful kill past the reap ceiling.
    #[error("Stage {stage} did not exit after SIGKILL")]
    Unkillable { stage: String, pid: Option<u32> },
}
