//! Stage specifications for decoder pipelines.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One external process within a decoding pipeline.
///
/// Commands and arguments are opaque to the supervisor; they are passed to
/// the OS exactly as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Decoder-scoped stage name (e.g. "capture", "monitor").
    pub id: String,
    /// Executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Read stdin from the previous stage's stdout.
    #[serde(default)]
    pub pipe_from_previous: bool,
}

impl StageSpec {
    /// Create a stage with no arguments.
    #[must_use]
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            pipe_from_previous: false,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Consume the previous stage's stdout as this stage's stdin.
    #[must_use]
    pub fn piped(mut self) -> Self {
        self.pipe_from_previous = true;
        self
    }

    /// Render the stage as a shell-like command line, for logs and display.
    #[must_use]
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Locate the executable, searching `PATH` for bare names.
    #[must_use]
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        let command = Path::new(&self.command);
        if command.components().count() > 1 {
            return command.is_file().then(|| command.to_path_buf());
        }

        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.command))
            .find(|candidate| candidate.is_file())
    }

    /// Check whether the executable is installed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.resolve_executable().is_some()
    }
}
