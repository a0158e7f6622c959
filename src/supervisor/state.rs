//! Pipeline session state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pipeline session.
///
/// `Starting → Active → Stopping → Stopped`, with `Starting → Failed`,
/// `Active → Failed` and `Stopping → Failed`. A session torn down because a
/// stage died goes `Active → Stopping → Failed`; so does a stop that leaves a
/// stage behind after SIGKILL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Stopped and Failed are final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Starting or Active: the session owns running processes.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Active | Self::Failed)
                | (Self::Active, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Stopped | Self::Failed)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
