//! Request and response bodies for the dashboard HTTP endpoints.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process::StageStatus;
use crate::supervisor::{SessionState, SessionStatus, StopReport};

/// State reported for a decoder with no registered session.
pub const NOT_RUNNING: &str = "not_running";

/// Body of POST /api/decoders/:name/start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Values for the decoder's `{placeholder}` arguments.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
    Error,
}

/// Response for POST /api/decoders/:name/start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: StartStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl StartResponse {
    #[must_use]
    pub fn started(session_id: Uuid, already_running: bool) -> Self {
        Self {
            status: if already_running {
                StartStatus::AlreadyRunning
            } else {
                StartStatus::Started
            },
            message: None,
            session_id: Some(session_id),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StartStatus::Error,
            message: Some(message.into()),
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    NotRunning,
    Error,
}

/// Response for POST /api/decoders/:name/stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: StopStatus,
    /// Pids of every stage that was reaped.
    pub killed: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StopResponse {
    #[must_use]
    pub fn stopped(report: &StopReport) -> Self {
        Self {
            status: StopStatus::Stopped,
            killed: report.pids(),
            message: None,
        }
    }

    #[must_use]
    pub fn not_running() -> Self {
        Self {
            status: StopStatus::NotRunning,
            killed: Vec::new(),
            message: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StopStatus::Error,
            killed: Vec::new(),
            message: Some(message.into()),
        }
    }
}

/// Response for GET /api/decoders/:name/status, also sent as the final
/// `status` event of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub decoder: String,
    /// A session state, or `not_running`.
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Build from a registry lookup.
    #[must_use]
    pub fn from_status(decoder: &str, status: Option<SessionStatus>) -> Self {
        match status {
            Some(status) => Self {
                decoder: status.decoder_name,
                state: status.state.as_str().to_string(),
                session_id: Some(status.session_id),
                started_at: Some(status.started_at),
                stages: status.stages,
                error: status.error,
            },
            None => Self::not_running(decoder),
        }
    }

    #[must_use]
    pub fn not_running(decoder: &str) -> Self {
        Self {
            decoder: decoder.to_string(),
            state: NOT_RUNNING.to_string(),
            session_id: None,
            started_at: None,
            stages: Vec::new(),
            error: None,
        }
    }

    /// Summary of a session that just ended.
    #[must_use]
    pub fn ended(decoder: &str, state: SessionState, reason: Option<String>) -> Self {
        Self {
            state: state.as_str().to_string(),
            error: reason,
            ..Self::not_running(decoder)
        }
    }
}

/// Entry in GET /api/decoders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderInfo {
    pub name: String,
    pub description: String,
    /// Every stage's executable was found on `PATH`.
    pub available: bool,
    pub state: String,
    /// Placeholder names the decoder accepts.
    pub parameters: Vec<String>,
    /// Stage command lines, placeholders unresolved.
    pub stages: Vec<String>,
}

/// Response for POST /api/reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetResponse {
    /// Decoders that were stopped.
    pub stopped: Vec<String>,
    /// Decoders that could not be stopped cleanly.
    pub failed: Vec<ResetFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetFailure {
    pub decoder: String,
    pub message: String,
}
