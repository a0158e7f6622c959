//! Messages carried on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::supervisor::SessionState;

/// One line of decoder output.
///
/// The payload is opaque; interpreting it is left to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub decoder_name: String,
    pub stage_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw_line: String,
}

impl DecodedEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(
        decoder_name: impl Into<String>,
        stage_id: impl Into<String>,
        raw_line: impl Into<String>,
    ) -> Self {
        Self {
            decoder_name: decoder_name.into(),
            stage_id: stage_id.into(),
            timestamp: Utc::now(),
            raw_line: raw_line.into(),
        }
    }
}

/// Everything published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// A decoded output line.
    Line(DecodedEvent),
    /// A session reached a terminal state; its stream is over.
    SessionEnded {
        decoder_name: String,
        state: SessionState,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl BusMessage {
    /// Terminal message for `decoder`.
    #[must_use]
    pub fn session_ended(
        decoder_name: impl Into<String>,
        state: SessionState,
        reason: Option<String>,
    ) -> Self {
        Self::SessionEnded {
            decoder_name: decoder_name.into(),
            state,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Decoder this message belongs to.
    #[must_use]
    pub fn decoder_name(&self) -> &str {
        match self {
            Self::Line(event) => &event.decoder_name,
            Self::SessionEnded { decoder_name, .. } => decoder_name,
        }
    }

    /// Returns true if this ends the decoder's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEnded { .. })
    }
}
