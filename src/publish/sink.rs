//! Destinations for bus messages.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::bus::BusMessage;

/// Errors from sink operations.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("Failed to write event: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Something that accepts bus messages one at a time.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one message.
    async fn publish(&mut self, message: &BusMessage) -> Result<(), SinkError>;

    /// Flush anything buffered. Called once when publishing ends.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Emits every message as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&mut self, message: &BusMessage) -> Result<(), SinkError> {
        match message {
            BusMessage::Line(event) => tracing::info!(
                target: "decoder_events",
                decoder = %event.decoder_name,
                stage = %event.stage_id,
                line = %event.raw_line,
                "Decoded"
            ),
            BusMessage::SessionEnded {
                decoder_name,
                state,
                reason,
                ..
            } => tracing::info!(
                target: "decoder_events",
                decoder = %decoder_name,
                state = %state,
                reason = reason.as_deref().unwrap_or(""),
                "Session ended"
            ),
        }
        Ok(())
    }
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W> JsonLinesSink<W> {
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&mut self, message: &BusMessage) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}
