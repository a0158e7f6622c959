//! Line-oriented draining of stage output.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use super::ReadError;
use crate::bus::{BusMessage, DecodedEvent, EventBus};

/// Drains one stage's stdout, publishing a [`DecodedEvent`] per complete line.
pub struct LineReader<R> {
    decoder: String,
    stage: String,
    stream: BufReader<R>,
    bus: EventBus,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader for `stream`, tagging events with decoder and stage.
    pub fn new(
        decoder: impl Into<String>,
        stage: impl Into<String>,
        stream: R,
        bus: EventBus,
    ) -> Self {
        Self {
            decoder: decoder.into(),
            stage: stage.into(),
            stream: BufReader::new(stream),
            bus,
        }
    }

    /// Read until end-of-stream, returning the number of lines published.
    ///
    /// A trailing partial line at end-of-stream is discarded.
    ///
    /// # Errors
    ///
    /// Returns `ReadError` if the underlying stream fails. End-of-stream is
    /// not an error.
    pub async fn run(mut self) -> Result<u64, ReadError> {
        let mut buf = Vec::with_capacity(256);
        let mut lines = 0u64;

        loop {
            buf.clear();
            let n = self
                .stream
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|source| ReadError {
                    stage: self.stage.clone(),
                    source,
                })?;

            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                tracing::debug!(
                    decoder = %self.decoder,
                    stage = %self.stage,
                    bytes = buf.len(),
                    "Discarding partial line at end of stream"
                );
                break;
            }

            let line = String::from_utf8_lossy(trim_line_ending(&buf));
            if line.is_empty() {
                continue;
            }

            lines += 1;
            self.bus.publish(BusMessage::Line(DecodedEvent::new(
                &self.decoder,
                &self.stage,
                line,
            )));
        }

        tracing::debug!(decoder = %self.decoder, stage = %self.stage, lines, "Stage output closed");
        Ok(lines)
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Forward a stage's stderr to the log so the pipe never fills up.
pub fn drain_stderr<R>(decoder: String, stage: String, stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(decoder = %decoder, stage = %stage, "stderr: {line}");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(decoder = %decoder, stage = %stage, error = %e, "stderr closed");
                    break;
                }
            }
        }
    })
}
