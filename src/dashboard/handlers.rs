//! HTTP handlers for the dashboard API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use tokio::sync::watch;

use super::api::{
    DecoderInfo, ResetFailure, ResetResponse, StartRequest, StartResponse, StatusResponse,
    StopResponse, NOT_RUNNING,
};
use crate::bus::{BusMessage, Subscription};
use crate::config::{Config, ConfigError};
use crate::supervisor::{
    SessionStatus, StartOutcome, StopOutcome, SupervisorError, SupervisorRegistry,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SupervisorRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: Arc<SupervisorRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    fn grace_period(&self) -> Duration {
        self.config.supervisor.grace_period()
    }
}

/// Failures while handling a start request.
#[derive(Debug, thiserror::Error)]
enum StartFailure {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// GET /api/decoders - Configured decoders with availability and state.
pub async fn list_decoders(State(state): State<AppState>) -> Json<Vec<DecoderInfo>> {
    let decoders = state
        .config
        .catalog()
        .into_iter()
        .map(|(name, decoder)| DecoderInfo {
            state: state
                .registry
                .status(&name)
                .map_or_else(|| NOT_RUNNING.to_string(), |s| s.state.as_str().to_string()),
            available: decoder.is_available(),
            parameters: decoder.parameters().into_iter().collect(),
            stages: decoder.stages.iter().map(|s| s.command_line()).collect(),
            description: decoder.description,
            name,
        })
        .collect();

    Json(decoders)
}

/// POST /api/decoders/:name/start - Start a decoder unless it is running.
pub async fn start_decoder(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Json<StartResponse> {
    let request = body.map(|Json(request)| request).unwrap_or_default();

    match launch(&state, &name, &request.parameters).await {
        Ok(outcome) => Json(StartResponse::started(
            outcome.session.id(),
            outcome.already_running,
        )),
        Err(e) => {
            tracing::warn!(decoder = %name, error = %e, "Start request failed");
            Json(StartResponse::error(e.to_string()))
        }
    }
}

async fn launch(
    state: &AppState,
    name: &str,
    parameters: &HashMap<String, String>,
) -> Result<StartOutcome, StartFailure> {
    let stages = state.config.decoder(name)?.resolve(name, parameters)?;
    Ok(state.registry.start_decoder(name, &stages).await?)
}

/// POST /api/decoders/:name/stop - Stop a decoder and reap its stages.
pub async fn stop_decoder(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<StopResponse> {
    match state.registry.stop_decoder(&name, state.grace_period()).await {
        Ok(StopOutcome::Stopped(report)) => Json(StopResponse::stopped(&report)),
        Ok(StopOutcome::NotRunning) => Json(StopResponse::not_running()),
        Err(e) => {
            tracing::error!(decoder = %name, error = %e, "Stop request failed");
            Json(StopResponse::error(e.to_string()))
        }
    }
}

/// GET /api/decoders/:name/status - Current session status.
pub async fn decoder_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<StatusResponse> {
    Json(StatusResponse::from_status(&name, state.registry.status(&name)))
}

enum StreamPhase {
    /// Forwarding lines. The status receiver ends the stream even when the
    /// session's end message was lost to lag on the shared bus.
    Live {
        subscription: Subscription,
        status_rx: watch::Receiver<SessionStatus>,
    },
    Final,
    Done,
}

struct StreamContext {
    name: String,
    registry: Arc<SupervisorRegistry>,
}

impl StreamContext {
    fn current_status(&self) -> Result<Event, axum::Error> {
        status_event(&StatusResponse::from_status(
            &self.name,
            self.registry.status(&self.name),
        ))
    }
}

fn status_event(status: &StatusResponse) -> Result<Event, axum::Error> {
    Event::default().event("status").json_data(status)
}

/// Resolves once the session is stopped or failed; `None` if it was dropped.
async fn terminal_status(
    status_rx: &mut watch::Receiver<SessionStatus>,
) -> Option<SessionStatus> {
    let status = status_rx
        .wait_for(|status| status.state.is_terminal())
        .await
        .ok()?;
    Some(status.clone())
}

/// GET /api/decoders/:name/stream - SSE stream of decoded lines.
///
/// Ends with a single `status` event once the session stops or fails, or
/// immediately if the decoder is not running.
pub async fn stream_decoder(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, axum::Error>>> {
    // Subscribe before checking liveness so no line after the check is missed.
    let subscription = state.registry.bus().subscribe();
    let phase = match state.registry.session(&name) {
        Some(session) if !session.state().is_terminal() => StreamPhase::Live {
            subscription,
            status_rx: session.watch_status(),
        },
        _ => StreamPhase::Final,
    };
    let context = StreamContext {
        name,
        registry: Arc::clone(&state.registry),
    };

    let stream = futures_util::stream::unfold((phase, context), |(phase, ctx)| async move {
        match phase {
            StreamPhase::Live {
                mut subscription,
                mut status_rx,
            } => loop {
                tokio::select! {
                    // Lines already queued go out before the final status.
                    biased;

                    message = subscription.recv() => {
                        let Some(message) = message else {
                            return Some((ctx.current_status(), (StreamPhase::Done, ctx)));
                        };
                        if message.decoder_name() != ctx.name {
                            continue;
                        }
                        match message {
                            BusMessage::Line(event) => {
                                let item = Event::default().event("line").json_data(&event);
                                let next = StreamPhase::Live { subscription, status_rx };
                                return Some((item, (next, ctx)));
                            }
                            BusMessage::SessionEnded { state, reason, .. } => {
                                let status = StatusResponse::ended(&ctx.name, state, reason);
                                return Some((status_event(&status), (StreamPhase::Done, ctx)));
                            }
                        }
                    }

                    ended = terminal_status(&mut status_rx) => {
                        let item = match ended {
                            Some(status) => status_event(&StatusResponse::ended(
                                &ctx.name,
                                status.state,
                                status.error,
                            )),
                            None => ctx.current_status(),
                        };
                        return Some((item, (StreamPhase::Done, ctx)));
                    }
                }
            },
            StreamPhase::Final => Some((ctx.current_status(), (StreamPhase::Done, ctx))),
            StreamPhase::Done => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /api/reset - Stop every running decoder.
pub async fn reset(State(state): State<AppState>) -> Json<ResetResponse> {
    let mut response = ResetResponse::default();

    for (decoder, result) in state.registry.reset_all(state.grace_period()).await {
        match result {
            Ok(StopOutcome::Stopped(_)) => response.stopped.push(decoder),
            Ok(StopOutcome::NotRunning) => {}
            Err(e) => response.failed.push(ResetFailure {
                decoder,
                message: e.to_string(),
            }),
        }
    }

    Json(response)
}
