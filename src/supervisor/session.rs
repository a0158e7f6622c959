//! Pipeline sessions: one decoder's cooperating stage processes.
//!
//! A session spawns its stages in order, wiring a stage's stdout into the
//! next stage's stdin where the next stage asks for it. Every stage whose
//! output is not piped onward gets a [`LineReader`] task. A monitor task
//! listens for readers hitting end-of-stream and polls every stage for exit
//! while the session is active, failing the session when either happens.
//!
//! Teardown (stop, unexpected exit, or failed start) always runs the same
//! sequence: SIGTERM to every stage in reverse order, one shared grace period
//! with SIGKILL escalation, wait for readers, then reap every stage.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{BusMessage, EventBus};
use crate::process::{
    drain_stderr, LineReader, ProcessHandle, ProcessState, ReadError, ReapedProcess, SpawnError,
    StageSpec, StageStatus,
};
use crate::supervisor::{SessionState, SupervisorError};

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Default bound on waiting for a killed stage or a reader to finish.
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the monitor polls stages for exit. Piped stages have no reader
/// of their own, so this is the only way their death is noticed.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(250);

/// Timing knobs for session teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Time allowed for graceful exit before SIGKILL.
    pub grace_period: Duration,
    /// Ceiling for any single wait after SIGKILL.
    pub reap_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub decoder_name: String,
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageStatus>,
    pub error: Option<String>,
}

/// What a finished session killed and how each stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub decoder_name: String,
    pub session_id: Uuid,
    pub state: SessionState,
    /// Reaped stages, in the order they were reaped (reverse stage order).
    pub killed: Vec<ReapedProcess>,
}

impl StopReport {
    /// Process ids of the reaped stages.
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        self.killed.iter().filter_map(|p| p.pid).collect()
    }

    /// Stage ids of the reaped stages.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<&str> {
        self.killed.iter().map(|p| p.stage_id.as_str()).collect()
    }
}

/// Sent by a reader task when its stream closes.
#[derive(Debug)]
struct StageExit {
    stage: String,
    result: Result<u64, ReadError>,
}

#[derive(Default)]
struct SessionInner {
    handles: Vec<ProcessHandle>,
    readers: Vec<JoinHandle<()>>,
    stderr_drains: Vec<JoinHandle<()>>,
    report: Option<StopReport>,
}

/// One running decoder pipeline.
pub struct PipelineSession {
    id: Uuid,
    decoder: String,
    settings: SessionSettings,
    bus: EventBus,
    inner: Mutex<SessionInner>,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PipelineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSession")
            .field("id", &self.id)
            .field("decoder", &self.decoder)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PipelineSession {
    /// Spawn every stage and return the session once it is active.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPipeline` before spawning anything if the stage list is
    /// malformed, or `Spawn`/`StageExited` after stopping and reaping every
    /// stage that had already been spawned.
    pub async fn start(
        decoder: impl Into<String>,
        stages: &[StageSpec],
        bus: EventBus,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, SupervisorError> {
        let decoder = decoder.into();
        validate_stages(&decoder, stages)?;

        let id = Uuid::new_v4();
        let (status_tx, _) = watch::channel(SessionStatus {
            decoder_name: decoder.clone(),
            session_id: id,
            state: SessionState::Starting,
            started_at: Utc::now(),
            stages: stages.iter().map(StageStatus::pending).collect(),
            error: None,
        });

        let session = Arc::new(Self {
            id,
            decoder,
            settings,
            bus,
            inner: Mutex::new(SessionInner::default()),
            status_tx,
            cancel: CancellationToken::new(),
        });

        tracing::info!(decoder = %session.decoder, session = %id, stages = stages.len(), "Starting session");

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        {
            let mut inner = session.inner.lock().await;
            let started = session
                .spawn_stages(&mut inner, stages, &exit_tx)
                .and_then(|()| session.ensure_running(&mut inner));

            if let Err(err) = started {
                tracing::error!(decoder = %session.decoder, error = %err, "Session failed to start");
                let reason = Some(err.to_string());
                if let Err(cleanup) = session
                    .teardown(&mut inner, settings.grace_period, SessionState::Failed, reason)
                    .await
                {
                    tracing::error!(decoder = %session.decoder, error = %cleanup, "Cleanup after failed start left stages behind");
                }
                return Err(err);
            }

            session.transition(SessionState::Active, None);
        }

        drop(exit_tx);
        tokio::spawn(Arc::clone(&session).monitor(exit_rx));

        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn decoder_name(&self) -> &str {
        &self.decoder
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status_tx.borrow().state
    }

    /// Current status snapshot. Never waits on lifecycle operations.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Stop every stage and reap it.
    ///
    /// Calling this on a session that already ended returns its report.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Unkillable` if a stage survived SIGKILL; the
    /// session is then `Failed`.
    pub async fn stop(&self, grace: Duration) -> Result<StopReport, SupervisorError> {
        let mut inner = self.inner.lock().await;
        if let Some(report) = &inner.report {
            return Ok(report.clone());
        }

        tracing::info!(decoder = %self.decoder, session = %self.id, "Stopping session");
        self.transition(SessionState::Stopping, None);
        self.teardown(&mut inner, grace, SessionState::Stopped, None)
            .await
    }

    /// React to a stage exiting or its output closing on its own.
    ///
    /// Fails the session and tears down every remaining stage. Does nothing
    /// unless the session is active. The session reports `Stopping` for the
    /// whole teardown and `Failed` once every stage is reaped.
    pub async fn on_unexpected_exit(&self, stage_id: &str) {
        let mut inner = self.inner.lock().await;
        if self.state() != SessionState::Active {
            return;
        }

        tracing::warn!(decoder = %self.decoder, stage = stage_id, "Stage exited unexpectedly, failing session");
        for handle in &mut inner.handles {
            if !handle.is_alive() {
                self.update_stage(handle.status());
            }
        }

        let reason = Some(format!("stage {stage_id} exited unexpectedly"));
        self.transition(SessionState::Stopping, reason.clone());
        if let Err(e) = self
            .teardown(&mut inner, self.settings.grace_period, SessionState::Failed, reason)
            .await
        {
            tracing::error!(decoder = %self.decoder, error = %e, "Failed session left stages behind");
        }
    }

    fn spawn_stages(
        &self,
        inner: &mut SessionInner,
        stages: &[StageSpec],
        exit_tx: &mpsc::UnboundedSender<StageExit>,
    ) -> Result<(), SupervisorError> {
        let mut upstream: Option<ChildStdout> = None;

        for (index, spec) in stages.iter().enumerate() {
            let spawn_error = |source| SupervisorError::Spawn {
                decoder: self.decoder.clone(),
                stage: spec.id.clone(),
                source,
            };

            let stdin: Stdio = match upstream.take() {
                Some(stdout) => stdout
                    .try_into()
                    .map_err(|e| spawn_error(SpawnError::from_io(&spec.command, e)))?,
                None => Stdio::null(),
            };

            let mut handle = ProcessHandle::spawn(spec, stdin).map_err(spawn_error)?;

            if let Some(stderr) = handle.take_stderr() {
                inner.stderr_drains.push(drain_stderr(
                    self.decoder.clone(),
                    spec.id.clone(),
                    stderr,
                ));
            }

            let feeds_next = stages
                .get(index + 1)
                .is_some_and(|next| next.pipe_from_previous);
            if let Some(stdout) = handle.take_stdout() {
                if feeds_next {
                    upstream = Some(stdout);
                } else {
                    inner
                        .readers
                        .push(self.spawn_reader(spec.id.clone(), stdout, exit_tx.clone()));
                }
            }

            self.update_stage(handle.status());
            inner.handles.push(handle);
        }

        Ok(())
    }

    fn ensure_running(&self, inner: &mut SessionInner) -> Result<(), SupervisorError> {
        for handle in &mut inner.handles {
            if !handle.is_alive() {
                self.update_stage(handle.status());
                return Err(SupervisorError::StageExited {
                    decoder: self.decoder.clone(),
                    stage: handle.id().to_string(),
                });
            }
        }
        Ok(())
    }

    fn spawn_reader(
        &self,
        stage: String,
        stdout: ChildStdout,
        exit_tx: mpsc::UnboundedSender<StageExit>,
    ) -> JoinHandle<()> {
        let reader = LineReader::new(self.decoder.clone(), stage.clone(), stdout, self.bus.clone());
        tokio::spawn(async move {
            let result = reader.run().await;
            let _ = exit_tx.send(StageExit { stage, result });
        })
    }

    async fn monitor(self: Arc<Self>, mut exits: mpsc::UnboundedReceiver<StageExit>) {
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut readers_open = true;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return,

                exit = exits.recv(), if readers_open => {
                    let Some(exit) = exit else {
                        readers_open = false;
                        continue;
                    };
                    if let Err(e) = &exit.result {
                        tracing::warn!(decoder = %self.decoder, error = %e, "Stage output failed, treating as closed");
                    }
                    self.on_unexpected_exit(&exit.stage).await;
                    return;
                }

                _ = liveness.tick() => {
                    if let Some(stage) = self.exited_stage() {
                        self.on_unexpected_exit(&stage).await;
                        return;
                    }
                }
            }
        }
    }

    /// First stage found to have exited, refreshing its status.
    ///
    /// Skipped while a lifecycle operation holds the stage handles.
    fn exited_stage(&self) -> Option<String> {
        let mut inner = self.inner.try_lock().ok()?;
        let mut exited = None;
        for handle in &mut inner.handles {
            if !handle.is_alive() {
                self.update_stage(handle.status());
                if exited.is_none() {
                    exited = Some(handle.id().to_string());
                }
            }
        }
        exited
    }

    async fn teardown(
        &self,
        inner: &mut SessionInner,
        grace: Duration,
        outcome: SessionState,
        reason: Option<String>,
    ) -> Result<StopReport, SupervisorError> {
        self.cancel.cancel();
        let ceiling = self.settings.reap_timeout;

        // Every stage hears SIGTERM before anything blocks.
        for handle in inner.handles.iter_mut().rev() {
            if let Err(e) = handle.signal_terminate() {
                tracing::warn!(decoder = %self.decoder, stage = handle.id(), error = %e, "Failed to signal stage");
            }
            self.update_stage(handle.status());
        }

        let deadline = Instant::now() + grace;
        for handle in inner.handles.iter_mut().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = handle.request_stop(remaining).await {
                tracing::warn!(decoder = %self.decoder, stage = handle.id(), error = %e, "Failed to stop stage");
            }
            self.update_stage(handle.status());
        }

        for reader in inner.readers.drain(..) {
            join_or_abort(reader, ceiling, &self.decoder, "reader").await;
        }
        for drain in inner.stderr_drains.drain(..) {
            join_or_abort(drain, ceiling, &self.decoder, "stderr drain").await;
        }

        let mut killed = Vec::with_capacity(inner.handles.len());
        let mut unreaped = Vec::new();
        for handle in inner.handles.drain(..).rev() {
            let stage = handle.id().to_string();
            match handle.reap(ceiling).await {
                Ok(reaped) => {
                    self.mark_reaped(&reaped);
                    killed.push(reaped);
                }
                Err(e) => {
                    tracing::error!(decoder = %self.decoder, stage = %stage, error = %e, "Failed to reap stage");
                    unreaped.push(stage);
                }
            }
        }

        let (state, reason) = if unreaped.is_empty() {
            (outcome, reason)
        } else {
            (
                SessionState::Failed,
                Some(format!("unkillable stages: {}", unreaped.join(", "))),
            )
        };
        self.transition(state, reason.clone());

        let report = StopReport {
            decoder_name: self.decoder.clone(),
            session_id: self.id,
            state,
            killed,
        };
        inner.report = Some(report.clone());

        self.bus
            .publish(BusMessage::session_ended(&self.decoder, state, reason));
        tracing::info!(
            decoder = %self.decoder,
            session = %self.id,
            state = %state,
            reaped = report.killed.len(),
            "Session ended"
        );

        if unreaped.is_empty() {
            Ok(report)
        } else {
            Err(SupervisorError::Unkillable {
                decoder: self.decoder.clone(),
                stages: unreaped,
            })
        }
    }

    fn transition(&self, next: SessionState, error: Option<String>) {
        self.status_tx.send_modify(|status| {
            if status.state.can_transition_to(next) {
                tracing::debug!(decoder = %self.decoder, from = %status.state, to = %next, "Session state transition");
                status.state = next;
                if error.is_some() {
                    status.error = error;
                }
            } else {
                tracing::warn!(decoder = %self.decoder, from = %status.state, to = %next, "Ignoring invalid session state transition");
            }
        });
    }

    fn update_stage(&self, stage: StageStatus) {
        self.status_tx.send_modify(|status| {
            if let Some(slot) = status.stages.iter_mut().find(|s| s.id == stage.id) {
                *slot = stage;
            }
        });
    }

    fn mark_reaped(&self, reaped: &ReapedProcess) {
        self.status_tx.send_modify(|status| {
            if let Some(slot) = status.stages.iter_mut().find(|s| s.id == reaped.stage_id) {
                slot.state = ProcessState::Reaped;
                slot.exit = Some(reaped.exit);
            }
        });
    }
}

async fn join_or_abort(mut task: JoinHandle<()>, limit: Duration, decoder: &str, what: &str) {
    if tokio::time::timeout(limit, &mut task).await.is_err() {
        tracing::warn!(decoder, task = what, "Task still running after stage exit, aborting it");
        task.abort();
    }
}

fn validate_stages(decoder: &str, stages: &[StageSpec]) -> Result<(), SupervisorError> {
    let invalid = |reason: String| SupervisorError::InvalidPipeline {
        decoder: decoder.to_string(),
        reason,
    };

    let Some(first) = stages.first() else {
        return Err(invalid("no stages".to_string()));
    };
    if first.pipe_from_previous {
        return Err(invalid(format!(
            "first stage {} has no previous stage to read from",
            first.id
        )));
    }

    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage.id.as_str()) {
            return Err(invalid(format!("duplicate stage id {}", stage.id)));
        }
    }
    Ok(())
}
