//! Process-wide table of decoder sessions.
//!
//! Start and stop for one decoder name are serialized by a per-name
//! operation lock; different names proceed independently. A name's lock only
//! lives in the table while an operation holds or waits for it. The
//! name → session map itself is only touched under a plain mutex that is
//! never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::OwnedMutexGuard;

use crate::bus::EventBus;
use crate::process::StageSpec;
use crate::supervisor::{
    PipelineSession, SessionSettings, SessionStatus, StopReport, SupervisorError,
};

/// Result of a start request.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub session: Arc<PipelineSession>,
    /// The decoder was already running; `session` is the existing one.
    pub already_running: bool,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running under that name.
    NotRunning,
    /// The session was stopped and every stage reaped.
    Stopped(StopReport),
}

type OpLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive right to start or stop one decoder name.
///
/// Dropping it removes the name's lock from the table unless another
/// operation is waiting on it.
struct OpGuard<'a> {
    locks: &'a OpLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let lock = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one here: nobody else wants it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&self.name);
        }
    }
}

/// Registry of active decoder sessions, keyed by decoder name.
#[derive(Debug)]
pub struct SupervisorRegistry {
    sessions: Mutex<HashMap<String, Arc<PipelineSession>>>,
    op_locks: OpLocks,
    bus: EventBus,
    settings: SessionSettings,
}

impl SupervisorRegistry {
    /// Create an empty registry publishing to `bus`.
    #[must_use]
    pub fn new(bus: EventBus, settings: SessionSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            bus,
            settings,
        }
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Start `name` unless it is already starting or active.
    ///
    /// A session that already ended (e.g. failed on its own) is replaced. One
    /// still tearing down after a stage died is waited for first, so its
    /// stages never overlap the new session's.
    ///
    /// # Errors
    ///
    /// Returns the session's start error; nothing is registered in that case.
    pub async fn start_decoder(
        &self,
        name: &str,
        stages: &[StageSpec],
    ) -> Result<StartOutcome, SupervisorError> {
        let _op = self.lock_name(name).await;

        if let Some(existing) = self.session(name) {
            if existing.state().is_live() {
                tracing::debug!(decoder = name, session = %existing.id(), "Decoder already running");
                return Ok(StartOutcome {
                    session: existing,
                    already_running: true,
                });
            }
            if !existing.state().is_terminal() {
                tracing::debug!(decoder = name, session = %existing.id(), "Waiting for failing session to finish teardown");
                let mut status_rx = existing.watch_status();
                let _ = status_rx
                    .wait_for(|status| status.state.is_terminal())
                    .await;
            }
            tracing::debug!(decoder = name, state = %existing.state(), "Replacing ended session");
            self.sessions().remove(name);
        }

        let session =
            PipelineSession::start(name, stages, self.bus.clone(), self.settings).await?;
        self.sessions()
            .insert(name.to_string(), Arc::clone(&session));
        tracing::info!(decoder = name, session = %session.id(), "Decoder started");

        Ok(StartOutcome {
            session,
            already_running: false,
        })
    }

    /// Stop `name` and remove it from the registry.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Unkillable` if a stage survived SIGKILL. The
    /// session is removed either way.
    pub async fn stop_decoder(
        &self,
        name: &str,
        grace: Duration,
    ) -> Result<StopOutcome, SupervisorError> {
        let _op = self.lock_name(name).await;

        let Some(session) = self.session(name) else {
            return Ok(StopOutcome::NotRunning);
        };

        if session.state().is_terminal() {
            self.sessions().remove(name);
            return Ok(StopOutcome::NotRunning);
        }

        let result = session.stop(grace).await;
        self.sessions().remove(name);
        result.map(StopOutcome::Stopped)
    }

    /// Stop every registered session.
    ///
    /// Failures are collected per decoder; one failure does not keep the
    /// others from being stopped.
    pub async fn reset_all(
        &self,
        grace: Duration,
    ) -> Vec<(String, Result<StopOutcome, SupervisorError>)> {
        let mut names: Vec<String> = self.sessions().keys().cloned().collect();
        names.sort();

        tracing::info!(sessions = names.len(), "Stopping all decoders");
        let results = join_all(names.iter().map(|name| self.stop_decoder(name, grace))).await;

        names
            .into_iter()
            .zip(results)
            .inspect(|(name, result)| {
                if let Err(e) = result {
                    tracing::error!(decoder = %name, error = %e, "Failed to stop decoder during reset");
                }
            })
            .collect()
    }

    /// Registered session for `name`, if any.
    #[must_use]
    pub fn session(&self, name: &str) -> Option<Arc<PipelineSession>> {
        self.sessions().get(name).cloned()
    }

    /// Status of `name`, or `None` if nothing is registered.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<SessionStatus> {
        self.session(name).map(|session| session.status())
    }

    /// Status of every registered session, sorted by decoder name.
    #[must_use]
    pub fn list(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> =
            self.sessions().values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.decoder_name.cmp(&b.decoder_name));
        statuses
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<PipelineSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock_name(&self, name: &str) -> OpGuard<'_> {
        let lock = {
            let mut locks = self.op_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        OpGuard {
            locks: &self.op_locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}
