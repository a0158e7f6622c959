//! Decoder stage process spawning and termination.
//!
//! A [`ProcessHandle`] owns exactly one child process. On unix every stage is
//! started as the leader of its own process group so that termination
//! signals also reach anything the tool forks.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use super::{ProcessError, SpawnError, StageSpec};

/// Lifecycle state of a stage process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    NotStarted,
    Running,
    Stopping,
    Exited,
    Reaped,
}

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited on its own.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
    /// Whether termination had to be escalated to SIGKILL.
    pub forced: bool,
}

impl ExitInfo {
    fn from_status(status: ExitStatus, forced: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            forced,
        }
    }

    /// Short human-readable description (e.g. "exit 0", "signal 9, forced").
    #[must_use]
    pub fn describe(&self) -> String {
        let base = match (self.code, self.signal) {
            (Some(code), _) => format!("exit {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown".to_string(),
        };
        if self.forced {
            format!("{base}, forced")
        } else {
            base
        }
    }
}

/// Point-in-time view of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub started_at: Option<DateTime<Utc>>,
    pub exit: Option<ExitInfo>,
}

impl StageStatus {
    /// Status of a stage that has not been spawned yet.
    #[must_use]
    pub fn pending(spec: &StageSpec) -> Self {
        Self {
            id: spec.id.clone(),
            command: spec.command_line(),
            pid: None,
            state: ProcessState::NotStarted,
            started_at: None,
            exit: None,
        }
    }
}

/// Outcome of reaping a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapedProcess {
    pub stage_id: String,
    pub pid: Option<u32>,
    pub exit: ExitInfo,
}

/// A running decoder stage.
///
/// The handle must be consumed by [`ProcessHandle::reap`]; dropping it
/// earlier kills the whole process group and logs an error.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: StageSpec,
    pid: Option<u32>,
    state: ProcessState,
    started_at: DateTime<Utc>,
    exit: Option<ExitInfo>,
    forced: bool,
    child: Child,
}

impl ProcessHandle {
    /// Spawn a stage with the given stdin.
    ///
    /// Stdout and stderr are always piped.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the executable is missing or cannot be launched.
    pub fn spawn(spec: &StageSpec, stdin: Stdio) -> Result<Self, SpawnError> {
        let mut std_cmd = std::process::Command::new(&spec.command);
        std_cmd
            .args(&spec.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.command, e))?;
        let pid = child.id();

        tracing::info!(
            stage = %spec.id,
            pid,
            command = %spec.command_line(),
            "Spawned stage process"
        );

        Ok(Self {
            spec: spec.clone(),
            pid,
            state: ProcessState::Running,
            started_at: Utc::now(),
            exit: None,
            forced: false,
            child,
        })
    }

    /// Stage id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// OS process id captured at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    #[must_use]
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit information, once the process has been observed to exit.
    #[must_use]
    pub fn exit(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        StageStatus {
            id: self.spec.id.clone(),
            command: self.spec.command_line(),
            pid: self.pid,
            state: self.state,
            started_at: Some(self.started_at),
            exit: self.exit,
        }
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking liveness check.
    ///
    /// Records the exit status when the process is found to have exited, but
    /// never moves the handle to `Reaped`.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(stage = %self.spec.id, error = %e, "Failed to poll stage status");
                false
            }
        }
    }

    /// Send the graceful termination signal without waiting.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Signal` if the signal cannot be delivered.
    pub fn signal_terminate(&mut self) -> Result<(), ProcessError> {
        if self.state != ProcessState::Running || !self.is_alive() {
            return Ok(());
        }
        self.transition(ProcessState::Stopping);

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            self.child
                .start_kill()
                .map_err(|source| ProcessError::Signal {
                    stage: self.spec.id.clone(),
                    pid: self.pid.unwrap_or_default(),
                    source,
                })
        }
    }

    /// Attempt graceful termination, escalating to SIGKILL after `grace`.
    ///
    /// Does not wait for the killed process; [`ProcessHandle::reap`] does.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal cannot be delivered or waiting fails.
    pub async fn request_stop(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if self.exit.is_some() {
            return Ok(());
        }
        if self.state == ProcessState::Running {
            self.signal_terminate()?;
        }

        if self.wait_for(grace).await?.is_some() {
            return Ok(());
        }

        tracing::warn!(
            stage = %self.spec.id,
            pid = self.pid,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Stage ignored SIGTERM, escalating to SIGKILL"
        );
        self.force_kill()
    }

    /// Wait (bounded) for the process to exit and release it.
    ///
    /// A process still running after `ceiling` is force-killed and given one
    /// more `ceiling`. On unix the process group is swept afterwards so no
    /// descendant outlives the stage.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Unkillable` if the process survives SIGKILL.
    pub async fn reap(mut self, ceiling: Duration) -> Result<ReapedProcess, ProcessError> {
        let exit = match self.exit {
            Some(exit) => exit,
            None => self.wait_bounded(ceiling).await?,
        };

        #[cfg(unix)]
        self.sweep_group();

        self.transition(ProcessState::Reaped);
        tracing::debug!(stage = %self.spec.id, pid = self.pid, exit = %exit.describe(), "Reaped stage");

        Ok(ReapedProcess {
            stage_id: self.spec.id.clone(),
            pid: self.pid,
            exit,
        })
    }

    async fn wait_bounded(&mut self, ceiling: Duration) -> Result<ExitInfo, ProcessError> {
        if let Some(exit) = self.wait_for(ceiling).await? {
            return Ok(exit);
        }

        if !self.forced {
            tracing::warn!(stage = %self.spec.id, pid = self.pid, "Stage still running at reap, killing");
            self.force_kill()?;
            if let Some(exit) = self.wait_for(ceiling).await? {
                return Ok(exit);
            }
        }

        tracing::error!(stage = %self.spec.id, pid = self.pid, "Stage did not exit after SIGKILL");
        Err(ProcessError::Unkillable {
            stage: self.spec.id.clone(),
            pid: self.pid,
        })
    }

    /// Wait up to `limit` for exit; `None` on timeout.
    async fn wait_for(&mut self, limit: Duration) -> Result<Option<ExitInfo>, ProcessError> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => Ok(Some(self.record_exit(status))),
            Ok(Err(source)) => Err(ProcessError::Wait {
                stage: self.spec.id.clone(),
                source,
            }),
            Err(_) => Ok(None),
        }
    }

    fn force_kill(&mut self) -> Result<(), ProcessError> {
        self.forced = true;

        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL)?;

        // The leader may have moved itself out of its group.
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(stage = %self.spec.id, error = %e, "Direct kill skipped");
        }
        Ok(())
    }

    fn record_exit(&mut self, status: ExitStatus) -> ExitInfo {
        let exit = ExitInfo::from_status(status, self.forced);
        self.exit = Some(exit);
        if matches!(self.state, ProcessState::Running | ProcessState::Stopping) {
            self.transition(ProcessState::Exited);
        }
        exit
    }

    fn transition(&mut self, new_state: ProcessState) {
        if self.state == ProcessState::Reaped {
            return;
        }
        tracing::debug!(stage = %self.spec.id, from = ?self.state, to = ?new_state, "Stage state transition");
        self.state = new_state;
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(());
        };

        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ProcessError::Signal {
                stage: self.spec.id.clone(),
                pid,
                source: std::io::Error::from(errno),
            }),
        }
    }

    #[cfg(unix)]
    fn sweep_group(&self) {
        if let Err(e) = self.signal_group(nix::sys::signal::Signal::SIGKILL) {
            tracing::warn!(stage = %self.spec.id, error = %e, "Failed to sweep process group");
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        match self.state {
            ProcessState::Running | ProcessState::Stopping => {
                tracing::error!(
                    stage = %self.spec.id,
                    pid = self.pid,
                    state = ?self.state,
                    "Stage handle dropped before reap, killing process group"
                );
                #[cfg(unix)]
                self.sweep_group();
            }
            ProcessState::Exited => {
                #[cfg(unix)]
                self.sweep_group();
            }
            ProcessState::NotStarted | ProcessState::Reaped => {}
        }
    }
}
