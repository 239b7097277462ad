//! Process lifecycle tracker.
//!
//! Starts one-shot children into named slots, persists a record per slot so a
//! later stop (possibly from a restarted agent) can find the process, and
//! stops them with graduated signal escalation.
//!
//! A recorded pid may be recycled by the OS between the record write and a
//! stop request. The tracker accepts that rare race: it only signals pids
//! that are alive and not zombies, and children run in their own process
//! group, which narrows but does not close the window.

use super::record::{self, ProcessRecord, Slot};
use super::signal::{self, StopSignal};
use crate::error::{AgentError, Result, poisoned};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Child;

/// Poll period while waiting for a signalled process to exit.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Wait after SIGKILL before the record is dropped regardless.
const KILL_SETTLE: Duration = Duration::from_millis(500);

/// Bytes of stderr kept in an [`ExitReport`].
const STDERR_TAIL: usize = 200;

/// What to run. The program is opaque to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Resolve bare program names through `PATH`.
    fn resolve_program(&self) -> Result<PathBuf> {
        if self.program.components().count() > 1 {
            return Ok(self.program.clone());
        }
        which::which(&self.program).map_err(|e| {
            AgentError::Process(format!("program not found: {} ({e})", self.program.display()))
        })
    }

    fn command(&self) -> Result<tokio::process::Command> {
        let mut cmd = tokio::process::Command::new(self.resolve_program()?);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    fn display(&self) -> String {
        self.program.display().to_string()
    }
}

/// Outcome of a stop request. All variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No record for the slot.
    NothingToStop,
    /// A record existed but its process had already gone.
    AlreadyExited { pid: u32 },
    /// The requested signal ended the process within the grace period.
    Terminated { pid: u32 },
    /// The process outlived the grace period and was killed.
    Killed { pid: u32 },
}

impl StopOutcome {
    /// Human-readable ack detail.
    #[must_use]
    pub fn detail(&self, slot: Slot) -> String {
        match self {
            Self::NothingToStop => format!("{slot}: nothing to stop"),
            Self::AlreadyExited { pid } => format!("{slot}: pid={pid} already exited"),
            Self::Terminated { pid } => format!("{slot}: stopped pid={pid}"),
            Self::Killed { pid } => format!("{slot}: killed pid={pid} after grace"),
        }
    }
}

/// Exit of a blocking child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    /// `None` when the child died from a signal.
    pub code: Option<i32>,
    pub stdout: String,
    /// Last characters of stderr, trimmed.
    pub stderr_tail: String,
}

impl ExitReport {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// `rc=<code>` or `rc=signal`, plus stderr when present.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        let rc = self
            .code
            .map_or_else(|| "signal".to_owned(), |c| c.to_string());
        if self.stderr_tail.is_empty() {
            format!("rc={rc}")
        } else {
            format!("rc={rc} stderr={}", self.stderr_tail)
        }
    }
}

/// Stop parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub signal: StopSignal,
    pub grace: Duration,
    pub force_kill: bool,
}

impl StopRequest {
    /// TERM, then KILL after `grace`.
    #[must_use]
    pub fn term(grace: Duration) -> Self {
        Self {
            signal: StopSignal::Term,
            grace,
            force_kill: true,
        }
    }
}

struct Inner {
    pid_dir: PathBuf,
    /// Serializes record reads and writes between callers and reapers.
    records: Mutex<()>,
    shut_down: AtomicBool,
}

/// Tracks one child per [`Slot`]. Cheap to clone.
#[derive(Clone)]
pub struct ProcessTracker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("pid_dir", &self.inner.pid_dir)
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProcessTracker {
    /// Create a tracker storing records under `pid_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if `pid_dir` cannot be created.
    pub fn new(pid_dir: impl Into<PathBuf>) -> Result<Self> {
        let pid_dir = pid_dir.into();
        std::fs::create_dir_all(&pid_dir)?;
        Ok(Self {
            inner: Arc::new(Inner {
                pid_dir,
                records: Mutex::new(()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn pid_dir(&self) -> &Path {
        &self.inner.pid_dir
    }

    fn with_records<T>(&self, f: impl FnOnce(&Path) -> T) -> Result<T> {
        let _guard = self
            .inner
            .records
            .lock()
            .map_err(poisoned("process record"))?;
        Ok(f(&self.inner.pid_dir))
    }

    /// The live record for `slot`, if any. Stale records are cleaned up.
    pub fn active(&self, slot: Slot) -> Result<Option<ProcessRecord>> {
        self.with_records(|dir| match record::read(dir, slot) {
            Some(rec) if signal::is_alive(rec.pid) => Some(rec),
            Some(rec) => {
                record::remove_if(dir, slot, rec.pid);
                None
            }
            None => None,
        })
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(AgentError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Spawn into `slot` and persist its record. Fails if the slot is busy.
    ///
    /// The busy check, spawn and record write happen under one lock, so two
    /// callers racing for the same slot cannot both start a child.
    fn spawn_tracked(&self, slot: Slot, mut cmd: tokio::process::Command, name: &str) -> Result<(Child, u32)> {
        self.ensure_accepting()?;
        let (child, pid) = self.with_records(|dir| {
            match record::read(dir, slot) {
                Some(rec) if signal::is_alive(rec.pid) => {
                    return Err(AgentError::Process(format!("{slot} slot busy with pid={}", rec.pid)));
                }
                Some(rec) => {
                    record::remove_if(dir, slot, rec.pid);
                }
                None => {}
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| AgentError::Process(format!("cannot spawn {name}: {e}")))?;
            let Some(pid) = child.id() else {
                return Err(AgentError::Process(format!("{name} exited before its pid was read")));
            };
            let rec = ProcessRecord {
                pid,
                started_at: crate::timefmt::now_string(),
                kind: slot,
            };
            if let Err(e) = record::write(dir, &rec) {
                let _ = child.start_kill();
                return Err(e);
            }
            Ok((child, pid))
        })??;
        tracing::info!(slot = %slot, pid, program = %name, "process started");
        Ok((child, pid))
    }

    /// Launch a detached child and return its pid without waiting.
    ///
    /// A reaper task removes the record once the child exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker is shut down, the slot is busy, or the
    /// spawn fails.
    pub async fn start(&self, slot: Slot, spec: &LaunchSpec) -> Result<u32> {
        let mut cmd = spec.command()?;
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let (mut child, pid) = self.spawn_tracked(slot, cmd, &spec.display())?;

        let tracker = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let removed = tracker
                .with_records(|dir| record::remove_if(dir, slot, pid))
                .unwrap_or(false);
            match status {
                Ok(status) => tracing::info!(slot = %slot, pid, %status, removed, "process exited"),
                Err(e) => tracing::warn!(slot = %slot, pid, error = %e, "cannot reap process"),
            }
        });
        Ok(pid)
    }

    /// Launch a child and wait for it to exit, bounded by `timeout`.
    ///
    /// On timeout the child's group is stopped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Timeout`] if the deadline elapses, or a spawn error.
    pub async fn start_and_wait(
        &self,
        slot: Slot,
        spec: &LaunchSpec,
        timeout: Duration,
    ) -> Result<ExitReport> {
        let mut cmd = spec.command()?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let (child, pid) = self.spawn_tracked(slot, cmd, &spec.display())?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                self.with_records(|dir| record::remove_if(dir, slot, pid))?;
                let output = result
                    .map_err(|e| AgentError::Process(format!("wait for {slot} pid={pid}: {e}")))?;
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                let tail_start = stderr
                    .char_indices()
                    .rev()
                    .nth(STDERR_TAIL.saturating_sub(1))
                    .map_or(0, |(i, _)| i);
                let report = ExitReport {
                    pid,
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
                    stderr_tail: stderr[tail_start..].to_owned(),
                };
                tracing::info!(slot = %slot, pid, code = ?report.code, "process finished");
                Ok(report)
            }
            Err(_) => {
                tracing::warn!(slot = %slot, pid, timeout_ms = timeout.as_millis() as u64, "process timed out; stopping");
                if let Err(e) = self.stop(slot, StopRequest::term(Duration::from_secs(1))).await {
                    tracing::warn!(slot = %slot, pid, error = %e, "stop after timeout failed");
                }
                Err(AgentError::Timeout(format!(
                    "{slot} pid={pid} did not finish within {}s",
                    timeout.as_secs_f32()
                )))
            }
        }
    }

    /// Stop whatever the record for `slot` names.
    ///
    /// Idempotent: with no record this returns [`StopOutcome::NothingToStop`].
    ///
    /// # Errors
    ///
    /// Returns an error if signalling fails for a reason other than the
    /// process having gone, or if the process outlives the grace period and
    /// `force_kill` is off.
    pub async fn stop(&self, slot: Slot, req: StopRequest) -> Result<StopOutcome> {
        let Some(rec) = self.with_records(|dir| record::read(dir, slot))? else {
            return Ok(StopOutcome::NothingToStop);
        };
        let pid = rec.pid;

        if !signal::is_alive(pid) {
            self.with_records(|dir| record::remove_if(dir, slot, pid))?;
            return Ok(StopOutcome::AlreadyExited { pid });
        }

        tracing::info!(slot = %slot, pid, signal = %req.signal, "sending signal");
        let delivered = signal::send(pid, req.signal)
            .map_err(|e| AgentError::Process(format!("signal {} to pid={pid}: {e}", req.signal)))?;
        if !delivered {
            self.with_records(|dir| record::remove_if(dir, slot, pid))?;
            return Ok(StopOutcome::AlreadyExited { pid });
        }

        if wait_for_exit(pid, req.grace).await {
            self.with_records(|dir| record::remove_if(dir, slot, pid))?;
            return Ok(if req.signal == StopSignal::Kill {
                StopOutcome::Killed { pid }
            } else {
                StopOutcome::Terminated { pid }
            });
        }

        if !req.force_kill {
            return Err(AgentError::Process(format!(
                "{slot} pid={pid} still running after {}ms",
                req.grace.as_millis()
            )));
        }

        tracing::warn!(slot = %slot, pid, signal = %StopSignal::Kill, "grace elapsed; sending signal");
        if let Err(e) = signal::send(pid, StopSignal::Kill) {
            tracing::warn!(slot = %slot, pid, error = %e, "kill failed");
        }
        if !wait_for_exit(pid, KILL_SETTLE).await {
            tracing::warn!(slot = %slot, pid, "process still present after kill");
        }
        self.with_records(|dir| record::remove_if(dir, slot, pid))?;
        Ok(StopOutcome::Killed { pid })
    }

    /// Refuse new starts from now on.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop every slot (best-effort). Used during teardown.
    pub async fn stop_all(&self, grace: Duration) {
        for slot in Slot::ALL {
            match self.stop(slot, StopRequest::term(grace)).await {
                Ok(StopOutcome::NothingToStop) => {}
                Ok(outcome) => tracing::info!(slot = %slot, "{}", outcome.detail(slot)),
                Err(e) => tracing::warn!(slot = %slot, error = %e, "stop during teardown failed"),
            }
        }
    }
}

/// Poll until `pid` is gone or `grace` elapses. Returns whether it exited.
async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !signal::is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}
