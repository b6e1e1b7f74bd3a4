//! # Monitor
//!
//! The monitored side of a heartbeat pair. A monitor owns one child process
//! and keeps it alive only while pulses keep arriving.
//!
//! ## Lifecycle
//!
//! `Starting → Running → Stopping → Terminated`
//!
//! - **Starting**: the child is spawned with piped stdout/stderr and one
//!   forwarder per stream feeds the log sink.
//! - **Running**: waits up to three intervals for each pulse. A missed
//!   deadline, a `false` pulse, a closed channel or the child exiting on its
//!   own all move to Stopping.
//! - **Stopping**: logs `exiting`, kills the child and waits for it (bounded),
//!   joins the forwarders (bounded), logs `exited`, closes the sink.
//!
//! ## Invariants
//!
//! - Stopping runs at most once per monitor.
//! - `exited` is the last line the sink receives.

use std::ffi::OsString;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HeartbeatConfig;
use crate::error::Error;
use crate::error::Result;
use crate::pulse::PulseSource;
use crate::sink::LogSink;
use crate::sink::Source;
use crate::sink::forward;
use crate::sink::join_forwarders;

/// An executable and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No pulse within three intervals.
    PulseTimeout,
    /// The parent sent `false`.
    StopPulse,
    /// The parent's end of the pulse channel went away.
    ChannelClosed,
    /// The child exited on its own.
    ChildExited,
    /// Stop was requested locally.
    Requested,
    /// The monitor ended without being asked to.
    MonitorLost,
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    Exited(ExitStatus),
    /// The child was still alive when the kill deadline passed.
    KillTimeout,
    /// Waiting on the child failed.
    WaitFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub reason: StopReason,
    pub teardown: Teardown,
}

impl Report {
    /// The child's exit code, when it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.teardown {
            Teardown::Exited(status) => status.code(),
            _ => None,
        }
    }
}

/// A running monitor. Dropping it does not stop the child; use
/// `request_stop` and `join`.
pub struct Monitor {
    pid: Option<u32>,
    state: watch::Receiver<MonitorState>,
    stop: Arc<Notify>,
    task: JoinHandle<Report>,
}

impl Monitor {
    /// Spawns `spec` and starts watching `pulses`. Must be called inside a
    /// tokio runtime.
    pub fn spawn<P: PulseSource>(
        spec: &CommandSpec,
        pulses: P,
        sink: Arc<dyn LogSink>,
        config: &HeartbeatConfig,
    ) -> Result<Self> {
        let (state_tx, state) = watch::channel(MonitorState::Starting);

        let mut child = spec
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", spec, e)))?;

        let stdout = child.stdout.take().ok_or(Error::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(Error::MissingPipe("stderr"))?;
        let forwarders = vec![
            forward(stdout, Source::Stdout, sink.clone()),
            forward(stderr, Source::Stderr, sink.clone()),
        ];

        let pid = child.id();
        tracing::info!(?pid, command = %spec, "child started");

        let stop = Arc::new(Notify::new());
        let watcher = Watch {
            child,
            forwarders,
            sink,
            config: config.clone(),
            state: state_tx,
            pid,
        };
        let task = tokio::spawn(watcher.run(pulses, stop.clone()));

        Ok(Self { pid, state, stop, task })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// True once the monitor has finished its teardown.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the monitor to stop as if the parent had sent `false`.
    pub fn request_stop(&self) {
        self.stop.notify_one();
    }

    /// Resolves when the monitor reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| *state == MonitorState::Terminated).await;
    }

    /// Waits for the monitor to finish and returns its report.
    pub async fn join(self) -> Result<Report> {
        Ok(self.task.await?)
    }
}

/// State owned by the monitor task.
struct Watch {
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
    sink: Arc<dyn LogSink>,
    config: HeartbeatConfig,
    state: watch::Sender<MonitorState>,
    pid: Option<u32>,
}

impl Watch {
    async fn run<P: PulseSource>(mut self, mut pulses: P, stop: Arc<Notify>) -> Report {
        self.state.send_replace(MonitorState::Running);
        let pulse_timeout = self.config.pulse_timeout();

        let (reason, status) = loop {
            tokio::select! {
                status = self.child.wait() => break (StopReason::ChildExited, Some(status)),
                _ = stop.notified() => break (StopReason::Requested, None),
                pulse = tokio::time::timeout(pulse_timeout, pulses.recv()) => match pulse {
                    Ok(Some(true)) => continue,
                    Ok(Some(false)) => break (StopReason::StopPulse, None),
                    Ok(None) => break (StopReason::ChannelClosed, None),
                    Err(_) => break (StopReason::PulseTimeout, None),
                },
            }
        };

        self.finish(reason, status).await
    }

    async fn finish(mut self, reason: StopReason, status: Option<std::io::Result<ExitStatus>>) -> Report {
        self.state.send_replace(MonitorState::Stopping);
        tracing::info!(pid = ?self.pid, ?reason, "stopping child");
        self.sink.line(Source::Supervisor, "exiting").await;

        let teardown = match status {
            Some(Ok(status)) => Teardown::Exited(status),
            Some(Err(e)) => Teardown::WaitFailed(e.to_string()),
            None => kill(&mut self.child, self.config.kill_timeout, self.pid).await,
        };

        join_forwarders(std::mem::take(&mut self.forwarders), self.config.join_timeout, self.pid).await;

        self.sink.line(Source::Supervisor, "exited").await;
        self.sink.close().await;
        tracing::info!(pid = ?self.pid, ?teardown, "child terminated");
        self.state.send_replace(MonitorState::Terminated);

        Report { reason, teardown }
    }
}

/// Force-kills the child and waits for it, at most `limit`.
pub(crate) async fn kill(child: &mut Child, limit: Duration, pid: Option<u32>) -> Teardown {
    if let Err(e) = child.start_kill() {
        // already reaped, or already gone
        tracing::debug!(?pid, error = %e, "kill failed");
    }
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Teardown::Exited(status),
        Ok(Err(e)) => Teardown::WaitFailed(e.to_string()),
        Err(_) => {
            tracing::error!(?pid, ?limit, "child survived the kill deadline");
            Teardown::KillTimeout
        }
    }
}
