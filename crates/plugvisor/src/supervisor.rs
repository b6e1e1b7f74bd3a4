//! # Supervisor
//!
//! The parent side of a heartbeat pair. A supervisor pulses its monitor once
//! per interval and watches that the monitor is still there.
//!
//! Two shapes:
//!
//! - `start` runs the monitor as a task in this process. Useful for tests and
//!   for hosts that only need output forwarding and bounded teardown.
//! - `launch` runs the `plugvisor` binary as the monitor, with the pulse
//!   channel on its stdin. If this process dies without warning, the pipe
//!   closes or the pulses stop, and the monitor kills the child on its own.
//!
//! ## Invariants
//!
//! - Teardown happens once. `stop` may be called any number of times and
//!   every caller sees the same report.
//! - The last pulse a live supervisor sends is `false`.

use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::HeartbeatConfig;
use crate::error::Error;
use crate::error::Result;
use crate::monitor::CommandSpec;
use crate::monitor::Monitor;
use crate::monitor::Report;
use crate::monitor::StopReason;
use crate::monitor::Teardown;
use crate::monitor::kill;
use crate::pulse;
use crate::pulse::LinePulseWriter;
use crate::pulse::PulseSink;
use crate::sink::LogSink;
use crate::sink::Source;
use crate::sink::forward;
use crate::sink::join_forwarders;

/// Where the monitor runs.
enum MonitorSide {
    Task(Monitor),
    Process {
        child: Child,
        forwarders: Vec<JoinHandle<()>>,
        pid: Option<u32>,
    },
}

impl MonitorSide {
    fn is_gone(&mut self) -> bool {
        match self {
            Self::Task(monitor) => monitor.is_finished(),
            Self::Process { child, .. } => !matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Waits for the monitor to wind down after the final pulse.
    async fn finish(self, reason: StopReason, config: &HeartbeatConfig) -> Result<Report> {
        match self {
            Self::Task(monitor) => tokio::time::timeout(config.stop_timeout, monitor.join())
                .await
                .map_err(|_| Error::StopTimeout)?,
            Self::Process { mut child, forwarders, pid } => {
                let teardown = match tokio::time::timeout(config.stop_timeout, child.wait()).await {
                    Ok(Ok(status)) => Teardown::Exited(status),
                    Ok(Err(e)) => Teardown::WaitFailed(e.to_string()),
                    Err(_) => {
                        tracing::warn!(?pid, "monitor process did not stop, killing it");
                        kill(&mut child, config.kill_timeout, pid).await
                    }
                };
                join_forwarders(forwarders, config.join_timeout, pid).await;
                Ok(Report { reason, teardown })
            }
        }
    }
}

/// Keeps a child process alive only as long as this supervisor is.
pub struct Supervisor {
    pid: Option<u32>,
    stopping: AtomicBool,
    stop: Arc<Notify>,
    task: Mutex<Option<JoinHandle<Result<Report>>>>,
    report: OnceCell<Result<Report>>,
}

impl Supervisor {
    /// Spawns `spec` under an in-process monitor.
    pub fn start(spec: &CommandSpec, sink: Arc<dyn LogSink>, config: HeartbeatConfig) -> Result<Self> {
        let (pulses, source) = pulse::channel();
        let monitor = Monitor::spawn(spec, source, sink, &config)?;
        let pid = monitor.pid();
        Ok(Self::run(pid, pulses, MonitorSide::Task(monitor), config))
    }

    /// Spawns `spec` under a separate monitor process running `monitor_exe`
    /// (the `plugvisor` binary). The monitor's own stdout and stderr, which
    /// mirror the child's, are forwarded to `sink`.
    pub fn launch(
        monitor_exe: impl AsRef<OsStr>,
        spec: &CommandSpec,
        sink: Arc<dyn LogSink>,
        config: HeartbeatConfig,
    ) -> Result<Self> {
        let mut command = Command::new(monitor_exe.as_ref());
        command
            .arg("--interval-ms")
            .arg(config.interval.as_millis().to_string())
            .arg("--kill-timeout-ms")
            .arg(config.kill_timeout.as_millis().to_string())
            .arg("--join-timeout-ms")
            .arg(config.join_timeout.as_millis().to_string())
            .arg("--")
            .arg(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", monitor_exe.as_ref().to_string_lossy(), e)))?;

        let stdin = child.stdin.take().ok_or(Error::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(Error::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(Error::MissingPipe("stderr"))?;
        let forwarders = vec![
            forward(stdout, Source::Stdout, sink.clone()),
            forward(stderr, Source::Stderr, sink),
        ];

        let pid = child.id();
        tracing::info!(?pid, command = %spec, "monitor process started");
        let side = MonitorSide::Process { child, forwarders, pid };
        Ok(Self::run(pid, LinePulseWriter::new(stdin), side, config))
    }

    fn run<S: PulseSink>(pid: Option<u32>, pulses: S, side: MonitorSide, config: HeartbeatConfig) -> Self {
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(pulse_loop(pulses, side, config, stop.clone()));
        Self {
            pid,
            stopping: AtomicBool::new(false),
            stop,
            task: Mutex::new(Some(task)),
            report: OnceCell::new(),
        }
    }

    /// Pid of the monitored process: the child itself under `start`, the
    /// monitor process under `launch`.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stops supervision and tears the child down. Idempotent.
    pub async fn stop(&self) -> Result<Report> {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            tracing::info!(pid = ?self.pid, "stop requested");
        }
        self.stop.notify_one();
        self.wait().await
    }

    /// Waits for supervision to end without asking it to, e.g. after the
    /// child exits on its own.
    pub async fn wait(&self) -> Result<Report> {
        self.report
            .get_or_init(|| async {
                match self.task.lock().await.take() {
                    Some(task) => task.await.map_err(Error::from).and_then(|report| report),
                    None => Err(Error::Join("Pulse loop already consumed".into())),
                }
            })
            .await
            .clone()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

/// Pulses `true` every interval until stopped or the monitor is gone, then
/// sends `false` and waits for the monitor to finish.
async fn pulse_loop<S: PulseSink>(
    mut pulses: S,
    mut side: MonitorSide,
    config: HeartbeatConfig,
    stop: Arc<Notify>,
) -> Result<Report> {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = stop.notified() => break StopReason::Requested,
            _ = ticker.tick() => {
                if side.is_gone() {
                    tracing::warn!("monitor is gone");
                    break StopReason::MonitorLost;
                }
                if let Err(e) = pulses.send(true).await {
                    tracing::warn!(error = %e, "pulse not delivered");
                    break StopReason::MonitorLost;
                }
            }
        }
    };

    if let Err(e) = pulses.send(false).await {
        tracing::debug!(error = %e, "final pulse not delivered");
        if let MonitorSide::Task(monitor) = &side {
            monitor.request_stop();
        }
    }
    drop(pulses);

    side.finish(reason, &config).await
}
