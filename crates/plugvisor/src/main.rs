use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use plugvisor::CommandSpec;
use plugvisor::HeartbeatConfig;
use plugvisor::LinePulseReader;
use plugvisor::Monitor;
use plugvisor::StdioSink;

/// Runs a command for as long as the parent keeps pulsing on stdin.
///
/// Pulses are lines of `true`; `false`, silence for three intervals, or the
/// end of stdin kill the command. Its stdout and stderr are mirrored onto
/// ours.
#[derive(Parser, Debug)]
#[command(name = "plugvisor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Expected pulse interval
    #[arg(long, env = "PLUGVISOR_INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// How long to wait for the command to die after killing it
    #[arg(long, env = "PLUGVISOR_KILL_TIMEOUT_MS", default_value_t = 2000)]
    kill_timeout_ms: u64,

    /// How long to wait for output forwarding to drain
    #[arg(long, env = "PLUGVISOR_JOIN_TIMEOUT_MS", default_value_t = 1000)]
    join_timeout_ms: u64,

    /// The command to supervise, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    fn config(&self) -> HeartbeatConfig {
        HeartbeatConfig::default()
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_kill_timeout(Duration::from_millis(self.kill_timeout_ms))
            .with_join_timeout(Duration::from_millis(self.join_timeout_ms))
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let result = runtime.block_on(run(args));
    // the stdin reader thread cannot be cancelled, so do not wait for it
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = args.config();
    let (program, rest) = args.command.split_first().context("no command given")?;
    let spec = CommandSpec::new(program).args(rest);

    let pulses = LinePulseReader::new(tokio::io::stdin());
    let monitor = Monitor::spawn(&spec, pulses, Arc::new(StdioSink::new()), &config)
        .with_context(|| format!("failed to start {}", spec))?;
    let report = monitor.join().await?;

    tracing::info!(reason = ?report.reason, teardown = ?report.teardown, "supervision ended");
    Ok(match report.exit_code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}
