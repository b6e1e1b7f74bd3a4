//! # Log Sinks
//!
//! Where a supervised child's output goes. Every line is tagged with the
//! stream it came from; the monitor's own lifecycle lines (`exiting`,
//! `exited`) use `Source::Supervisor`.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Stdout,
    Stderr,
    Supervisor,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
            Self::Supervisor => write!(f, "supervisor"),
        }
    }
}

#[async_trait::async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn line(&self, source: Source, line: &str);

    /// Called once, after the last line.
    async fn close(&self) {}
}

/// Emits every line as a tracing event.
#[derive(Debug, Clone)]
pub struct TracingSink {
    name: String,
}

impl TracingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl LogSink for TracingSink {
    async fn line(&self, source: Source, line: &str) {
        match source {
            Source::Stderr => tracing::warn!(child = %self.name, %source, "{}", line),
            _ => tracing::info!(child = %self.name, %source, "{}", line),
        }
    }
}

/// Captures lines in memory for testing and inspection.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<(Source, String)>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all captured lines in arrival order.
    pub async fn lines(&self) -> Vec<(Source, String)> {
        self.lines.lock().await.clone()
    }

    /// Returns the captured lines from one source.
    pub async fn lines_from(&self, source: Source) -> Vec<String> {
        self.lines
            .lock()
            .await
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LogSink for MemorySink {
    async fn line(&self, source: Source, line: &str) {
        self.lines.lock().await.push((source, line.to_string()));
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Mirrors child output onto this process' own stdout and stderr, so a
/// parent reading them sees the child's streams unchanged. Supervisor lines
/// go to tracing.
pub struct StdioSink {
    stdout: Mutex<tokio::io::Stdout>,
    stderr: Mutex<tokio::io::Stderr>,
}

impl StdioSink {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
            stderr: Mutex::new(tokio::io::stderr()),
        }
    }
}

impl Default for StdioSink {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &Mutex<W>, line: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[async_trait::async_trait]
impl LogSink for StdioSink {
    async fn line(&self, source: Source, line: &str) {
        let written = match source {
            Source::Stdout => write_line(&self.stdout, line).await,
            Source::Stderr => write_line(&self.stderr, line).await,
            Source::Supervisor => {
                tracing::info!("{}", line);
                Ok(())
            }
        };
        if let Err(e) = written {
            tracing::debug!(%source, error = %e, "dropped child output");
        }
    }
}

/// Spawns a task copying `reader` into `sink` line by line until EOF.
/// Bytes that are not UTF-8 are replaced rather than ending the copy; a
/// forwarder that gave up would leave the child writing into a closed pipe.
pub(crate) fn forward<R>(reader: R, source: Source, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    sink.line(source, &String::from_utf8_lossy(&buf)).await;
                }
                Err(e) => {
                    tracing::warn!(%source, error = %e, "output forwarding stopped");
                    break;
                }
            }
        }
    })
}

/// Waits for each forwarder to drain, at most `limit` apiece. Stragglers
/// are aborted; a grandchild holding the pipe open must not stall teardown.
pub(crate) async fn join_forwarders(forwarders: Vec<JoinHandle<()>>, limit: Duration, pid: Option<u32>) {
    for mut forwarder in forwarders {
        if tokio::time::timeout(limit, &mut forwarder).await.is_err() {
            tracing::warn!(?pid, "output forwarder did not finish, aborting it");
            forwarder.abort();
        }
    }
}
