//! # Transport Abstraction
//!
//! A minimal, async interface for moving records between a host and a plugin.
//!
//! ## Philosophy
//!
//! - **Record-Oriented**: The Transport knows nothing about requests, handles or
//!   values. It moves opaque lines, one record per `send`/`recv`.
//! - **One Reader**: `recv` is only ever driven by the single read loop of the
//!   owning peer.
//! - **Fire and Forget**: Outbound traffic goes through an `Outbox`; a failed
//!   write is handed to the poster's rejection callback, never raised at the
//!   call site.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// End of the input stream, or the other side is gone.
    Closed(String),
    /// The descriptor failed mid-read or mid-write.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed(msg) => write!(f, "Transport closed: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => Self::Closed(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex, record-framed byte channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one record. The payload must not contain the delimiter.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Reads the next record.
    ///
    /// # Invariants
    /// - Returns `Ok(None)` once the input stream has ended.
    /// - Never returns a partial record.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the write half, so the other side reads end-of-input. Later
    /// sends fail with `Closed`.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A transport over any pair of async byte streams, framing records with `\n`.
pub struct StreamTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<Option<W>>,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }
}

impl StreamTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Binds to the process' own stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[cfg(unix)]
impl StreamTransport<tokio::fs::File, tokio::fs::File> {
    /// Binds to a pair of descriptors pre-opened by the launching process.
    ///
    /// # Safety
    /// Both descriptors must be open, owned by nobody else, and distinct.
    /// The transport takes ownership and closes them on drop.
    pub unsafe fn from_raw_fds(input: std::os::fd::RawFd, output: std::os::fd::RawFd) -> Self {
        use std::os::fd::FromRawFd;

        // SAFETY: upheld by the caller.
        let (input, output) = unsafe {
            (std::fs::File::from_raw_fd(input), std::fs::File::from_raw_fd(output))
        };
        Self::new(tokio::fs::File::from_std(input), tokio::fs::File::from_std(output))
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| Error::Closed("Write half closed".into()))?;
        writer.write_all(payload).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Ok(None);
            }

            // strip the delimiter; a final unterminated record still counts
            if line.last() == Some(&b'\n') {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    async fn close(&self) -> Result<()> {
        // dropping the writer releases the descriptor, even where shutdown
        // only flushes
        match self.writer.lock().await.take() {
            Some(mut writer) => Ok(writer.shutdown().await?),
            None => Ok(()),
        }
    }
}

/// Called with the write error when a posted record could not be delivered.
pub type Reject = Box<dyn FnOnce(Error) + Send + 'static>;

enum Outgoing {
    Record(Vec<u8>, Reject),
    Close,
}

/// The single writer for one transport.
///
/// Records are written in the order they were posted. Posting never blocks
/// and never fails at the call site.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    /// Spawns the writer task. It ends once every `Outbox` clone is dropped,
    /// or after `close`.
    pub fn spawn(transport: Arc<dyn Transport>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

        tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                match outgoing {
                    Outgoing::Record(payload, reject) => {
                        if let Err(e) = transport.send(&payload).await {
                            tracing::debug!(error = %e, "outbound record rejected");
                            reject(e);
                        }
                    }
                    Outgoing::Close => {
                        if let Err(e) = transport.close().await {
                            tracing::debug!(error = %e, "transport did not close cleanly");
                        }
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queues a record for writing.
    pub fn post(&self, payload: Vec<u8>, reject: Reject) {
        if let Err(mpsc::error::SendError(Outgoing::Record(_, reject))) = self.tx.send(Outgoing::Record(payload, reject)) {
            reject(Error::Closed("Writer task has stopped".into()));
        }
    }

    /// Writes what is already queued, then closes the transport's write half.
    /// Records posted afterwards are rejected.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}
