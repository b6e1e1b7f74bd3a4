//! # Pulse Channels
//!
//! The private control channel between a parent and its monitor. The parent
//! writes `true` once per interval while it is alive and a final `false` when
//! it stops on purpose. The monitor treats anything else as a reason to stop:
//! a falsy pulse, silence for three intervals, or the channel closing.
//!
//! ## Line Format
//!
//! Over a byte stream each pulse is one line, `true` or `false`. `1` is also
//! read as alive; blank lines are skipped.

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::error::Result;

/// The monitor's end of the channel.
#[async_trait::async_trait]
pub trait PulseSource: Send + 'static {
    /// Waits for the next pulse. `None` once the parent's end is gone.
    ///
    /// Must be cancel-safe: the monitor races it against a timeout.
    async fn recv(&mut self) -> Option<bool>;
}

/// The parent's end of the channel.
#[async_trait::async_trait]
pub trait PulseSink: Send + 'static {
    async fn send(&mut self, alive: bool) -> Result<()>;
}

/// Creates an in-process pulse channel.
pub fn channel() -> (ChannelPulseSink, ChannelPulseSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelPulseSink { tx }, ChannelPulseSource { rx })
}

pub struct ChannelPulseSink {
    tx: mpsc::UnboundedSender<bool>,
}

#[async_trait::async_trait]
impl PulseSink for ChannelPulseSink {
    async fn send(&mut self, alive: bool) -> Result<()> {
        self.tx
            .send(alive)
            .map_err(|_| Error::Pulse("Monitor has gone away".into()))
    }
}

pub struct ChannelPulseSource {
    rx: mpsc::UnboundedReceiver<bool>,
}

#[async_trait::async_trait]
impl PulseSource for ChannelPulseSource {
    async fn recv(&mut self) -> Option<bool> {
        self.rx.recv().await
    }
}

/// Reads pulses from a byte stream, typically the monitor's stdin.
pub struct LinePulseReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send + 'static> LinePulseReader<R> {
    pub fn new(reader: R) -> Self {
        Self { lines: BufReader::new(reader).lines() }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> PulseSource for LinePulseReader<R> {
    async fn recv(&mut self) -> Option<bool> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(line == "true" || line == "1");
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(error = %e, "pulse channel read failed");
                    return None;
                }
            }
        }
    }
}

/// Writes pulses to a byte stream, typically the monitor's stdin pipe.
pub struct LinePulseWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send + 'static> LinePulseWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> PulseSink for LinePulseWriter<W> {
    async fn send(&mut self, alive: bool) -> Result<()> {
        let line: &[u8] = if alive { b"true\n" } else { b"false\n" };
        self.writer
            .write_all(line)
            .await
            .map_err(|e| Error::Pulse(e.to_string()))?;
        self.writer.flush().await.map_err(|e| Error::Pulse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_line_reader_parses_pulses() {
        let mut source = LinePulseReader::new(&b"true\n\n 1 \nyes\nfalse\n"[..]);
        assert_eq!(source.recv().await, Some(true));
        assert_eq!(source.recv().await, Some(true));
        assert_eq!(source.recv().await, Some(false));
        assert_eq!(source.recv().await, Some(false));
        assert_eq!(source.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_and_reader_agree() {
        let (read, write) = tokio::io::duplex(64);
        let mut sink = LinePulseWriter::new(write);
        let mut source = LinePulseReader::new(read);

        sink.send(true).await.unwrap();
        sink.send(false).await.unwrap();
        drop(sink);

        assert_eq!(source.recv().await, Some(true));
        assert_eq!(source.recv().await, Some(false));
        assert_eq!(source.recv().await, None);
    }

    #[tokio::test]
    async fn test_channel_reports_closed_ends() {
        let (mut sink, mut source) = channel();
        sink.send(true).await.unwrap();
        drop(sink);
        assert_eq!(source.recv().await, Some(true));
        assert_eq!(source.recv().await, None);

        let (mut sink, source) = channel();
        drop(source);
        assert!(matches!(sink.send(true).await, Err(Error::Pulse(_))));
    }
}
