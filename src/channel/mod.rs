//! Deadline-bounded byte channel
//!
//! Wraps a byte-stream connection and turns every connect/read/write into an
//! operation that either completes or is cancelled after a caller-supplied
//! duration, reporting exactly one outcome. The underlying transport is
//! pluggable so plain TCP and TLS-wrapped streams get identical timeout
//! semantics.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::core::{Error, Result};

/// Default per-operation timeout when the caller passes `None`
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory for the underlying byte stream.
///
/// `reset()` on the channel calls this again, so a connector must be able to
/// produce a fresh stream for every call.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    async fn connect(&mut self) -> io::Result<Self::Stream>;
}

/// Connects over plain TCP to a host/port pair.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpConnector {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }
}

/// Races an I/O future against a deadline.
///
/// The select is biased towards the I/O arm: a completion that lands before
/// the timer is observed always wins, even if the timer is also ready. A
/// timer wake-up that fires before its configured deadline is detected by
/// comparing against the clock and re-armed with no side effects.
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let deadline = Instant::now() + limit;
    tokio::pin!(fut);
    let timer = sleep_until(deadline);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;
            res = &mut fut => {
                return res.map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => Error::Eof,
                    _ => Error::Io(e),
                });
            }
            _ = &mut timer => {
                if Instant::now() < deadline {
                    // Spurious wake-up: the deadline was pushed back while
                    // the timer was pending. Restart the wait.
                    timer.as_mut().reset(deadline);
                    continue;
                }
                return Err(Error::Timeout(limit));
            }
        }
    }
}

/// A byte channel whose every operation is bounded by a deadline.
pub struct DeadlineChannel<C: Connector> {
    connector: C,
    stream: Option<C::Stream>,
    default_timeout: Duration,
    /// Bytes read off the wire but not yet consumed by a caller
    buf: BytesMut,
}

impl<C: Connector> DeadlineChannel<C> {
    /// Creates a channel; no connection is attempted until `connect`.
    pub fn new(connector: C, default_timeout: Option<Duration>) -> Self {
        DeadlineChannel {
            connector,
            stream: None,
            default_timeout: default_timeout.unwrap_or(DEFAULT_TIMEOUT),
            buf: BytesMut::with_capacity(1024),
        }
    }

    fn limit(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    fn stream_mut(&mut self) -> Result<&mut C::Stream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::transport("channel is not connected"))
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the underlying connection.
    pub async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        let limit = self.limit(timeout);
        let stream = bounded(limit, self.connector.connect()).await?;
        self.stream = Some(stream);
        self.buf.clear();
        Ok(())
    }

    /// Tears down the connection and dials again in place. Used after a
    /// fatal transport error when the caller wants to keep the channel
    /// object alive.
    pub async fn reset(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream = None;
        self.buf.clear();
        self.connect(timeout).await
    }

    /// Drops the connection. The channel stays usable after a `connect`.
    pub fn close(&mut self) {
        self.stream = None;
        self.buf.clear();
    }

    /// Writes the whole buffer or fails.
    pub async fn write_all(&mut self, bytes: &[u8], timeout: Option<Duration>) -> Result<()> {
        let limit = self.limit(timeout);
        let stream = self.stream_mut()?;
        bounded(limit, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
    }

    /// Reads exactly `n` bytes, consuming previously buffered bytes first.
    pub async fn read_exactly(&mut self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let limit = self.limit(timeout);
        let stream = self.stream.as_mut().ok_or_else(|| Error::transport("channel is not connected"))?;
        let buf = &mut self.buf;
        bounded(limit, async {
            while buf.len() < n {
                let read = stream.read_buf(buf).await?;
                if read == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                }
            }
            Ok(())
        })
        .await?;
        Ok(self.buf.split_to(n).to_vec())
    }

    /// Reads until `delimiter` is seen; returns everything up to and
    /// including the delimiter.
    pub async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        debug_assert!(!delimiter.is_empty());
        let limit = self.limit(timeout);
        let stream = self.stream.as_mut().ok_or_else(|| Error::transport("channel is not connected"))?;
        let buf = &mut self.buf;
        let end = bounded(limit, async {
            loop {
                if let Some(pos) = find_subslice(buf, delimiter) {
                    return Ok(pos + delimiter.len());
                }
                let read = stream.read_buf(buf).await?;
                if read == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                }
            }
        })
        .await?;
        Ok(self.buf.split_to(end).to_vec())
    }

    /// Reads until the peer closes the stream.
    pub async fn read_to_eof(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let limit = self.limit(timeout);
        let stream = self.stream.as_mut().ok_or_else(|| Error::transport("channel is not connected"))?;
        let buf = &mut self.buf;
        bounded(limit, async {
            loop {
                let read = stream.read_buf(buf).await?;
                if read == 0 {
                    return Ok(());
                }
            }
        })
        .await?;
        Ok(self.buf.split().to_vec())
    }

    /// Discards buffered bytes and drains whatever is still sitting on the
    /// wire. Called before retrying a step so a stale partial response
    /// cannot be mistaken for the next one. A timeout here is the expected
    /// outcome, not an error. With no connection there is nothing to drain,
    /// so retrying a failed connect goes through here unharmed.
    pub async fn flush_pending(&mut self) -> Result<()> {
        let discarded = self.buf.len();
        self.buf.clear();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut scratch = [0u8; 256];
        let mut drained = discarded;
        loop {
            match bounded(Duration::from_millis(100), stream.read(&mut scratch)).await {
                Ok(0) => return Err(Error::Eof),
                Ok(n) => drained += n,
                Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }
        if drained > 0 {
            debug!(bytes = drained, "flushed stray bytes before retry");
        }
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
