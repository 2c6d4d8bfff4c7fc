//! Line-delimited duplex control channel.
//!
//! Every message is a single ASCII line terminated by `\n`. Reads come in two
//! flavours: bounded (fail with [`ChannelError::Timeout`]) and cancellable
//! (abort when a [`StopFlag`] is set). A read of zero bytes means the peer
//! closed its side and yields [`ChannelError::Eof`].

use crate::error::{ChannelError, ControlError};
use crate::stop::StopFlag;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace};

/// Bounded wait used on the control path.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(60);

pub type TcpLineReader = LineReader<OwnedReadHalf>;
pub type TcpLineWriter = LineWriter<OwnedWriteHalf>;

/// Bind a control listener.
pub async fn listen(addr: SocketAddr) -> Result<TcpListener, ControlError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ControlError::Bind { addr, source })?;
    info!("Listening on {}", addr);
    Ok(listener)
}

/// Split a connected socket into its reading and writing halves.
pub fn split(stream: TcpStream) -> (TcpLineReader, TcpLineWriter) {
    let (read, write) = stream.into_split();
    (LineReader::new(read), LineWriter::new(write))
}

pub struct LineReader<R> {
    inner: BufReader<R>,
    // Partial line kept across cancelled reads.
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Read one line, failing if nothing complete arrives within `timeout`.
    pub async fn read_line_timeout(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        let read = tokio::time::timeout(timeout, self.inner.read_until(b'\n', &mut self.buf)).await;
        match read {
            Ok(read) => self.take_line(read?),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    /// Read one line with no deadline. Returns `Ok(None)` as soon as `stop`
    /// is set; the socket is left untouched so a concurrent writer keeps
    /// working.
    pub async fn read_line_cancellable(
        &mut self,
        stop: &StopFlag,
    ) -> Result<Option<String>, ChannelError> {
        if stop.is_set() {
            return Ok(None);
        }
        let read = tokio::select! {
            read = self.inner.read_until(b'\n', &mut self.buf) => Some(read),
            _ = stop.wait() => None,
        };
        match read {
            Some(read) => self.take_line(read?).map(Some),
            None => {
                trace!("Cancellable read interrupted by stop flag");
                Ok(None)
            }
        }
    }

    fn take_line(&mut self, read: usize) -> Result<String, ChannelError> {
        if read == 0 && self.buf.is_empty() {
            return Err(ChannelError::Eof);
        }
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        debug!(line = %line, "Line received");
        Ok(line)
    }
}

pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write `line` followed by `\n` and flush it immediately.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        debug!(line = %line, "Line sent");
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush pending data and close the writing half.
    pub async fn finish(&mut self) -> Result<(), ChannelError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}
