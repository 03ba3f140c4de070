//! Byte-stream primitives shared by every framing.
//!
//! Writes loop until the whole buffer is out, retrying interrupted calls.
//! A lost connection closes the link and is reported as [`Sent::Lost`]
//! rather than as an error; genuine I/O failures propagate.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tcpcl_core::sdnv::{self, MAX_SDNV_LEN};
use tcpcl_core::wire::WireError;

use crate::error::TcpclError;

/// Whether `e` means the peer is gone rather than that something broke locally.
pub fn is_connection_loss(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        e.kind(),
        BrokenPipe | ConnectionReset | ConnectionAborted | TimedOut | NotConnected
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH)
    )
}

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Complete(usize),
    /// The connection went away. The link is now disconnected.
    Lost,
}

/// Outcome of an exact-length receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Complete,
    /// Orderly close, interruption, or peer reset after `read` bytes.
    Closed { read: usize },
}

/// The write side of a connection. `None` is the disconnected state.
pub struct Link<W> {
    inner: Option<W>,
}

impl<W> Link<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: Some(writer) }
    }

    pub fn disconnected() -> Self {
        Self { inner: None }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Detach the writer without closing it.
    pub fn take(&mut self) -> Option<W> {
        self.inner.take()
    }
}

impl<W: AsyncWrite + Unpin> Link<W> {
    /// Write all of `buf`.
    pub async fn send_bytes(&mut self, buf: &[u8]) -> Result<Sent, TcpclError> {
        let Some(writer) = self.inner.as_mut() else {
            return Ok(Sent::Lost);
        };
        match write_fully(writer, buf).await {
            Ok(()) => Ok(Sent::Complete(buf.len())),
            Err(e) if is_connection_loss(&e) || e.kind() == io::ErrorKind::WriteZero => {
                tracing::debug!(error = %e, "connection lost during send");
                self.close().await;
                Ok(Sent::Lost)
            }
            Err(e) => Err(TcpclError::io("send", e)),
        }
    }

    /// Shut the writer down and enter the disconnected state.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            let _ = writer.shutdown().await;
        }
    }
}

async fn write_fully<W: AsyncWrite + Unpin>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    loop {
        match writer.flush().await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Fill `buf` from the stream.
pub async fn receive_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<Received, TcpclError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Ok(Received::Closed { read: filled }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted || is_connection_loss(&e) => {
                tracing::debug!(error = %e, "receive stopped");
                return Ok(Received::Closed { read: filled });
            }
            Err(e) => return Err(TcpclError::io("receive", e)),
        }
    }
    Ok(Received::Complete)
}

/// Fill `buf`, treating any close as a truncated `what`.
pub async fn receive_required<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), TcpclError> {
    match receive_bytes(reader, buf).await? {
        Received::Complete => Ok(()),
        Received::Closed { .. } => Err(TcpclError::ClosedMidFrame(what)),
    }
}

/// Copy the raw bytes of an SDNV into `field`, one byte at a time.
///
/// Gives up after ten bytes or when `field` is full. Returns the count.
pub async fn read_sdnv_field<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &mut [u8],
    what: &'static str,
) -> Result<usize, TcpclError> {
    let cap = field.len().min(MAX_SDNV_LEN);
    for i in 0..cap {
        receive_required(reader, &mut field[i..=i], what).await?;
        if sdnv::is_last_byte(field[i]) {
            return Ok(i + 1);
        }
    }
    Err(WireError::LengthFieldTooLong.into())
}

/// Read and decode an SDNV from the stream.
pub async fn read_sdnv<R: AsyncRead + Unpin>(
    reader: &mut R,
    what: &'static str,
) -> Result<u64, TcpclError> {
    let mut field = [0u8; MAX_SDNV_LEN];
    let n = read_sdnv_field(reader, &mut field, what).await?;
    let (value, _) = sdnv::decode(&field[..n]).map_err(WireError::from)?;
    Ok(value)
}
