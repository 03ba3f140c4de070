//! One live connection: handshake, receiver task, keepalive ticker.
//!
//! The write half sits behind a mutex shared by whoever sends bundles and
//! the keepalive ticker; each segment is written whole under one lock.
//! The read half is owned by the receiver task alone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tcpcl_core::config::{Framing, TcpclConfig};
use tcpcl_core::wire::{
    encode_data_header, encode_keepalive, encode_length_prefix, ContactHeader, DataFlags,
    ShutdownSegment,
};

use crate::bundle::{AcquisitionSink, PeerInfo};
use crate::error::TcpclError;
use crate::handshake::{exchange_contact_headers, resolve_local_eid};
use crate::io::{Link, Sent};
use crate::segment::{receive_loop, ReceiveStop};
use crate::simple::receive_simple_loop;

/// Per-session settings shared by inducts and outducts.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub local_eid: String,
    /// Keepalive interval we ask for, seconds.
    pub keepalive_secs: u16,
    pub keepalive_tick: Duration,
    pub transfer_buffer_size: usize,
    pub framing: Framing,
    pub rx_delay_nsec_per_byte: u64,
}

impl SessionParams {
    pub fn from_config(config: &TcpclConfig, framing: Framing) -> Self {
        Self {
            local_eid: resolve_local_eid(&config.node.local_eid),
            keepalive_secs: config.session.keepalive_secs,
            keepalive_tick: config.session.keepalive_tick(),
            transfer_buffer_size: config.session.transfer_buffer_size.max(1),
            framing,
            rx_delay_nsec_per_byte: config.session.rx_delay_nsec_per_byte,
        }
    }
}

/// What each side learned during setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer: PeerInfo,
    /// Negotiated keepalive seconds. Zero means no ticker.
    pub keepalive: u16,
    pub framing: Framing,
}

// ── Transmitter ───────────────────────────────────────────────────────────────

/// The write side of a session.
pub struct Transmitter<W> {
    link: Link<W>,
    framing: Framing,
    last_send: Instant,
    scratch: BytesMut,
}

pub type SharedTransmitter = Arc<Mutex<Transmitter<OwnedWriteHalf>>>;

impl<W: AsyncWrite + Unpin> Transmitter<W> {
    pub fn new(link: Link<W>, framing: Framing) -> Self {
        Self {
            link,
            framing,
            last_send: Instant::now(),
            scratch: BytesMut::with_capacity(16),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Time since the last successful write of any kind.
    pub fn idle_for(&self) -> Duration {
        self.last_send.elapsed()
    }

    pub(crate) fn link_mut(&mut self) -> &mut Link<W> {
        &mut self.link
    }

    async fn send_scratch(&mut self) -> Result<Sent, TcpclError> {
        let sent = self.link.send_bytes(&self.scratch).await?;
        self.scratch.clear();
        if let Sent::Complete(_) = sent {
            self.last_send = Instant::now();
        }
        Ok(sent)
    }

    /// Keepalive segment, or a zero length prefix in simple framing.
    pub async fn send_keepalive(&mut self) -> Result<Sent, TcpclError> {
        self.scratch.clear();
        match self.framing {
            Framing::Tcpcl => {
                encode_keepalive(&mut self.scratch);
            }
            Framing::Simple => self.scratch.extend_from_slice(&[0u8; 4]),
        }
        self.send_scratch().await
    }

    /// Shutdown segment. Simple framing has none; nothing is written.
    pub async fn send_shutdown(&mut self, shutdown: ShutdownSegment) -> Result<Sent, TcpclError> {
        if self.framing == Framing::Simple {
            return Ok(Sent::Complete(0));
        }
        self.scratch.clear();
        shutdown.encode(&mut self.scratch);
        self.send_scratch().await
    }

    /// Write one segment of `length` bundle bytes taken from `reader`.
    ///
    /// The payload is streamed through `buf`. If anything fails after the
    /// header went out, the link is closed since the stream is no longer
    /// in sync.
    pub async fn send_segment<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        flags: DataFlags,
        length: u64,
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<Sent, TcpclError> {
        self.scratch.clear();
        match self.framing {
            Framing::Tcpcl => {
                encode_data_header(&mut self.scratch, flags, length);
            }
            Framing::Simple => {
                let prefix = encode_length_prefix(length)?;
                self.scratch.extend_from_slice(&prefix);
            }
        }
        if let Sent::Lost = self.send_scratch().await? {
            return Ok(Sent::Lost);
        }

        match self.stream_payload(length, reader, buf).await {
            Ok(Sent::Complete(_)) => {
                self.last_send = Instant::now();
                Ok(Sent::Complete(length as usize))
            }
            Ok(Sent::Lost) => Ok(Sent::Lost),
            Err(e) => {
                self.link.close().await;
                Err(e)
            }
        }
    }

    async fn stream_payload<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        length: u64,
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<Sent, TcpclError> {
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader
                .read(&mut buf[..want])
                .await
                .map_err(|e| TcpclError::io("read bundle", e))?;
            if n == 0 {
                return Err(TcpclError::io(
                    "read bundle",
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("bundle ended {remaining} bytes short"),
                    ),
                ));
            }
            if let Sent::Lost = self.link.send_bytes(&buf[..n]).await? {
                return Ok(Sent::Lost);
            }
            remaining -= n as u64;
        }
        Ok(Sent::Complete(length as usize))
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}

// ── Keepalive ticker ──────────────────────────────────────────────────────────

/// Why a keepalive ticker returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveExit {
    Stopped,
    /// Someone else closed the link.
    LinkDown,
    /// A keepalive could not be sent.
    SendFailed,
}

/// Send a keepalive whenever nothing has been written for `period`.
///
/// Sleeps one `tick` at a time, so the real cadence is at least `period`.
pub async fn keepalive_ticker<W: AsyncWrite + Unpin>(
    tx: Arc<Mutex<Transmitter<W>>>,
    period: Duration,
    tick: Duration,
    peer_addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
) -> KeepaliveExit {
    loop {
        tokio::select! {
            _ = stop.changed() => return KeepaliveExit::Stopped,
            _ = tokio::time::sleep(tick) => {}
        }
        if *stop.borrow() {
            return KeepaliveExit::Stopped;
        }

        let mut guard = tx.lock().await;
        if !guard.is_connected() {
            tracing::debug!(%peer_addr, "link closed, keepalive ticker exiting");
            return KeepaliveExit::LinkDown;
        }
        if guard.idle_for() < period {
            continue;
        }
        match guard.send_keepalive().await {
            Ok(Sent::Complete(_)) => tracing::trace!(%peer_addr, "keepalive sent"),
            Ok(Sent::Lost) => {
                tracing::info!(%peer_addr, "connection lost sending keepalive");
                return KeepaliveExit::SendFailed;
            }
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "keepalive failed");
                guard.close().await;
                return KeepaliveExit::SendFailed;
            }
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A connection after setup, with its background tasks running.
pub struct Session {
    info: SessionInfo,
    tx: SharedTransmitter,
    stop: watch::Sender<bool>,
    receiver: Option<JoinHandle<Result<ReceiveStop, TcpclError>>>,
    keepalive: Option<JoinHandle<()>>,
    keepalive_failed: Arc<AtomicBool>,
}

impl Session {
    /// Exchange contact headers (TCPCL framing only) and start the
    /// receiver and, if a keepalive period was agreed, the ticker.
    pub async fn establish(
        stream: TcpStream,
        params: &SessionParams,
        sink: Arc<dyn AcquisitionSink>,
    ) -> Result<Session, TcpclError> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TcpclError::io("peer_addr", e))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(params.transfer_buffer_size, read_half);
        let mut tx = Transmitter::new(Link::new(write_half), params.framing);

        let (peer_eid, keepalive) = match params.framing {
            Framing::Tcpcl => {
                let local = ContactHeader::local(params.keepalive_secs, params.local_eid.clone());
                let negotiated = exchange_contact_headers(&mut reader, tx.link_mut(), &local).await?;
                (Some(negotiated.peer.local_eid), negotiated.keepalive)
            }
            Framing::Simple => (None, params.keepalive_secs),
        };

        let info = SessionInfo {
            peer: PeerInfo {
                addr: peer_addr,
                eid: peer_eid,
            },
            keepalive,
            framing: params.framing,
        };
        let tx = Arc::new(Mutex::new(tx));
        let (stop, stop_rx) = watch::channel(false);

        let receiver = tokio::spawn(run_receiver(
            reader,
            tx.clone(),
            sink,
            info.peer.clone(),
            params.clone(),
            stop_rx.clone(),
        ));

        let keepalive_failed = Arc::new(AtomicBool::new(false));
        let keepalive = (keepalive > 0).then(|| {
            let ticker = keepalive_ticker(
                tx.clone(),
                Duration::from_secs(u64::from(keepalive)),
                params.keepalive_tick,
                peer_addr,
                stop_rx,
            );
            let failed = keepalive_failed.clone();
            tokio::spawn(async move {
                if ticker.await == KeepaliveExit::SendFailed {
                    failed.store(true, Ordering::Relaxed);
                }
            })
        });

        Ok(Session {
            info,
            tx,
            stop,
            receiver: Some(receiver),
            keepalive,
            keepalive_failed,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn transmitter(&self) -> SharedTransmitter {
        self.tx.clone()
    }

    /// The receiver or ticker has exited, so the connection is unusable.
    pub fn is_finished(&self) -> bool {
        self.receiver.as_ref().map_or(true, |h| h.is_finished())
            || self.keepalive.as_ref().map_or(false, |h| h.is_finished())
    }

    /// A keepalive could not be sent. A ticker that exited because the
    /// link was already closed does not count.
    pub fn keepalive_failed(&self) -> bool {
        self.keepalive_failed.load(Ordering::Relaxed)
    }

    /// Wait for the receiver to stop on its own.
    pub async fn wait(&mut self) -> Result<ReceiveStop, TcpclError> {
        let Some(handle) = self.receiver.as_mut() else {
            return Ok(ReceiveStop::Stopped);
        };
        let result = handle.await;
        self.receiver = None;
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(peer_addr = %self.info.peer.addr, error = %e, "receiver task died");
                Ok(ReceiveStop::Stopped)
            }
        }
    }

    /// Stop both tasks, close the socket, and join everything.
    pub async fn close(mut self) -> Option<Result<ReceiveStop, TcpclError>> {
        let _ = self.stop.send(true);
        let outcome = match self.receiver.take() {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        if let Some(handle) = self.keepalive.take() {
            let _ = handle.await;
        }
        self.tx.lock().await.close().await;
        outcome
    }
}

async fn run_receiver(
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    tx: SharedTransmitter,
    sink: Arc<dyn AcquisitionSink>,
    peer: PeerInfo,
    params: SessionParams,
    mut stop: watch::Receiver<bool>,
) -> Result<ReceiveStop, TcpclError> {
    let result = tokio::select! {
        _ = stop.changed() => Ok(ReceiveStop::Stopped),
        r = async {
            match params.framing {
                Framing::Tcpcl => {
                    receive_loop(&mut reader, sink.as_ref(), &peer, params.transfer_buffer_size).await
                }
                Framing::Simple => {
                    receive_simple_loop(
                        &mut reader,
                        sink.as_ref(),
                        &peer,
                        params.transfer_buffer_size,
                        params.rx_delay_nsec_per_byte,
                    )
                    .await
                }
            }
        } => r,
    };

    match &result {
        Ok(stop) => tracing::debug!(peer_addr = %peer.addr, ?stop, "receiver finished"),
        Err(e) => tracing::warn!(peer_addr = %peer.addr, error = %e, "receiver failed"),
    }

    // Nothing more can arrive; make sure writers see it too.
    tx.lock().await.close().await;
    result
}
