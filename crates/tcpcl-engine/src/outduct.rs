//! Outbound duct: connects on demand, streams queued bundles to one peer.
//!
//! Every bundle taken off the queue is reported exactly once, either to
//! `xmit_success` or to `xmit_failure`. A failed connect blocks the duct
//! and arms the backoff; while the window is open bundles are refused
//! straight away. A lost connection blocks the duct too, but the next
//! bundle (or tick) may reconnect immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use tcpcl_core::config::{Framing, OutductConfig, TcpclConfig};
use tcpcl_core::wire::{DataFlags, ShutdownReason, ShutdownSegment};

use crate::backoff::Backoff;
use crate::bundle::{AcquisitionSink, DiscardSink, OutboundBundle, XmitObserver};
use crate::error::TcpclError;
use crate::io::Sent;
use crate::registry::OutductRegistry;
use crate::segment::ReceiveStop;
use crate::session::{Session, SessionInfo, SessionParams};

/// Protocol name recorded in the outduct registry.
pub const PROTOCOL_NAME: &str = "tcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuctState {
    Disconnected,
    Connecting,
    HandshakeSent,
    Connected,
    Sending,
    Idle,
}

/// What happened to one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmitOutcome {
    Sent,
    Failed,
    /// Refused without trying because the duct is blocked.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct OutductSettings {
    pub name: String,
    /// "host:port"
    pub peer: String,
    pub session: SessionParams,
    /// Max payload bytes per data segment. 0 = one segment per bundle.
    pub max_segment_length: u64,
    pub idle_shutdown: Option<Duration>,
    pub backoff_start: Duration,
    pub backoff_limit: Duration,
}

impl OutductSettings {
    pub fn from_config(config: &TcpclConfig, duct: &OutductConfig) -> Self {
        Self {
            name: duct.name.clone(),
            peer: duct.peer.clone(),
            session: SessionParams::from_config(config, duct.framing),
            max_segment_length: config.session.max_segment_length,
            idle_shutdown: config.session.idle_shutdown(),
            backoff_start: config.backoff.start(),
            backoff_limit: config.backoff.limit(),
        }
    }
}

pub struct Outduct {
    settings: OutductSettings,
    state: DuctState,
    session: Option<Session>,
    backoff: Backoff,
    blocked: bool,
    last_bundle: Instant,
    registry: OutductRegistry,
    observer: Arc<dyn XmitObserver>,
    sink: Arc<dyn AcquisitionSink>,
    buf: Vec<u8>,
}

impl Outduct {
    pub fn new(
        settings: OutductSettings,
        registry: OutductRegistry,
        observer: Arc<dyn XmitObserver>,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_start, settings.backoff_limit);
        let buf = vec![0u8; settings.session.transfer_buffer_size.max(1)];
        Self {
            settings,
            state: DuctState::Disconnected,
            session: None,
            backoff,
            blocked: false,
            last_bundle: Instant::now(),
            registry,
            observer,
            sink: Arc::new(DiscardSink),
            buf,
        }
    }

    /// Where bundles the peer sends back on this connection go.
    pub fn with_sink(mut self, sink: Arc<dyn AcquisitionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> DuctState {
        self.state
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session.as_ref().map(Session::info)
    }

    /// Dequeue and transmit until shutdown or until the queue closes.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<OutboundBundle>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.settings.session.keepalive_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(duct = %self.settings.name, peer = %self.settings.peer, "outduct starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                bundle = queue.recv() => match bundle {
                    Some(bundle) => {
                        self.transmit(bundle).await;
                    }
                    None => break,
                },

                _ = ticker.tick() => self.tick().await,
            }
        }

        // Hand back anything still queued.
        queue.close();
        while let Ok(bundle) = queue.try_recv() {
            self.observer.xmit_failure(bundle.handle);
        }

        self.shutdown().await;
        tracing::info!(duct = %self.settings.name, "outduct stopped");
        Ok(())
    }

    /// Send one bundle and report the outcome to the observer.
    pub async fn transmit(&mut self, mut bundle: OutboundBundle) -> XmitOutcome {
        let handle = bundle.handle;
        let length = bundle.length;

        if self.blocked && !self.backoff.ready(Instant::now()) {
            tracing::debug!(duct = %self.settings.name, handle, "outduct blocked, bundle refused");
            self.observer.xmit_failure(handle);
            return XmitOutcome::Deferred;
        }

        if self.settings.session.framing == Framing::Simple && length == 0 {
            tracing::warn!(duct = %self.settings.name, handle, "empty bundle cannot be length-prefixed");
            self.observer.xmit_failure(handle);
            return XmitOutcome::Failed;
        }

        match self.send_bundle(&mut bundle).await {
            Ok(()) => {
                self.state = DuctState::Idle;
                self.last_bundle = Instant::now();
                tracing::debug!(duct = %self.settings.name, handle, bytes = length, "bundle sent");
                self.observer.xmit_success(handle, length);
                drop(bundle);
                XmitOutcome::Sent
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(duct = %self.settings.name, peer = %self.settings.peer, handle, error = %e, "bundle not sent");
                } else {
                    tracing::error!(duct = %self.settings.name, peer = %self.settings.peer, handle, error = %e, "bundle transmission failed");
                }
                self.drop_session().await;
                self.block();
                self.observer.xmit_failure(handle);
                XmitOutcome::Failed
            }
        }
    }

    /// Periodic housekeeping: notice dead sessions, close idle ones, and
    /// retry the connection of a blocked duct once its window has passed.
    pub async fn tick(&mut self) {
        match &self.session {
            Some(session) if session.is_finished() => {
                let keepalive_failed = session.keepalive_failed();
                let outcome = self.drop_session().await;
                let peer_ended = matches!(
                    outcome,
                    Some(Ok(ReceiveStop::Shutdown(_))) | Some(Ok(ReceiveStop::PeerClosed))
                );
                tracing::info!(duct = %self.settings.name, ?outcome, "session ended");
                if keepalive_failed || !peer_ended {
                    self.block();
                }
            }
            Some(_) => {
                if let Some(limit) = self.settings.idle_shutdown {
                    if self.last_bundle.elapsed() >= limit {
                        tracing::info!(duct = %self.settings.name, "session idle, shutting down");
                        self.close_session(ShutdownSegment {
                            reason: Some(ShutdownReason::Idle),
                            delay: None,
                        })
                        .await;
                    }
                }
            }
            None => {
                if self.blocked && self.backoff.ready(Instant::now()) {
                    if let Err(e) = self.ensure_connected().await {
                        tracing::debug!(
                            duct = %self.settings.name,
                            error = %e,
                            retry_in = ?self.backoff.window(),
                            "reconnect failed"
                        );
                    }
                }
            }
        }
    }

    /// Send Shutdown (no reason, no delay) on a live session and close it.
    pub async fn shutdown(&mut self) {
        self.close_session(ShutdownSegment::default()).await;
    }

    async fn send_bundle(&mut self, bundle: &mut OutboundBundle) -> Result<(), TcpclError> {
        self.ensure_connected().await?;
        let tx = self
            .session
            .as_ref()
            .map(Session::transmitter)
            .ok_or(TcpclError::ConnectionLost)?;
        self.state = DuctState::Sending;

        let max = match (self.settings.session.framing, self.settings.max_segment_length) {
            (Framing::Simple, _) | (_, 0) => u64::MAX,
            (Framing::Tcpcl, n) => n,
        };

        let mut offset = 0u64;
        loop {
            let this = (bundle.length - offset).min(max);
            let is_last = offset + this == bundle.length;
            let flags = DataFlags::for_chunk(offset == 0, is_last);

            let sent = tx
                .lock()
                .await
                .send_segment(flags, this, &mut bundle.reader, &mut self.buf)
                .await?;
            if sent == Sent::Lost {
                return Err(TcpclError::ConnectionLost);
            }

            offset += this;
            if is_last {
                return Ok(());
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), TcpclError> {
        if let Some(session) = &self.session {
            if !session.is_finished() {
                return Ok(());
            }
            tracing::debug!(duct = %self.settings.name, "session gone, reconnecting");
            self.drop_session().await;
        }

        let started = Instant::now();
        let session = match self.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.state = DuctState::Disconnected;
                self.backoff.failed(started);
                return Err(e);
            }
        };

        let info = session.info();
        if let Err(e) = self.registry.record(info.peer.addr, PROTOCOL_NAME, &self.settings.name) {
            tracing::warn!(duct = %self.settings.name, error = %e, "registry entry already present");
        }
        tracing::info!(
            duct = %self.settings.name,
            peer_addr = %info.peer.addr,
            peer_eid = info.peer.eid.as_deref().unwrap_or("-"),
            keepalive = info.keepalive,
            "outduct connected"
        );

        self.session = Some(session);
        self.state = DuctState::Connected;
        self.last_bundle = Instant::now();
        self.backoff.reset();
        if self.blocked {
            self.blocked = false;
            self.observer.outduct_unblocked(&self.settings.name);
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<Session, TcpclError> {
        self.state = DuctState::Connecting;
        let stream = TcpStream::connect(&self.settings.peer)
            .await
            .map_err(|source| TcpclError::Connect {
                peer: self.settings.peer.clone(),
                source,
            })?;

        self.state = DuctState::HandshakeSent;
        Session::establish(stream, &self.settings.session, self.sink.clone()).await
    }

    async fn close_session(&mut self, shutdown: ShutdownSegment) {
        let Some(tx) = self.session.as_ref().map(Session::transmitter) else {
            return;
        };
        let sent = tx.lock().await.send_shutdown(shutdown).await;
        match sent {
            Ok(Sent::Complete(_)) => {
                tracing::debug!(duct = %self.settings.name, "shutdown sent");
            }
            Ok(Sent::Lost) => {
                tracing::info!(duct = %self.settings.name, "connection lost sending shutdown");
                self.block();
            }
            Err(e) => {
                tracing::warn!(duct = %self.settings.name, error = %e, "failed to send shutdown");
                self.block();
            }
        }
        self.drop_session().await;
    }

    async fn drop_session(&mut self) -> Option<Result<ReceiveStop, TcpclError>> {
        self.state = DuctState::Disconnected;
        let session = self.session.take()?;
        self.registry.forget(&session.info().peer.addr);
        session.close().await
    }

    fn block(&mut self) {
        if !self.blocked {
            self.blocked = true;
            tracing::info!(duct = %self.settings.name, "outduct blocked");
            self.observer.outduct_blocked(&self.settings.name);
        }
    }
}
