//! tcpcl integration test harness.
//!
//! Everything runs over loopback inside the test process: real inducts and
//! outducts, or a hand-driven peer writing raw segments.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tcpcl_core::config::Framing;
use tcpcl_core::wire::{encode_data_header, ContactHeader, DataFlags, SegmentHeader, ShutdownSegment};
use tcpcl_engine::handshake::{receive_contact_header, Negotiated};
use tcpcl_engine::induct::ConnectionTable;
use tcpcl_engine::segment::receive_segment_header;
use tcpcl_engine::{
    AcquisitionSink, BundleHandle, Induct, OutductSettings, SessionParams, XmitObserver,
};

mod failures;
mod sessions;
mod simple;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn params(eid: &str, keepalive_secs: u16, framing: Framing) -> SessionParams {
    SessionParams {
        local_eid: eid.into(),
        keepalive_secs,
        keepalive_tick: Duration::from_millis(50),
        transfer_buffer_size: 4096,
        framing,
        rx_delay_nsec_per_byte: 0,
    }
}

pub fn settings(name: &str, peer: SocketAddr, session: SessionParams) -> OutductSettings {
    OutductSettings {
        name: name.into(),
        peer: peer.to_string(),
        session,
        max_segment_length: 0,
        idle_shutdown: None,
        backoff_start: Duration::from_secs(30),
        backoff_limit: Duration::from_secs(3600),
    }
}

/// A running induct on an ephemeral loopback port.
pub struct InductHandle {
    pub addr: SocketAddr,
    pub connections: ConnectionTable,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl InductHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.unwrap().unwrap();
    }
}

pub fn start_induct(params: SessionParams, sink: Arc<dyn AcquisitionSink>) -> InductHandle {
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let induct = Induct::bind("127.0.0.1:0".parse().unwrap(), params, sink, shutdown_rx).unwrap();
    let addr = induct.local_addr().unwrap();
    let connections = induct.connections();
    let task = tokio::spawn(induct.run());
    InductHandle {
        addr,
        connections,
        shutdown,
        task,
    }
}

/// Observer that writes down every callback.
#[derive(Default)]
pub struct Recorder {
    pub successes: Mutex<Vec<(BundleHandle, u64)>>,
    pub failures: Mutex<Vec<BundleHandle>>,
    pub blocked: Mutex<Vec<String>>,
    pub unblocked: Mutex<Vec<String>>,
}

impl XmitObserver for Recorder {
    fn xmit_success(&self, handle: BundleHandle, length: u64) {
        self.successes.lock().unwrap().push((handle, length));
    }

    fn xmit_failure(&self, handle: BundleHandle) {
        self.failures.lock().unwrap().push(handle);
    }

    fn outduct_blocked(&self, duct: &str) {
        self.blocked.lock().unwrap().push(duct.to_string());
    }

    fn outduct_unblocked(&self, duct: &str) {
        self.unblocked.lock().unwrap().push(duct.to_string());
    }
}

/// Poll `cond` every 10ms for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ── Raw peer ──────────────────────────────────────────────────────────────────

/// Listener standing in for a remote node.
pub async fn raw_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub async fn write_contact_header(stream: &mut TcpStream, header: &ContactHeader) {
    let mut buf = BytesMut::new();
    header.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
}

/// Send our header, read theirs.
pub async fn raw_handshake(stream: &mut TcpStream, keepalive: u16, eid: &str) -> Negotiated {
    write_contact_header(stream, &ContactHeader::local(keepalive, eid)).await;
    receive_contact_header(stream, keepalive).await.unwrap()
}

pub async fn write_data(stream: &mut TcpStream, flags: DataFlags, payload: &[u8]) {
    let mut buf = BytesMut::new();
    encode_data_header(&mut buf, flags, payload.len() as u64);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

pub async fn write_shutdown(stream: &mut TcpStream, shutdown: ShutdownSegment) {
    let mut buf = BytesMut::new();
    shutdown.encode(&mut buf);
    stream.write_all(&buf).await.unwrap();
}

/// Next segment header, failing on EOF.
pub async fn read_segment(stream: &mut TcpStream) -> Result<SegmentHeader> {
    match receive_segment_header(stream).await? {
        Some(header) => Ok(header),
        None => bail!("peer closed"),
    }
}

/// Next data segment's flags and payload.
pub async fn read_data(stream: &mut TcpStream) -> Result<(DataFlags, Vec<u8>)> {
    match read_segment(stream).await? {
        SegmentHeader::Data { flags, length } => {
            let mut payload = vec![0u8; length as usize];
            stream.read_exact(&mut payload).await?;
            Ok((flags, payload))
        }
        other => bail!("expected data segment, got {other:?}"),
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
