//! Seams between the engine and the surrounding bundle agent.
//!
//! The engine never looks inside a bundle. Outbound bundles arrive as a
//! reader of known length; inbound bundles leave through an
//! [`AcquisitionSink`]; transmission outcomes are reported to an
//! [`XmitObserver`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncRead;

/// Opaque identifier the bundle agent uses to find the bundle again.
pub type BundleHandle = u64;

/// One bundle staged for transmission.
pub struct OutboundBundle {
    pub handle: BundleHandle,
    /// Exact number of bytes `reader` will yield.
    pub length: u64,
    pub class_of_service: u8,
    /// Extended class-of-service ordinal.
    pub ecos_ordinal: u8,
    pub duct_name: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl OutboundBundle {
    /// Bundle backed by an in-memory buffer.
    pub fn from_bytes(handle: BundleHandle, duct_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            handle,
            length: payload.len() as u64,
            class_of_service: 0,
            ecos_ordinal: 0,
            duct_name: duct_name.into(),
            reader: Box::new(std::io::Cursor::new(payload)),
        }
    }
}

impl std::fmt::Debug for OutboundBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundBundle")
            .field("handle", &self.handle)
            .field("length", &self.length)
            .field("duct_name", &self.duct_name)
            .finish_non_exhaustive()
    }
}

/// Receives transmission outcomes for outbound bundles.
pub trait XmitObserver: Send + Sync {
    /// The whole bundle was written. Called before the bundle is released.
    fn xmit_success(&self, handle: BundleHandle, length: u64);

    /// The bundle was not sent and must be retried or rerouted.
    fn xmit_failure(&self, handle: BundleHandle);

    fn outduct_blocked(&self, _duct: &str) {}

    fn outduct_unblocked(&self, _duct: &str) {}
}

/// Who a bundle came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// Endpoint from the peer's contact header. `None` for simple framing.
    pub eid: Option<String>,
}

/// Creates one [`Acquisition`] per inbound bundle.
pub trait AcquisitionSink: Send + Sync {
    fn begin_acquisition(&self, peer: &PeerInfo) -> anyhow::Result<Box<dyn Acquisition>>;
}

/// Work area for one inbound bundle.
///
/// Called from the receive loop on a runtime worker; implementations that
/// block for long should hand the work off, as the daemon's spool does.
pub trait Acquisition: Send {
    fn continue_acquisition(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    /// All bytes received. The bundle is handed over exactly once.
    fn end_acquisition(self: Box<Self>) -> anyhow::Result<()>;

    /// Transfer abandoned; discard what was received.
    fn cancel_acquisition(self: Box<Self>);
}

// ── In-memory sink ────────────────────────────────────────────────────────────

/// A bundle collected by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBundle {
    pub peer: PeerInfo,
    pub payload: Bytes,
}

/// Sink that keeps every delivered bundle in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    delivered: Arc<Mutex<Vec<ReceivedBundle>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundles delivered so far, in order.
    pub fn delivered(&self) -> Vec<ReceivedBundle> {
        self.delivered.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl AcquisitionSink for MemorySink {
    fn begin_acquisition(&self, peer: &PeerInfo) -> anyhow::Result<Box<dyn Acquisition>> {
        Ok(Box::new(MemoryAcquisition {
            peer: peer.clone(),
            buf: Vec::new(),
            delivered: self.delivered.clone(),
        }))
    }
}

struct MemoryAcquisition {
    peer: PeerInfo,
    buf: Vec<u8>,
    delivered: Arc<Mutex<Vec<ReceivedBundle>>>,
}

impl Acquisition for MemoryAcquisition {
    fn continue_acquisition(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn end_acquisition(self: Box<Self>) -> anyhow::Result<()> {
        let bundle = ReceivedBundle {
            peer: self.peer,
            payload: Bytes::from(self.buf),
        };
        self.delivered
            .lock()
            .map_err(|_| anyhow::anyhow!("delivered list poisoned"))?
            .push(bundle);
        Ok(())
    }

    fn cancel_acquisition(self: Box<Self>) {}
}

/// Sink that drops everything, for sessions not expected to carry data.
pub struct DiscardSink;

impl AcquisitionSink for DiscardSink {
    fn begin_acquisition(&self, peer: &PeerInfo) -> anyhow::Result<Box<dyn Acquisition>> {
        tracing::debug!(peer_addr = %peer.addr, "discarding unexpected inbound bundle");
        Ok(Box::new(Discard))
    }
}

struct Discard;

impl Acquisition for Discard {
    fn continue_acquisition(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn end_acquisition(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    fn cancel_acquisition(self: Box<Self>) {}
}
