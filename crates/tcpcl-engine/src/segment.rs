//! Reading segments off a stream and reassembling bundles.

use tokio::io::AsyncRead;

use tcpcl_core::sdnv::MAX_SDNV_LEN;
use tcpcl_core::wire::{
    split_type_byte, SegmentHeader, SegmentType, ShutdownSegment, SHUTDOWN_DELAY_FLAG,
    SHUTDOWN_REASON_FLAG,
};

use crate::bundle::{Acquisition, AcquisitionSink, PeerInfo};
use crate::error::TcpclError;
use crate::io::{read_sdnv_field, receive_bytes, receive_required, Received};

/// Why a receive loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStop {
    /// Peer sent a Shutdown segment.
    Shutdown(ShutdownSegment),
    /// Peer closed the connection between segments.
    PeerClosed,
    /// Local stop request.
    Stopped,
}

/// Read one segment header. `None` means the peer closed cleanly before
/// the first byte.
pub async fn receive_segment_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<SegmentHeader>, TcpclError> {
    let mut raw = [0u8; 1 + MAX_SDNV_LEN];
    match receive_bytes(reader, &mut raw[..1]).await? {
        Received::Complete => {}
        Received::Closed { .. } => return Ok(None),
    }

    let (kind, flags) = split_type_byte(raw[0]);
    let body = match SegmentType::try_from(kind)? {
        SegmentType::Data | SegmentType::Ack => {
            read_sdnv_field(reader, &mut raw[1..], "segment length").await?
        }
        SegmentType::Refuse | SegmentType::Keepalive => 0,
        SegmentType::Shutdown => {
            let mut n = 0;
            if flags & SHUTDOWN_REASON_FLAG != 0 {
                n += 1;
            }
            if flags & SHUTDOWN_DELAY_FLAG != 0 {
                n += 2;
            }
            receive_required(reader, &mut raw[1..1 + n], "shutdown segment").await?;
            n
        }
    };

    let header = SegmentHeader::decode(&mut &raw[..1 + body])?;
    Ok(Some(header))
}

// ── Reassembly ────────────────────────────────────────────────────────────────

/// One bundle being received. Dropping it mid-transfer cancels the
/// acquisition.
pub(crate) struct Reassembly<'a> {
    sink: &'a dyn AcquisitionSink,
    peer: &'a PeerInfo,
    current: Option<Box<dyn Acquisition>>,
    received: u64,
}

impl<'a> Reassembly<'a> {
    pub(crate) fn new(sink: &'a dyn AcquisitionSink, peer: &'a PeerInfo) -> Self {
        Self {
            sink,
            peer,
            current: None,
            received: 0,
        }
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn begin(&mut self) -> Result<(), TcpclError> {
        self.cancel();
        let acquisition = self
            .sink
            .begin_acquisition(self.peer)
            .map_err(TcpclError::Acquisition)?;
        self.current = Some(acquisition);
        self.received = 0;
        Ok(())
    }

    /// Stream `length` payload bytes from `reader` into the acquisition.
    pub(crate) async fn append_from<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        length: u64,
        buf: &mut [u8],
    ) -> Result<(), TcpclError> {
        let mut remaining = length;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            receive_required(reader, &mut buf[..n], "data segment").await?;
            if let Some(acquisition) = self.current.as_mut() {
                acquisition
                    .continue_acquisition(&buf[..n])
                    .map_err(TcpclError::Acquisition)?;
            }
            remaining -= n as u64;
            self.received += n as u64;
        }
        Ok(())
    }

    /// Hand the completed bundle over. Returns its length.
    pub(crate) fn deliver(&mut self) -> Result<u64, TcpclError> {
        let length = self.received;
        self.received = 0;
        if let Some(acquisition) = self.current.take() {
            acquisition.end_acquisition().map_err(TcpclError::Acquisition)?;
        }
        Ok(length)
    }

    fn cancel(&mut self) {
        if let Some(acquisition) = self.current.take() {
            tracing::debug!(
                peer_addr = %self.peer.addr,
                received = self.received,
                "abandoning partial bundle"
            );
            acquisition.cancel_acquisition();
        }
    }
}

impl Drop for Reassembly<'_> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Read segments until Shutdown, close, or error, delivering each
/// reassembled bundle to `sink` exactly once.
///
/// A Data segment without the start flag is only valid while a bundle is
/// being accumulated.
pub async fn receive_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    sink: &dyn AcquisitionSink,
    peer: &PeerInfo,
    transfer_buffer_size: usize,
) -> Result<ReceiveStop, TcpclError> {
    let mut buf = vec![0u8; transfer_buffer_size.max(1)];
    let mut bundle = Reassembly::new(sink, peer);

    loop {
        let Some(header) = receive_segment_header(reader).await? else {
            if bundle.in_progress() {
                return Err(TcpclError::ClosedMidFrame("fragmented bundle"));
            }
            return Ok(ReceiveStop::PeerClosed);
        };

        match header {
            SegmentHeader::Data { flags, length } => {
                if flags.has_reserved_bits() {
                    return Err(TcpclError::BadDataFlags(flags.bits()));
                }
                if !bundle.in_progress() {
                    if !flags.is_start() {
                        return Err(TcpclError::BadDataFlags(flags.bits()));
                    }
                    bundle.begin()?;
                }
                bundle.append_from(reader, length, &mut buf).await?;
                if flags.is_end() {
                    let total = bundle.deliver()?;
                    tracing::debug!(peer_addr = %peer.addr, bytes = total, "bundle received");
                }
            }
            SegmentHeader::Keepalive => {
                tracing::trace!(peer_addr = %peer.addr, "keepalive");
            }
            SegmentHeader::Shutdown(shutdown) => {
                tracing::info!(
                    peer_addr = %peer.addr,
                    reason = ?shutdown.reason,
                    delay = ?shutdown.delay,
                    "peer sent shutdown"
                );
                return Ok(ReceiveStop::Shutdown(shutdown));
            }
            SegmentHeader::Ack { acked, .. } => {
                tracing::debug!(peer_addr = %peer.addr, acked, "ack segment ignored");
            }
            SegmentHeader::Refuse { reason } => {
                tracing::debug!(peer_addr = %peer.addr, reason, "refuse segment ignored");
            }
        }
    }
}
