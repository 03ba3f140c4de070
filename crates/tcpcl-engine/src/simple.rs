//! Receive side of the simple framing: a 4-byte big-endian length before
//! each bundle, zero meaning keepalive. There is no handshake and no
//! shutdown segment; the connection just closes.

use std::time::Duration;

use tokio::io::AsyncRead;

use crate::bundle::{AcquisitionSink, PeerInfo};
use crate::error::TcpclError;
use crate::io::{receive_bytes, Received};
use crate::segment::{ReceiveStop, Reassembly};

/// Read length-prefixed bundles until the peer closes.
///
/// With a nonzero `rx_delay_nsec_per_byte`, sleeps length × delay before
/// reading each bundle body to emulate a slow link.
pub async fn receive_simple_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    sink: &dyn AcquisitionSink,
    peer: &PeerInfo,
    transfer_buffer_size: usize,
    rx_delay_nsec_per_byte: u64,
) -> Result<ReceiveStop, TcpclError> {
    let mut buf = vec![0u8; transfer_buffer_size.max(1)];

    loop {
        let mut prefix = [0u8; 4];
        match receive_bytes(reader, &mut prefix).await? {
            Received::Complete => {}
            Received::Closed { read: 0 } => return Ok(ReceiveStop::PeerClosed),
            Received::Closed { .. } => return Err(TcpclError::ClosedMidFrame("length prefix")),
        }

        let length = u64::from(u32::from_be_bytes(prefix));
        if length == 0 {
            tracing::trace!(peer_addr = %peer.addr, "keepalive");
            continue;
        }

        if rx_delay_nsec_per_byte > 0 {
            let delay = Duration::from_nanos(length.saturating_mul(rx_delay_nsec_per_byte));
            tokio::time::sleep(delay).await;
        }

        let mut bundle = Reassembly::new(sink, peer);
        bundle.begin()?;
        bundle.append_from(reader, length, &mut buf).await?;
        bundle.deliver()?;
        tracing::debug!(peer_addr = %peer.addr, bytes = length, "bundle received");
    }
}
