//! Engine error type.

use std::io;

use tcpcl_core::wire::WireError;

use crate::io::is_connection_loss;

/// Errors raised by sessions and ducts.
#[derive(Debug, thiserror::Error)]
pub enum TcpclError {
    #[error("protocol violation: {0}")]
    Wire(#[from] WireError),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("connection closed in the middle of a {0}")]
    ClosedMidFrame(&'static str),

    #[error("flags not set correctly: 0x{0:x}")]
    BadDataFlags(u8),

    #[error("acquisition failed: {0}")]
    Acquisition(anyhow::Error),

    #[error("failed to connect to {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("connection lost")]
    ConnectionLost,
}

impl TcpclError {
    pub fn io(op: &'static str, source: io::Error) -> Self {
        TcpclError::Io { op, source }
    }

    /// Whether a later attempt on a fresh connection may succeed.
    ///
    /// Protocol violations and sink failures are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            TcpclError::Connect { .. } | TcpclError::ConnectionLost | TcpclError::ClosedMidFrame(_) => true,
            TcpclError::Io { source, .. } => is_connection_loss(source),
            TcpclError::Wire(_) | TcpclError::BadDataFlags(_) | TcpclError::Acquisition(_) => false,
        }
    }
}
