//! tcpcl-engine: sessions, inbound and outbound ducts for the TCP
//! convergence layer, on top of the codecs in tcpcl-core.

pub mod backoff;
pub mod bundle;
pub mod error;
pub mod handshake;
pub mod induct;
pub mod io;
pub mod outduct;
pub mod registry;
pub mod segment;
pub mod session;
pub mod simple;

pub use bundle::{
    Acquisition, AcquisitionSink, BundleHandle, DiscardSink, MemorySink, OutboundBundle, PeerInfo,
    ReceivedBundle, XmitObserver,
};
pub use error::TcpclError;
pub use induct::Induct;
pub use outduct::{DuctState, Outduct, OutductSettings, XmitOutcome};
pub use registry::OutductRegistry;
pub use segment::ReceiveStop;
pub use session::{KeepaliveExit, Session, SessionInfo, SessionParams};
