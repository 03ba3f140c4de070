//! tcpcl-core: wire format, SDNV codec, and configuration for the
//! TCP convergence layer. The engine and daemon crates depend on this one.

pub mod config;
pub mod sdnv;
pub mod wire;

pub use config::{Framing, TcpclConfig};
pub use wire::{ContactHeader, DataFlags, SegmentHeader, ShutdownReason, ShutdownSegment, WireError};
