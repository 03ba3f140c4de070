//! TCPCL wire format: contact header and segment framing.
//!
//! These types ARE the protocol. The contact header is exchanged exactly
//! once per connection, before any segment. Every segment starts with one
//! byte: the high nibble is the segment type, the low nibble its flags.
//!
//! Everything here works on in-memory buffers. Reading from and writing to
//! sockets lives in the engine crate.

use bytes::{Buf, BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::sdnv::{self, Sdnv, SdnvError, MAX_SDNV_LEN};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Contact header magic.
pub const TCPCL_MAGIC: [u8; 4] = *b"dtn!";

/// Protocol version spoken locally. Lower peer versions are refused.
pub const TCPCL_VERSION: u8 = 0x03;

/// Contact header flags advertised locally.
pub const LOCAL_CONTACT_FLAGS: u8 = 0x00;

/// Well-known TCPCL port.
pub const DEFAULT_PORT: u16 = 4556;

/// Size of the transfer buffer used to stream bundles and to compose the
/// contact header.
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Fixed bytes of a contact header plus the largest possible SDNV.
pub const CONTACT_HEADER_OVERHEAD: usize = std::mem::size_of::<ContactHeaderFixed>() + MAX_SDNV_LEN;

/// Longest peer endpoint identifier accepted.
pub const MAX_EID_LEN: u64 = TRANSFER_BUFFER_SIZE as u64;

/// Default requested keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_SECS: u16 = 15;

/// Reconnect backoff bounds in seconds.
pub const BACKOFF_TIMER_START: u64 = 30;
pub const BACKOFF_TIMER_LIMIT: u64 = 3600;

/// Hostnames longer than this are truncated when building the local EID.
pub const EID_HOSTNAME_MAX: usize = 60;

// ── Contact header ────────────────────────────────────────────────────────────

/// Fixed-size prefix of the contact header.
///
/// Wire size: 8 bytes. The keepalive interval is big-endian seconds.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ContactHeaderFixed {
    pub magic: [u8; 4],
    pub version: u8,
    pub flags: u8,
    pub keepalive: [u8; 2],
}

assert_eq_size!(ContactHeaderFixed, [u8; 8]);

/// Contact header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContactFlags(u8);

impl ContactFlags {
    pub const NONE: ContactFlags = ContactFlags(0x00);
    pub const REQUEST_ACK: u8 = 0x01;
    pub const REACTIVE_FRAGMENTATION: u8 = 0x02;
    pub const NEGATIVE_ACK: u8 = 0x04;

    /// Validate a flags byte against the allowed combinations.
    ///
    /// Negative acks without acks make no sense, so 0x04 and 0x06 are out.
    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x00 | 0x01 | 0x02 | 0x03 | 0x05 | 0x07 => Ok(ContactFlags(byte)),
            other => Err(WireError::DisallowedFlags(other)),
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn requests_acks(self) -> bool {
        self.0 & Self::REQUEST_ACK != 0
    }

    pub fn reactive_fragmentation(self) -> bool {
        self.0 & Self::REACTIVE_FRAGMENTATION != 0
    }

    pub fn negative_acks(self) -> bool {
        self.0 & Self::NEGATIVE_ACK != 0
    }
}

/// Parameters carried by a contact header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHeader {
    pub version: u8,
    pub flags: ContactFlags,
    /// Requested keepalive interval, seconds. Zero disables keepalives.
    pub keepalive: u16,
    /// Endpoint identifier of the sending node, e.g. `dtn://host.dtn`.
    pub local_eid: String,
}

impl ContactHeader {
    /// Header advertising the local version and flags.
    pub fn local(keepalive: u16, local_eid: impl Into<String>) -> Self {
        Self {
            version: TCPCL_VERSION,
            flags: ContactFlags(LOCAL_CONTACT_FLAGS),
            keepalive,
            local_eid: local_eid.into(),
        }
    }

    /// Append the encoded header to `buf`, returning its length.
    ///
    /// Fails if the header cannot fit the transfer buffer.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<usize, WireError> {
        let eid = self.local_eid.as_bytes();
        let needed = CONTACT_HEADER_OVERHEAD + eid.len();
        if needed > TRANSFER_BUFFER_SIZE {
            return Err(WireError::HeaderTooLarge {
                needed,
                capacity: TRANSFER_BUFFER_SIZE,
            });
        }

        let fixed = ContactHeaderFixed {
            magic: TCPCL_MAGIC,
            version: self.version,
            flags: self.flags.bits(),
            keepalive: self.keepalive.to_be_bytes(),
        };
        let eid_len = Sdnv::new(eid.len() as u64);

        let start = buf.len();
        buf.reserve(fixed.as_bytes().len() + eid_len.len() + eid.len());
        buf.put_slice(fixed.as_bytes());
        buf.put_slice(eid_len.as_bytes());
        buf.put_slice(eid);
        Ok(buf.len() - start)
    }

    /// Check the four magic bytes.
    pub fn check_magic(magic: &[u8]) -> Result<(), WireError> {
        if magic == TCPCL_MAGIC {
            Ok(())
        } else {
            let mut seen = [0u8; 4];
            let n = magic.len().min(4);
            seen[..n].copy_from_slice(&magic[..n]);
            Err(WireError::BadMagic(seen))
        }
    }

    /// Validate version, flags and keepalive from the 4 bytes after magic.
    ///
    /// A higher peer version is parsed as if it were ours.
    pub fn parse_parameters(bytes: [u8; 4]) -> Result<(u8, ContactFlags, u16), WireError> {
        let version = bytes[0];
        if version < TCPCL_VERSION {
            return Err(WireError::VersionTooLow(version));
        }
        let flags = ContactFlags::from_byte(bytes[1])?;
        let keepalive = u16::from_be_bytes([bytes[2], bytes[3]]);
        Ok((version, flags, keepalive))
    }

    /// Decode a complete contact header from a buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < TCPCL_MAGIC.len() {
            return Err(WireError::Truncated);
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        Self::check_magic(&magic)?;

        if buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let mut params = [0u8; 4];
        buf.copy_to_slice(&mut params);
        let (version, flags, keepalive) = Self::parse_parameters(params)?;

        let eid_len = get_length_field(buf)?;
        if eid_len > MAX_EID_LEN {
            return Err(WireError::EidTooLong(eid_len));
        }
        let eid_len = eid_len as usize;
        if buf.remaining() < eid_len {
            return Err(WireError::Truncated);
        }
        let mut eid = vec![0u8; eid_len];
        buf.copy_to_slice(&mut eid);

        Ok(Self {
            version,
            flags,
            keepalive,
            local_eid: String::from_utf8_lossy(&eid).into_owned(),
        })
    }
}

/// Keepalive period both sides will honour.
pub fn negotiate_keepalive(local: u16, peer: u16) -> u16 {
    local.min(peer)
}

// ── Segments ──────────────────────────────────────────────────────────────────

/// Segment type, the high nibble of a segment's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentType {
    Data = 0x1,
    Ack = 0x2,
    Refuse = 0x3,
    Keepalive = 0x4,
    Shutdown = 0x5,
}

impl TryFrom<u8> for SegmentType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(SegmentType::Data),
            0x2 => Ok(SegmentType::Ack),
            0x3 => Ok(SegmentType::Refuse),
            0x4 => Ok(SegmentType::Keepalive),
            0x5 => Ok(SegmentType::Shutdown),
            other => Err(WireError::UnknownSegmentType(other)),
        }
    }
}

impl From<SegmentType> for u8 {
    fn from(t: SegmentType) -> u8 {
        t as u8
    }
}

/// Split a segment's first byte into (type nibble, flags nibble).
pub fn split_type_byte(byte: u8) -> (u8, u8) {
    ((byte & 0xf0) >> 4, byte & 0x0f)
}

fn type_byte(segment_type: SegmentType, flags: u8) -> u8 {
    (u8::from(segment_type) << 4) | (flags & 0x0f)
}

/// Data segment flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFlags(u8);

impl DataFlags {
    pub const START: u8 = 0x02;
    pub const END: u8 = 0x01;

    /// Neither bit set: a middle fragment.
    pub const CONTINUATION: DataFlags = DataFlags(0x00);
    pub const FIRST: DataFlags = DataFlags(Self::START);
    pub const LAST: DataFlags = DataFlags(Self::END);
    /// Both bits: the whole bundle in one segment.
    pub const SINGLE: DataFlags = DataFlags(Self::START | Self::END);

    pub fn from_bits(bits: u8) -> Self {
        DataFlags(bits & 0x0f)
    }

    /// Flags for one chunk of a bundle split into segments.
    pub fn for_chunk(is_first: bool, is_last: bool) -> Self {
        let mut bits = 0;
        if is_first {
            bits |= Self::START;
        }
        if is_last {
            bits |= Self::END;
        }
        DataFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_start(self) -> bool {
        self.0 & Self::START != 0
    }

    pub fn is_end(self) -> bool {
        self.0 & Self::END != 0
    }

    /// Bits other than START and END are set.
    pub fn has_reserved_bits(self) -> bool {
        self.0 & !(Self::START | Self::END) != 0
    }
}

/// Shutdown reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownReason {
    Idle = 0x00,
    VersionMismatch = 0x01,
    Busy = 0x02,
}

impl TryFrom<u8> for ShutdownReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ShutdownReason::Idle),
            0x01 => Ok(ShutdownReason::VersionMismatch),
            0x02 => Ok(ShutdownReason::Busy),
            other => Err(WireError::UnknownShutdownReason(other)),
        }
    }
}

/// Shutdown segment flag bits.
pub const SHUTDOWN_REASON_FLAG: u8 = 0x02;
pub const SHUTDOWN_DELAY_FLAG: u8 = 0x01;

/// A shutdown segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownSegment {
    pub reason: Option<ShutdownReason>,
    /// Seconds before reconnecting. Zero means never.
    pub delay: Option<u16>,
}

impl ShutdownSegment {
    /// Build from integer codes: reason 0 = none, 1 = idle, 2 = version
    /// mismatch, 3 = busy; delay -1 = absent, 0 = infinite, else seconds.
    pub fn from_codes(reason: i32, delay: i32) -> Result<Self, WireError> {
        let reason = match reason {
            0 => None,
            1 => Some(ShutdownReason::Idle),
            2 => Some(ShutdownReason::VersionMismatch),
            3 => Some(ShutdownReason::Busy),
            other => return Err(WireError::UnknownReasonCode(other)),
        };
        let delay = match delay {
            -1 => None,
            d if d < -1 => return Err(WireError::NegativeDelay(d)),
            d => Some(u16::try_from(d).map_err(|_| WireError::DelayTooLarge(d))?),
        };
        Ok(Self { reason, delay })
    }

    /// Append the encoded segment to `buf`, returning its length.
    pub fn encode(&self, buf: &mut BytesMut) -> usize {
        let mut flags = 0;
        if self.reason.is_some() {
            flags |= SHUTDOWN_REASON_FLAG;
        }
        if self.delay.is_some() {
            flags |= SHUTDOWN_DELAY_FLAG;
        }

        let start = buf.len();
        buf.put_u8(type_byte(SegmentType::Shutdown, flags));
        if let Some(reason) = self.reason {
            buf.put_u8(reason as u8);
        }
        if let Some(delay) = self.delay {
            buf.put_u16(delay);
        }
        buf.len() - start
    }
}

/// Append a data segment header; the payload follows immediately.
///
/// Returns the header length.
pub fn encode_data_header(buf: &mut BytesMut, flags: DataFlags, payload_len: u64) -> usize {
    let len = Sdnv::new(payload_len);
    buf.put_u8(type_byte(SegmentType::Data, flags.bits()));
    buf.put_slice(len.as_bytes());
    1 + len.len()
}

/// Append a keepalive segment: one byte, type only.
pub fn encode_keepalive(buf: &mut BytesMut) -> usize {
    buf.put_u8(type_byte(SegmentType::Keepalive, 0));
    1
}

/// A decoded segment header. Data payload bytes are not included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentHeader {
    Data { flags: DataFlags, length: u64 },
    /// Acknowledged length so far. Recognized, not acted upon.
    Ack { flags: u8, acked: u64 },
    /// Refusal reason in the flags nibble. Recognized, not acted upon.
    Refuse { reason: u8 },
    Keepalive,
    Shutdown(ShutdownSegment),
}

impl SegmentHeader {
    /// Decode one segment header from a buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let (kind, flags) = split_type_byte(buf.get_u8());
        match SegmentType::try_from(kind)? {
            SegmentType::Data => Ok(SegmentHeader::Data {
                flags: DataFlags::from_bits(flags),
                length: get_length_field(buf)?,
            }),
            SegmentType::Ack => Ok(SegmentHeader::Ack {
                flags,
                acked: get_length_field(buf)?,
            }),
            SegmentType::Refuse => Ok(SegmentHeader::Refuse { reason: flags }),
            SegmentType::Keepalive => Ok(SegmentHeader::Keepalive),
            SegmentType::Shutdown => {
                let mut shutdown = ShutdownSegment::default();
                if flags & SHUTDOWN_REASON_FLAG != 0 {
                    if !buf.has_remaining() {
                        return Err(WireError::Truncated);
                    }
                    shutdown.reason = Some(ShutdownReason::try_from(buf.get_u8())?);
                }
                if flags & SHUTDOWN_DELAY_FLAG != 0 {
                    if buf.remaining() < 2 {
                        return Err(WireError::Truncated);
                    }
                    shutdown.delay = Some(buf.get_u16());
                }
                Ok(SegmentHeader::Shutdown(shutdown))
            }
        }
    }
}

/// Read an SDNV length field, capped at ten bytes.
fn get_length_field(buf: &mut impl Buf) -> Result<u64, WireError> {
    let mut field = [0u8; MAX_SDNV_LEN];
    for i in 0..MAX_SDNV_LEN {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        field[i] = buf.get_u8();
        if sdnv::is_last_byte(field[i]) {
            let (value, _) = sdnv::decode(&field[..=i])?;
            return Ok(value);
        }
    }
    Err(WireError::LengthFieldTooLong)
}

// ── Simple framing ────────────────────────────────────────────────────────────

/// Length prefix used by the simple framing. Zero is reserved for
/// keepalives, so an empty bundle cannot be framed.
pub fn encode_length_prefix(bundle_len: u64) -> Result<[u8; 4], WireError> {
    if bundle_len == 0 {
        return Err(WireError::EmptyBundle);
    }
    let len = u32::try_from(bundle_len).map_err(|_| WireError::BundleTooLarge(bundle_len))?;
    Ok(len.to_be_bytes())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("didn't receive contact header magic, got {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("lower version than current version: 0x{0:02x}")]
    VersionTooLow(u8),

    #[error("incorrect flags set in contact header: 0x{0:02x}")]
    DisallowedFlags(u8),

    #[error("unknown segment type: 0x{0:x}")]
    UnknownSegmentType(u8),

    #[error("unknown shutdown reason byte: 0x{0:02x}")]
    UnknownShutdownReason(u8),

    #[error("unknown shutdown reason code: {0}")]
    UnknownReasonCode(i32),

    #[error("shutdown delay less than zero: {0}")]
    NegativeDelay(i32),

    #[error("shutdown delay too large: {0}")]
    DelayTooLarge(i32),

    #[error("contact header needs {needed} bytes, buffer holds {capacity}")]
    HeaderTooLarge { needed: usize, capacity: usize },

    #[error("remote EID too long: {0} bytes")]
    EidTooLong(u64),

    #[error("remote length too big")]
    LengthFieldTooLong,

    #[error("bundle of {0} bytes cannot be length-prefixed")]
    BundleTooLarge(u64),

    #[error("empty bundle cannot be sent with simple framing")]
    EmptyBundle,

    #[error("malformed length: {0}")]
    Sdnv(#[from] SdnvError),

    #[error("input ended mid-field")]
    Truncated,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
