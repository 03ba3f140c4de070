//! Self-delimiting numeric values.
//!
//! Each byte carries seven bits of the value, most significant group first.
//! The high bit is set on every byte except the last. A value is at most
//! ten bytes on the wire; anything longer cannot be a 64-bit integer and is
//! rejected rather than silently truncated.

/// Maximum encoded length accepted by the decoder.
pub const MAX_SDNV_LEN: usize = 10;

const CONTINUATION: u8 = 0x80;
const GROUP_MASK: u8 = 0x7f;

/// An encoded SDNV, held inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sdnv {
    value: u64,
    len: usize,
    text: [u8; MAX_SDNV_LEN],
}

impl Sdnv {
    /// Encode `value` into its minimal continuation-bit form.
    pub fn new(value: u64) -> Self {
        let mut scratch = [0u8; MAX_SDNV_LEN];
        let mut remaining = value;
        let mut n = 0;

        // Fill from the least significant group backwards.
        loop {
            let mut byte = (remaining as u8) & GROUP_MASK;
            if n > 0 {
                byte |= CONTINUATION;
            }
            scratch[MAX_SDNV_LEN - 1 - n] = byte;
            n += 1;
            remaining >>= 7;
            if remaining == 0 {
                break;
            }
        }

        let mut text = [0u8; MAX_SDNV_LEN];
        text[..n].copy_from_slice(&scratch[MAX_SDNV_LEN - n..]);
        Self { value, len: n, text }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.text[..self.len]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Encode `value` as an SDNV byte vector.
pub fn encode(value: u64) -> Vec<u8> {
    Sdnv::new(value).as_bytes().to_vec()
}

/// Decode an SDNV from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(u64, usize), SdnvError> {
    let mut value: u64 = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if i >= MAX_SDNV_LEN {
            return Err(SdnvError::MalformedVarint);
        }
        if value > (u64::MAX >> 7) {
            return Err(SdnvError::Overflow);
        }
        value = (value << 7) | u64::from(byte & GROUP_MASK);
        if byte & CONTINUATION == 0 {
            return Ok((value, i + 1));
        }
    }

    if bytes.len() >= MAX_SDNV_LEN {
        Err(SdnvError::MalformedVarint)
    } else {
        Err(SdnvError::Incomplete)
    }
}

/// Whether `byte` is the final byte of an SDNV.
pub fn is_last_byte(byte: u8) -> bool {
    byte & CONTINUATION == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SdnvError {
    #[error("SDNV value too big for 64 bits")]
    MalformedVarint,

    #[error("SDNV value overflows a 64-bit integer")]
    Overflow,

    #[error("SDNV truncated before its final byte")]
    Incomplete,
}
