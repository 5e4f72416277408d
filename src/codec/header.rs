//! Packet wire header encoding and decoding.
//!
//! Implements the 7-byte header format:
//! ```text
//! ┌──────────┬────────────┬───────┬───────────┐
//! │ Encoder  │ Compressor │ Flags │ Body len  │
//! │ 1 byte   │ 1 byte     │ 1 byte│ 4 bytes   │
//! │          │ 0 = none   │       │ uint32 BE │
//! └──────────┴────────────┴───────┴───────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, WireError};

/// Header size in bytes (fixed, exactly 7).
pub const HEADER_SIZE: usize = 7;

/// Flag bit: the body is one chunk of a split packet.
pub const FLAG_CHUNK: u8 = 0b0000_0001;

/// Reserved flag bits (crypto indicator and future use); must be zero.
pub const FLAG_RESERVED_MASK: u8 = 0b1111_1110;

/// Default maximum body size accepted from the wire (256 MB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 256 * 1024 * 1024;

/// Decoded packet wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Serialization format of the body.
    pub encoder: u8,
    /// Compression applied to the body (0 = none).
    pub compressor: u8,
    /// Flags byte, see `FLAG_*`.
    pub flags: u8,
    /// Body length in bytes.
    pub body_length: u32,
}

impl WireHeader {
    /// Create a new header.
    pub fn new(encoder: u8, compressor: u8, flags: u8, body_length: u32) -> Self {
        Self {
            encoder,
            compressor,
            flags,
            body_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.encoder;
        buf[1] = self.compressor;
        buf[2] = self.flags;
        buf[3..7].copy_from_slice(&self.body_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if the buffer is too short; structural validation is
    /// a separate step ([`WireHeader::validate`]).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            encoder: buf[0],
            compressor: buf[1],
            flags: buf[2],
            body_length: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks reserved flag bits and the body length bound. Encoder and
    /// compressor ids are validated by the decode path once the body is
    /// available, so an unknown id carries its excerpt in the error.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.flags & FLAG_RESERVED_MASK != 0 {
            return Err(WireError::Malformed(format!(
                "reserved header flags set: {:#04x}",
                self.flags
            )));
        }
        if self.body_length > max_body_size {
            return Err(WireError::Malformed(format!(
                "body size {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }
        Ok(())
    }

    /// Check if the body is a chunk of a split packet.
    #[inline]
    pub fn is_chunk(&self) -> bool {
        self.flags & FLAG_CHUNK != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = WireHeader::new(1, 0, FLAG_CHUNK, 4096);
        let encoded = original.encode();
        let decoded = WireHeader::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = WireHeader::new(0x01, 0x02, 0x00, 0x04050607);
        let bytes = header.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(bytes[2], 0x00);
        assert_eq!(&bytes[3..7], &[0x04, 0x05, 0x06, 0x07]);
    }

    #[test]
    fn test_header_size_is_exactly_7() {
        assert_eq!(HEADER_SIZE, 7);
        assert_eq!(WireHeader::new(1, 0, 0, 0).encode().len(), 7);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(WireHeader::decode(&[0u8; 6]).is_none());
    }

    #[test]
    fn test_validate_reserved_flags_rejected() {
        let header = WireHeader::new(1, 0, 0b1000_0000, 0);
        let result = header.validate(DEFAULT_MAX_BODY_SIZE);
        assert!(matches!(result, Err(crate::error::WireError::Malformed(_))));
    }

    #[test]
    fn test_validate_body_too_large() {
        let header = WireHeader::new(1, 0, 0, 1_000_000);
        assert!(header.validate(100).is_err());
        assert!(header.validate(1_000_000).is_ok());
    }

    #[test]
    fn test_is_chunk() {
        assert!(WireHeader::new(1, 0, FLAG_CHUNK, 0).is_chunk());
        assert!(!WireHeader::new(1, 0, 0, 0).is_chunk());
    }
}
