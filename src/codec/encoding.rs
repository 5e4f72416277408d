//! Negotiable packet encoders and compressors.
//!
//! Each side advertises an ordered preference list; [`negotiate`] picks
//! the first mutually supported entry. MsgPack is the baseline encoder
//! used before negotiation completes; "none" is always a valid compressor
//! and is the default on local/trusted transports such as subprocess
//! pipes, where compression is wasted CPU.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Result, WireError};
use crate::packet::Packet;

/// Packet serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    /// MessagePack via `rmp-serde`. Baseline; always supported.
    MsgPack = 1,
    /// JSON via `serde_json`. Human-readable, no blob support on the wire.
    Json = 2,
}

impl Encoder {
    /// Wire identifier of this encoder.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Map a wire identifier to an encoder.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Encoder::MsgPack),
            2 => Ok(Encoder::Json),
            other => Err(WireError::Malformed(format!("unknown encoder id {other}"))),
        }
    }

    /// Serialize a packet to bytes.
    pub fn encode(self, packet: &Packet) -> Result<Vec<u8>> {
        match self {
            Encoder::MsgPack => Ok(rmp_serde::to_vec(packet)?),
            Encoder::Json => Ok(serde_json::to_vec(packet)?),
        }
    }

    /// Deserialize a packet from bytes.
    ///
    /// Failures are malformed input: the bytes came off the wire claiming
    /// to be this encoding.
    pub fn decode(self, body: &[u8]) -> Result<Packet> {
        match self {
            Encoder::MsgPack => rmp_serde::from_slice(body)
                .map_err(|e| WireError::Malformed(format!("msgpack body: {e}"))),
            Encoder::Json => serde_json::from_slice(body)
                .map_err(|e| WireError::Malformed(format!("json body: {e}"))),
        }
    }
}

/// Body compression applied after encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// No compression. Always supported, default for local transports.
    None = 0,
    /// zlib via `flate2`.
    Zlib = 1,
}

impl Compressor {
    /// Wire identifier of this compressor.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Map a wire identifier to a compressor.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Compressor::None),
            1 => Ok(Compressor::Zlib),
            other => Err(WireError::Malformed(format!(
                "unknown compressor id {other}"
            ))),
        }
    }

    /// Compress a body.
    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(body.to_vec()),
            Compressor::Zlib => {
                let mut encoder = ZlibEncoder::new(
                    Vec::with_capacity(body.len() / 2 + 16),
                    Compression::default(),
                );
                encoder.write_all(body)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress a body received from the wire.
    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(body.to_vec()),
            Compressor::Zlib => {
                let mut out = Vec::with_capacity(body.len() * 2);
                ZlibDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(|e| WireError::Malformed(format!("zlib body: {e}")))?;
                Ok(out)
            }
        }
    }
}

/// Pick the first entry of `ours` that the peer also supports.
///
/// `ours` is in preference order; returns `None` when there is no overlap
/// (for compressors the caller falls back to [`Compressor::None`]).
pub fn negotiate<T: Copy + PartialEq>(ours: &[T], theirs: &[T]) -> Option<T> {
    ours.iter().copied().find(|c| theirs.contains(c))
}
