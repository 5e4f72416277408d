//! Packet codec - wire header, encoders, compressors and chunking.
//!
//! This module turns a [`Packet`](crate::packet::Packet) into framed bytes
//! and back:
//!
//! - [`header`] - the fixed 7-byte wire prefix
//! - [`encoding`] - negotiable serialization (MsgPack, JSON) and
//!   compression (none, zlib)
//! - [`chunk`] - large-packet splitting and per-connection reassembly
//! - [`decoder`] - resumable extraction of packets from a byte stream

pub mod chunk;
pub mod decoder;
pub mod encoding;
pub mod header;

pub use chunk::{ChunkAssembler, split_chunks, CHUNK_PREFIX_SIZE};
pub use decoder::PacketDecoder;
pub use encoding::{negotiate, Compressor, Encoder};
pub use header::{WireHeader, FLAG_CHUNK, HEADER_SIZE};
