//! Resumable packet extraction from a byte stream.
//!
//! Accumulates partial reads in a single `BytesMut` and walks a two-state
//! machine:
//! - `WaitingForHeader`: need at least 7 bytes
//! - `WaitingForBody`: header parsed, need N more body bytes
//!
//! Chunked bodies are routed through the decoder's [`ChunkAssembler`] and
//! only surface as a packet once the whole sequence has arrived.

use bytes::BytesMut;

use super::chunk::ChunkAssembler;
use super::encoding::{Compressor, Encoder};
use super::header::{WireHeader, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use crate::error::Result;
use crate::packet::Packet;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: WireHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
pub struct PacketDecoder {
    buffer: BytesMut,
    state: State,
    max_body_size: u32,
    assembler: ChunkAssembler,
}

impl PacketDecoder {
    /// Create a decoder with default limits.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a decoder with a custom maximum body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
            assembler: ChunkAssembler::new(),
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Partial data is buffered for the next push. A malformed header,
    /// body or chunk aborts decoding with an error; the caller treats
    /// that as fatal to the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(packet) = self.try_extract_one()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    fn try_extract_one(&mut self) -> Result<Option<Packet>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = match WireHeader::decode(&self.buffer[..HEADER_SIZE]) {
                        Some(h) => h,
                        None => return Ok(None),
                    };
                    header.validate(self.max_body_size)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForBody { header };
                }
                State::WaitingForBody { header } => {
                    let header = *header;
                    let need = header.body_length as usize;
                    if self.buffer.len() < need {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(need);
                    self.state = State::WaitingForHeader;

                    if header.is_chunk() {
                        match self.assembler.push(&body)? {
                            Some(complete) => {
                                return Ok(Some(decode_body(&header, &complete)?))
                            }
                            // sequence still incomplete, keep extracting
                            None => continue,
                        }
                    }
                    return Ok(Some(decode_body(&header, &body)?));
                }
            }
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffered bytes not yet consumed. On a decode error this starts at
    /// the offending header, so error reports can excerpt the actual bad
    /// input rather than whatever was read last.
    pub fn peek(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of chunk sequences awaiting completion.
    pub fn pending_sequences(&self) -> usize {
        self.assembler.pending_sequences()
    }

    /// Drop all buffered state, e.g. on connection close.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
        self.assembler.clear();
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(header: &WireHeader, body: &[u8]) -> Result<Packet> {
    let compressor = Compressor::from_id(header.compressor)?;
    let encoder = Encoder::from_id(header.encoder)?;
    let raw = compressor.decompress(body)?;
    encoder.decode(&raw)
}
