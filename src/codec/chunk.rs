//! Large-packet chunking and reassembly.
//!
//! Bodies larger than the configured threshold, on tags registered in the
//! large-packet allow-list, are split across multiple wire frames. Every
//! chunk body starts with a 12-byte prefix:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬────────────┐
//! │ sequence │ index    │ total    │ chunk data │
//! │ u32 BE   │ u32 BE   │ u32 BE   │ n bytes    │
//! └──────────┴──────────┴──────────┴────────────┘
//! ```
//!
//! Chunk 0 doubles as the header chunk announcing the total count. The
//! receiver buffers chunks by (sequence, index) in a table owned by its
//! connection's decoder, concatenates them once all have arrived and only
//! then decodes the packet. Sequences abandoned mid-flight are evicted
//! after a timeout so a misbehaving peer cannot pin memory forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{Result, WireError};

/// Size of the per-chunk prefix (sequence, index, total).
pub const CHUNK_PREFIX_SIZE: usize = 12;

/// How long an incomplete sequence may sit before eviction.
pub const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Split a body into chunk frame bodies of at most `chunk_size` data bytes.
///
/// `sequence` must be unique per split packet on this connection.
pub fn split_chunks(sequence: u32, body: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    debug_assert!(chunk_size > 0);
    let total = body.len().div_ceil(chunk_size).max(1) as u32;
    body.chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, data)| {
            let mut chunk = Vec::with_capacity(CHUNK_PREFIX_SIZE + data.len());
            chunk.extend_from_slice(&sequence.to_be_bytes());
            chunk.extend_from_slice(&(index as u32).to_be_bytes());
            chunk.extend_from_slice(&total.to_be_bytes());
            chunk.extend_from_slice(data);
            chunk
        })
        .collect()
}

struct PendingSequence {
    total: u32,
    chunks: HashMap<u32, Vec<u8>>,
    last_seen: Instant,
}

/// Per-connection reassembly table for in-flight chunked packets.
///
/// Owned by the connection's [`PacketDecoder`](super::PacketDecoder) and
/// dropped with it on close.
pub struct ChunkAssembler {
    pending: HashMap<u32, PendingSequence>,
    eviction: Duration,
}

impl ChunkAssembler {
    /// Create an assembler with the default eviction timeout.
    pub fn new() -> Self {
        Self::with_eviction(DEFAULT_EVICTION_TIMEOUT)
    }

    /// Create an assembler with a custom eviction timeout.
    pub fn with_eviction(eviction: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            eviction,
        }
    }

    /// Feed one chunk body; returns the reassembled payload once the last
    /// missing chunk of its sequence arrives.
    pub fn push(&mut self, chunk_body: &[u8]) -> Result<Option<Vec<u8>>> {
        if chunk_body.len() < CHUNK_PREFIX_SIZE {
            return Err(WireError::Malformed(format!(
                "chunk body too short: {} bytes",
                chunk_body.len()
            )));
        }
        let sequence = u32::from_be_bytes([chunk_body[0], chunk_body[1], chunk_body[2], chunk_body[3]]);
        let index = u32::from_be_bytes([chunk_body[4], chunk_body[5], chunk_body[6], chunk_body[7]]);
        let total = u32::from_be_bytes([chunk_body[8], chunk_body[9], chunk_body[10], chunk_body[11]]);

        if total == 0 || index >= total {
            return Err(WireError::Malformed(format!(
                "chunk index {index} out of range for total {total}"
            )));
        }

        self.evict_stale();

        let entry = self.pending.entry(sequence).or_insert_with(|| PendingSequence {
            total,
            chunks: HashMap::new(),
            last_seen: Instant::now(),
        });
        if entry.total != total {
            return Err(WireError::Malformed(format!(
                "chunk total changed mid-sequence: {} then {total}",
                entry.total
            )));
        }
        entry.last_seen = Instant::now();
        entry
            .chunks
            .insert(index, chunk_body[CHUNK_PREFIX_SIZE..].to_vec());

        if entry.chunks.len() as u32 != total {
            return Ok(None);
        }

        // complete: concatenate in index order
        let mut entry = match self.pending.remove(&sequence) {
            Some(e) => e,
            None => return Ok(None),
        };
        let mut body = Vec::new();
        for i in 0..total {
            match entry.chunks.remove(&i) {
                Some(data) => body.extend_from_slice(&data),
                None => {
                    return Err(WireError::Malformed(format!(
                        "chunk sequence {sequence} missing index {i}"
                    )))
                }
            }
        }
        Ok(Some(body))
    }

    /// Number of sequences currently buffered.
    pub fn pending_sequences(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything, e.g. on connection close.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn evict_stale(&mut self) {
        let eviction = self.eviction;
        self.pending
            .retain(|_, entry| entry.last_seen.elapsed() < eviction);
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}
