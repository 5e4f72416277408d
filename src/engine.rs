//! Protocol engine - owns one connection and drives its lifecycle.
//!
//! The engine runs two loops on the tokio runtime:
//!
//! - the **read loop** pulls bytes off the connection, feeds them through
//!   the resumable [`PacketDecoder`] (unwrapping WebSocket frames first
//!   when tunneled) and hands each complete packet to the dispatch
//!   callback, synchronously, in arrival order;
//! - the **write loop** drains the [`SendQueue`] one packet at a time,
//!   compressing, chunking and framing as negotiated. It parks on the
//!   queue's notify when idle; `source_has_more` (raised by every
//!   enqueue) wakes it. That wake signal is the backpressure mechanism:
//!   an empty queue costs no CPU.
//!
//! Failure semantics: malformed input produces a single `gibberish`
//! notification with a bounded excerpt and closes the connection;
//! EOF, I/O errors and read timeouts produce `connection-lost` and close.
//! Neither is retried by the engine; retry policy belongs to the owner.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::chunk::split_chunks;
use crate::codec::{
    negotiate, Compressor, Encoder, PacketDecoder, WireHeader, FLAG_CHUNK,
};
use crate::config::{hexstr, WireConfig};
use crate::connection::{BoxedWriter, Connection};
use crate::error::{Result, WireError};
use crate::frame::{self, FrameEvent, Opcode};
use crate::packet::{ellipsized, reserved, Packet, PacketValue};
use crate::queue::{QueueItem, SendQueue};

/// Lifecycle of a protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProtocolState {
    /// Constructed, loops not running.
    Created = 0,
    /// `start()` called, loops spawned.
    Started = 1,
    /// At least one frame successfully exchanged.
    Active = 2,
    /// Local close or fatal error observed; loops winding down.
    Closing = 3,
    /// Both loops have stopped and the connection is released.
    Closed = 4,
}

impl ProtocolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProtocolState::Created,
            1 => ProtocolState::Started,
            2 => ProtocolState::Active,
            3 => ProtocolState::Closing,
            _ => ProtocolState::Closed,
        }
    }
}

/// Wire framing mode of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Packet frames go straight onto the byte stream.
    Raw,
    /// Packet frames are tunneled inside WebSocket binary frames.
    /// `mask` controls outbound masking (client-role tunnels mask).
    WebSocket {
        /// Mask outbound frames.
        mask: bool,
    },
}

/// Default serialized-body size above which packets must be chunked.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 16 * 1024;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Encoder preference order; the first entry is used before
    /// negotiation completes.
    pub encoders: Vec<Encoder>,
    /// Compressor preference order; `None` is always an implicit fallback.
    pub compressors: Vec<Compressor>,
    /// Command tags allowed to exceed the chunk threshold.
    pub large_packets: HashSet<String>,
    /// Serialized-body size above which allow-listed packets are chunked.
    pub chunk_threshold: usize,
    /// Wire framing mode.
    pub framing: Framing,
    /// Diagnostic toggles.
    pub wire: WireConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            encoders: vec![Encoder::MsgPack],
            compressors: vec![Compressor::None],
            large_packets: HashSet::new(),
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            framing: Framing::Raw,
            wire: WireConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for a local/trusted transport (subprocess pipes):
    /// baseline encoder, no compression.
    pub fn local() -> Self {
        Self::default()
    }

    /// Register a tag on the large-packet allow-list.
    pub fn allow_large(mut self, tag: impl Into<String>) -> Self {
        self.large_packets.insert(tag.into());
        self
    }
}

/// Dispatch callback invoked once per received packet, in arrival order.
///
/// Must be fast: it runs inline on the read path. Long-running work is
/// scheduled through a [`Scheduler`](crate::sched::Scheduler).
pub type DispatchFn = Arc<dyn Fn(&EngineHandle, Packet) + Send + Sync>;

struct Shared {
    state: AtomicU8,
    queue: SendQueue,
    // watch, not Notify: a close raised before a loop registers its
    // waiter must still be observed.
    closed_tx: watch::Sender<bool>,
    encoder: AtomicU8,
    compressor: AtomicU8,
    encoders: Vec<Encoder>,
    compressors: Vec<Compressor>,
    large_packets: HashSet<String>,
    chunk_threshold: usize,
    framing: Framing,
    wire: WireConfig,
    label: String,
    next_chunk_seq: AtomicU32,
    error_notified: AtomicBool,
    loops_running: AtomicU8,
}

impl Shared {
    fn state(&self) -> ProtocolState {
        ProtocolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            ProtocolState::Started as u8,
            ProtocolState::Active as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn begin_close(&self) -> bool {
        let prev = self.state.swap(ProtocolState::Closing as u8, Ordering::AcqRel);
        if prev >= ProtocolState::Closing as u8 {
            self.state.store(prev, Ordering::Release);
            return false;
        }
        // Unsent packets are discarded; no delivery guarantee past close.
        self.queue.discard();
        let _ = self.closed_tx.send(true);
        self.queue.source_has_more();
        if self.loops_running.load(Ordering::Acquire) == 0 {
            self.state
                .store(ProtocolState::Closed as u8, Ordering::Release);
        }
        true
    }

    fn loop_stopped(&self) {
        if self.loops_running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state
                .store(ProtocolState::Closed as u8, Ordering::Release);
            tracing::debug!(target: "sessionwire::engine", label = %self.label, "closed");
        }
    }
}

/// Clone-able handle to a running engine: the producer/control surface.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ProtocolState {
        self.shared.state()
    }

    /// Connection label, for logs.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Number of packets enqueued but not yet written.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Serialize and enqueue a packet for sending.
    ///
    /// The body is encoded with the currently negotiated encoder here, at
    /// enqueue time, so an oversized body on a tag outside the
    /// large-packet allow-list fails immediately with
    /// [`WireError::Oversized`] instead of poisoning the write loop.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.shared.state() >= ProtocolState::Closing {
            return Err(WireError::Closed);
        }
        let encoder = self.encoder();
        let body = encoder.encode(packet)?;
        if body.len() > self.shared.chunk_threshold
            && !self.shared.large_packets.contains(packet.tag())
        {
            return Err(WireError::Oversized {
                tag: packet.tag().to_string(),
                size: body.len(),
                limit: self.shared.chunk_threshold,
            });
        }
        if self.shared.wire.hexdump {
            tracing::info!(
                target: "sessionwire::engine",
                tag = packet.tag(),
                body = %hexstr(&body),
                "send"
            );
        } else if self.shared.wire.debug {
            tracing::debug!(
                target: "sessionwire::engine",
                tag = packet.tag(),
                bytes = body.len(),
                "send"
            );
        }
        self.shared.queue.push(QueueItem::Packet {
            tag: packet.tag().to_string(),
            body: Bytes::from(body),
            encoder: encoder.id(),
        });
        Ok(())
    }

    /// Write raw bytes to the transport, bypassing the codec entirely.
    ///
    /// Test hook for fault injection; the peer will see this as
    /// gibberish.
    pub fn send_raw(&self, junk: Bytes) -> Result<()> {
        if self.shared.state() >= ProtocolState::Closing {
            return Err(WireError::Closed);
        }
        self.shared.queue.push(QueueItem::Raw(junk));
        Ok(())
    }

    /// Currently selected encoder.
    pub fn encoder(&self) -> Encoder {
        Encoder::from_id(self.shared.encoder.load(Ordering::Acquire))
            .unwrap_or(Encoder::MsgPack)
    }

    /// Currently selected compressor.
    pub fn compressor(&self) -> Compressor {
        Compressor::from_id(self.shared.compressor.load(Ordering::Acquire))
            .unwrap_or(Compressor::None)
    }

    /// Pick the first of our preferred encoders the peer also supports
    /// and switch to it. Falls back to the baseline when there is no
    /// overlap.
    pub fn negotiate_encoder(&self, theirs: &[Encoder]) -> Encoder {
        let chosen = negotiate(&self.shared.encoders, theirs).unwrap_or(Encoder::MsgPack);
        self.shared.encoder.store(chosen.id(), Ordering::Release);
        chosen
    }

    /// Pick the first of our preferred compressors the peer also
    /// supports; "none" is always a valid fallback.
    pub fn negotiate_compressor(&self, theirs: &[Compressor]) -> Compressor {
        let chosen = negotiate(&self.shared.compressors, theirs).unwrap_or(Compressor::None);
        self.shared.compressor.store(chosen.id(), Ordering::Release);
        chosen
    }

    /// Close the engine: stop accepting sends, discard unsent packets,
    /// release the connection. Idempotent, callable from any task.
    pub fn close(&self) {
        if self.shared.begin_close() {
            tracing::debug!(target: "sessionwire::engine", label = %self.shared.label, "closing");
        }
    }
}

/// Owns one [`Connection`] and drives its read and write loops.
pub struct ProtocolEngine {
    shared: Arc<Shared>,
    conn: Option<Box<dyn Connection>>,
    dispatch: DispatchFn,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl ProtocolEngine {
    /// Create an engine over `conn`; `dispatch` receives every packet.
    pub fn new(conn: Box<dyn Connection>, dispatch: DispatchFn, config: EngineConfig) -> Self {
        let initial_encoder = config.encoders.first().copied().unwrap_or(Encoder::MsgPack);
        let initial_compressor = config
            .compressors
            .first()
            .copied()
            .unwrap_or(Compressor::None);
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ProtocolState::Created as u8),
            queue: SendQueue::new(),
            closed_tx,
            encoder: AtomicU8::new(initial_encoder.id()),
            compressor: AtomicU8::new(initial_compressor.id()),
            encoders: config.encoders,
            compressors: config.compressors,
            large_packets: config.large_packets,
            chunk_threshold: config.chunk_threshold,
            framing: config.framing,
            wire: config.wire,
            label: conn.label().to_string(),
            next_chunk_seq: AtomicU32::new(1),
            error_notified: AtomicBool::new(false),
            loops_running: AtomicU8::new(0),
        });
        Self {
            shared,
            conn: Some(conn),
            dispatch,
            read_task: None,
            write_task: None,
        }
    }

    /// Producer/control handle, clone-able across tasks.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Spawn the read and write loops. Transitions CREATED -> STARTED;
    /// any other state (already started, or closed before starting)
    /// fails with [`WireError::Closed`].
    pub fn start(&mut self) -> Result<()> {
        self.shared
            .state
            .compare_exchange(
                ProtocolState::Created as u8,
                ProtocolState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| WireError::Closed)?;

        let conn = self.conn.take().ok_or(WireError::Closed)?;
        let timeout = conn.timeout();
        let (reader, writer) = conn.split();

        self.shared.loops_running.store(2, Ordering::Release);

        let shared = self.shared.clone();
        let dispatch = self.dispatch.clone();
        let closed_rx = self.shared.closed_tx.subscribe();
        self.read_task = Some(tokio::spawn(read_loop(
            reader, shared, dispatch, timeout, closed_rx,
        )));

        let shared = self.shared.clone();
        let dispatch = self.dispatch.clone();
        let closed_rx = self.shared.closed_tx.subscribe();
        self.write_task = Some(tokio::spawn(write_loop(writer, shared, dispatch, closed_rx)));
        Ok(())
    }

    /// Close and wait for both loops to observe the closure.
    pub async fn shutdown(&mut self) {
        self.handle().close();
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.write_task.take() {
            let _ = task.await;
        }
    }
}

async fn read_loop(
    mut reader: crate::connection::BoxedReader,
    shared: Arc<Shared>,
    dispatch: DispatchFn,
    timeout: Duration,
    mut closed_rx: watch::Receiver<bool>,
) {
    let mut decoder = PacketDecoder::new();
    let mut ws_buf = BytesMut::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        if shared.state() >= ProtocolState::Closing {
            break;
        }

        let read = tokio::select! {
            _ = closed_rx.changed() => break,
            read = read_some(&mut reader, &mut buf, timeout) => read,
        };
        let read = match read {
            ReadOutcome::Data(result) => result,
            ReadOutcome::TimedOut => {
                // Timeout is treated like a peer-initiated close.
                connection_lost(&shared, &dispatch, "read timeout");
                break;
            }
        };

        let n = match read {
            Ok(0) => {
                connection_lost(&shared, &dispatch, "EOF");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                connection_lost(&shared, &dispatch, &e.to_string());
                break;
            }
        };

        let packets = match shared.framing {
            Framing::Raw => decoder.push(&buf[..n]),
            Framing::WebSocket { .. } => {
                ws_buf.extend_from_slice(&buf[..n]);
                unwrap_ws_frames(&mut ws_buf, &mut decoder)
            }
        };

        match packets {
            Ok(packets) => {
                if !packets.is_empty() {
                    shared.mark_active();
                }
                for packet in packets {
                    if shared.wire.debug {
                        tracing::debug!(
                            target: "sessionwire::engine",
                            tag = packet.tag(),
                            "dispatch"
                        );
                    }
                    dispatch_packet(&shared, &dispatch, packet);
                    if shared.state() >= ProtocolState::Closing {
                        break;
                    }
                }
            }
            Err(WireError::ConnectionClosed) => {
                connection_lost(&shared, &dispatch, "peer close frame");
                break;
            }
            Err(e) => {
                // The offending bytes may have arrived in an earlier read;
                // excerpt the unconsumed buffer, not the last chunk.
                let bad = match shared.framing {
                    Framing::Raw if decoder.buffered() > 0 => decoder.peek(),
                    Framing::WebSocket { .. } if !ws_buf.is_empty() => &ws_buf[..],
                    _ => &buf[..n],
                };
                gibberish(&shared, &dispatch, &e, bad);
                break;
            }
        }
    }

    decoder.clear();
    shared.loop_stopped();
}

enum ReadOutcome {
    Data(std::io::Result<usize>),
    TimedOut,
}

async fn read_some(
    reader: &mut crate::connection::BoxedReader,
    buf: &mut [u8],
    timeout: Duration,
) -> ReadOutcome {
    if timeout.is_zero() {
        ReadOutcome::Data(reader.read(buf).await)
    } else {
        match tokio::time::timeout(timeout, reader.read(buf)).await {
            Ok(result) => ReadOutcome::Data(result),
            Err(_elapsed) => ReadOutcome::TimedOut,
        }
    }
}

/// Peel complete WebSocket frames off `ws_buf`, feeding binary payloads
/// into the packet decoder. A CLOSE frame surfaces as `ConnectionClosed`.
fn unwrap_ws_frames(ws_buf: &mut BytesMut, decoder: &mut PacketDecoder) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    loop {
        match frame::decode_frame(ws_buf)? {
            FrameEvent::Incomplete => return Ok(packets),
            FrameEvent::Frame {
                opcode,
                payload,
                consumed,
                ..
            } => {
                let _ = ws_buf.split_to(consumed);
                match opcode {
                    Opcode::Binary | Opcode::Continuation => {
                        packets.extend(decoder.push(&payload)?);
                    }
                    Opcode::Close => return Err(WireError::ConnectionClosed),
                    // Control frames carry nothing for the packet layer.
                    Opcode::Ping | Opcode::Pong => {}
                    Opcode::Text => {
                        return Err(WireError::Malformed(
                            "unexpected text frame on packet tunnel".to_string(),
                        ))
                    }
                }
            }
        }
    }
}

fn dispatch_packet(shared: &Arc<Shared>, dispatch: &DispatchFn, packet: Packet) {
    let handle = EngineHandle {
        shared: shared.clone(),
    };
    dispatch(&handle, packet);
}

fn connection_lost(shared: &Arc<Shared>, dispatch: &DispatchFn, detail: &str) {
    // The locally initiated close path must not masquerade as a failure.
    if shared.state() >= ProtocolState::Closing {
        return;
    }
    if !shared.error_notified.swap(true, Ordering::AcqRel) {
        tracing::info!(
            target: "sessionwire::engine",
            label = %shared.label,
            detail,
            "connection lost"
        );
        dispatch_packet(
            shared,
            dispatch,
            Packet::new(
                reserved::CONNECTION_LOST,
                vec![PacketValue::from(detail)],
            ),
        );
    }
    shared.begin_close();
}

fn gibberish(shared: &Arc<Shared>, dispatch: &DispatchFn, error: &WireError, data: &[u8]) {
    if !shared.error_notified.swap(true, Ordering::AcqRel) {
        let excerpt = ellipsized(data, 80);
        tracing::warn!(
            target: "sessionwire::engine",
            label = %shared.label,
            %error,
            excerpt,
            "gibberish received"
        );
        dispatch_packet(
            shared,
            dispatch,
            Packet::new(
                reserved::GIBBERISH,
                vec![
                    PacketValue::from(error.to_string()),
                    PacketValue::from(excerpt),
                ],
            ),
        );
    }
    shared.begin_close();
}

async fn write_loop(
    mut writer: BoxedWriter,
    shared: Arc<Shared>,
    dispatch: DispatchFn,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        // Drain everything currently queued.
        loop {
            if shared.state() >= ProtocolState::Closing {
                shared.loop_stopped();
                return;
            }
            let (item, _must_start_new_frame, more) = shared.queue.get_next_packet();
            let item = match item {
                Some(item) => item,
                None => break,
            };
            if let Err(e) = write_item(&mut writer, &shared, item).await {
                connection_lost(&shared, &dispatch, &e.to_string());
                shared.loop_stopped();
                return;
            }
            shared.mark_active();
            if !more {
                break;
            }
        }

        // Idle: suspend until the next source_has_more or close.
        tokio::select! {
            _ = shared.queue.wait() => {}
            _ = closed_rx.changed() => {
                shared.loop_stopped();
                return;
            }
        }
    }
}

async fn write_item(writer: &mut BoxedWriter, shared: &Shared, item: QueueItem) -> Result<()> {
    match item {
        QueueItem::Raw(junk) => {
            // Fault-injection lane: straight onto the wire.
            writer.write_all(&junk).await?;
        }
        QueueItem::Packet { tag, body, encoder } => {
            let compressor = Compressor::from_id(shared.compressor.load(Ordering::Acquire))
                .unwrap_or(Compressor::None);
            let chunked = body.len() > shared.chunk_threshold
                && shared.large_packets.contains(tag.as_str());
            let compressed = compressor.compress(&body)?;

            if chunked {
                let seq = shared.next_chunk_seq.fetch_add(1, Ordering::AcqRel);
                for chunk in split_chunks(seq, &compressed, shared.chunk_threshold) {
                    let header = WireHeader::new(
                        encoder,
                        compressor.id(),
                        FLAG_CHUNK,
                        chunk.len() as u32,
                    );
                    write_frame(writer, shared, &header, &chunk).await?;
                }
            } else {
                let header =
                    WireHeader::new(encoder, compressor.id(), 0, compressed.len() as u32);
                write_frame(writer, shared, &header, &compressed).await?;
            }
        }
    }
    if shared.wire.flush_after_send {
        writer.flush().await?;
    }
    Ok(())
}

async fn write_frame(
    writer: &mut BoxedWriter,
    shared: &Shared,
    header: &WireHeader,
    body: &[u8],
) -> Result<()> {
    match shared.framing {
        Framing::Raw => {
            writer.write_all(&header.encode()).await?;
            writer.write_all(body).await?;
        }
        Framing::WebSocket { mask } => {
            // One packet frame per WebSocket binary frame, never split
            // across frames of another packet.
            let mut inner = Vec::with_capacity(crate::codec::HEADER_SIZE + body.len());
            inner.extend_from_slice(&header.encode());
            inner.extend_from_slice(body);
            let ws = frame::encode_frame(Opcode::Binary, &inner, mask, true);
            writer.write_all(&ws).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StreamConnection;
    use std::sync::Mutex;

    fn collector() -> (DispatchFn, Arc<Mutex<Vec<Packet>>>) {
        let seen: Arc<Mutex<Vec<Packet>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatch: DispatchFn = Arc::new(move |_handle, packet| {
            sink.lock().unwrap().push(packet);
        });
        (dispatch, seen)
    }

    #[test]
    fn state_ordering() {
        assert!(ProtocolState::Created < ProtocolState::Started);
        assert!(ProtocolState::Active < ProtocolState::Closing);
        assert!(ProtocolState::Closing < ProtocolState::Closed);
    }

    #[tokio::test]
    async fn oversized_rejected_at_enqueue() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig {
                chunk_threshold: 64,
                ..EngineConfig::default()
            },
        );
        let handle = engine.handle();
        let big = Packet::new("hello", vec![PacketValue::Blob(Bytes::from(vec![0u8; 256]))]);
        match handle.send(&big) {
            Err(WireError::Oversized { tag, .. }) => assert_eq!(tag, "hello"),
            other => panic!("expected Oversized, got {other:?}"),
        }
        // Same body on the allow-list goes through.
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn large_packet_allow_list_permits_chunking() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig {
                chunk_threshold: 64,
                ..EngineConfig::default()
            }
            .allow_large("hello"),
        );
        let handle = engine.handle();
        let big = Packet::new("hello", vec![PacketValue::Blob(Bytes::from(vec![0u8; 256]))]);
        handle.send(&big).unwrap();
        assert_eq!(handle.pending(), 1);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let mut engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig::default(),
        );
        engine.start().unwrap();
        let handle = engine.handle();
        handle.close();
        let packet = Packet::new("ping", vec![]);
        assert!(matches!(handle.send(&packet), Err(WireError::Closed)));
        engine.shutdown().await;
        assert_eq!(handle.state(), ProtocolState::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let mut engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig::default(),
        );
        engine.start().unwrap();
        let handle = engine.handle();
        handle.close();
        handle.close();
        engine.shutdown().await;
        assert_eq!(handle.state(), ProtocolState::Closed);
    }

    #[tokio::test]
    async fn close_before_start_stays_closed() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let mut engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig::default(),
        );
        let handle = engine.handle();
        handle.close();
        assert_eq!(handle.state(), ProtocolState::Closed);
        // A late start must not revive a closed engine.
        assert!(matches!(engine.start(), Err(WireError::Closed)));
        assert_eq!(handle.state(), ProtocolState::Closed);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let mut engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig::default(),
        );
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(WireError::Closed)));
        engine.handle().close();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn negotiation_prefers_our_order() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (dispatch, _) = collector();
        let engine = ProtocolEngine::new(
            Box::new(StreamConnection::new(local, "test")),
            dispatch,
            EngineConfig {
                encoders: vec![Encoder::MsgPack, Encoder::Json],
                compressors: vec![Compressor::Zlib, Compressor::None],
                ..EngineConfig::default()
            },
        );
        let handle = engine.handle();
        assert_eq!(handle.negotiate_encoder(&[Encoder::Json]), Encoder::Json);
        assert_eq!(handle.encoder(), Encoder::Json);
        assert_eq!(
            handle.negotiate_compressor(&[Compressor::None, Compressor::Zlib]),
            Compressor::Zlib
        );
        // No overlap falls back to the baseline.
        assert_eq!(handle.negotiate_encoder(&[]), Encoder::MsgPack);
    }
}
