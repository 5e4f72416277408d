//! # sessionwire
//!
//! Transport-agnostic framed packet protocol with a subprocess RPC
//! bridge.
//!
//! The stack, bottom up:
//!
//! - **frame**: WebSocket-style binary framing (opcode, fin, masking,
//!   7/16/64-bit length classes), used when packets are tunneled.
//! - **codec**: the packet wire format — a fixed 7-byte header naming
//!   the encoder, compressor and body length, plus chunking of
//!   oversized bodies and their reassembly.
//! - **engine**: owns one [`Connection`], runs a read-and-dispatch loop
//!   and a queue-drain-and-write loop, and exposes encoder/compressor
//!   negotiation and the start/close lifecycle.
//! - **bridge**: the [`Caller`]/[`Callee`] pair projecting an object's
//!   command and event surface across a subprocess boundary over the
//!   engine.
//!
//! ## Example
//!
//! ```ignore
//! use sessionwire::{EngineConfig, Packet, PacketValue, ProtocolEngine, StreamConnection};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sessionwire::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:14500").await?;
//!     let mut engine = ProtocolEngine::new(
//!         Box::new(StreamConnection::from_tcp(stream)),
//!         Arc::new(|handle, packet| {
//!             println!("{}: {} values", packet.tag(), packet.values().len());
//!         }),
//!         EngineConfig::default(),
//!     );
//!     engine.start()?;
//!     engine.handle().send(&Packet::new("hello", vec![PacketValue::from(1i64)]))?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod frame;
pub mod packet;
pub mod queue;
pub mod sched;

pub use bridge::{Callee, Caller, CommandRegistry, EventEmitter};
pub use codec::{Compressor, Encoder};
pub use config::WireConfig;
pub use connection::{Connection, PairConnection, StreamConnection};
pub use engine::{EngineConfig, EngineHandle, Framing, ProtocolEngine, ProtocolState};
pub use error::{Result, WireError};
pub use packet::{Packet, PacketValue};
