//! Process bridge: project an object's commands and events across a
//! process boundary over the packet protocol.
//!
//! Two symmetric roles. The [`Callee`](callee::Callee) runs inside the
//! child process, dispatching incoming command packets to registered
//! handlers and forwarding the wrapped object's events as outbound
//! packets. The [`Caller`](caller::Caller) runs in the parent, spawns the
//! child, and exposes send + ordered signal subscriptions.
//!
//! Both sides default to the baseline encoder with no compression, since
//! subprocess pipes are local and trusted.

pub mod callee;
pub mod caller;

pub use callee::{BridgeEvent, Callee, CommandHandler, CommandRegistry, EventEmitter};
pub use caller::{Caller, SignalCallback};

/// Child processes must not open their own UI.
pub const ENV_SKIP_UI: &str = "SESSIONWIRE_SKIP_UI";
/// Prefix the child prepends to its log lines.
pub const ENV_LOG_PREFIX: &str = "SESSIONWIRE_LOG_PREFIX";
/// Child must not pause for interactive input at startup.
pub const ENV_WAIT_FOR_INPUT: &str = "SESSIONWIRE_WAIT_FOR_INPUT";
/// Deterministic (uncolored) child log output.
pub const ENV_NO_COLOR: &str = "NO_COLOR";

/// Wire tags use hyphens; handler names use underscores.
pub fn translate_tag(tag: &str) -> String {
    tag.replace('-', "_")
}
