//! Child-process side of the bridge.
//!
//! A [`Callee`] owns a protocol engine over the process's stdin/stdout
//! (or any injected connection), dispatches incoming command packets to
//! a [`CommandRegistry`], and forwards the wrapped object's events out
//! through an [`EventEmitter`]. Reserved tags are control traffic and
//! never reach application handlers.
//!
//! Shutdown is two-phase: the first termination signal announces itself
//! to the peer with a `signal` packet and defers the actual stop by a
//! short grace delay so that packet reaches the wire; a second signal
//! stops immediately.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::config::WireConfig;
use crate::connection::{Connection, PairConnection};
use crate::engine::{DispatchFn, EngineConfig, EngineHandle, ProtocolEngine};
use crate::error::{Result, WireError};
use crate::packet::{reserved, Packet, PacketValue};
use crate::sched::{SharedScheduler, TokioScheduler};

use super::translate_tag;

/// Delay between announcing a termination signal and acting on it,
/// long enough for the `signal` packet to reach the wire.
pub const SIGNAL_GRACE_DELAY: Duration = Duration::from_millis(150);

/// Junk written raw to the transport by fault injection.
const FAULT_BYTES: &[u8] = b"\xde\xad\xbe\xefgarbage not matching any wire header\x00\xff";

/// A command handler: receives the packet's values after the tag.
///
/// Handlers run on the scheduler, never inline on the read path.
pub type CommandHandler = Arc<dyn Fn(&[PacketValue]) + Send + Sync>;

/// Static tag-to-handler table, built once at construction.
///
/// Tags are stored in handler-name form (hyphens already translated to
/// underscores), so `register("set-position", ..)` and an incoming
/// `set-position` packet meet in the middle.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `tag`. Later registrations replace earlier
    /// ones for the same tag.
    pub fn register<F>(&mut self, tag: &str, handler: F)
    where
        F: Fn(&[PacketValue]) + Send + Sync + 'static,
    {
        self.handlers.insert(translate_tag(tag), Arc::new(handler));
    }

    fn get(&self, method: &str) -> Option<&CommandHandler> {
        self.handlers.get(method)
    }

    /// Registered handler names, for logs.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// An event the wrapped object can emit across the bridge.
///
/// The finite set of events is enumerated as a type implementing this
/// trait (typically an enum), so the exportable surface is statically
/// known.
pub trait BridgeEvent: Send + 'static {
    /// Outbound packet tag for this event.
    fn tag(&self) -> &'static str;

    /// The event's own arguments, in wire order.
    fn into_values(self) -> Vec<PacketValue>;
}

struct FaultInjector {
    rate: u32,
    sends: AtomicU64,
}

impl FaultInjector {
    fn new(rate: u32) -> Self {
        Self {
            rate,
            sends: AtomicU64::new(0),
        }
    }

    /// Count one outbound send; on every Nth, write junk straight to the
    /// transport behind it.
    fn after_send(&self, handle: &EngineHandle) {
        if self.rate == 0 {
            return;
        }
        let n = self.sends.fetch_add(1, Ordering::AcqRel) + 1;
        if n % u64::from(self.rate) == 0 {
            tracing::warn!(target: "sessionwire::bridge", send = n, "injecting fault");
            let _ = handle.send_raw(Bytes::from_static(FAULT_BYTES));
        }
    }
}

/// Clone-able outbound event channel handed to the wrapped object.
///
/// Emitting an event whose tag was never exported is a silent no-op
/// (logged at debug); emitting before the callee runs fails with
/// [`WireError::Closed`].
#[derive(Clone)]
pub struct EventEmitter {
    handle: Arc<OnceLock<EngineHandle>>,
    exports: Arc<HashMap<&'static str, Vec<PacketValue>>>,
    fault: Arc<FaultInjector>,
}

impl EventEmitter {
    /// Serialize and enqueue `event` if its tag is exported.
    pub fn emit<E: BridgeEvent>(&self, event: E) -> Result<()> {
        let tag = event.tag();
        let fixed = match self.exports.get(tag) {
            Some(fixed) => fixed,
            None => {
                tracing::debug!(target: "sessionwire::bridge", tag, "event not exported");
                return Ok(());
            }
        };
        let handle = self.handle.get().ok_or(WireError::Closed)?;
        let mut values = event.into_values();
        values.extend(fixed.iter().cloned());
        handle.send(&Packet::new(tag, values))?;
        self.fault.after_send(handle);
        Ok(())
    }
}

struct CalleeShared {
    handle: Arc<OnceLock<EngineHandle>>,
    registry: CommandRegistry,
    allow_list: Option<HashSet<String>>,
    scheduler: SharedScheduler,
    fault: Arc<FaultInjector>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stopping: AtomicBool,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Child-process bridge endpoint.
///
/// Configure with the builder methods, hand [`emitter()`](Self::emitter)
/// to the wrapped object, then [`run()`](Self::run).
pub struct Callee {
    registry: CommandRegistry,
    allow_list: Option<HashSet<String>>,
    exports: HashMap<&'static str, Vec<PacketValue>>,
    large_packets: HashSet<String>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
    scheduler: SharedScheduler,
    wire: WireConfig,
    connection: Option<Box<dyn Connection>>,
    handle: Arc<OnceLock<EngineHandle>>,
    fault: Arc<FaultInjector>,
    emitter_exports: OnceLock<Arc<HashMap<&'static str, Vec<PacketValue>>>>,
}

impl Callee {
    /// Build a callee over the process's standard streams, configured
    /// from the environment.
    pub fn new(registry: CommandRegistry) -> Self {
        Self::with_scheduler(registry, Arc::new(TokioScheduler))
    }

    /// Build a callee with an explicit scheduler.
    pub fn with_scheduler(registry: CommandRegistry, scheduler: SharedScheduler) -> Self {
        let wire = WireConfig::from_env();
        let fault = Arc::new(FaultInjector::new(wire.fault_rate));
        Self {
            registry,
            allow_list: None,
            exports: HashMap::new(),
            large_packets: HashSet::new(),
            cleanup: None,
            scheduler,
            wire,
            connection: None,
            handle: Arc::new(OnceLock::new()),
            fault,
            emitter_exports: OnceLock::new(),
        }
    }

    /// Restrict dispatch to these command tags; anything else is logged
    /// and dropped.
    pub fn allow_list<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow_list = Some(
            tags.into_iter()
                .map(|t| translate_tag(t.as_ref()))
                .collect(),
        );
        self
    }

    /// Export an event tag: the wrapped object's events with this tag are
    /// forwarded as packets carrying the event args followed by
    /// `fixed_args`. Must precede [`emitter()`](Self::emitter).
    pub fn export(mut self, tag: &'static str, fixed_args: Vec<PacketValue>) -> Self {
        self.exports.insert(tag, fixed_args);
        self
    }

    /// Allow this event tag to exceed the chunk threshold.
    pub fn allow_large(mut self, tag: impl Into<String>) -> Self {
        self.large_packets.insert(tag.into());
        self
    }

    /// Run `cleanup` exactly once during shutdown, before the engine
    /// closes.
    pub fn on_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Register a command handler. Handlers that emit events take a
    /// clone of [`emitter()`](Self::emitter), so this accepts `&mut`
    /// after construction.
    pub fn register<F>(&mut self, tag: &str, handler: F)
    where
        F: Fn(&[PacketValue]) + Send + Sync + 'static,
    {
        self.registry.register(tag, handler);
    }

    /// Replace the default stdio transport, for tests.
    pub fn with_connection(mut self, conn: Box<dyn Connection>) -> Self {
        self.connection = Some(conn);
        self
    }

    /// Override the fault injection rate (0 disables). Normally set via
    /// the environment.
    pub fn with_fault_rate(mut self, rate: u32) -> Self {
        self.fault = Arc::new(FaultInjector::new(rate));
        self
    }

    /// The outbound event channel for the wrapped object. Snapshots the
    /// export table; call after all [`export()`](Self::export) calls.
    pub fn emitter(&self) -> EventEmitter {
        let exports = self
            .emitter_exports
            .get_or_init(|| Arc::new(self.exports.clone()))
            .clone();
        EventEmitter {
            handle: self.handle.clone(),
            exports,
            fault: self.fault.clone(),
        }
    }

    /// Serve until stopped; returns the process exit code.
    pub async fn run(mut self) -> Result<i32> {
        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => Box::new(PairConnection::new(
                tokio::io::stdin(),
                tokio::io::stdout(),
                "stdio",
            )),
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = Arc::new(CalleeShared {
            handle: self.handle.clone(),
            registry: self.registry,
            allow_list: self.allow_list,
            scheduler: self.scheduler,
            fault: self.fault,
            cleanup: Mutex::new(self.cleanup),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx,
        });

        let dispatch_shared = shared.clone();
        let dispatch: DispatchFn =
            Arc::new(move |handle, packet| handle_packet(&dispatch_shared, handle, packet));

        let mut config = EngineConfig::local();
        config.large_packets = self.large_packets;
        config.wire = self.wire;
        // Pipes buffer; flush so small packets are not held back.
        config.wire.flush_after_send = true;

        let mut engine = ProtocolEngine::new(conn, dispatch, config);
        let _ = self.handle.set(engine.handle());
        engine.start()?;
        tracing::info!(target: "sessionwire::bridge", "callee running");

        #[cfg(unix)]
        spawn_signal_task(shared.clone());

        while !*stop_rx.borrow() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }

        engine.shutdown().await;
        tracing::info!(target: "sessionwire::bridge", "callee stopped");
        Ok(0)
    }
}

fn handle_packet(shared: &Arc<CalleeShared>, _handle: &EngineHandle, packet: Packet) {
    let tag = packet.tag();
    if reserved::is_reserved(tag) {
        match tag {
            reserved::STOP | reserved::CONNECTION_LOST | reserved::GIBBERISH => {
                tracing::info!(target: "sessionwire::bridge", tag, "control packet, stopping");
                stop(shared);
            }
            reserved::EXIT => {
                tracing::info!(target: "sessionwire::bridge", "exit requested");
                stop(shared);
                std::process::exit(0);
            }
            // `signal` only travels callee-to-caller.
            _ => {}
        }
        return;
    }

    let method = translate_tag(tag);
    if let Some(allow) = &shared.allow_list {
        if !allow.contains(&method) {
            tracing::warn!(target: "sessionwire::bridge", tag, "tag not in allow-list, dropped");
            return;
        }
    }
    match shared.registry.get(&method) {
        Some(handler) => {
            let handler = handler.clone();
            let values: Vec<PacketValue> = packet.values().to_vec();
            shared
                .scheduler
                .schedule(Box::new(move || handler(&values)));
        }
        None => {
            tracing::warn!(target: "sessionwire::bridge", tag, "unknown command, dropped");
        }
    }
}

fn stop(shared: &Arc<CalleeShared>) {
    if shared.stopped.swap(true, Ordering::AcqRel) {
        return;
    }
    run_cleanup(shared);
    if let Some(handle) = shared.handle.get() {
        handle.close();
    }
    let _ = shared.stop_tx.send(true);
}

fn run_cleanup(shared: &CalleeShared) {
    let cleanup = shared
        .cleanup
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

#[cfg(unix)]
fn spawn_signal_task(shared: Arc<CalleeShared>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "sessionwire::bridge", error = %e, "no SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "sessionwire::bridge", error = %e, "no SIGTERM handler");
                return;
            }
        };
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            on_signal(&shared, name);
        }
    });
}

#[cfg(unix)]
fn on_signal(shared: &Arc<CalleeShared>, name: &str) {
    if shared.stopping.swap(true, Ordering::AcqRel) {
        tracing::info!(target: "sessionwire::bridge", signal = name, "second signal, stopping now");
        stop(shared);
        return;
    }
    tracing::info!(target: "sessionwire::bridge", signal = name, "termination signal");
    if let Some(handle) = shared.handle.get() {
        let _ = handle.send(&Packet::new(
            reserved::SIGNAL,
            vec![PacketValue::from(name)],
        ));
        shared.fault.after_send(handle);
    }
    let s = shared.clone();
    shared.scheduler.schedule(Box::new(move || run_cleanup(&s)));
    // Grace delay lets the signal packet reach the wire before the
    // engine closes.
    let s = shared.clone();
    shared
        .scheduler
        .schedule_after(SIGNAL_GRACE_DELAY, Box::new(move || stop(&s)));
}
