//! Parent-process side of the bridge.
//!
//! A [`Caller`] spawns the child, wires a protocol engine onto its
//! stdin/stdout, and exposes the child's event stream as ordered signal
//! subscriptions. Every received packet fans out to the subscribers of
//! its tag, each invocation scheduled rather than run inline on the
//! read path.
//!
//! `connection-lost` and `gibberish` are always subscribed: either one
//! tears the child down.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::process::Command;
use tokio::sync::watch;

use crate::config::WireConfig;
use crate::connection::PairConnection;
use crate::engine::{DispatchFn, EngineConfig, EngineHandle, ProtocolEngine};
use crate::error::{Result, WireError};
use crate::packet::{reserved, Packet, PacketValue};
use crate::sched::{SharedScheduler, TokioScheduler};

use super::{ENV_LOG_PREFIX, ENV_NO_COLOR, ENV_SKIP_UI, ENV_WAIT_FOR_INPUT};

/// A signal subscriber. Receives the caller plus the subscription's
/// fixed arguments followed by the packet's payload arguments.
pub type SignalCallback = Arc<dyn Fn(&Caller, &[PacketValue]) + Send + Sync>;

struct Subscription {
    callback: SignalCallback,
    fixed: Vec<PacketValue>,
}

struct CallerInner {
    program: String,
    args: Vec<String>,
    description: String,
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    large_packets: Mutex<HashSet<String>>,
    scheduler: SharedScheduler,
    wire: WireConfig,
    engine: OnceLock<EngineHandle>,
    kill_tx: watch::Sender<bool>,
    kill_rx: Mutex<Option<watch::Receiver<bool>>>,
    started: AtomicBool,
    exited: AtomicBool,
    exit_fired: AtomicBool,
    stopped: AtomicBool,
}

/// Parent-process bridge endpoint; cheap to clone, all clones share the
/// same child.
#[derive(Clone)]
pub struct Caller {
    inner: Arc<CallerInner>,
}

impl Caller {
    /// Describe the child to spawn. Nothing runs until
    /// [`start()`](Self::start).
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_scheduler(program, args, Arc::new(TokioScheduler))
    }

    /// Same, with an explicit scheduler.
    pub fn with_scheduler(
        program: impl Into<String>,
        args: Vec<String>,
        scheduler: SharedScheduler,
    ) -> Self {
        let program = program.into();
        let description = program
            .rsplit('/')
            .next()
            .unwrap_or(&program)
            .to_string();
        let (kill_tx, kill_rx) = watch::channel(false);
        let caller = Self {
            inner: Arc::new(CallerInner {
                program,
                args,
                description,
                subscriptions: Mutex::new(HashMap::new()),
                large_packets: Mutex::new(HashSet::new()),
                scheduler,
                wire: WireConfig::from_env(),
                engine: OnceLock::new(),
                kill_tx,
                kill_rx: Mutex::new(Some(kill_rx)),
                started: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                exit_fired: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        };
        // Peer failure always tears the child down.
        caller.connect(
            reserved::CONNECTION_LOST,
            Arc::new(|caller, args| {
                tracing::info!(
                    target: "sessionwire::bridge",
                    detail = args.first().and_then(PacketValue::as_str).unwrap_or(""),
                    "connection to child lost"
                );
                caller.stop();
            }),
            vec![],
        );
        caller.connect(
            reserved::GIBBERISH,
            Arc::new(|caller, args| {
                tracing::warn!(
                    target: "sessionwire::bridge",
                    detail = args.first().and_then(PacketValue::as_str).unwrap_or(""),
                    "gibberish from child"
                );
                caller.stop();
            }),
            vec![],
        );
        caller
    }

    /// Subscribe `callback` to packets tagged `tag`. Subscribers fire in
    /// registration order, each with `fixed_args` followed by the
    /// packet's values.
    pub fn connect(&self, tag: &str, callback: SignalCallback, fixed_args: Vec<PacketValue>) {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(tag.to_string())
            .or_default()
            .push(Subscription {
                callback,
                fixed: fixed_args,
            });
    }

    /// Allow this command tag to exceed the chunk threshold. Takes
    /// effect at [`start()`](Self::start).
    pub fn allow_large(&self, tag: impl Into<String>) {
        self.inner
            .large_packets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tag.into());
    }

    /// Spawn the child and start the protocol engine on its pipes.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(WireError::Closed);
        }
        let inner = &self.inner;
        let mut cmd = Command::new(&inner.program);
        cmd.args(&inner.args)
            // Inherits our environment, minus anything interactive.
            .env(ENV_SKIP_UI, "1")
            .env(ENV_WAIT_FOR_INPUT, "0")
            .env(ENV_LOG_PREFIX, &inner.description)
            .env(ENV_NO_COLOR, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        tracing::info!(
            target: "sessionwire::bridge",
            program = %inner.program,
            pid = child.id(),
            "spawned child"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let conn = PairConnection::new(
            stdout,
            stdin,
            format!("subprocess:{}", inner.description),
        );

        let caller = self.clone();
        let dispatch: DispatchFn = Arc::new(move |_handle, packet| {
            caller.fire(packet.tag(), packet.values());
        });
        let mut config = EngineConfig::local();
        config.large_packets = inner
            .large_packets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        config.wire = inner.wire.clone();
        config.wire.flush_after_send = true;

        let mut engine = ProtocolEngine::new(Box::new(conn), dispatch, config);
        let _ = inner.engine.set(engine.handle());
        engine.start()?;

        let kill_rx = inner
            .kill_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let caller = self.clone();
        tokio::spawn(async move {
            watch_child(caller, child, kill_rx).await;
        });
        Ok(())
    }

    /// Enqueue a command packet for the child.
    pub fn send(&self, tag: &str, values: Vec<PacketValue>) -> Result<()> {
        if self.inner.exited.load(Ordering::Acquire) {
            return Err(WireError::ConnectionClosed);
        }
        let handle = self.inner.engine.get().ok_or(WireError::Closed)?;
        handle.send(&Packet::new(tag, values))
    }

    /// True until the child's exit has been observed.
    pub fn is_alive(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.exited.load(Ordering::Acquire)
    }

    /// Terminate the child (non-blocking) and close the engine.
    /// Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            target: "sessionwire::bridge",
            program = %self.inner.program,
            "stopping child"
        );
        let _ = self.inner.kill_tx.send(true);
        if let Some(handle) = self.inner.engine.get() {
            handle.close();
        }
    }

    /// Fan a packet out to the subscribers of its tag, in registration
    /// order, each invocation scheduled off the read path.
    fn fire(&self, tag: &str, values: &[PacketValue]) {
        let jobs: Vec<(SignalCallback, Vec<PacketValue>)> = {
            let subscriptions = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match subscriptions.get(tag) {
                Some(subs) => subs
                    .iter()
                    .map(|sub| {
                        let mut args = sub.fixed.clone();
                        args.extend_from_slice(values);
                        (sub.callback.clone(), args)
                    })
                    .collect(),
                None => {
                    tracing::debug!(target: "sessionwire::bridge", tag, "no subscribers");
                    return;
                }
            }
        };
        for (callback, args) in jobs {
            let caller = self.clone();
            self.inner
                .scheduler
                .schedule(Box::new(move || callback(&caller, &args)));
        }
    }
}

/// Wait for the child to exit (or for `stop()` to request a kill), then
/// fire the reserved `exit` subscription exactly once.
async fn watch_child(
    caller: Caller,
    mut child: tokio::process::Child,
    kill_rx: Option<watch::Receiver<bool>>,
) {
    let status = match kill_rx {
        Some(mut kill_rx) => {
            tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.changed() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
        None => child.wait().await,
    };
    caller.inner.exited.store(true, Ordering::Release);
    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };
    tracing::info!(target: "sessionwire::bridge", code, "child exited");
    if let Some(handle) = caller.inner.engine.get() {
        handle.close();
    }
    if !caller.inner.exit_fired.swap(true, Ordering::AcqRel) {
        caller.fire(reserved::EXIT, &[PacketValue::Int(i64::from(code))]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::TestScheduler;

    #[test]
    fn send_before_start_is_closed() {
        let caller = Caller::new("/bin/true", vec![]);
        assert!(matches!(
            caller.send("ping", vec![]),
            Err(WireError::Closed)
        ));
        assert!(!caller.is_alive());
    }

    #[test]
    fn subscribers_fire_in_registration_order() {
        let scheduler = Arc::new(TestScheduler::new());
        let caller = Caller::with_scheduler("/bin/true", vec![], scheduler.clone());

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        caller.connect(
            "replied",
            Arc::new(move |_caller, _args| first.lock().unwrap().push("first")),
            vec![],
        );
        let second = order.clone();
        caller.connect(
            "replied",
            Arc::new(move |_caller, _args| second.lock().unwrap().push("second")),
            vec![],
        );

        caller.fire("replied", &[PacketValue::from("hi")]);
        scheduler.run_pending();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn fixed_args_precede_packet_args() {
        let scheduler = Arc::new(TestScheduler::new());
        let caller = Caller::with_scheduler("/bin/true", vec![], scheduler.clone());

        let seen: Arc<Mutex<Vec<PacketValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        caller.connect(
            "replied",
            Arc::new(move |_caller, args| {
                sink.lock().unwrap().extend_from_slice(args);
            }),
            vec![PacketValue::from("fixed")],
        );

        caller.fire("replied", &[PacketValue::from("payload")]);
        scheduler.run_pending();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PacketValue::from("fixed"), PacketValue::from("payload")]
        );
    }

    #[test]
    fn stop_is_idempotent_before_start() {
        let caller = Caller::new("/bin/true", vec![]);
        caller.stop();
        caller.stop();
    }
}
