//! Signal listener: turns OS signals and explicit exit requests into exactly
//! one run of the quit callback.
//!
//! # State machine
//!
//! ```text
//!            SIGINT / SIGTERM / SIGHUP / SIGABRT
//!            or exit()
//! Listening ───────────────────────────────────► ShuttingDown ──quit() done──► Done
//!    │  ▲
//!    └──┘ SIGUSR2: restart(), keep listening
//! ```
//!
//! The state is published on a `watch` channel. [`SignalListener::exit`]
//! requests the transition and waits until `Done`, so a caller that awaits it
//! knows every cleanup action has finished. Triggers arriving after the first
//! one are inert.
//!
//! On non-Unix platforms only Ctrl-C is observed and there is no restart
//! signal.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use crate::error::Error;

/// Where the listener is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListenerState {
    Listening,
    ShuttingDown,
    Done,
}

/// What caused the listener to stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger {
    Signal(&'static str),
    Requested,
}

/// Watches for termination and restart signals.
///
/// Cheap to clone; every clone controls the same listener.
#[derive(Clone, Debug)]
pub struct SignalListener {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    started: AtomicBool,
    stop: Notify,
    state: watch::Sender<ListenerState>,
}

impl Default for SignalListener {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalListener {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ListenerState::Listening);
        Self {
            inner: Arc::new(Inner { started: AtomicBool::new(false), stop: Notify::new(), state }),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Installs the signal handlers and spawns the listener task.
    ///
    /// `quit` runs once, on the first termination signal or [`exit`] call.
    /// An [`exit`] made before `run` is remembered: the listener then quits
    /// as soon as it starts. `restart` runs on every restart signal. Must be
    /// called from within a tokio runtime.
    ///
    /// Fails with [`Error::ListenerRunning`] if the listener was already
    /// started, leaving the running one untouched.
    ///
    /// [`exit`]: SignalListener::exit
    pub fn run<Q, QF, R>(&self, quit: Q, restart: R) -> Result<(), Error>
    where
        Q: FnOnce() -> QF + Send + 'static,
        QF: Future<Output = ()> + Send + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(Error::ListenerRunning);
        }
        let mut signals = Signals::install()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::ListenerRunning);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let trigger = loop {
                tokio::select! {
                    biased;

                    () = inner.stop.notified() => break Trigger::Requested,

                    received = signals.recv() => match received {
                        Received::Terminate(name) => break Trigger::Signal(name),
                        Received::Restart => {
                            info!("restart signal received");
                            restart();
                        }
                    },
                }
            };

            info!(?trigger, "shutting down");
            inner.state.send_replace(ListenerState::ShuttingDown);
            quit().await;
            inner.state.send_replace(ListenerState::Done);
        });
        Ok(())
    }

    /// Requests shutdown and waits until the quit callback has completed.
    ///
    /// The request is stored even if the listener has not started yet, in
    /// which case this returns at once and a later [`run`] quits immediately.
    /// If a signal already started the shutdown, waits for it.
    ///
    /// [`run`]: SignalListener::run
    pub async fn exit(&self) {
        // Notify keeps one permit when nobody is waiting yet.
        self.inner.stop.notify_one();
        if !self.is_running() {
            return;
        }
        let mut state = self.inner.state.subscribe();
        if state.wait_for(|s| *s == ListenerState::Done).await.is_err() {
            warn!("signal listener dropped before shutdown completed");
        }
    }
}

// ── OS signals ────────────────────────────────────────────────────────────────

enum Received {
    Terminate(&'static str),
    Restart,
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    abort: tokio::signal::unix::Signal,
    restart: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            abort: signal(SignalKind::from_raw(libc::SIGABRT))?,
            restart: signal(SignalKind::user_defined2())?,
        })
    }

    async fn recv(&mut self) -> Received {
        tokio::select! {
            _ = self.interrupt.recv() => Received::Terminate("SIGINT"),
            _ = self.terminate.recv() => Received::Terminate("SIGTERM"),
            _ = self.hangup.recv()    => Received::Terminate("SIGHUP"),
            _ = self.abort.recv()     => Received::Terminate("SIGABRT"),
            _ = self.restart.recv()   => Received::Restart,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Received {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Received::Terminate("Ctrl-C"),
            // Without a handler there is nothing to wait for.
            Err(_) => std::future::pending().await,
        }
    }
}
