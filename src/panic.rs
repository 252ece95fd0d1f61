//! Panic guard: the crash-only boundary around request processing.
//!
//! A panic while handling a request leaves shared state (the admission
//! gate's permits, a half-built response) in an unknown condition. The guard
//! does not try to recover. It logs the panic payload and the backtrace of
//! the panicking thread at [`Level::Panic`], drains the log pipeline so those
//! records reach the destination, and exits the process with status
//! [`FAULT_EXIT_CODE`]. An external supervisor is expected to restart it.
//!
//! The backtrace is captured by a process-wide panic hook, installed once,
//! which stores it in a thread-local before delegating to the previous hook.
//! [`CatchUnwind`] polls the request future on the same thread, so the
//! backtrace is still there when the unwind is caught.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};

use http::StatusCode;

use crate::handler::{self, BoxFuture, BoxedHandler};
use crate::log::{Level, LogPipeline};
use crate::response::Response;

/// Exit status used after a request panics.
pub const FAULT_EXIT_CODE: i32 = 1;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

fn install_backtrace_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

// ── Fault ─────────────────────────────────────────────────────────────────────

/// A caught panic.
#[derive(Debug)]
pub struct Fault {
    pub message: String,
    pub backtrace: String,
}

impl Fault {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_owned()
        };
        let backtrace = LAST_BACKTRACE
            .with(|slot| slot.borrow_mut().take())
            .map_or_else(|| "<unavailable>".to_owned(), |bt| bt.to_string());
        Self { message, backtrace }
    }
}

/// Resolves to `Err(Fault)` instead of unwinding when the inner future panics.
pub struct CatchUnwind {
    inner: BoxFuture,
}

impl CatchUnwind {
    pub fn new(inner: BoxFuture) -> Self {
        Self { inner }
    }
}

impl Future for CatchUnwind {
    type Output = Result<Response, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(poll) => poll.map(Ok),
            Err(payload) => Poll::Ready(Err(Fault::from_payload(payload))),
        }
    }
}

// ── PanicGuard ────────────────────────────────────────────────────────────────

/// What to do once a fault has been logged. Receives the exit status.
pub type FaultAction = Arc<dyn Fn(i32) + Send + Sync + 'static>;

/// Catches panics from the handler chain, logs them and ends the process.
#[derive(Clone)]
pub struct PanicGuard {
    logs: LogPipeline,
    on_fault: FaultAction,
}

impl PanicGuard {
    pub fn new(logs: LogPipeline) -> Self {
        install_backtrace_hook();
        Self { logs, on_fault: Arc::new(|code| std::process::exit(code)) }
    }

    /// Replaces the process exit with `action`. If the action returns, the
    /// faulted request is answered with `500`.
    pub fn on_fault(mut self, action: FaultAction) -> Self {
        self.on_fault = action;
        self
    }

    /// Wraps `next` so that a panic anywhere inside it is caught here.
    pub fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let guard = self.clone();
        handler::boxed(move |req| {
            let guard = guard.clone();
            let next = Arc::clone(&next);
            // `call` runs inside the caught future so a panic raised while
            // building the inner future is caught too.
            let fut: BoxFuture = Box::pin(async move { next.call(req).await });
            async move {
                match CatchUnwind::new(fut).await {
                    Ok(res) => res,
                    Err(fault) => guard.fail(fault),
                }
            }
        })
    }

    fn fail(&self, fault: Fault) -> Response {
        self.logs.logf(Level::Panic, format_args!("PANIC!\n  {}", fault.message));
        self.logs.logf(Level::Panic, format_args!("Stack Trace:\n{}", fault.backtrace));
        self.logs.quit();
        (self.on_fault)(FAULT_EXIT_CODE);
        Response::status(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Debug for PanicGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicGuard").field("logs", &self.logs).finish_non_exhaustive()
    }
}
