//! Middleware layer.
//!
//! A middleware stage is a function from the next handler to a handler that
//! wraps it. Stages are registered under a caller-chosen integer priority and
//! composed into one handler by [`MiddlewareRegistry::build`], once, at
//! startup.
//!
//! # Ordering
//!
//! The stage with the **smallest** priority is the **outermost**: it sees the
//! request first and the response last.
//!
//! ```text
//! register(10, a); register(50, b); register(1000, gate)
//!
//! request ─► a ─► b ─► gate ─► terminal
//! ```
//!
//! Priorities are unique; registering an existing priority replaces its
//! stage. [`GATE_PRIORITY`] is reserved for the [`AdmissionGate`].

pub mod gate;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::handler::{self, BoxedHandler};
use crate::request::Request;
use crate::response::Response;

pub use gate::{AdmissionGate, GATE_PRIORITY};

/// A registered wrapping function.
pub type Stage = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static>;

/// Priority-keyed set of middleware stages.
#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    stages: BTreeMap<i32, Stage>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stage` at `priority`, returning the stage it replaced.
    pub fn register<F>(&mut self, priority: i32, stage: F) -> Option<Stage>
    where
        F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
    {
        self.stages.insert(priority, Arc::new(stage))
    }

    /// Removes the stage at `priority`. Returns whether one was registered.
    pub fn unregister(&mut self, priority: i32) -> bool {
        self.stages.remove(&priority).is_some()
    }

    /// Active priorities in ascending order, outermost first.
    pub fn priorities(&self) -> Vec<i32> {
        self.stages.keys().copied().collect()
    }

    pub fn len(&self) -> usize { self.stages.len() }
    pub fn is_empty(&self) -> bool { self.stages.is_empty() }

    /// Wraps `terminal` in every registered stage.
    ///
    /// Stages are applied from the highest priority to the lowest, so the
    /// lowest priority ends up outermost. The result depends only on the
    /// registry's contents, never on registration order.
    pub fn build(&self, terminal: BoxedHandler) -> BoxedHandler {
        self.stages.values().rev().fold(terminal, |inner, stage| stage(inner))
    }
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("priorities", &self.priorities())
            .finish()
    }
}

// ── from_fn ───────────────────────────────────────────────────────────────────

/// The rest of the chain, handed to a [`from_fn`] stage.
pub struct Next(BoxedHandler);

impl Next {
    /// Passes `req` inward and resolves to the inner response.
    pub async fn run(self, req: Request) -> Response {
        self.0.call(req).await
    }
}

/// Builds a stage from an async function of the request and the rest of the
/// chain.
///
/// ```rust
/// use keel::middleware::{self, MiddlewareRegistry, Next};
/// use keel::{Request, Response};
///
/// async fn powered_by(req: Request, next: Next) -> Response {
///     let res = next.run(req).await;
///     res
/// }
///
/// let mut registry = MiddlewareRegistry::new();
/// registry.register(10, middleware::from_fn(powered_by));
/// ```
pub fn from_fn<F, Fut>(f: F) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let f = Arc::new(f);
    move |next: BoxedHandler| {
        let f = Arc::clone(&f);
        handler::boxed(move |req| (*f)(req, Next(Arc::clone(&next))))
    }
}
