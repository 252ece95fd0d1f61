//! Handler trait and type erasure.
//!
//! # How handlers are composed
//!
//! Middleware stages, the admission gate, the panic guard and the
//! application's terminal handler are all different concrete types, yet the
//! chain has to hand each stage "the next handler" without knowing what it
//! is. Every handler is therefore erased to a [`BoxedHandler`]
//! (`Arc<dyn ErasedHandler>`) and stages are plain functions from one
//! `BoxedHandler` to another.
//!
//! ```text
//! async fn app(req: Request) -> Response { … }    ← user writes this
//!        ↓ handler::boxed(app)
//! Arc::new(FnHandler(app))                        ← heap-allocated wrapper
//!        ↓ stage(next) for every registered stage
//! Arc<dyn ErasedHandler>                          ← composed once at startup
//!        ↓
//! handler.call(req)  at request time              ← one vtable dispatch per layer
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

// ── Erased types ──────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a [`Response`].
///
/// `Send + 'static` let tokio move the future across worker threads.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Dispatch interface shared by every layer of the chain.
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
///
/// Cloning is one atomic increment; the chain built at startup is reused by
/// every connection for the lifetime of the service.
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid terminal handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` or closure with the signature:
///
/// ```text
/// Fn(Request) -> impl Future<Output = impl IntoResponse>
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Erases `handler` into a [`BoxedHandler`].
///
/// This is how middleware stages produce the handler they return:
///
/// ```rust
/// use keel::handler::{self, BoxedHandler};
///
/// fn passthrough(next: BoxedHandler) -> BoxedHandler {
///     handler::boxed(move |req| next.call(req))
/// }
/// ```
pub fn boxed(handler: impl Handler) -> BoxedHandler {
    handler.into_boxed_handler()
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Bridges a concrete handler `F` into the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}
