//! Admission gate: caps the number of requests processed at once.
//!
//! Each request takes a permit from a [`Semaphore`] before it is passed
//! inward and gives it back when the inner handler finishes. The permit is an
//! RAII guard, so it is also returned when the inner handler panics and the
//! request future is dropped mid-unwind.
//!
//! Waiters queue without bound by default. [`AdmissionGate::with_queue_limit`]
//! caps the queue; requests arriving at a full queue get `503`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use http::StatusCode;
use tokio::sync::Semaphore;

use crate::handler::{self, BoxedHandler};
use crate::response::Response;

/// Priority the service registers the gate at.
pub const GATE_PRIORITY: i32 = 1000;

/// A bounded pool of request permits.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    queue_limit: Option<usize>,
    waiting: Arc<AtomicUsize>,
}

impl AdmissionGate {
    /// A gate admitting at most `capacity` concurrent requests.
    ///
    /// Returns `None` when `capacity` is zero: an unconfigured gate does not
    /// throttle at all. See [`ServiceConfig::gate_capacity`].
    ///
    /// [`ServiceConfig::gate_capacity`]: crate::ServiceConfig::gate_capacity
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_limit: None,
            waiting: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Rejects requests with `503` once `limit` requests are already waiting.
    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit);
        self
    }

    pub fn capacity(&self) -> usize { self.capacity }

    /// Permits not currently held by a request.
    pub fn available(&self) -> usize { self.permits.available_permits() }

    /// Requests currently blocked waiting for a permit.
    pub fn waiting(&self) -> usize { self.waiting.load(Ordering::Acquire) }

    /// Wraps `next` so every call holds a permit for its whole duration.
    pub fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let gate = self.clone();
        handler::boxed(move |req| {
            let gate = gate.clone();
            let next = Arc::clone(&next);
            async move {
                let _permit = match Arc::clone(&gate.permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        if gate.queue_limit.is_some_and(|limit| gate.waiting() >= limit) {
                            return Response::status(StatusCode::SERVICE_UNAVAILABLE);
                        }
                        let _queued = Waiting::enter(&gate.waiting);
                        match Arc::clone(&gate.permits).acquire_owned().await {
                            Ok(permit) => permit,
                            // The semaphore is never closed.
                            Err(_) => return Response::status(StatusCode::SERVICE_UNAVAILABLE),
                        }
                    }
                };
                next.call(req).await
            }
        })
    }

    /// The gate as a middleware stage, for [`MiddlewareRegistry::register`].
    ///
    /// [`MiddlewareRegistry::register`]: crate::middleware::MiddlewareRegistry::register
    pub fn stage(&self) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static {
        let gate = self.clone();
        move |next| gate.wrap(next)
    }
}

/// Counts a request as waiting until dropped.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
