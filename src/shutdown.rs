//! Shutdown registry: ordered cleanup hooks that run once.
//!
//! Hooks are appended while the service is being set up and run in
//! registration order when the service terminates. Each hook runs to
//! completion before the next one starts, so a later hook can rely on an
//! earlier one having finished (the HTTP listener is stopped before the log
//! pipeline is drained).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A cleanup hook. Consumed when it runs.
pub type ShutdownHook = Box<dyn FnOnce() -> HookFuture + Send + 'static>;

/// Ordered, run-once list of [`ShutdownHook`]s.
#[derive(Default)]
pub struct ShutdownRegistry {
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
    ran: AtomicBool,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named hook.
    ///
    /// Hooks added after [`run`](Self::run) has started are never run.
    pub fn add<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: ShutdownHook = Box::new(move || Box::pin(hook()));
        self.hooks.lock().push((name.into(), hook));
    }

    /// Hook names in the order they will run.
    pub fn names(&self) -> Vec<String> {
        self.hooks.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize { self.hooks.lock().len() }
    pub fn is_empty(&self) -> bool { self.hooks.lock().is_empty() }

    /// Whether [`run`](Self::run) has been called.
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }

    /// Runs every hook in registration order.
    ///
    /// Only the first call does anything; later calls return immediately,
    /// even while the first is still in progress.
    pub async fn run(&self) {
        if self.ran.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (name, hook) in hooks {
            tracing::debug!(hook = %name, "running shutdown hook");
            hook().await;
        }
    }
}

impl fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("hooks", &self.names())
            .field("ran", &self.has_run())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder(order: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() -> HookFuture + Send + 'static {
        let order = Arc::clone(order);
        move || -> HookFuture {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().push(name);
            })
        }
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = ShutdownRegistry::new();
        registry.add("http", recorder(&order, "http"));
        registry.add("logs", recorder(&order, "logs"));
        registry.add("db", recorder(&order, "db"));
        assert_eq!(registry.names(), ["http", "logs", "db"]);

        registry.run().await;
        assert_eq!(*order.lock(), ["http", "logs", "db"]);
        assert!(registry.has_run());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ShutdownRegistry::new());
        registry.add("once", recorder(&order, "once"));

        let a = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.run().await }
        });
        let b = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.run().await }
        });
        a.await.unwrap();
        b.await.unwrap();
        registry.run().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*order.lock(), ["once"]);
    }
}
