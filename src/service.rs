//! Service lifecycle: create, run, exit.
//!
//! ```text
//! Service::new(app)          terminal handler, error handler, middleware
//!      ↓ create(config)      log pipeline, shutdown hooks, admission gate
//!      ↓ run()               signal listener, chain built once, accept loop
//!      ↓ SIGTERM / exit()    hooks in order: stop HTTP listener, drain logs
//! run() returns              only after every hook has finished
//! ```
//!
//! Everything a running service shares (log pipeline, shutdown registry,
//! signal listener) belongs to its `Service` value, so several services can
//! live in one process.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::handler::{self, BoxedHandler, Handler};
use crate::log::{Level, LogPipeline, LogSink};
use crate::middleware::{AdmissionGate, GATE_PRIORITY, MiddlewareRegistry};
use crate::panic::{FaultAction, PanicGuard};
use crate::request::Request;
use crate::response::Response;
use crate::server::{self, Drain};
use crate::shutdown::ShutdownRegistry;
use crate::signal::SignalListener;

/// Renders a response that carries an error.
pub type ErrorHandler = Arc<dyn Fn(Response) -> Response + Send + Sync + 'static>;

type RestartHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// An HTTP service and everything it owns while running.
pub struct Service {
    app: BoxedHandler,
    on_error: ErrorHandler,
    on_restart: Option<RestartHandler>,
    on_fault: Option<FaultAction>,
    middleware: MiddlewareRegistry,
    runtime: Option<Runtime>,
}

/// State built by [`Service::create`].
struct Runtime {
    domain: String,
    full_domain: String,
    port: u16,
    development: bool,
    grace: Duration,
    gate: Option<AdmissionGate>,
    logs: LogPipeline,
    shutdown: Arc<ShutdownRegistry>,
    signals: SignalListener,
    stop: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl Service {
    /// A service that answers every request with `app`.
    pub fn new(app: impl Handler) -> Self {
        Self {
            app: handler::boxed(app),
            on_error: Arc::new(render_error),
            on_restart: None,
            on_fault: None,
            middleware: MiddlewareRegistry::new(),
            runtime: None,
        }
    }

    /// Sets the handler for responses created with [`Response::bad`].
    ///
    /// The default renders the error message as a plain-text body.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Response) -> Response + Send + Sync + 'static,
    {
        self.on_error = Arc::new(f);
        self
    }

    /// Sets the callback for the restart signal (`SIGUSR2`).
    ///
    /// The default only logs a notice.
    pub fn on_restart<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_restart = Some(Arc::new(f));
        self
    }

    /// Replaces the process exit performed after a request panics.
    pub fn on_fault<F>(mut self, f: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.on_fault = Some(Arc::new(f));
        self
    }

    /// Registers a middleware stage. See [`MiddlewareRegistry::register`].
    ///
    /// Takes effect for handlers built afterwards. Logged at debug level in
    /// development mode.
    pub fn layer<F>(mut self, priority: i32, stage: F) -> Self
    where
        F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
    {
        self.middleware.register(priority, stage);
        self.debug_stage("Added", priority);
        self
    }

    /// Removes the stage at `priority`. Returns whether one was registered.
    pub fn remove_layer(&mut self, priority: i32) -> bool {
        let removed = self.middleware.unregister(priority);
        if removed {
            self.debug_stage("Deleted", priority);
        }
        removed
    }

    fn debug_stage(&self, action: &str, priority: i32) {
        if let Some(rt) = self.runtime.as_ref().filter(|rt| rt.development) {
            rt.logs.logf(Level::Debug, format_args!("{action} middleware with priority {priority}"));
        }
    }

    pub fn middleware(&self) -> &MiddlewareRegistry { &self.middleware }
    pub fn middleware_mut(&mut self) -> &mut MiddlewareRegistry { &mut self.middleware }

    pub fn is_initialized(&self) -> bool {
        self.runtime.is_some()
    }

    // ── create ────────────────────────────────────────────────────────────────

    /// Initializes the service from `config`, logging to its `log` destination.
    ///
    /// The config is consumed; only the values the service needs are kept.
    pub fn create(&mut self, config: ServiceConfig) -> Result<(), Error> {
        if self.runtime.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        config.validate()?;
        let sink = config.open_log()?;
        self.init(config, sink)
    }

    /// Like [`create`](Self::create), but logs to `sink` and ignores the
    /// config's `log` value.
    pub fn create_with_log(&mut self, config: ServiceConfig, sink: impl LogSink) -> Result<(), Error> {
        if self.runtime.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        config.validate()?;
        self.init(config, sink)
    }

    fn init(&mut self, config: ServiceConfig, sink: impl LogSink) -> Result<(), Error> {
        let logs = LogPipeline::start(sink)?;
        let shutdown = Arc::new(ShutdownRegistry::new());
        let stop = CancellationToken::new();
        let (stopped, _) = watch::channel(false);

        shutdown.add("http-listener", {
            let stop = stop.clone();
            let mut stopped = stopped.subscribe();
            let logs = logs.clone();
            let domain = config.domain.clone();
            move || async move {
                stop.cancel();
                let _ = stopped.wait_for(|done| *done).await;
                logs.logf(Level::Message, format_args!("Shutting down for {domain}"));
            }
        });
        shutdown.add("log-pipeline", {
            let logs = logs.clone();
            move || async move {
                let _ = tokio::task::spawn_blocking(move || logs.quit()).await;
            }
        });

        let full_domain = config.full_domain();
        let grace = config.shutdown_grace();
        if config.development {
            logs.log(Level::Notice, &["Development mode enabled"]);
            logs.logf(Level::Debug, format_args!("Working Domain: {full_domain}"));
        }

        let gate = config
            .gate_capacity()
            .and_then(AdmissionGate::new)
            .map(|gate| match config.queue_limit {
                Some(limit) => gate.with_queue_limit(limit),
                None => gate,
            });
        match &gate {
            Some(gate) => {
                self.middleware.register(GATE_PRIORITY, gate.stage());
            }
            None => logs.log(Level::Notice, &["Admission gate disabled by configuration"]),
        }
        if config.development {
            for priority in self.middleware.priorities() {
                logs.logf(Level::Debug, format_args!("Added middleware with priority {priority}"));
            }
        }

        self.runtime = Some(Runtime {
            domain: config.domain,
            full_domain,
            port: config.port,
            development: config.development,
            grace,
            gate,
            logs,
            shutdown,
            signals: SignalListener::new(),
            stop,
            stopped,
        });
        Ok(())
    }

    fn runtime(&self) -> Result<&Runtime, Error> {
        self.runtime.as_ref().ok_or(Error::NotInitialized)
    }

    /// The service's log pipeline.
    pub fn logs(&self) -> Result<LogPipeline, Error> {
        Ok(self.runtime()?.logs.clone())
    }

    /// `http(s)://domain`.
    pub fn full_domain(&self) -> Option<&str> {
        self.runtime.as_ref().map(|rt| rt.full_domain.as_str())
    }

    /// The admission gate, if one is configured.
    pub fn gate(&self) -> Option<&AdmissionGate> {
        self.runtime.as_ref().and_then(|rt| rt.gate.as_ref())
    }

    // ── handler chain ─────────────────────────────────────────────────────────

    /// Composes the full request handler: panic guard, middleware stages in
    /// priority order, then the application with its error handling.
    pub fn handler(&self) -> Result<BoxedHandler, Error> {
        let rt = self.runtime()?;
        if rt.development {
            rt.logs.logf(
                Level::Debug,
                format_args!("Middleware active by priority: {:?}", self.middleware.priorities()),
            );
        }

        let chain = self.middleware.build(self.terminal(rt));
        let mut guard = PanicGuard::new(rt.logs.clone());
        if let Some(action) = &self.on_fault {
            guard = guard.on_fault(Arc::clone(action));
        }
        Ok(guard.wrap(chain))
    }

    /// The application handler followed by the error handler.
    fn terminal(&self, rt: &Runtime) -> BoxedHandler {
        let app = Arc::clone(&self.app);
        let on_error = Arc::clone(&self.on_error);
        let logs = rt.logs.clone();
        let development = rt.development;

        handler::boxed(move |req| {
            let app = Arc::clone(&app);
            let on_error = Arc::clone(&on_error);
            let logs = logs.clone();
            async move {
                let res = app.call(req).await;
                let Some(message) = res.error() else {
                    return res;
                };
                if development {
                    logs.logf(
                        Level::Debug,
                        format_args!("[Error({})] {message}", res.status_code().as_u16()),
                    );
                }
                on_error(res)
            }
        })
    }

    /// A handler that sends plain-HTTP visitors to the same path on the
    /// service's full domain. Serve it on the port-80 listener of a TLS
    /// deployment.
    pub fn https_redirect(&self) -> Result<BoxedHandler, Error> {
        let full_domain: Arc<str> = Arc::from(self.runtime()?.full_domain.as_str());
        Ok(handler::boxed(move |req: Request| {
            let full_domain = Arc::clone(&full_domain);
            async move {
                if req.method() != Method::GET && req.method() != Method::HEAD {
                    return Response::builder().status(StatusCode::BAD_REQUEST).text("Use HTTPS");
                }
                let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
                Response::redirect(StatusCode::FOUND, &format!("{full_domain}{target}"))
            }
        }))
    }

    // ── run ───────────────────────────────────────────────────────────────────

    /// Binds `0.0.0.0:{port}` and serves until shutdown.
    ///
    /// Fails with [`Error::NotInitialized`] if [`create`](Self::create) has not
    /// been called. Returns only once every shutdown hook has completed.
    pub async fn run(&self) -> Result<(), Error> {
        let rt = self.runtime()?;
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], rt.port))).await;
        self.drive(rt, listener).await
    }

    /// Like [`run`](Self::run), on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), Error> {
        let rt = self.runtime()?;
        self.drive(rt, Ok(listener)).await
    }

    async fn drive(&self, rt: &Runtime, listener: io::Result<TcpListener>) -> Result<(), Error> {
        let handler = self.handler()?;

        let quit = {
            let shutdown = Arc::clone(&rt.shutdown);
            move || async move { shutdown.run().await }
        };
        let restart = self.restart_callback(rt);
        match rt.signals.run(quit, move || restart()) {
            Ok(()) => {}
            // Another run owns the listener; leave that one serving.
            Err(Error::ListenerRunning) => return Err(Error::ListenerRunning),
            Err(e) => {
                rt.logs.log_error(Level::Error, &e);
                rt.stopped.send_replace(true);
                rt.shutdown.run().await;
                return Err(e);
            }
        }

        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                rt.logs.log_error(Level::Error, &e);
                rt.stopped.send_replace(true);
                rt.signals.exit().await;
                return Err(e.into());
            }
        };

        let addr = listener
            .local_addr()
            .map_or_else(|_| format!(":{}", rt.port), |addr| addr.to_string());
        rt.logs.logf(
            Level::Message,
            format_args!("Starting {} for {} | Listening on {addr}", crate::version(), rt.domain),
        );
        if rt.development {
            rt.logs.log(Level::Debug, &["Server starting..."]);
        }

        if let Drain::Forced(abandoned) = server::serve(listener, handler, rt.stop.clone(), rt.grace).await {
            rt.logs.logf(
                Level::Error,
                format_args!(
                    "Listener did not stop within {:?}; closed {abandoned} connections",
                    rt.grace
                ),
            );
        }
        if rt.development {
            rt.logs.log(Level::Debug, &["Server shutting down..."]);
        }

        rt.stopped.send_replace(true);
        rt.signals.exit().await;
        Ok(())
    }

    fn restart_callback(&self, rt: &Runtime) -> RestartHandler {
        match &self.on_restart {
            Some(f) => Arc::clone(f),
            None => {
                let logs = rt.logs.clone();
                Arc::new(move || logs.log(Level::Notice, &["Restart signal received"]))
            }
        }
    }

    /// Requests shutdown and waits until every shutdown hook has finished.
    ///
    /// A request made before [`run`](Self::run) has started the listener is
    /// kept: that `run` then shuts down at once instead of serving. Has no
    /// effect before [`create`](Self::create).
    pub async fn exit(&self) {
        if let Some(rt) = &self.runtime {
            rt.signals.exit().await;
        }
    }
}

/// Default [`ErrorHandler`]: the error message as a plain-text body.
fn render_error(mut res: Response) -> Response {
    let status = res.status_code();
    match res.take_error() {
        Some(message) => Response::builder().status(status).text(message),
        None => res,
    }
}
