//! End-to-end tests of the service lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode, header};
use keel::handler::BoxedHandler;
use keel::log::LogSink;
use keel::middleware::{self, GATE_PRIORITY, Next};
use keel::{Error, Request, Response, STDOUT, Service, ServiceConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MARKER: HeaderName = HeaderName::from_static("x-marker");

// ── helpers ───────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<String>>);

impl Captured {
    fn text(&self) -> String {
        self.0.lock().unwrap().clone()
    }
}

impl LogSink for Captured {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().push_str(&String::from_utf8_lossy(line));
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn config() -> ServiceConfig {
    ServiceConfig::new("example.test", 0, STDOUT)
}

fn get(uri: &str) -> Request {
    http::Request::get(uri).body(Bytes::new()).unwrap().into()
}

async fn hello(_req: Request) -> Response {
    Response::text("hello")
}

async fn faulty(_req: Request) -> Response {
    panic!("template missing")
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    out
}

// ── lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_before_create_is_rejected() {
    let service = Service::new(hello);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    assert!(matches!(service.run_on(listener).await, Err(Error::NotInitialized)));
    assert!(matches!(service.run().await, Err(Error::NotInitialized)));
    assert!(matches!(service.handler(), Err(Error::NotInitialized)));
    assert!(!service.is_initialized());
}

#[tokio::test]
async fn create_twice_is_rejected() {
    let mut service = Service::new(hello);
    service.create_with_log(config(), Captured::default()).unwrap();
    let again = service.create_with_log(config(), Captured::default());
    assert!(matches!(again, Err(Error::AlreadyInitialized)));
    service.logs().unwrap().quit();
}

#[tokio::test]
async fn invalid_config_does_not_initialize() {
    let mut service = Service::new(hello);
    let err = service.create(ServiceConfig::new("", 80, STDOUT)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(!service.is_initialized());
}

#[tokio::test]
async fn serves_over_tcp_and_shuts_down_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("keel.log");
    let mut config = config();
    config.log = log_path.display().to_string();

    let mut service = Service::new(hello);
    service.create(config).unwrap();
    let service = Arc::new(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run_on(listener).await }
    });

    let reply = http_get(addr, "/").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");
    assert!(reply.ends_with("hello"), "{reply}");

    service.exit().await;
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("run returns after exit")
        .unwrap()
        .unwrap();

    assert!(service.logs().unwrap().is_closed());
    assert!(TcpStream::connect(addr).await.is_err());

    let log = std::fs::read_to_string(&log_path).unwrap();
    let started = log.find("Starting keel v").expect("start line");
    let stopped = log.find("Shutting down for example.test").expect("shutdown line");
    assert!(started < stopped, "{log}");
    assert!(log.contains(&format!("Listening on {addr}")), "{log}");
}

#[tokio::test]
async fn exit_waits_for_in_flight_requests() {
    let finished = Arc::new(AtomicUsize::new(0));
    let app = {
        let finished = Arc::clone(&finished);
        move |_req: Request| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                "slow"
            }
        }
    };

    let mut service = Service::new(app);
    service.create_with_log(config(), Captured::default()).unwrap();
    let service = Arc::new(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run_on(listener).await }
    });

    // The first request makes sure the accept loop is up.
    assert!(http_get(addr, "/").await.ends_with("slow"));

    let in_flight = tokio::spawn(async move { http_get(addr, "/").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.exit().await;

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert!(in_flight.await.unwrap().ends_with("slow"));
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn exit_issued_while_run_is_starting_is_not_lost() {
    let mut service = Service::new(hello);
    service.create_with_log(config(), Captured::default()).unwrap();
    let service = Arc::new(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run_on(listener).await }
    });
    service.exit().await;

    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("run returns after an early exit")
        .unwrap()
        .unwrap();
    assert!(service.logs().unwrap().is_closed());
}

#[tokio::test]
async fn second_run_leaves_the_first_serving() {
    let mut service = Service::new(hello);
    service.create_with_log(config(), Captured::default()).unwrap();
    let service = Arc::new(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run_on(listener).await }
    });
    assert!(http_get(addr, "/").await.ends_with("hello"));

    let other = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(matches!(service.run_on(other).await, Err(Error::ListenerRunning)));

    assert!(!running.is_finished());
    assert!(!service.logs().unwrap().is_closed());
    assert!(http_get(addr, "/").await.ends_with("hello"));

    service.exit().await;
    running.await.unwrap().unwrap();
}

// ── middleware ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn lower_priority_stage_runs_outermost() {
    fn mark(name: &'static str) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static {
        middleware::from_fn(move |mut req: Request, next: Next| {
            req.append_header(MARKER, HeaderValue::from_static(name));
            next.run(req)
        })
    }

    let app = |req: Request| async move {
        let mut seen: Vec<String> = req
            .headers()
            .get_all(MARKER)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_owned))
            .collect();
        seen.push("terminal".to_owned());
        seen.join(",")
    };

    let mut service = Service::new(app).layer(50, mark("50")).layer(10, mark("10"));
    service.create_with_log(config(), Captured::default()).unwrap();

    let res = service.handler().unwrap().call(get("/")).await;
    assert_eq!(res.body(), b"10,50,terminal");
    service.logs().unwrap().quit();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gate_holds_third_request_until_a_slot_frees() {
    const HOLD: Duration = Duration::from_millis(100);

    let origin = Instant::now();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let app = {
        let starts = Arc::clone(&starts);
        move |_req: Request| {
            let starts = Arc::clone(&starts);
            async move {
                starts.lock().unwrap().push(origin.elapsed());
                tokio::time::sleep(HOLD).await;
                "done"
            }
        }
    };

    let mut config = config();
    config.workers = Some(2);
    let mut service = Service::new(app);
    service.create_with_log(config, Captured::default()).unwrap();
    assert_eq!(service.gate().map(|g| g.capacity()), Some(2));
    assert_eq!(service.middleware().priorities(), [GATE_PRIORITY]);

    let chain = service.handler().unwrap();
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let chain = Arc::clone(&chain);
            tokio::spawn(async move { chain.call(get("/")).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().status_code(), StatusCode::OK);
    }

    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 3);
    assert!(starts[1] - starts[0] < HOLD, "first two run together: {starts:?}");
    assert!(starts[2] - starts[0] >= HOLD, "third waits for a slot: {starts:?}");
    assert_eq!(service.gate().unwrap().available(), 2);
    service.logs().unwrap().quit();
}

#[tokio::test]
async fn gate_disabled_without_workers() {
    let sink = Captured::default();
    let mut service = Service::new(hello);
    service.create_with_log(config(), sink.clone()).unwrap();
    assert!(service.gate().is_none());
    assert!(service.middleware().is_empty());

    service.logs().unwrap().quit();
    assert!(sink.text().contains(" NOTICE: Admission gate disabled by configuration"));
}

#[tokio::test]
async fn development_mode_logs_stage_changes() {
    let sink = Captured::default();
    let passthrough = middleware::from_fn(|req: Request, next: Next| next.run(req));
    let mut config = config();
    config.development = true;
    config.workers = Some(4);

    let mut service = Service::new(hello).layer(10, passthrough);
    service.create_with_log(config, sink.clone()).unwrap();
    let mut service = service.layer(20, middleware::from_fn(|req: Request, next: Next| next.run(req)));
    assert!(service.remove_layer(10));
    assert!(!service.remove_layer(10));
    assert_eq!(service.middleware().priorities(), [20, GATE_PRIORITY]);

    service.logs().unwrap().quit();
    let log = sink.text();
    assert!(log.contains(" *DEBUG* Added middleware with priority 10"), "{log}");
    assert!(log.contains(&format!(" *DEBUG* Added middleware with priority {GATE_PRIORITY}")), "{log}");
    assert!(log.contains(" *DEBUG* Added middleware with priority 20"), "{log}");
    assert_eq!(log.matches("Deleted middleware with priority 10").count(), 1, "{log}");
}

// ── errors and faults ─────────────────────────────────────────────────────────

#[tokio::test]
async fn panicking_handler_is_logged_and_exits_nonzero() {
    let sink = Captured::default();
    let exit_code = Arc::new(AtomicI32::new(0));
    let mut service = Service::new(faulty).on_fault({
        let exit_code = Arc::clone(&exit_code);
        move |code| exit_code.store(code, Ordering::SeqCst)
    });
    let mut config = config();
    config.workers = Some(1);
    service.create_with_log(config, sink.clone()).unwrap();

    let res = service.handler().unwrap().call(get("/")).await;

    assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(exit_code.load(Ordering::SeqCst), keel::panic::FAULT_EXIT_CODE);
    assert_eq!(service.gate().unwrap().available(), 1);

    let log = sink.text();
    assert!(log.contains(" !Panic! PANIC!\n  template missing"), "{log}");
    assert!(log.contains(" !Panic! Stack Trace:"), "{log}");
}

#[tokio::test]
async fn bad_response_goes_to_error_handler() {
    let sink = Captured::default();
    let app = |req: Request| async move {
        match req.form_value("name") {
            Some(name) => Response::text(name),
            None => Response::bad(StatusCode::UNPROCESSABLE_ENTITY, "name is required"),
        }
    };
    let mut service = Service::new(app).on_error(|mut res: Response| {
        let message = res.take_error().unwrap_or_default();
        Response::builder().status(res.status_code()).text(format!("oops: {message}"))
    });
    let mut config = config();
    config.development = true;
    service.create_with_log(config, sink.clone()).unwrap();

    let chain = service.handler().unwrap();
    let ok = chain.call(get("/?name=ada")).await;
    assert_eq!(ok.body(), b"ada");

    let failed = chain.call(get("/")).await;
    assert_eq!(failed.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(failed.body(), b"oops: name is required");

    service.logs().unwrap().quit();
    let log = sink.text();
    assert!(log.contains(" NOTICE: Development mode enabled"), "{log}");
    assert!(log.contains(" *DEBUG* Working Domain: http://example.test"), "{log}");
    assert!(log.contains(" *DEBUG* [Error(422)] name is required"), "{log}");
}

#[tokio::test]
async fn default_error_handler_renders_message() {
    let app = |_req: Request| async { Response::bad(StatusCode::FORBIDDEN, "members only") };
    let mut service = Service::new(app);
    service.create_with_log(config(), Captured::default()).unwrap();

    let res = service.handler().unwrap().call(get("/")).await;
    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(res.body(), b"members only");
    service.logs().unwrap().quit();
}

#[tokio::test]
async fn https_redirect_targets_full_domain() {
    let mut config = config();
    config.https = true;
    let mut service = Service::new(hello);
    service.create_with_log(config, Captured::default()).unwrap();
    assert_eq!(service.full_domain(), Some("https://example.test"));

    let redirect = service.https_redirect().unwrap();
    let res = redirect.call(get("/account?tab=2")).await;
    assert_eq!(res.status_code(), StatusCode::FOUND);
    assert_eq!(res.headers()[header::LOCATION], "https://example.test/account?tab=2");

    let post: Request = http::Request::post("/account").body(Bytes::new()).unwrap().into();
    let res = redirect.call(post).await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(res.body(), b"Use HTTPS");
    service.logs().unwrap().quit();
}
