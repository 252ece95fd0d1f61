//! HTTP accept loop and graceful drain.
//!
//! # Stopping
//!
//! The loop runs until its [`CancellationToken`] is cancelled (the service's
//! shutdown hook does that). It then:
//! 1. Stops calling `listener.accept()`, so no new connections are made.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Waits up to the grace period for them, then aborts whatever is left.
//!
//! A request that never completes therefore cannot hold shutdown hostage.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::handler::BoxedHandler;
use crate::request::Request;
use crate::response::Response;

/// How the accept loop finished draining.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Drain {
    /// Every connection closed within the grace period.
    Graceful,
    /// The grace period ran out; this many connection tasks were aborted.
    Forced(usize),
}

/// Accepts connections on `listener` and dispatches every request through
/// `handler` until `stop` is cancelled.
pub(crate) async fn serve(
    listener: TcpListener,
    handler: BoxedHandler,
    stop: CancellationToken,
    grace: Duration,
) -> Drain {
    let builder = ConnBuilder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();

    // JoinSet tracks every spawned connection task so stragglers can be
    // aborted once the grace period is over.
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            // Check the stop request first so it takes effect immediately,
            // even if more connections are queued.
            biased;

            () = stop.cancelled() => {
                info!(in_flight = tasks.len(), "stop requested, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let handler = handler.clone();
                let io = TokioIo::new(stream);

                // `service_fn` is called once per request on the connection.
                let svc = service_fn(move |req| dispatch(handler.clone(), req, remote_addr));
                let conn = graceful.watch(builder.serve_connection(io, svc).into_owned());

                tasks.spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);

    if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
        let abandoned = tasks.len();
        tasks.shutdown().await;
        return Drain::Forced(abandoned);
    }
    while tasks.join_next().await.is_some() {}
    Drain::Graceful
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Reads one request body and runs the composed handler on it.
///
/// Every failure becomes a response, so hyper never sees an error.
async fn dispatch(
    handler: BoxedHandler,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(Response::status(http::StatusCode::BAD_REQUEST).into_inner());
        }
    };

    let request = Request::new(parts.method, parts.uri, parts.headers, body);
    Ok(handler.call(request).await.into_inner())
}
