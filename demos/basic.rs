//! Minimal keel service: a form-driven greeting behind a request timer.
//!
//! Run with:
//!   cargo run --example basic -- keel.toml
//!
//! where `keel.toml` holds:
//!
//! ```toml
//! [service]
//! domain = "localhost"
//! port = 3000
//! log = "stdout"
//! workers = 32
//! development = true
//! ```
//!
//! Try:
//!   curl 'http://localhost:3000/?name=alice'
//!   curl -X POST http://localhost:3000/ -d 'name=bob'
//!   curl http://localhost:3000/            # 400, rendered by the error handler
//!   kill -TERM <pid>                        # drains and exits cleanly

use std::process::ExitCode;
use std::time::Instant;

use http::StatusCode;
use keel::log::PipelineLayer;
use keel::middleware::{self, Next};
use keel::{Request, Response, Service, ServiceConfig};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args().nth(1).unwrap_or_else(|| "keel.toml".to_owned());
    let config = match ServiceConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut service = Service::new(greet)
        .layer(10, middleware::from_fn(timed))
        .on_error(|mut res| {
            let message = res.take_error().unwrap_or_default();
            Response::builder()
                .status(res.status_code())
                .json(format!(r#"{{"error":"{message}"}}"#).into_bytes())
        });

    if let Err(e) = service.create(config) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // Route `tracing` events from the runtime into the service log.
    if let Ok(logs) = service.logs() {
        tracing_subscriber::registry().with(PipelineLayer::new(logs)).init();
    }

    match service.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn greet(req: Request) -> Response {
    match req.form_value("name") {
        Some(name) => Response::text(format!("hello, {name}\n")),
        None => Response::bad(StatusCode::BAD_REQUEST, "name is required"),
    }
}

async fn timed(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let path = req.path().to_owned();
    let res = next.run(req).await;
    tracing::info!(%path, status = res.status_code().as_u16(), elapsed = ?started.elapsed(), "handled");
    res
}
