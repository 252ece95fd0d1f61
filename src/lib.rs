//! # keel
//!
//! An embeddable HTTP service runtime. It owns the parts of a service that
//! are the same in every application:
//!
//! - **Process bootstrap**: configuration in, log destination opened,
//!   components wired in dependency order
//! - **Ordered middleware**: stages composed once, by integer priority
//! - **Admission gate**: a cap on concurrently processed requests
//! - **Async logging**: many producers, one writer thread, no lost order
//! - **Coordinated shutdown**: SIGINT / SIGTERM / SIGHUP / SIGABRT or an
//!   explicit call run every cleanup hook exactly once, in order
//! - **Crash-only faults**: a panicking request is logged with its
//!   backtrace and the process exits for its supervisor to restart
//!
//! What a request *means* is yours: routing, templating, sessions. keel hands
//! every request to one application handler.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use keel::{Request, Response, Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel::Error> {
//!     let mut service = Service::new(app);
//!     service.create(ServiceConfig::load("keel.toml")?)?;
//!     service.run().await
//! }
//!
//! async fn app(req: Request) -> Response {
//!     match req.form_value("name") {
//!         Some(name) => Response::text(format!("hello, {name}")),
//!         None => Response::bad(StatusCode::BAD_REQUEST, "name is required"),
//!     }
//! }
//! ```

mod config;
mod error;
mod request;
mod response;
mod server;
mod service;

pub mod handler;
pub mod log;
pub mod middleware;
pub mod panic;
pub mod shutdown;
pub mod signal;

pub use config::{STDOUT, ServiceConfig};
pub use error::Error;
pub use handler::Handler;
pub use log::{Level, LogPipeline};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use service::{ErrorHandler, Service};

const NAME: &str = env!("CARGO_PKG_NAME");
const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// `keel vX.Y.Z`
pub fn version() -> String {
    format!("{NAME} v{}", env!("CARGO_PKG_VERSION"))
}

/// [`version`] followed by a one-line description.
pub fn info() -> String {
    format!("{}\n\t{DESCRIPTION}", version())
}
