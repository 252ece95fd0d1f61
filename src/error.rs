//! Unified error type.

use thiserror::Error;

/// The error type returned by keel's fallible operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values carrying an error message, not as
/// `Error`s. This type surfaces lifecycle and infrastructure failures:
/// configuration, binding to a port, opening the log destination.
#[derive(Debug, Error)]
pub enum Error {
    /// [`Service::run`](crate::Service::run) was called before
    /// [`Service::create`](crate::Service::create).
    #[error("service not initialized: create() must be called before run()")]
    NotInitialized,

    /// [`Service::create`](crate::Service::create) was called twice.
    #[error("service already initialized")]
    AlreadyInitialized,

    /// The signal listener was started a second time.
    #[error("signal listener already running")]
    ListenerRunning,

    /// A configuration value is missing or invalid.
    #[error("config: {0}")]
    Config(String),

    /// The configuration document could not be parsed.
    #[error("config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Binding, accepting, opening the log destination, installing signal handlers.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
