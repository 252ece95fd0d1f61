//! Service configuration.
//!
//! Loaded from a TOML document with a `[service]` table:
//!
//! ```toml
//! [service]
//! domain = "example.com"
//! port = 8080
//! log = "stdout"          # or a file path
//! workers = 64            # optional; absent or <= 0 disables the admission gate
//! queue_limit = 1024      # optional; absent queues waiters without bound
//! development = false
//! https = false
//! shutdown_grace_secs = 30
//! ```
//!
//! The config is consumed by [`Service::create`](crate::Service::create);
//! the service keeps only what it derives from it.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::log::{self, LogSink};

/// `log` value that routes the log pipeline to standard output.
pub const STDOUT: &str = "stdout";

fn default_grace_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub domain: String,
    pub port: u16,
    pub log: String,
    #[serde(default)]
    pub workers: Option<i64>,
    #[serde(default)]
    pub queue_limit: Option<usize>,
    #[serde(default)]
    pub development: bool,
    #[serde(default)]
    pub https: bool,
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Deserialize)]
struct ConfigFile {
    service: ServiceConfig,
}

impl ServiceConfig {
    /// A config with the required values set and everything else defaulted.
    pub fn new(domain: impl Into<String>, port: u16, log: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            port,
            log: log.into(),
            workers: None,
            queue_limit: None,
            development: false,
            https: false,
            shutdown_grace_secs: default_grace_secs(),
        }
    }

    /// Reads and validates the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let file: ConfigFile = toml::from_str(text)?;
        file.service.validate()?;
        Ok(file.service)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.domain.trim().is_empty() {
            return Err(Error::Config("domain must not be empty".to_owned()));
        }
        if self.log.trim().is_empty() {
            return Err(Error::Config("log must be \"stdout\" or a file path".to_owned()));
        }
        Ok(())
    }

    /// `https://domain` or `http://domain`, depending on the TLS flag.
    pub fn full_domain(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}", self.domain)
    }

    /// Admission gate capacity, if throttling is enabled.
    pub fn gate_capacity(&self) -> Option<usize> {
        self.workers.and_then(|n| usize::try_from(n).ok()).filter(|&n| n > 0)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Opens the configured log destination.
    pub fn open_log(&self) -> Result<Box<dyn LogSink>, Error> {
        if self.log == STDOUT {
            Ok(Box::new(log::stdout_sink()))
        } else {
            Ok(Box::new(log::file_sink(&self.log)?))
        }
    }
}
