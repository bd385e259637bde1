//! Proxy configuration.
//!
//! Every option can be given on the command line or through the environment
//! variable of the same upper-case name. The binary flattens [`ProxyConfig`]
//! into its own argument parser; tests build one with [`ProxyConfig::new`].

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default URL prefix under which the backend tree is exposed.
pub const DEFAULT_MOUNT_PATH: &str = "/";
/// Default maximum number of cached metadata entries.
pub const DEFAULT_CACHE_SIZE: u64 = 10_000;
/// Default metadata time-to-live, in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;
/// Default size at which uploads are split.
pub const DEFAULT_FILE_MAX_SIZE: u64 = 4 * GIB;
/// Default number of retries for one chunk upload.
pub const DEFAULT_CHUNK_RETRIES: u32 = 3;
/// Default number of chunk uploads allowed in flight.
pub const DEFAULT_PIPELINE_DEPTH: usize = 2;
/// Default timeout for metadata and pass-through requests, in seconds.
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;
/// Default timeout for one chunk upload attempt, in seconds.
pub const DEFAULT_CHUNK_UPLOAD_TIMEOUT_SECS: u64 = 3600;
/// Default interval between pending-manifest sweeps, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
/// Default age after which a pending manifest is considered abandoned.
pub const DEFAULT_PENDING_MAX_AGE_SECS: u64 = 86_400;

/// Configuration errors detected by [`ProxyConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An option has a value the proxy cannot work with.
    #[error("invalid {option}: {reason}")]
    Invalid {
        /// Environment name of the offending option.
        option: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            option,
            reason: reason.into(),
        }
    }
}

/// Immutable configuration shared by every proxy service.
#[derive(Debug, Clone, Args)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// URL prefix under which the backend tree is exposed to clients.
    #[arg(long, env = "MOUNT_PATH", default_value = DEFAULT_MOUNT_PATH)]
    pub mount_path: String,

    /// Username clients must present.
    #[arg(long, env = "AUTH_USERNAME", default_value = "user")]
    pub auth_username: String,

    /// Password clients must present.
    #[arg(long, env = "AUTH_PASSWORD", default_value = "password", hide_env_values = true)]
    pub auth_password: String,

    /// Base URL of the backend WebDAV server.
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: String,

    /// Username for the backend server.
    #[arg(long, env = "BACKEND_USERNAME", default_value = "")]
    pub backend_username: String,

    /// Password for the backend server.
    #[arg(long, env = "BACKEND_PASSWORD", default_value = "", hide_env_values = true)]
    pub backend_password: String,

    /// Maximum number of cached metadata entries.
    #[arg(long, env = "METADATA_CACHE_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    pub metadata_cache_size: u64,

    /// Metadata time-to-live in seconds.
    #[arg(long, env = "METADATA_CACHE_TTL", default_value_t = DEFAULT_CACHE_TTL_SECS)]
    pub metadata_cache_ttl: u64,

    /// Uploads of at least this many bytes are split into chunks.
    #[arg(long, env = "FILE_MAX_SIZE", default_value_t = DEFAULT_FILE_MAX_SIZE)]
    pub file_max_size: u64,

    /// Target size of each chunk (defaults to FILE_MAX_SIZE).
    #[arg(long, env = "CHUNK_SIZE")]
    pub chunk_size: Option<u64>,

    /// Retries for a failed chunk upload before the upload is rolled back.
    #[arg(long, env = "CHUNK_RETRIES", default_value_t = DEFAULT_CHUNK_RETRIES)]
    pub chunk_retries: u32,

    /// Number of chunk uploads that may be in flight at once.
    #[arg(long, env = "CHUNK_PIPELINE_DEPTH", default_value_t = DEFAULT_PIPELINE_DEPTH)]
    pub chunk_pipeline_depth: usize,

    /// Timeout for metadata and pass-through backend requests, in seconds.
    #[arg(long, env = "BACKEND_TIMEOUT", default_value_t = DEFAULT_BACKEND_TIMEOUT_SECS)]
    pub backend_timeout: u64,

    /// Timeout for a single chunk upload attempt, in seconds.
    #[arg(long, env = "CHUNK_UPLOAD_TIMEOUT", default_value_t = DEFAULT_CHUNK_UPLOAD_TIMEOUT_SECS)]
    pub chunk_upload_timeout: u64,

    /// Directory for spooled upload parts (defaults to the system temp dir).
    #[arg(long, env = "SPOOL_DIR")]
    pub spool_dir: Option<PathBuf>,

    /// Seconds between sweeps of abandoned uploads (0 disables the sweep).
    #[arg(long, env = "PENDING_SWEEP_INTERVAL", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub pending_sweep_interval: u64,

    /// Age in seconds after which an unfinished upload is swept.
    #[arg(long, env = "PENDING_MAX_AGE", default_value_t = DEFAULT_PENDING_MAX_AGE_SECS)]
    pub pending_max_age: u64,
}

impl ProxyConfig {
    /// Creates a configuration with default values for the given backend.
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            auth_username: "user".to_string(),
            auth_password: "password".to_string(),
            backend_url: backend_url.into(),
            backend_username: String::new(),
            backend_password: String::new(),
            metadata_cache_size: DEFAULT_CACHE_SIZE,
            metadata_cache_ttl: DEFAULT_CACHE_TTL_SECS,
            file_max_size: DEFAULT_FILE_MAX_SIZE,
            chunk_size: None,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            chunk_pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT_SECS,
            chunk_upload_timeout: DEFAULT_CHUNK_UPLOAD_TIMEOUT_SECS,
            spool_dir: None,
            pending_sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            pending_max_age: DEFAULT_PENDING_MAX_AGE_SECS,
        }
    }

    /// Checks option values that clap cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_max_size == 0 {
            return Err(ConfigError::invalid("FILE_MAX_SIZE", "must be greater than zero"));
        }
        match self.chunk_size {
            Some(0) => {
                return Err(ConfigError::invalid("CHUNK_SIZE", "must be greater than zero"));
            }
            Some(size) if size > self.file_max_size => {
                return Err(ConfigError::invalid(
                    "CHUNK_SIZE",
                    format!("{size} exceeds FILE_MAX_SIZE ({})", self.file_max_size),
                ));
            }
            _ => {}
        }
        if self.chunk_pipeline_depth == 0 {
            return Err(ConfigError::invalid(
                "CHUNK_PIPELINE_DEPTH",
                "must be at least 1",
            ));
        }
        if self.metadata_cache_size == 0 {
            return Err(ConfigError::invalid(
                "METADATA_CACHE_SIZE",
                "must be greater than zero",
            ));
        }
        if !self.mount_path.starts_with('/') {
            return Err(ConfigError::invalid("MOUNT_PATH", "must start with '/'"));
        }
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "BACKEND_URL",
                format!("'{}' is not an http(s) URL", self.backend_url),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Socket address the server binds to.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host.parse().map_err(|_| {
            ConfigError::invalid("HOST", format!("'{}' is not an IP address", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Mount path without a trailing slash; empty when mounted at the root.
    pub fn mount_prefix(&self) -> &str {
        self.mount_path.trim_end_matches('/')
    }

    /// Effective chunk-size target.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.unwrap_or(self.file_max_size)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_cache_ttl)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout)
    }

    pub fn chunk_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_upload_timeout)
    }

    /// Sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.pending_sweep_interval > 0).then(|| Duration::from_secs(self.pending_sweep_interval))
    }

    pub fn pending_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_max_age)
    }

    /// Directory where upload parts are spooled.
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
