//! A WebDAV proxy that lifts the backend's upload size limit.
//!
//! `splitdav` sits between WebDAV clients and a backend WebDAV server and
//! forwards ordinary requests unchanged. Uploads of at least `FILE_MAX_SIZE`
//! bytes are cut into parts the backend accepts and tracked by a manifest
//! stored next to them; downloads, including single byte ranges, are
//! reassembled from those parts on the fly. Clients only ever see the
//! original file.
//!
//! # Architecture
//!
//! - [`backend`]: authenticated HTTP client for the backend server
//! - [`manifest`]: chunk manifests, their storage and self-healing
//! - [`cache`]: bounded TTL metadata cache
//! - [`chunker`]: chunked PUT, DELETE, COPY and MOVE
//! - [`reassembly`]: streaming, range-aware GET of chunked files
//! - [`namespace`]: the logical view that hides chunk bookkeeping
//! - [`handler`]: authentication and verb dispatch
//! - [`server`]: the accept loop and background sweep
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use splitdav::{DavProxy, ProxyConfig, ProxyServer, ServerConfig};
//!
//! let config = ProxyConfig::new("https://dav.example.com/remote.php/dav");
//! let proxy = Arc::new(DavProxy::new(&config)?);
//! let server = ProxyServer::start(proxy, ServerConfig::from_proxy_config(&config)?).await?;
//! println!("Serving on {}", server.url());
//! ```

pub mod auth;
pub mod backend;
pub mod body;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod error;
pub mod handler;
pub mod locks;
pub mod manifest;
pub mod metadata;
pub mod multistatus;
pub mod namespace;
pub mod path;
pub mod range;
pub mod reassembly;
pub mod retry;
pub mod server;
pub mod spool;
pub mod stats;

pub use config::{ConfigError, ProxyConfig};
pub use error::{ProxyError, ProxyResult};
pub use handler::{DavMethod, DavProxy};
pub use manifest::{ChunkDescriptor, FileManifest, ManifestState};
pub use server::{ProxyServer, ServerConfig};
pub use stats::{ProxyStats, StatsSnapshot};
