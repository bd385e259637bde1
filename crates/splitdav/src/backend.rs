//! Authenticated HTTP client for the backend WebDAV server.
//!
//! Requests without a body (and with a small in-memory body) are retried on
//! transient failures. Streaming uploads are sent once; the chunk manager
//! retries chunk uploads itself from the spooled part.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RANGE};
use hyper::{Method, StatusCode};
use reqwest::{Body, RequestBuilder, Response, Url};
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};

use crate::config::{ConfigError, ProxyConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::metadata::Resource;
use crate::multistatus::{PROPFIND_REQUEST, parse_multistatus};
use crate::path;
use crate::retry::{RetryPolicy, is_transient};

/// PROPFIND depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// Headers copied from client requests on pass-through.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "depth",
    "overwrite",
    "if",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "lock-token",
    "timeout",
    "range",
];

struct Inner {
    client: reqwest::Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// Decoded path component of the base URL, without trailing slash.
    base_path: String,
    username: String,
    password: String,
    timeout: Duration,
    retry: RetryPolicy,
}

/// Shared handle to the backend server.
#[derive(Clone)]
pub struct BackendClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            option: "BACKEND_URL",
            reason,
        };
        let url = Url::parse(&config.backend_url).map_err(|e| invalid(e.to_string()))?;
        let base_path = path::decode(url.path()).trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(config.backend_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: config.backend_url.trim_end_matches('/').to_string(),
                base_path,
                username: config.backend_username.clone(),
                password: config.backend_password.clone(),
                timeout: config.backend_timeout(),
                retry: RetryPolicy::new(config.chunk_retries),
            }),
        })
    }

    /// Backend URL of a logical path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path::encode(path))
    }

    /// Timeout applied to metadata requests and to response headers.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.inner.client.request(method, self.url(path));
        if self.inner.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.inner.username, Some(&self.inner.password))
        }
    }

    /// Sends a request whose body is buffered, so it can be rebuilt per attempt.
    async fn send_retrying(
        &self,
        what: &str,
        path: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> ProxyResult<Response> {
        self.inner
            .retry
            .run(what, is_transient, |_| {
                let request = build().timeout(self.inner.timeout);
                async move {
                    let response = request.send().await?;
                    check_status(response, path)
                }
            })
            .await
    }

    /// Sends a request and waits for its headers under the backend timeout,
    /// leaving the body to stream without a deadline.
    async fn send_streaming(&self, request: RequestBuilder) -> ProxyResult<Response> {
        match tokio::time::timeout(self.inner.timeout, request.send()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::BackendTimeout(format!(
                "no response within {:?}",
                self.inner.timeout
            ))),
        }
    }

    /// Lists `path` (Depth 1) or stats it (Depth 0).
    ///
    /// Returned paths are logical: backend prefix stripped, decoded and
    /// normalized. Entries outside the backend base are dropped.
    pub async fn propfind(&self, path: &str, depth: Depth) -> ProxyResult<Vec<Resource>> {
        debug!(path, depth = depth.as_str(), "PROPFIND backend");
        let method = propfind_method();
        let response = self
            .send_retrying("PROPFIND", path, || {
                self.request(method.clone(), path)
                    .header("Depth", depth.as_str())
                    .header(CONTENT_TYPE, "application/xml")
                    .body(PROPFIND_REQUEST)
            })
            .await?;
        let xml = response.text().await?;
        let entries = parse_multistatus(&xml)
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        let mut resources = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.logical_path(&entry.href) {
                Some(logical) => resources.push(Resource {
                    path: logical,
                    meta: entry.meta,
                }),
                None => trace!(href = %entry.href, "Ignoring href outside backend base"),
            }
        }
        Ok(resources)
    }

    /// Maps a backend href to a logical path.
    pub fn logical_path(&self, href: &str) -> Option<String> {
        let raw_path = match href.find("://") {
            Some(scheme_end) => {
                let rest = &href[scheme_end + 3..];
                rest.find('/').map_or("/", |idx| &rest[idx..])
            }
            None => href,
        };
        let decoded = path::decode(raw_path);
        let base = &self.inner.base_path;
        let relative = if base.is_empty() {
            decoded.as_str()
        } else if path::is_within(&decoded, base) {
            &decoded[base.len()..]
        } else {
            return None;
        };
        path::normalize(relative).ok()
    }

    /// Fetches a small resource into memory; `None` when it does not exist.
    pub async fn get_bytes(&self, path: &str) -> ProxyResult<Option<Bytes>> {
        debug!(path, "GET backend (buffered)");
        match self
            .send_retrying("GET", path, || self.request(Method::GET, path))
            .await
        {
            Ok(response) => Ok(Some(response.bytes().await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Opens a streaming GET, optionally for the inclusive byte range
    /// `start..=end`.
    pub async fn get_stream(&self, path: &str, range: Option<(u64, u64)>) -> ProxyResult<Response> {
        debug!(path, ?range, "GET backend");
        let mut request = self.request(Method::GET, path);
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={start}-{end}"));
        }
        let response = self.send_streaming(request).await?;
        check_status(response, path)
    }

    /// Stores a small in-memory body.
    pub async fn put_bytes(
        &self,
        path: &str,
        data: Bytes,
        content_type: &'static str,
    ) -> ProxyResult<StatusCode> {
        debug!(path, len = data.len(), "PUT backend (buffered)");
        let response = self
            .send_retrying("PUT", path, || {
                self.request(Method::PUT, path)
                    .header(CONTENT_TYPE, content_type)
                    .body(data.clone())
            })
            .await?;
        Ok(response.status())
    }

    /// Uploads a spooled file of `len` bytes. Single attempt.
    pub async fn put_file(
        &self,
        path: &str,
        file: &Path,
        len: u64,
        timeout: Duration,
    ) -> ProxyResult<()> {
        debug!(path, len, "PUT backend (spooled part)");
        let file = tokio::fs::File::open(file).await?;
        let request = self
            .request(Method::PUT, path)
            .header(CONTENT_LENGTH, len)
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(timeout)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        let response = request.send().await?;
        check_status(response, path).map(|_| ())
    }

    /// Streams a client body to the backend. Single attempt.
    pub async fn put_stream(
        &self,
        path: &str,
        body: Body,
        len: Option<u64>,
        content_type: Option<&HeaderValue>,
    ) -> ProxyResult<StatusCode> {
        debug!(path, ?len, "PUT backend (streamed)");
        let mut request = self.request(Method::PUT, path).body(body);
        if let Some(len) = len {
            request = request.header(CONTENT_LENGTH, len);
        }
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type.clone());
        }
        let response = self.send_streaming(request).await?;
        check_status(response, path).map(|r| r.status())
    }

    /// Deletes `path`; returns false if it did not exist.
    pub async fn delete(&self, path: &str) -> ProxyResult<bool> {
        debug!(path, "DELETE backend");
        match self
            .send_retrying("DELETE", path, || self.request(Method::DELETE, path))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Server-side copy of a single resource.
    pub async fn copy(&self, from: &str, to: &str, overwrite: bool) -> ProxyResult<StatusCode> {
        debug!(from, to, "COPY backend");
        let method = copy_method();
        let destination = self.url(to);
        let response = self
            .send_retrying("COPY", from, || {
                self.request(method.clone(), from)
                    .header("Destination", &destination)
                    .header("Overwrite", if overwrite { "T" } else { "F" })
                    .header("Depth", "0")
            })
            .await?;
        Ok(response.status())
    }

    /// Forwards a client request unchanged apart from authentication and
    /// the `Destination` header, which is rewritten to `destination`.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        destination: Option<&str>,
        body: Body,
    ) -> ProxyResult<Response> {
        debug!(%method, path, "Forwarding to backend");
        let mut request = self.request(method, path).body(body);
        for name in FORWARDED_REQUEST_HEADERS {
            let name = HeaderName::from_static(name);
            for value in headers.get_all(&name) {
                request = request.header(name.clone(), value.clone());
            }
        }
        if let Some(destination) = destination {
            request = request.header("Destination", self.url(destination));
        }
        self.send_streaming(request).await
    }
}

/// Turns backend error statuses into [`ProxyError::BackendStatus`].
fn check_status(response: Response, path: &str) -> ProxyResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ProxyError::BackendStatus {
            status,
            path: path.to_string(),
        })
    }
}

fn propfind_method() -> Method {
    Method::from_bytes(b"PROPFIND").unwrap_or(Method::GET)
}

fn copy_method() -> Method {
    Method::from_bytes(b"COPY").unwrap_or(Method::GET)
}

/// Adapts a byte stream from a reqwest response into proxy errors.
pub fn response_stream(
    response: Response,
) -> impl futures::Stream<Item = ProxyResult<Bytes>> + Send + 'static {
    response.bytes_stream().map_err(ProxyError::from)
}
