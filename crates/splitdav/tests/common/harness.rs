//! Test proxy harness.
//!
//! Provides a `TestProxy` that runs the proxy in front of a fresh
//! [`MockBackend`], along with HTTP convenience methods that authenticate
//! as the configured client.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use splitdav::multistatus::parse_multistatus;
use splitdav::stats::StatsSnapshot;
use splitdav::{DavProxy, ProxyConfig, ProxyServer, ServerConfig};
use tempfile::TempDir;

use super::generators::{CHUNK_SIZE, FILE_MAX_SIZE};
use super::mock_backend::{BACKEND_PASSWORD, BACKEND_USER, MockBackend};

/// Client credentials accepted by the test proxy.
pub const CLIENT_USER: &str = "alice";
pub const CLIENT_PASSWORD: &str = "wonderland";

/// A proxy, its backend and an authenticated client.
pub struct TestProxy {
    pub backend: MockBackend,
    server: ProxyServer,
    client: Client,
    /// Base URL of the proxy, including the mount path.
    pub base_url: String,
    _spool_dir: TempDir,
}

impl TestProxy {
    /// Proxy mounted at the root with small chunking limits.
    pub async fn start() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Like [`TestProxy::start`], with `configure` applied to the config.
    pub async fn with_config(configure: impl FnOnce(&mut ProxyConfig)) -> Self {
        let backend = MockBackend::start().await;
        let spool_dir = TempDir::new().expect("Failed to create spool dir");

        let mut config = ProxyConfig::new(backend.url());
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.auth_username = CLIENT_USER.to_string();
        config.auth_password = CLIENT_PASSWORD.to_string();
        config.backend_username = BACKEND_USER.to_string();
        config.backend_password = BACKEND_PASSWORD.to_string();
        config.file_max_size = FILE_MAX_SIZE;
        config.chunk_size = Some(CHUNK_SIZE);
        config.chunk_retries = 2;
        config.backend_timeout = 5;
        config.chunk_upload_timeout = 5;
        config.pending_sweep_interval = 0;
        config.spool_dir = Some(spool_dir.path().to_path_buf());
        configure(&mut config);
        config.validate().expect("Invalid test configuration");

        let proxy = Arc::new(DavProxy::new(&config).expect("Failed to build proxy"));
        let server_config = ServerConfig::from_proxy_config(&config).expect("Invalid bind address");
        let server = ProxyServer::start(proxy, server_config)
            .await
            .expect("Failed to start proxy");
        let base_url = format!("{}{}", server.url(), config.mount_prefix());

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to create HTTP client");

        Self {
            backend,
            server,
            client,
            base_url,
            _spool_dir: spool_dir,
        }
    }

    pub fn proxy(&self) -> &Arc<DavProxy> {
        self.server.proxy()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.proxy().stats().snapshot()
    }

    /// Root URL of the server, ignoring the mount path.
    pub fn server_url(&self) -> String {
        self.server.url()
    }

    /// Build a full URL from a path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// An authenticated request.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(CLIENT_USER, Some(CLIENT_PASSWORD))
    }

    /// A request without credentials.
    pub fn anonymous(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    // ========== HTTP Convenience Methods ==========

    pub async fn get(&self, path: &str) -> Response {
        self.request(Method::GET, path)
            .send()
            .await
            .expect("GET request failed")
    }

    /// GET a file's contents as bytes.
    pub async fn get_bytes(&self, path: &str) -> Result<Bytes, (StatusCode, String)> {
        let resp = self.get(path).await;
        let status = resp.status();
        if status.is_success() {
            Ok(resp.bytes().await.expect("Failed to read response bytes"))
        } else {
            Err((status, resp.text().await.unwrap_or_default()))
        }
    }

    /// GET with a `Range` header.
    pub async fn get_range(&self, path: &str, range: &str) -> Response {
        self.request(Method::GET, path)
            .header("Range", range)
            .send()
            .await
            .expect("GET request failed")
    }

    pub async fn head(&self, path: &str) -> Response {
        self.request(Method::HEAD, path)
            .send()
            .await
            .expect("HEAD request failed")
    }

    /// PUT file contents with a Content-Length.
    pub async fn put(&self, path: &str, body: impl Into<reqwest::Body>) -> Response {
        self.request(Method::PUT, path)
            .body(body)
            .send()
            .await
            .expect("PUT request failed")
    }

    /// PUT and assert a success status.
    pub async fn put_ok(&self, path: &str, body: Vec<u8>) {
        let resp = self.put(path, body).await;
        assert!(
            resp.status().is_success(),
            "PUT {} failed with {}",
            path,
            resp.status()
        );
    }

    /// PUT as a stream without Content-Length (chunked transfer encoding).
    pub async fn put_streamed(&self, path: &str, data: Vec<u8>, piece: usize) -> Response {
        let pieces: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(piece)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = reqwest::Body::wrap_stream(futures::stream::iter(pieces));
        self.request(Method::PUT, path)
            .body(body)
            .send()
            .await
            .expect("PUT request failed")
    }

    pub async fn delete(&self, path: &str) -> Response {
        self.request(Method::DELETE, path)
            .send()
            .await
            .expect("DELETE request failed")
    }

    pub async fn mkcol(&self, path: &str) -> Response {
        self.request(method("MKCOL"), path)
            .send()
            .await
            .expect("MKCOL request failed")
    }

    /// COPY `from` to `to`.
    pub async fn copy(&self, from: &str, to: &str, overwrite: bool) -> Response {
        self.relocate("COPY", from, to, overwrite).await
    }

    /// MOVE `from` to `to`.
    pub async fn move_to(&self, from: &str, to: &str, overwrite: bool) -> Response {
        self.relocate("MOVE", from, to, overwrite).await
    }

    async fn relocate(&self, verb: &str, from: &str, to: &str, overwrite: bool) -> Response {
        self.request(method(verb), from)
            .header("Destination", self.url(to))
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .send()
            .await
            .expect("COPY/MOVE request failed")
    }

    /// PROPFIND returning status and body.
    pub async fn propfind(&self, path: &str, depth: &str) -> (StatusCode, String) {
        let resp = self
            .request(method("PROPFIND"), path)
            .header("Depth", depth)
            .send()
            .await
            .expect("PROPFIND request failed");
        let status = resp.status();
        (status, resp.text().await.unwrap_or_default())
    }

    /// Names of the children in a Depth 1 listing of `path`.
    pub async fn list_names(&self, path: &str) -> Vec<String> {
        let (status, body) = self.propfind(path, "1").await;
        assert_eq!(status, StatusCode::MULTI_STATUS, "PROPFIND {path} failed: {body}");
        let entries = parse_multistatus(&body).expect("Invalid multistatus from proxy");
        let own = splitdav::path::normalize(&format!("/{path}")).expect("valid path");
        entries
            .into_iter()
            .filter_map(|entry| {
                let href = splitdav::path::decode(&entry.href);
                let href = href.strip_prefix(&self.mount_prefix()).unwrap_or(&href);
                let logical = splitdav::path::normalize(href).ok()?;
                (logical != own).then(|| splitdav::path::file_name(&logical).to_string())
            })
            .collect()
    }

    /// Size reported for `path` in a Depth 0 PROPFIND.
    pub async fn reported_size(&self, path: &str) -> Option<u64> {
        let (status, body) = self.propfind(path, "0").await;
        if status != StatusCode::MULTI_STATUS {
            return None;
        }
        parse_multistatus(&body)
            .ok()?
            .first()
            .map(|entry| entry.meta.size)
    }

    fn mount_prefix(&self) -> String {
        self.base_url
            .strip_prefix(&self.server.url())
            .unwrap_or_default()
            .to_string()
    }

    /// Drops all cached metadata, e.g. after editing the backend directly.
    pub fn forget_cache(&self) {
        self.proxy().cache().clear();
    }
}

/// A WebDAV method by name.
pub fn method(name: &str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("valid method name")
}
