//! Request routing and the verb handlers.
//!
//! Every request is authenticated, mapped from the proxy's URL space onto a
//! logical path and dispatched on a closed [`DavMethod`]. Handlers that need
//! chunk awareness go through the chunk manager or the reassembly streamer;
//! the rest are relayed to the backend.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hyper::header::{
    ACCEPT_RANGES, ALLOW, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, HeaderMap,
    HeaderName, HeaderValue, LAST_MODIFIED, LOCATION, RANGE,
};
use hyper::{Method, Request, Response, StatusCode};
use reqwest::Body;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::Credentials;
use crate::backend::{BackendClient, Depth, response_stream};
use crate::body::{self, ProxyBody, request_stream};
use crate::cache::MetadataCache;
use crate::chunker::ChunkManager;
use crate::config::{ConfigError, ProxyConfig};
use crate::error::{ALLOWED_METHODS, ProxyError, ProxyResult};
use crate::locks::PathLockManager;
use crate::manifest::{ManifestStore, SweepReport};
use crate::metadata::ResourceMeta;
use crate::multistatus::{MULTISTATUS_CONTENT_TYPE, render_multistatus};
use crate::namespace::Namespace;
use crate::path;
use crate::reassembly::ReassemblyStreamer;
use crate::retry::RetryPolicy;
use crate::stats::ProxyStats;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Response headers that describe the backend connection, not the resource.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "www-authenticate",
];

/// The verbs the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavMethod {
    Options,
    Get,
    Head,
    Put,
    Delete,
    Propfind,
    Proppatch,
    Mkcol,
    Copy,
    Move,
    Lock,
    Unlock,
}

impl DavMethod {
    pub fn from_method(method: &Method) -> Option<Self> {
        let verb = match *method {
            Method::OPTIONS => Self::Options,
            Method::GET => Self::Get,
            Method::HEAD => Self::Head,
            Method::PUT => Self::Put,
            Method::DELETE => Self::Delete,
            _ => match method.as_str() {
                "PROPFIND" => Self::Propfind,
                "PROPPATCH" => Self::Proppatch,
                "MKCOL" => Self::Mkcol,
                "COPY" => Self::Copy,
                "MOVE" => Self::Move,
                "LOCK" => Self::Lock,
                "UNLOCK" => Self::Unlock,
                _ => return None,
            },
        };
        Some(verb)
    }

    /// Whether the verb changes the resource it targets.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::Put | Self::Delete | Self::Proppatch | Self::Mkcol | Self::Copy | Self::Move
        )
    }
}

/// The proxy: every service, shared by all connections.
pub struct DavProxy {
    mount_prefix: String,
    mount_path: String,
    pending_max_age: std::time::Duration,
    credentials: Credentials,
    backend: BackendClient,
    cache: Arc<MetadataCache>,
    manifests: Arc<ManifestStore>,
    locks: Arc<PathLockManager>,
    stats: Arc<ProxyStats>,
    namespace: Namespace,
    chunker: Arc<ChunkManager>,
    reader: ReassemblyStreamer,
}

impl DavProxy {
    /// Builds every service from `config`.
    pub fn new(config: &ProxyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let stats = Arc::new(ProxyStats::new());
        let backend = BackendClient::new(config)?;
        let cache = Arc::new(MetadataCache::new(
            config.metadata_cache_size,
            config.cache_ttl(),
            Arc::clone(&stats),
        ));
        let locks = Arc::new(PathLockManager::new());
        let manifests = Arc::new(ManifestStore::new(
            backend.clone(),
            Arc::clone(&locks),
            Arc::clone(&stats),
        ));
        let namespace = Namespace::new(
            backend.clone(),
            Arc::clone(&cache),
            Arc::clone(&manifests),
            Arc::clone(&locks),
        );
        let chunker = Arc::new(ChunkManager::new(
            config,
            backend.clone(),
            Arc::clone(&manifests),
            Arc::clone(&cache),
            Arc::clone(&locks),
            Arc::clone(&stats),
        ));
        let reader = ReassemblyStreamer::new(
            backend.clone(),
            Arc::clone(&stats),
            RetryPolicy::new(config.chunk_retries),
        );

        Ok(Self {
            mount_prefix: config.mount_prefix().to_string(),
            mount_path: format!("{}/", config.mount_prefix()),
            pending_max_age: config.pending_max_age(),
            credentials: Credentials::new(&config.auth_username, &config.auth_password),
            backend,
            cache,
            manifests,
            locks,
            stats,
            namespace,
            chunker,
            reader,
        })
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Removes abandoned uploads and prunes idle path locks.
    pub async fn sweep(&self) -> SweepReport {
        let report = self.manifests.sweep_pending(self.pending_max_age).await;
        self.locks.prune();
        self.cache.run_pending_tasks();
        if report.swept > 0 || report.busy > 0 {
            info!(
                swept = report.swept,
                kept = report.kept,
                busy = report.busy,
                "Pending upload sweep finished"
            );
        } else {
            debug!(kept = report.kept, "Pending upload sweep finished");
        }
        report
    }

    /// Handles one client request. Never fails: errors become responses.
    #[instrument(skip_all, fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        self.stats.record_request();
        let started = Instant::now();
        let response = match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!("Request failed: {e}");
                } else {
                    debug!("Request refused: {e}");
                }
                e.into_response()
            }
        };
        debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis(),
            "Request complete"
        );
        response
    }

    async fn dispatch<B>(&self, req: Request<B>) -> ProxyResult<Response<ProxyBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        self.credentials.check(req.headers())?;
        let verb = DavMethod::from_method(req.method())
            .ok_or_else(|| ProxyError::MethodNotAllowed(req.method().to_string()))?;

        let raw_path = req.uri().path();
        if !self.mount_prefix.is_empty() && raw_path == "/" {
            return Ok(redirect(&self.mount_path));
        }
        let path = self.logical_path(raw_path)?;
        if path::is_reserved(&path) {
            return Err(ProxyError::Forbidden(path));
        }

        match verb {
            DavMethod::Options => Ok(options()),
            DavMethod::Propfind => self.propfind(&path, req.headers()).await,
            DavMethod::Get | DavMethod::Head => self.read(verb, &path, req.headers()).await,
            DavMethod::Put => self.put(&path, req).await,
            DavMethod::Delete => self.delete(&path, req.headers()).await,
            DavMethod::Copy | DavMethod::Move => self.relocate(verb, &path, req.headers()).await,
            DavMethod::Proppatch | DavMethod::Mkcol | DavMethod::Lock | DavMethod::Unlock => {
                self.pass_through(verb, &path, req).await
            }
        }
    }

    /// Maps a raw request path (or Destination path) to a logical path.
    fn logical_path(&self, raw: &str) -> ProxyResult<String> {
        let decoded = path::decode(raw);
        let relative = if self.mount_prefix.is_empty() {
            decoded.as_str()
        } else if path::is_within(&decoded, &self.mount_prefix) {
            &decoded[self.mount_prefix.len()..]
        } else {
            return Err(ProxyError::NotFound(decoded));
        };
        path::normalize(relative)
    }

    fn destination(&self, headers: &HeaderMap) -> ProxyResult<String> {
        let raw = headers
            .get("destination")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::BadRequest("missing Destination header".into()))?;
        let raw_path = match raw.find("://") {
            Some(scheme_end) => {
                let rest = &raw[scheme_end + 3..];
                rest.find('/').map_or("/", |idx| &rest[idx..])
            }
            None => raw,
        };
        let raw_path = raw_path.split(['?', '#']).next().unwrap_or(raw_path);
        let destination = self.logical_path(raw_path).map_err(|e| match e {
            ProxyError::NotFound(_) => {
                ProxyError::BadRequest(format!("destination {raw} is outside the mount"))
            }
            other => other,
        })?;
        if path::is_reserved(&destination) {
            return Err(ProxyError::Forbidden(destination));
        }
        Ok(destination)
    }

    async fn propfind(&self, path: &str, headers: &HeaderMap) -> ProxyResult<Response<ProxyBody>> {
        let depth = match headers.get("depth").map(HeaderValue::as_bytes) {
            None | Some(b"1") => Depth::One,
            Some(b"0") => Depth::Zero,
            Some(value) if value.eq_ignore_ascii_case(b"infinity") => {
                return Err(ProxyError::Forbidden(
                    "PROPFIND with Depth: infinity is not supported".into(),
                ));
            }
            Some(_) => return Err(ProxyError::BadRequest("invalid Depth header".into())),
        };

        let target = self.namespace.stat(path).await?;
        let resources = if depth == Depth::One && target.meta.is_collection {
            let (collection, children) = self.namespace.list(path).await?;
            let mut resources = Vec::with_capacity(children.len() + 1);
            resources.push(collection);
            resources.extend(children);
            resources
        } else {
            vec![target]
        };

        let xml = render_multistatus(&self.mount_prefix, &resources);
        let mut response = Response::new(body::full(xml));
        *response.status_mut() = StatusCode::MULTI_STATUS;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(MULTISTATUS_CONTENT_TYPE),
        );
        Ok(response)
    }

    async fn read(
        &self,
        verb: DavMethod,
        path: &str,
        headers: &HeaderMap,
    ) -> ProxyResult<Response<ProxyBody>> {
        let resource = self.namespace.stat(path).await?;
        if resource.meta.is_collection {
            return self.relay(verb, path, headers, None, Body::default()).await;
        }
        if verb == DavMethod::Head {
            let len = resource.meta.size;
            return Ok(entity_response(StatusCode::OK, &resource.meta, len, body::empty()));
        }
        if !resource.meta.chunked {
            return self.relay(verb, path, headers, None, Body::default()).await;
        }

        let manifest = {
            let guard = self.locks.read(path).await;
            match self.manifests.get(path).await {
                // Rebuilding needs the write lock.
                Err(ProxyError::ManifestCorrupt { .. }) => {
                    drop(guard);
                    self.manifests.get(path).await?
                }
                other => other?,
            }
        };
        let Some(manifest) = manifest else {
            // Replaced by a plain file since the metadata was cached.
            self.cache.invalidate(path);
            return self.relay(verb, path, headers, None, Body::default()).await;
        };

        let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
        let reassembly = self.reader.open(path, &manifest, range).await?;
        let meta = manifest.meta();
        let status = reassembly.status();
        let content_range = reassembly.range.map(|r| r.content_range());
        let mut response = entity_response(status, &meta, reassembly.len, reassembly.body);
        if let Some(content_range) = content_range {
            insert_header(response.headers_mut(), CONTENT_RANGE, &content_range);
        }
        Ok(response)
    }

    async fn put<B>(&self, path: &str, req: Request<B>) -> ProxyResult<Response<ProxyBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        if path == "/" {
            return Err(ProxyError::MethodNotAllowed("PUT on the root collection".into()));
        }
        let (parts, body) = req.into_parts();
        let content_length = match parts.headers.get(CONTENT_LENGTH) {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| ProxyError::BadRequest("invalid Content-Length".into()))?,
            ),
            None => None,
        };
        let content_type = parts.headers.get(CONTENT_TYPE).cloned();
        let status = self
            .chunker
            .put(path, request_stream(body), content_length, content_type)
            .await?;
        Ok(status_response(status))
    }

    async fn delete(&self, path: &str, headers: &HeaderMap) -> ProxyResult<Response<ProxyBody>> {
        if path == "/" {
            return Err(ProxyError::Forbidden("refusing to delete the root collection".into()));
        }
        if self.chunker.remove(path).await? {
            return Ok(status_response(StatusCode::NO_CONTENT));
        }
        let response = self
            .relay(DavMethod::Delete, path, headers, None, Body::default())
            .await;
        self.cache.invalidate_prefix(path);
        response
    }

    async fn relocate(
        &self,
        verb: DavMethod,
        from: &str,
        headers: &HeaderMap,
    ) -> ProxyResult<Response<ProxyBody>> {
        let to = self.destination(headers)?;
        let overwrite = !headers
            .get("overwrite")
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"F"));
        let is_move = verb == DavMethod::Move;

        let source = self.namespace.stat(from).await?;
        if source.meta.chunked {
            let status = self.chunker.relocate(from, &to, overwrite, is_move).await?;
            return Ok(status_response(status));
        }

        let target = match self.namespace.stat(&to).await {
            Ok(target) => Some(target),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let replaces_chunked = target.as_ref().is_some_and(|t| t.meta.chunked);
        if replaces_chunked && !overwrite {
            return Err(ProxyError::PreconditionFailed(to));
        }

        let mut response = self
            .relay(verb, from, headers, Some(&to), Body::default())
            .await?;
        if response.status().is_success() {
            if replaces_chunked {
                self.chunker.forget(&to).await?;
                if response.status() == StatusCode::CREATED {
                    *response.status_mut() = StatusCode::NO_CONTENT;
                }
            }
            self.cache.invalidate_prefix(&to);
            if is_move {
                self.cache.invalidate_prefix(from);
            }
        }
        Ok(response)
    }

    async fn pass_through<B>(
        &self,
        verb: DavMethod,
        path: &str,
        req: Request<B>,
    ) -> ProxyResult<Response<ProxyBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let response = self
            .relay(
                verb,
                path,
                &parts.headers,
                None,
                Body::wrap_stream(request_stream(body)),
            )
            .await;
        if verb.is_write() {
            self.cache.invalidate(path);
        }
        response
    }

    /// Sends a request to the backend and relays its response.
    async fn relay(
        &self,
        verb: DavMethod,
        path: &str,
        headers: &HeaderMap,
        destination: Option<&str>,
        body: Body,
    ) -> ProxyResult<Response<ProxyBody>> {
        let method = backend_method(verb)?;
        let upstream = self
            .backend
            .forward(method, path, headers, destination, body)
            .await?;
        let status = upstream.status();
        if status.is_server_error() {
            warn!(path, status = status.as_u16(), "Backend error relayed");
        }

        let mut response = Response::new(body::empty());
        *response.status_mut() = status;
        let out = response.headers_mut();
        for (name, value) in upstream.headers() {
            if !HOP_BY_HOP.contains(&name.as_str()) && *name != LOCATION {
                out.append(name.clone(), value.clone());
            }
        }
        *response.body_mut() = body::stream(response_stream(upstream));
        Ok(response)
    }
}

fn backend_method(verb: DavMethod) -> ProxyResult<Method> {
    let name: &[u8] = match verb {
        DavMethod::Options => b"OPTIONS",
        DavMethod::Get => b"GET",
        DavMethod::Head => b"HEAD",
        DavMethod::Put => b"PUT",
        DavMethod::Delete => b"DELETE",
        DavMethod::Propfind => b"PROPFIND",
        DavMethod::Proppatch => b"PROPPATCH",
        DavMethod::Mkcol => b"MKCOL",
        DavMethod::Copy => b"COPY",
        DavMethod::Move => b"MOVE",
        DavMethod::Lock => b"LOCK",
        DavMethod::Unlock => b"UNLOCK",
    };
    Method::from_bytes(name).map_err(|e| ProxyError::MethodNotAllowed(e.to_string()))
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(0u64));
    response
}

fn redirect(location: &str) -> Response<ProxyBody> {
    let mut response = status_response(StatusCode::FOUND);
    insert_header(response.headers_mut(), LOCATION, location);
    response
}

fn options() -> Response<ProxyBody> {
    let mut response = status_response(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert("dav", HeaderValue::from_static("1, 2"));
    headers.insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert("ms-author-via", HeaderValue::from_static("DAV"));
    response
}

/// A file response with the entity headers of `meta`.
fn entity_response(
    status: StatusCode,
    meta: &ResourceMeta,
    len: u64,
    body: ProxyBody,
) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_header(
        headers,
        CONTENT_TYPE,
        meta.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE),
    );
    if let Some(etag) = meta.quoted_etag() {
        insert_header(headers, ETAG, &etag);
    }
    if let Some(date) = meta.http_date() {
        insert_header(headers, LAST_MODIFIED, &date);
    }
    response
}

impl std::fmt::Debug for DavProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavProxy")
            .field("mount_prefix", &self.mount_prefix)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
