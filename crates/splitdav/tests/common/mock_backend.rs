//! In-memory WebDAV server standing in for the backend.
//!
//! Implements just enough of RFC 4918 for the proxy: PROPFIND (Depth 0/1),
//! GET/HEAD with single ranges, PUT, DELETE, MKCOL, COPY and MOVE. Every
//! request is logged, and faults can be injected per method and path.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use splitdav::metadata::{Resource, ResourceMeta};
use splitdav::multistatus::render_multistatus;
use splitdav::path;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Credentials the proxy must present to the backend.
pub const BACKEND_USER: &str = "backend";
pub const BACKEND_PASSWORD: &str = "backend-secret";

#[derive(Debug, Clone)]
enum Node {
    Collection {
        modified: DateTime<Utc>,
    },
    File {
        data: Bytes,
        modified: DateTime<Utc>,
        etag: String,
        content_type: Option<String>,
    },
}

/// A fault armed for matching requests.
#[derive(Debug, Clone)]
struct Fault {
    method: Method,
    pattern: String,
    /// Match the whole path instead of a substring.
    exact: bool,
    remaining: usize,
    status: Option<StatusCode>,
    delay: Option<Duration>,
}

impl Fault {
    fn matches(&self, path: &str) -> bool {
        if self.exact {
            path == self.pattern
        } else {
            path.contains(&self.pattern)
        }
    }
}

/// One request as the backend saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: Method,
    pub path: String,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    faults: Vec<Fault>,
    log: Vec<LoggedRequest>,
    etag_counter: u64,
    ignore_ranges: bool,
}

impl State {
    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("mock-{}", self.etag_counter)
    }

    fn parent_is_collection(&self, path: &str) -> bool {
        matches!(
            self.nodes.get(path::parent(path)),
            Some(Node::Collection { .. })
        )
    }

    fn resource(&self, path: &str) -> Option<Resource> {
        let meta = match self.nodes.get(path)? {
            Node::Collection { modified } => ResourceMeta::collection(Some(*modified)),
            Node::File {
                data,
                modified,
                etag,
                content_type,
            } => {
                let mut meta =
                    ResourceMeta::file(data.len() as u64, Some(*modified), Some(etag.clone()));
                meta.content_type.clone_from(content_type);
                meta
            }
        };
        Some(Resource {
            path: path.to_string(),
            meta,
        })
    }

    fn children(&self, path: &str) -> Vec<Resource> {
        self.nodes
            .keys()
            .filter(|candidate| *candidate != path && path::parent(candidate) == path)
            .filter_map(|child| self.resource(child))
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|candidate| path::is_within(candidate, path))
            .cloned()
            .collect()
    }

    /// Consumes a matching fault, if any.
    fn take_fault(
        &mut self,
        method: &Method,
        path: &str,
    ) -> Option<(Option<StatusCode>, Option<Duration>)> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.method == *method && f.remaining > 0 && f.matches(path))?;
        fault.remaining -= 1;
        Some((fault.status, fault.delay))
    }
}

/// Handle to a running mock backend.
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
    handle: JoinHandle<()>,
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockBackend {
    /// Starts an empty backend on a free local port.
    pub async fn start() -> Self {
        let mut state = State::default();
        state.nodes.insert(
            "/".to_string(),
            Node::Collection { modified: Utc::now() },
        );
        let state = Arc::new(Mutex::new(state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().expect("No local address");
        let serving = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let state = Arc::clone(&serving);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(serve(state, req).await) }
                    });
                    let _ = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock state poisoned")
    }

    // ========== Direct access to the stored tree ==========

    /// Stores a file directly, bypassing HTTP.
    pub fn insert_file(&self, path: &str, data: impl Into<Bytes>) {
        let mut state = self.state();
        let etag = state.next_etag();
        state.nodes.insert(
            path.to_string(),
            Node::File {
                data: data.into(),
                modified: Utc::now(),
                etag,
                content_type: None,
            },
        );
    }

    /// Creates a collection directly.
    pub fn insert_collection(&self, path: &str) {
        self.state()
            .nodes
            .insert(path.to_string(), Node::Collection { modified: Utc::now() });
    }

    /// Removes a node directly; returns whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.state().nodes.remove(path).is_some()
    }

    /// Content of a stored file.
    pub fn file(&self, path: &str) -> Option<Bytes> {
        match self.state().nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    /// Stored paths whose last segment contains `marker`.
    pub fn names_containing(&self, marker: &str) -> Vec<String> {
        self.paths()
            .into_iter()
            .filter(|p| path::file_name(p).contains(marker))
            .collect()
    }

    // ========== Fault injection and request log ==========

    /// Answers the next `times` matching requests with `status`.
    pub fn fail(&self, method: Method, path_contains: &str, times: usize, status: StatusCode) {
        self.state().faults.push(Fault {
            method,
            pattern: path_contains.to_string(),
            exact: false,
            remaining: times,
            status: Some(status),
            delay: None,
        });
    }

    /// Answers the next `times` requests for exactly `path` with `status`.
    pub fn fail_exact(&self, method: Method, path: &str, times: usize, status: StatusCode) {
        self.state().faults.push(Fault {
            method,
            pattern: path.to_string(),
            exact: true,
            remaining: times,
            status: Some(status),
            delay: None,
        });
    }

    /// Delays the next `times` matching requests before handling them.
    pub fn delay(&self, method: Method, path_contains: &str, times: usize, delay: Duration) {
        self.state().faults.push(Fault {
            method,
            pattern: path_contains.to_string(),
            exact: false,
            remaining: times,
            status: None,
            delay: Some(delay),
        });
    }

    /// Makes GET ignore `Range` headers, like some servers do.
    pub fn ignore_ranges(&self, ignore: bool) {
        self.state().ignore_ranges = ignore;
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state().log.clone()
    }

    /// Number of logged requests with `method` whose path contains `fragment`.
    pub fn count(&self, method: &Method, fragment: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|r| r.method == *method && r.path.contains(fragment))
            .count()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn authorized(req: &Request<Incoming>) -> bool {
    let expected = format!(
        "Basic {}",
        STANDARD.encode(format!("{BACKEND_USER}:{BACKEND_PASSWORD}"))
    );
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str())
}

/// Path part of a URL or absolute path, decoded and normalized.
fn request_path(raw: &str) -> String {
    let raw = match raw.find("://") {
        Some(idx) => {
            let rest = &raw[idx + 3..];
            rest.find('/').map_or("/", |slash| &rest[slash..])
        }
        None => raw,
    };
    path::normalize(&path::decode(raw)).unwrap_or_else(|_| "/".to_string())
}

async fn serve(state: Arc<Mutex<State>>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = request_path(req.uri().path());

    let fault = {
        let mut state = state.lock().expect("mock state poisoned");
        state.log.push(LoggedRequest {
            method: method.clone(),
            path: path.clone(),
        });
        state.take_fault(&method, &path)
    };
    if let Some((status, delay)) = fault {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = status {
            // Drain the body so the client sees the status, not a reset.
            let _ = req.into_body().collect().await;
            return response(status, "injected fault");
        }
    }

    if !authorized(&req) {
        let mut denied = response(StatusCode::UNAUTHORIZED, "");
        denied.headers_mut().insert(
            hyper::header::WWW_AUTHENTICATE,
            hyper::header::HeaderValue::from_static("Basic realm=\"mock\""),
        );
        return denied;
    }

    match method.as_str() {
        "PROPFIND" => propfind(&state, &req, &path),
        "GET" | "HEAD" => get(&state, &req, &path, method == Method::HEAD),
        "PUT" => {
            let content_type = req
                .headers()
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let Ok(body) = req.into_body().collect().await else {
                return response(StatusCode::BAD_REQUEST, "");
            };
            put(&state, &path, body.to_bytes(), content_type)
        }
        "DELETE" => delete(&state, &path),
        "MKCOL" => mkcol(&state, &path),
        "COPY" | "MOVE" => relocate(&state, &req, &path, method.as_str() == "MOVE"),
        "PROPPATCH" => response(StatusCode::MULTI_STATUS, ""),
        _ => response(StatusCode::METHOD_NOT_ALLOWED, ""),
    }
}

fn propfind(state: &Mutex<State>, req: &Request<Incoming>, path: &str) -> Response<Full<Bytes>> {
    let state = state.lock().expect("mock state poisoned");
    let Some(own) = state.resource(path) else {
        return response(StatusCode::NOT_FOUND, "");
    };
    let depth_one = req
        .headers()
        .get("depth")
        .is_none_or(|v| v.as_bytes() != b"0");
    let mut resources = vec![own.clone()];
    if depth_one && own.meta.is_collection {
        resources.extend(state.children(path));
    }
    let mut reply = response(StatusCode::MULTI_STATUS, render_multistatus("", &resources));
    reply.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    reply
}

fn get(
    state: &Mutex<State>,
    req: &Request<Incoming>,
    path: &str,
    head: bool,
) -> Response<Full<Bytes>> {
    let state = state.lock().expect("mock state poisoned");
    let (data, etag) = match state.nodes.get(path) {
        None => return response(StatusCode::NOT_FOUND, ""),
        Some(Node::Collection { .. }) => return response(StatusCode::OK, "<html>collection</html>"),
        Some(Node::File { data, etag, .. }) => (data.clone(), etag.clone()),
    };

    let range = req
        .headers()
        .get(hyper::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .filter(|_| !state.ignore_ranges)
        .and_then(|(start, end)| {
            let start: usize = start.parse().ok()?;
            let end: usize = if end.is_empty() {
                data.len().checked_sub(1)?
            } else {
                end.parse::<usize>().ok()?.min(data.len().checked_sub(1)?)
            };
            (start <= end).then_some((start, end))
        });

    let (status, body) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, data.slice(start..=end)),
        None => (StatusCode::OK, data.clone()),
    };
    let len = body.len();
    let mut reply = response(status, if head { Bytes::new() } else { body });
    let headers = reply.headers_mut();
    headers.insert(hyper::header::ETAG, format!("\"{etag}\"").parse().expect("valid etag"));
    if let Some((start, end)) = range {
        headers.insert(
            hyper::header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{}", data.len())
                .parse()
                .expect("valid content range"),
        );
    }
    if head {
        headers.insert(hyper::header::CONTENT_LENGTH, len.into());
    }
    reply
}

fn put(
    state: &Mutex<State>,
    path: &str,
    data: Bytes,
    content_type: Option<String>,
) -> Response<Full<Bytes>> {
    let mut state = state.lock().expect("mock state poisoned");
    if !state.parent_is_collection(path) {
        return response(StatusCode::CONFLICT, "");
    }
    let existed = match state.nodes.get(path) {
        Some(Node::Collection { .. }) => return response(StatusCode::METHOD_NOT_ALLOWED, ""),
        Some(Node::File { .. }) => true,
        None => false,
    };
    let etag = state.next_etag();
    state.nodes.insert(
        path.to_string(),
        Node::File {
            data,
            modified: Utc::now(),
            etag,
            content_type,
        },
    );
    response(if existed { StatusCode::NO_CONTENT } else { StatusCode::CREATED }, "")
}

fn delete(state: &Mutex<State>, path: &str) -> Response<Full<Bytes>> {
    let mut state = state.lock().expect("mock state poisoned");
    if !state.nodes.contains_key(path) {
        return response(StatusCode::NOT_FOUND, "");
    }
    for doomed in state.subtree(path) {
        state.nodes.remove(&doomed);
    }
    response(StatusCode::NO_CONTENT, "")
}

fn mkcol(state: &Mutex<State>, path: &str) -> Response<Full<Bytes>> {
    let mut state = state.lock().expect("mock state poisoned");
    if state.nodes.contains_key(path) {
        return response(StatusCode::METHOD_NOT_ALLOWED, "");
    }
    if !state.parent_is_collection(path) {
        return response(StatusCode::CONFLICT, "");
    }
    state
        .nodes
        .insert(path.to_string(), Node::Collection { modified: Utc::now() });
    response(StatusCode::CREATED, "")
}

fn relocate(
    state: &Mutex<State>,
    req: &Request<Incoming>,
    from: &str,
    is_move: bool,
) -> Response<Full<Bytes>> {
    let Some(destination) = req
        .headers()
        .get("destination")
        .and_then(|v| v.to_str().ok())
        .map(request_path)
    else {
        return response(StatusCode::BAD_REQUEST, "");
    };
    let overwrite = !req
        .headers()
        .get("overwrite")
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"F"));

    let mut state = state.lock().expect("mock state poisoned");
    if !state.nodes.contains_key(from) {
        return response(StatusCode::NOT_FOUND, "");
    }
    if !state.parent_is_collection(&destination) {
        return response(StatusCode::CONFLICT, "");
    }
    let existed = state.nodes.contains_key(&destination);
    if existed && !overwrite {
        return response(StatusCode::PRECONDITION_FAILED, "");
    }
    for doomed in state.subtree(&destination) {
        state.nodes.remove(&doomed);
    }

    let sources = state.subtree(from);
    for source in sources {
        let Some(node) = state.nodes.get(&source).cloned() else {
            continue;
        };
        let target = format!("{destination}{}", &source[from.len()..]);
        let node = match node {
            Node::File {
                data, content_type, ..
            } => Node::File {
                data,
                modified: Utc::now(),
                etag: state.next_etag(),
                content_type,
            },
            collection @ Node::Collection { .. } => collection,
        };
        state.nodes.insert(target, node);
        if is_move {
            state.nodes.remove(&source);
        }
    }
    response(if existed { StatusCode::NO_CONTENT } else { StatusCode::CREATED }, "")
}
