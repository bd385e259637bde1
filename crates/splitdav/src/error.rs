//! Error taxonomy for the proxy and its mapping onto HTTP responses.

use std::io;

use hyper::header::{ALLOW, CONTENT_RANGE, CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use thiserror::Error;

use crate::body::{self, ProxyBody};
use crate::manifest::ManifestError;

/// Methods listed in `Allow` headers.
pub const ALLOWED_METHODS: &str =
    "OPTIONS, GET, HEAD, PUT, DELETE, PROPFIND, PROPPATCH, MKCOL, COPY, MOVE, LOCK, UNLOCK";

/// Realm advertised in Basic-Auth challenges.
pub const AUTH_REALM: &str = "splitdav";

/// Errors produced while handling a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or wrong client credentials.
    #[error("authentication required")]
    AuthFailure,

    /// The logical path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request targets a name the proxy reserves for its own bookkeeping.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed request (bad path, bad Destination header).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Verb outside the supported set.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// COPY/MOVE with `Overwrite: F` onto an existing destination.
    #[error("destination already exists: {0}")]
    PreconditionFailed(String),

    /// Another writer committed a manifest for the path while this upload ran.
    #[error("manifest for {path} changed during upload")]
    ManifestConflict { path: String },

    /// The backend could not be reached or dropped the connection.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend did not answer in time.
    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    /// The backend answered with an error status that is passed on as-is.
    #[error("backend returned {status} for {path}")]
    BackendStatus { status: StatusCode, path: String },

    /// A chunk could not be stored; the upload was rolled back.
    #[error("upload of chunk {index} for {path} failed: {reason}")]
    ChunkUploadFailure {
        path: String,
        index: usize,
        reason: String,
    },

    /// A manifest could not be read and could not be rebuilt.
    #[error("manifest for {path} is unusable: {source}")]
    ManifestCorrupt {
        path: String,
        #[source]
        source: ManifestError,
    },

    /// The requested byte range cannot be served.
    #[error("range not satisfiable: {reason}")]
    RangeNotSatisfiable { total: u64, reason: String },

    /// Reading the client request body failed (usually a disconnect).
    #[error("client body error: {0}")]
    ClientBody(String),

    /// Local I/O failure (spool files).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthFailure => StatusCode::UNAUTHORIZED,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::BadRequest(_) | ProxyError::ClientBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ProxyError::ManifestConflict { .. } => StatusCode::CONFLICT,
            ProxyError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BackendStatus { status, .. } => *status,
            ProxyError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::ChunkUploadFailure { .. }
            | ProxyError::ManifestCorrupt { .. }
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same backend request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::BackendUnavailable(_) | ProxyError::BackendTimeout(_) => true,
            ProxyError::BackendStatus { status, .. } => matches!(
                *status,
                StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            _ => false,
        }
    }

    /// Whether this error means the backend has no such resource.
    pub fn is_not_found(&self) -> bool {
        match self {
            ProxyError::NotFound(_) => true,
            ProxyError::BackendStatus { status, .. } => *status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }

    /// Builds the response sent to the client for this error.
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status();
        let mut response = Response::new(body::full(format!("{self}\n")));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        match &self {
            ProxyError::AuthFailure => {
                let challenge = format!("Basic realm=\"{AUTH_REALM}\", charset=\"UTF-8\"");
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    headers.insert(WWW_AUTHENTICATE, value);
                }
            }
            ProxyError::RangeNotSatisfiable { total, .. } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
                    headers.insert(CONTENT_RANGE, value);
                }
            }
            ProxyError::MethodNotAllowed(_) => {
                headers.insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
            }
            _ => {}
        }
        response
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::BackendTimeout(e.to_string())
        } else {
            ProxyError::BackendUnavailable(e.to_string())
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
