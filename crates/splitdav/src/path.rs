//! Logical path handling and the naming convention for chunk bookkeeping.
//!
//! Logical paths are absolute, `/`-separated, percent-decoded and carry no
//! trailing slash (the root is `/`). For a file `/dir/name` the proxy stores:
//!
//! - `/dir/name.splitinfo`: the committed manifest
//! - `/dir/name.splitinfo.pending`: the manifest of an upload in progress
//! - `/dir/name.<upload id>.part<index>`: the chunk parts
//!
//! None of these names are visible through the proxy.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::error::{ProxyError, ProxyResult};

/// Suffix of committed manifest sidecars.
pub const SIDECAR_SUFFIX: &str = ".splitinfo";
/// Suffix of pending manifest records.
pub const PENDING_SUFFIX: &str = ".splitinfo.pending";
/// Length of an upload id in hex digits.
pub const UPLOAD_ID_LEN: usize = 8;

const PART_MARKER: &str = ".part";
const INDEX_WIDTH: usize = 4;

/// Characters escaped inside a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'/');

/// Normalizes a decoded path: collapses repeated slashes, resolves `.` and
/// `..`, strips the trailing slash. Escaping above the root is rejected.
pub fn normalize(raw: &str) -> ProxyResult<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ProxyError::BadRequest(format!(
                        "path escapes the root: {raw}"
                    )));
                }
            }
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent collection of `path`; the root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of `path` (empty for the root).
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Joins a collection path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Whether `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    prefix == "/"
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Path of the committed manifest sidecar for `path`.
pub fn sidecar_path(path: &str) -> String {
    format!("{path}{SIDECAR_SUFFIX}")
}

/// Path of the pending manifest record for `path`.
pub fn pending_path(path: &str) -> String {
    format!("{path}{PENDING_SUFFIX}")
}

/// Name of chunk `index` of upload `upload_id` for the file `name`.
pub fn chunk_name(name: &str, upload_id: &str, index: usize) -> String {
    format!("{name}.{upload_id}{PART_MARKER}{index:04}")
}

/// A name the proxy uses for its own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedName<'a> {
    /// Committed manifest of `target`.
    Sidecar { target: &'a str },
    /// Pending manifest of `target`.
    Pending { target: &'a str },
    /// One chunk of `target`.
    Chunk {
        target: &'a str,
        upload_id: &'a str,
        index: usize,
    },
}

impl<'a> ReservedName<'a> {
    /// Name of the logical file this bookkeeping entry belongs to.
    pub fn target(&self) -> &'a str {
        match *self {
            ReservedName::Sidecar { target }
            | ReservedName::Pending { target }
            | ReservedName::Chunk { target, .. } => target,
        }
    }
}

/// Classifies a single path segment.
pub fn classify(name: &str) -> Option<ReservedName<'_>> {
    if let Some(target) = name.strip_suffix(PENDING_SUFFIX)
        && !target.is_empty()
    {
        return Some(ReservedName::Pending { target });
    }
    if let Some(target) = name.strip_suffix(SIDECAR_SUFFIX)
        && !target.is_empty()
    {
        return Some(ReservedName::Sidecar { target });
    }
    parse_chunk_name(name)
}

fn parse_chunk_name(name: &str) -> Option<ReservedName<'_>> {
    let marker = name.rfind(PART_MARKER)?;
    let digits = &name[marker + PART_MARKER.len()..];
    if digits.len() < INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;

    let head = &name[..marker];
    let dot = head.rfind('.')?;
    let upload_id = &head[dot + 1..];
    let target = &head[..dot];
    let is_id = upload_id.len() == UPLOAD_ID_LEN
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !is_id || target.is_empty() {
        return None;
    }
    Some(ReservedName::Chunk {
        target,
        upload_id,
        index,
    })
}

/// Whether the last segment of `path` is a reserved name.
pub fn is_reserved(path: &str) -> bool {
    classify(file_name(path)).is_some()
}

/// Percent-encodes every segment of a logical path.
pub fn encode(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-decodes a raw URL path.
pub fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
