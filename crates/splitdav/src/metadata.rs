//! Metadata snapshot of a logical resource.

use chrono::{DateTime, Utc};

/// Size, timestamps and identity of a resource as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    /// Logical size in bytes (the manifest total for chunked files).
    pub size: u64,
    /// Last modification time, when known.
    pub modified: Option<DateTime<Utc>>,
    /// Entity tag without quotes.
    pub etag: Option<String>,
    pub is_collection: bool,
    pub content_type: Option<String>,
    /// Whether the content lives in chunks described by a manifest.
    pub chunked: bool,
}

impl ResourceMeta {
    /// Metadata for a collection.
    pub fn collection(modified: Option<DateTime<Utc>>) -> Self {
        Self {
            size: 0,
            modified,
            etag: None,
            is_collection: true,
            content_type: None,
            chunked: false,
        }
    }

    /// Metadata for a plain (non-chunked) file.
    pub fn file(size: u64, modified: Option<DateTime<Utc>>, etag: Option<String>) -> Self {
        Self {
            size,
            modified,
            etag,
            is_collection: false,
            content_type: None,
            chunked: false,
        }
    }

    /// Entity tag wrapped in quotes, ready for an `ETag` header.
    pub fn quoted_etag(&self) -> Option<String> {
        self.etag.as_ref().map(|tag| format!("\"{tag}\""))
    }

    /// Modification time formatted as an HTTP date.
    pub fn http_date(&self) -> Option<String> {
        self.modified.as_ref().map(format_http_date)
    }
}

/// A resource and its path, as found in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub path: String,
    pub meta: ResourceMeta,
}

/// Formats a timestamp as an RFC 7231 IMF-fixdate.
pub fn format_http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an HTTP date, accepting RFC 3339 as well since some servers use it.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Strips the weak marker and quotes from an entity tag.
pub fn unquote_etag(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"').to_string()
}
