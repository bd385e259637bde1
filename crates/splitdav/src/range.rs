//! Single byte-range parsing and its mapping onto chunks.

use crate::error::ProxyError;
use crate::manifest::FileManifest;

/// An inclusive, satisfiable byte range of a resource of `total` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    /// The whole resource; `None` when it is empty.
    pub fn full(total: u64) -> Option<Self> {
        (total > 0).then(|| Self {
            start: 0,
            end: total - 1,
            total,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Content-Range` header for a 206 response.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parses a `Range` header against a resource of `total` bytes.
///
/// Returns `Ok(None)` when the header should be ignored (other units or
/// unparseable), and an error for multi-range or unsatisfiable requests.
pub fn parse_range(header: &str, total: u64) -> Result<Option<ByteRange>, ProxyError> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Err(ProxyError::RangeNotSatisfiable {
            total,
            reason: "multiple ranges are not supported; request one range at a time".into(),
        });
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return Ok(None);
    };
    let (first, last) = (first.trim(), last.trim());

    let unsatisfiable = |reason: &str| ProxyError::RangeNotSatisfiable {
        total,
        reason: reason.to_string(),
    };

    if first.is_empty() {
        // Suffix range: the last n bytes.
        let Ok(suffix) = last.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || total == 0 {
            return Err(unsatisfiable("empty suffix range"));
        }
        return Ok(Some(ByteRange {
            start: total.saturating_sub(suffix),
            end: total - 1,
            total,
        }));
    }

    let Ok(start) = first.parse::<u64>() else {
        return Ok(None);
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return Ok(None),
        }
    };
    if let Some(end) = end
        && end < start
    {
        return Ok(None);
    }
    if start >= total {
        return Err(unsatisfiable("range starts past the end of the resource"));
    }
    Ok(Some(ByteRange {
        start,
        end: end.map_or(total - 1, |end| end.min(total - 1)),
        total,
    }))
}

/// The part of one chunk needed to serve a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    pub index: usize,
    /// Chunk name relative to the file's parent collection.
    pub location: String,
    /// First byte wanted, relative to the chunk.
    pub offset: u64,
    /// Bytes wanted from this chunk.
    pub len: u64,
    /// Full size of the chunk.
    pub chunk_size: u64,
}

impl ChunkSlice {
    /// Whether the whole chunk is wanted.
    pub fn is_whole(&self) -> bool {
        self.offset == 0 && self.len == self.chunk_size
    }

    /// Inclusive chunk-relative range for a backend sub-request.
    pub fn sub_range(&self) -> Option<(u64, u64)> {
        (!self.is_whole()).then(|| (self.offset, self.offset + self.len - 1))
    }
}

/// Maps `range` onto the chunks of `manifest` that intersect it, in order.
pub fn plan(manifest: &FileManifest, range: &ByteRange) -> Vec<ChunkSlice> {
    let mut slices = Vec::new();
    let mut chunk_start = 0u64;
    for chunk in &manifest.chunks {
        let chunk_end = chunk_start + chunk.size;
        if chunk.size > 0 && chunk_end > range.start && chunk_start <= range.end {
            let from = range.start.max(chunk_start);
            let to = range.end.min(chunk_end - 1);
            slices.push(ChunkSlice {
                index: chunk.index,
                location: chunk.location.clone(),
                offset: from - chunk_start,
                len: to - from + 1,
                chunk_size: chunk.size,
            });
        }
        if chunk_start > range.end {
            break;
        }
        chunk_start = chunk_end;
    }
    slices
}
