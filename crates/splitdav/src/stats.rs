//! Lock-free counters describing proxy activity.
//!
//! All counters are `AtomicU64` updated with relaxed ordering; a
//! [`StatsSnapshot`] captures them at one instant for logging.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters shared by every proxy service.
#[derive(Debug, Default)]
pub struct ProxyStats {
    requests: AtomicU64,
    chunked_uploads: AtomicU64,
    chunks_uploaded: AtomicU64,
    chunk_retries: AtomicU64,
    rollbacks: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    chunked_reads: AtomicU64,
    truncated_streams: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    manifests_healed: AtomicU64,
    pending_swept: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunked_upload(&self) {
        self.chunked_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk confirmed stored on the backend.
    #[inline]
    pub fn record_chunk_uploaded(&self, bytes: u64) {
        self.chunks_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk_retry(&self) {
        self.chunk_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunked_read(&self) {
        self.chunked_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a reassembled download that ended before its declared length.
    #[inline]
    pub fn record_truncated_stream(&self) {
        self.truncated_streams.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_manifest_healed(&self) {
        self.manifests_healed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pending_swept(&self) {
        self.pending_swept.fetch_add(1, Ordering::Relaxed);
    }

    /// Cache hit rate as a fraction (0.0 when nothing was looked up).
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Create a snapshot of current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            chunked_uploads: self.chunked_uploads.load(Ordering::Relaxed),
            chunks_uploaded: self.chunks_uploaded.load(Ordering::Relaxed),
            chunk_retries: self.chunk_retries.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            chunked_reads: self.chunked_reads.load(Ordering::Relaxed),
            truncated_streams: self.truncated_streams.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            manifests_healed: self.manifests_healed.load(Ordering::Relaxed),
            pending_swept: self.pending_swept.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub chunked_uploads: u64,
    pub chunks_uploaded: u64,
    pub chunk_retries: u64,
    pub rollbacks: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub chunked_reads: u64,
    pub truncated_streams: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub manifests_healed: u64,
    pub pending_swept: u64,
}

/// Format a byte count for log messages.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
