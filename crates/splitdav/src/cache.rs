//! Bounded, TTL-based metadata cache.
//!
//! Entries are evicted least-recently-used first once the configured capacity
//! is exceeded, and every read checks the entry's own deadline so an expired
//! entry is never returned, whatever moka's housekeeping has done so far.
//!
//! Collection entries may carry the names of their children. That list lets
//! the cache answer Depth:1 listings and negative lookups without the
//! backend, as long as every child entry is still present and fresh.
//!
//! Every invalidation bumps a generation counter. Results of a backend
//! request are only cached if no invalidation happened while it was in
//! flight, so a listing taken before a write cannot outlive that write.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::policy::EvictionPolicy;
use tracing::warn;

use crate::metadata::{Resource, ResourceMeta};
use crate::path;
use crate::stats::ProxyStats;

/// A cached metadata snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: String,
    pub meta: ResourceMeta,
    /// Child names of a collection whose full listing was cached.
    pub children: Option<Arc<Vec<String>>>,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(path: String, meta: ResourceMeta, children: Option<Vec<String>>, ttl: Duration) -> Self {
        Self {
            path,
            meta,
            children: children.map(Arc::new),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Returns true once the entry's deadline has passed.
    #[inline]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Outcome of [`MetadataCache::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A fresh entry for the path.
    Found(CacheEntry),
    /// The parent's cached listing proves the path does not exist.
    Absent,
    /// Nothing usable is cached.
    Unknown,
}

/// Process-wide metadata cache keyed by logical path.
pub struct MetadataCache {
    entries: moka::sync::Cache<String, CacheEntry>,
    ttl: Duration,
    generation: AtomicU64,
    stats: Arc<ProxyStats>,
}

impl MetadataCache {
    /// Creates a cache holding at most `capacity` entries for `ttl` each.
    pub fn new(capacity: u64, ttl: Duration, stats: Arc<ProxyStats>) -> Self {
        let entries = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self {
            entries,
            ttl,
            generation: AtomicU64::new(0),
            stats,
        }
    }

    /// Returns the fresh entry for `path`, if any.
    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        match self.entries.get(path) {
            Some(entry) if !entry.is_expired() => {
                self.stats.record_cache_hit();
                Some(entry)
            }
            Some(_) => {
                self.entries.invalidate(path);
                self.stats.record_cache_miss();
                None
            }
            None => {
                self.stats.record_cache_miss();
                None
            }
        }
    }

    /// Looks up `path`, falling back to the parent's child list to prove
    /// absence.
    pub fn lookup(&self, path: &str) -> Lookup {
        if let Some(entry) = self.get(path) {
            return Lookup::Found(entry);
        }
        if path == "/" {
            return Lookup::Unknown;
        }
        let name = path::file_name(path);
        match self.get(path::parent(path)).and_then(|parent| parent.children) {
            Some(children) if !children.iter().any(|child| child == name) => Lookup::Absent,
            _ => Lookup::Unknown,
        }
    }

    /// Caches metadata for a single path.
    pub fn put(&self, path: &str, meta: ResourceMeta) {
        self.entries.insert(
            path.to_string(),
            CacheEntry::new(path.to_string(), meta, None, self.ttl),
        );
    }

    /// Caches a complete Depth:1 listing: every child, then the collection
    /// itself with the child names attached.
    pub fn put_listing(&self, collection: &Resource, children: &[Resource]) {
        for child in children {
            self.put(&child.path, child.meta.clone());
        }
        let names = children
            .iter()
            .map(|child| path::file_name(&child.path).to_string())
            .collect();
        self.entries.insert(
            collection.path.clone(),
            CacheEntry::new(
                collection.path.clone(),
                collection.meta.clone(),
                Some(names),
                self.ttl,
            ),
        );
    }

    /// Current invalidation generation. Read it before asking the backend.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Like [`put`](Self::put), but only if nothing was invalidated since
    /// `generation` was read. Returns whether the entry was kept.
    pub fn put_if_current(&self, generation: u64, path: &str, meta: ResourceMeta) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.put(path, meta);
        if !self.is_current(generation) {
            self.entries.invalidate(path);
            return false;
        }
        true
    }

    /// Like [`put_listing`](Self::put_listing), but only if nothing was
    /// invalidated since `generation` was read. Returns whether the listing
    /// was kept.
    pub fn put_listing_if_current(
        &self,
        generation: u64,
        collection: &Resource,
        children: &[Resource],
    ) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.put_listing(collection, children);
        if !self.is_current(generation) {
            // An invalidation raced the insert; drop what may be stale.
            self.entries.invalidate(&collection.path);
            for child in children {
                self.entries.invalidate(&child.path);
            }
            return false;
        }
        true
    }

    /// Composes a Depth:1 listing from cached entries.
    ///
    /// Returns `None` unless the collection has a cached child list and every
    /// child entry is present and unexpired.
    pub fn compose_listing(&self, collection: &str) -> Option<(ResourceMeta, Vec<Resource>)> {
        let entry = self.get(collection)?;
        let names = entry.children.as_ref()?;
        let mut children = Vec::with_capacity(names.len());
        for name in names.iter() {
            let child_path = path::join(collection, name);
            let child = self.get(&child_path)?;
            children.push(Resource {
                path: child_path,
                meta: child.meta,
            });
        }
        Some((entry.meta, children))
    }

    /// Drops the entry for `path` and for its parent collection.
    pub fn invalidate(&self, path: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate(path);
        if path != "/" {
            self.entries.invalidate(path::parent(path));
        }
    }

    /// Drops every entry at or below `prefix`, plus the parent of `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let owned = prefix.to_string();
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |key, _| path::is_within(key, &owned))
        {
            warn!("Prefix invalidation unavailable ({e}); clearing metadata cache");
            self.entries.invalidate_all();
        }
        self.invalidate(prefix);
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate_all();
    }

    /// Applies pending evictions and invalidations.
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    /// Approximate number of cached entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
