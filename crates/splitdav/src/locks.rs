//! Per-path locking for writes to logical paths.
//!
//! Every logical path gets its own `RwLock`, created on first use and kept in
//! a sharded map, so operations on unrelated paths never contend.
//!
//! # Locking rules
//!
//! - Uploads, deletes and the destination of COPY/MOVE take the write lock
//!   for the whole operation.
//! - Readers take the read lock only while resolving the manifest.
//! - Operations touching two paths lock them in lexicographic order.
//! - Read locks are never upgraded.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Write guard over one logical path.
pub type PathWriteGuard = OwnedRwLockWriteGuard<()>;
/// Read guard over one logical path.
pub type PathReadGuard = OwnedRwLockReadGuard<()>;

/// Process-wide table of per-path locks.
#[derive(Debug, Default)]
pub struct PathLockManager {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl PathLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for `path`.
    pub fn lock_for(&self, path: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire the read lock on `path`.
    pub async fn read(&self, path: &str) -> PathReadGuard {
        self.lock_for(path).read_owned().await
    }

    /// Acquire the write lock on `path`.
    pub async fn write(&self, path: &str) -> PathWriteGuard {
        self.lock_for(path).write_owned().await
    }

    /// Acquire the write lock on `path` only if nobody holds it.
    pub fn try_write(&self, path: &str) -> Option<PathWriteGuard> {
        self.lock_for(path).try_write_owned().ok()
    }

    /// Acquire write locks on several paths in lexicographic order.
    ///
    /// Duplicates are locked once. Guards are returned in sorted order.
    pub async fn write_ordered(&self, paths: &[&str]) -> Vec<(String, PathWriteGuard)> {
        let mut sorted: Vec<String> = paths.iter().map(|p| (*p).to_string()).collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for path in sorted {
            let guard = self.write(&path).await;
            guards.push((path, guard));
        }
        guards
    }

    /// Drop locks nobody is holding or waiting on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of locks currently in the table.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
