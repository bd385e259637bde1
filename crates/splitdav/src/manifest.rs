//! Chunk manifests and their persistence on the backend.
//!
//! A [`FileManifest`] records, in byte order, where every chunk of a logical
//! file lives. The committed manifest of `/dir/name` is stored as JSON in the
//! sidecar `/dir/name.splitinfo` and is replaced with a single PUT, so it is
//! seen in full or not at all. Uploads in progress keep their manifest in
//! `/dir/name.splitinfo.pending`, which readers never consult.
//!
//! Chunk locations are names relative to the file's parent collection.
//! Moving or copying a whole collection therefore keeps its manifests valid.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendClient, Depth};
use crate::error::{ProxyError, ProxyResult};
use crate::locks::PathLockManager;
use crate::metadata::{Resource, ResourceMeta};
use crate::path::{self, ReservedName};
use crate::stats::ProxyStats;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

const MANIFEST_CONTENT_TYPE: &str = "application/json";

/// Reasons a manifest cannot be used.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported manifest version {0}")]
    Version(u32),

    #[error("manifest describes {found}, expected {expected}")]
    WrongPath { expected: String, found: String },

    #[error("chunk {found} found where chunk {expected} was expected")]
    OutOfOrder { expected: usize, found: usize },

    #[error("expected {expected} chunks, found {found}")]
    ChunkCount { expected: usize, found: usize },

    #[error("chunk sizes add up to {actual} bytes, manifest declares {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("chunk {index} holds {size} bytes, expected {expected}")]
    ChunkSize { index: usize, size: u64, expected: u64 },

    #[error("manifest is not committed")]
    NotCommitted,

    #[error("no chunks found to rebuild from")]
    NothingToRebuild,

    #[error("chunks from {0} different uploads found")]
    AmbiguousUploads(usize),
}

/// One stored chunk. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub index: usize,
    /// Name of the chunk relative to the file's parent collection.
    pub location: String,
    pub size: u64,
    /// `sha256:<hex>` of the chunk bytes; absent for rebuilt manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestState {
    Pending,
    Committed,
}

/// Chunk layout of one logical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifest {
    pub version: u32,
    pub original_path: String,
    pub upload_id: String,
    pub total_size: u64,
    pub chunk_size_target: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub state: ManifestState,
    pub created_at: DateTime<Utc>,
    pub entity_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Number of chunks needed for `total` bytes at `target` bytes each.
pub fn chunk_count(total: u64, target: u64) -> usize {
    usize::try_from(total.div_ceil(target.max(1))).unwrap_or(usize::MAX)
}

/// Size of chunk `index` when splitting `total` bytes at `target`.
pub fn chunk_len(total: u64, target: u64, index: usize) -> u64 {
    let start = (index as u64).saturating_mul(target);
    total.saturating_sub(start).min(target)
}

/// A fresh 8-hex-digit upload id.
pub fn new_upload_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(path::UPLOAD_ID_LEN);
    id
}

fn entity_tag(upload_id: &str, total_size: u64) -> String {
    format!("{upload_id}-{total_size:x}")
}

impl FileManifest {
    /// Starts a pending manifest for an upload of `total_size` bytes.
    pub fn pending(
        original_path: &str,
        total_size: u64,
        chunk_size_target: u64,
        upload_id: String,
        content_type: Option<String>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            original_path: original_path.to_string(),
            entity_tag: entity_tag(&upload_id, total_size),
            upload_id,
            total_size,
            chunk_size_target,
            chunks: Vec::with_capacity(chunk_count(total_size, chunk_size_target)),
            state: ManifestState::Pending,
            created_at: Utc::now(),
            content_type,
        }
    }

    /// Number of chunks this manifest will hold once complete.
    pub fn expected_chunks(&self) -> usize {
        chunk_count(self.total_size, self.chunk_size_target)
    }

    /// Appends the next chunk. Chunks must arrive in index order.
    pub fn append(&mut self, chunk: ChunkDescriptor) -> Result<(), ManifestError> {
        let expected = self.chunks.len();
        if chunk.index != expected {
            return Err(ManifestError::OutOfOrder {
                expected,
                found: chunk.index,
            });
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Marks the manifest committed after checking it is complete.
    pub fn commit(&mut self) -> Result<(), ManifestError> {
        self.check_layout()?;
        self.state = ManifestState::Committed;
        Ok(())
    }

    /// Checks that a committed manifest may be served for `path`.
    pub fn validate_committed(&self, path: &str) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::Version(self.version));
        }
        if self.state != ManifestState::Committed {
            return Err(ManifestError::NotCommitted);
        }
        if path::file_name(&self.original_path) != path::file_name(path) {
            return Err(ManifestError::WrongPath {
                expected: path.to_string(),
                found: self.original_path.clone(),
            });
        }
        self.check_layout()
    }

    fn check_layout(&self) -> Result<(), ManifestError> {
        let expected = self.expected_chunks();
        if self.chunks.len() != expected {
            return Err(ManifestError::ChunkCount {
                expected,
                found: self.chunks.len(),
            });
        }
        let mut actual = 0u64;
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != position {
                return Err(ManifestError::OutOfOrder {
                    expected: position,
                    found: chunk.index,
                });
            }
            let want = chunk_len(self.total_size, self.chunk_size_target, position);
            if chunk.size != want {
                return Err(ManifestError::ChunkSize {
                    index: position,
                    size: chunk.size,
                    expected: want,
                });
            }
            actual += chunk.size;
        }
        if actual != self.total_size {
            return Err(ManifestError::SizeMismatch {
                declared: self.total_size,
                actual,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Bytes, ManifestError> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ManifestError> {
        let manifest: FileManifest = serde_json::from_slice(data)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(ManifestError::Version(manifest.version));
        }
        Ok(manifest)
    }

    /// Client-visible metadata of the logical file.
    pub fn meta(&self) -> ResourceMeta {
        ResourceMeta {
            size: self.total_size,
            modified: Some(self.created_at),
            etag: Some(self.entity_tag.clone()),
            is_collection: false,
            content_type: self.content_type.clone(),
            chunked: true,
        }
    }

    /// Backend paths of all recorded chunks, given the file's logical path.
    pub fn chunk_paths(&self, path: &str) -> Vec<String> {
        let parent = path::parent(path);
        self.chunks
            .iter()
            .map(|chunk| path::join(parent, &chunk.location))
            .collect()
    }

    /// Rebuilds a committed manifest for `path` from the chunk names found in
    /// a listing of its parent collection.
    ///
    /// Chunks of `exclude_upload` (an upload still in progress) are ignored.
    /// Exactly one upload must remain, its indices contiguous from zero and
    /// all chunks but the last equally sized.
    pub fn reconstruct(
        path: &str,
        listing: &[Resource],
        exclude_upload: Option<&str>,
    ) -> Result<Self, ManifestError> {
        let name = path::file_name(path);
        let mut uploads: BTreeMap<&str, Vec<(usize, &Resource)>> = BTreeMap::new();
        for resource in listing {
            if let Some(ReservedName::Chunk {
                target,
                upload_id,
                index,
            }) = path::classify(path::file_name(&resource.path))
                && target == name
                && Some(upload_id) != exclude_upload
            {
                uploads.entry(upload_id).or_default().push((index, resource));
            }
        }
        if uploads.len() > 1 {
            return Err(ManifestError::AmbiguousUploads(uploads.len()));
        }
        let Some((upload_id, mut parts)) = uploads.pop_first() else {
            return Err(ManifestError::NothingToRebuild);
        };
        parts.sort_by_key(|(index, _)| *index);

        let total_size = parts.iter().map(|(_, r)| r.meta.size).sum();
        let chunk_size_target = parts.first().map_or(0, |(_, r)| r.meta.size);
        let created_at = parts
            .iter()
            .filter_map(|(_, r)| r.meta.modified)
            .max()
            .unwrap_or_else(Utc::now);

        let mut manifest = FileManifest::pending(
            path,
            total_size,
            chunk_size_target,
            upload_id.to_string(),
            None,
        );
        manifest.created_at = created_at;
        for (index, resource) in parts {
            manifest.append(ChunkDescriptor {
                index,
                location: path::file_name(&resource.path).to_string(),
                size: resource.meta.size,
                checksum: None,
            })?;
        }
        manifest.commit()?;
        Ok(manifest)
    }
}

/// Outcome of one pending-manifest sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Abandoned uploads removed.
    pub swept: usize,
    /// Pending uploads younger than the age limit.
    pub kept: usize,
    /// Paths skipped because an upload holds their lock.
    pub busy: usize,
}

/// Reads and writes manifests on the backend.
pub struct ManifestStore {
    backend: BackendClient,
    locks: Arc<PathLockManager>,
    stats: Arc<ProxyStats>,
    /// Paths with a pending record, seen in listings or written here.
    pending: DashMap<String, ()>,
}

impl ManifestStore {
    pub fn new(
        backend: BackendClient,
        locks: Arc<PathLockManager>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            backend,
            locks,
            stats,
            pending: DashMap::new(),
        }
    }

    /// Returns the committed manifest of `path`, if it has one.
    ///
    /// A corrupt sidecar is rebuilt from the chunk names in the parent
    /// collection, but only when the path's write lock is free. Otherwise,
    /// or if the rebuild fails, `ManifestCorrupt` is returned.
    pub async fn get(&self, path: &str) -> ProxyResult<Option<FileManifest>> {
        match self.read_sidecar(path).await? {
            None => Ok(None),
            Some(Ok(manifest)) => Ok(Some(manifest)),
            Some(Err(cause)) => {
                let Some(_guard) = self.locks.try_write(path) else {
                    warn!(path, "Manifest sidecar unusable ({cause}), path busy");
                    return Err(ProxyError::ManifestCorrupt {
                        path: path.to_string(),
                        source: cause,
                    });
                };
                warn!(path, "Manifest sidecar unusable ({cause}), rebuilding from chunks");
                self.heal(path).await.map(Some)
            }
        }
    }

    /// Like [`ManifestStore::get`], for callers already holding the write
    /// lock of `path`.
    pub async fn get_locked(&self, path: &str) -> ProxyResult<Option<FileManifest>> {
        match self.read_sidecar(path).await? {
            None => Ok(None),
            Some(Ok(manifest)) => Ok(Some(manifest)),
            Some(Err(cause)) => {
                warn!(path, "Manifest sidecar unusable ({cause}), rebuilding from chunks");
                self.heal(path).await.map(Some)
            }
        }
    }

    async fn read_sidecar(
        &self,
        path: &str,
    ) -> ProxyResult<Option<Result<FileManifest, ManifestError>>> {
        let Some(data) = self.backend.get_bytes(&path::sidecar_path(path)).await? else {
            return Ok(None);
        };
        Ok(Some(FileManifest::from_json(&data).and_then(|m| {
            m.validate_committed(path)?;
            Ok(m)
        })))
    }

    /// Upload id of the sidecar of `path`, valid or not.
    async fn committed_upload(&self, path: &str) -> ProxyResult<Option<String>> {
        let Some(data) = self.backend.get_bytes(&path::sidecar_path(path)).await? else {
            return Ok(None);
        };
        FileManifest::from_json(&data)
            .map(|m| Some(m.upload_id))
            .map_err(|source| ProxyError::ManifestCorrupt {
                path: path.to_string(),
                source,
            })
    }

    /// Returns the pending manifest of `path`, if an upload left one.
    pub async fn get_pending(&self, path: &str) -> ProxyResult<Option<FileManifest>> {
        let Some(data) = self.backend.get_bytes(&path::pending_path(path)).await? else {
            return Ok(None);
        };
        FileManifest::from_json(&data)
            .map(Some)
            .map_err(|source| ProxyError::ManifestCorrupt {
                path: path.to_string(),
                source,
            })
    }

    /// Writes the committed manifest, replacing any previous one in a single
    /// backend PUT.
    pub async fn put(&self, manifest: &FileManifest) -> ProxyResult<()> {
        let path = &manifest.original_path;
        if manifest.state != ManifestState::Committed {
            return Err(ProxyError::ManifestCorrupt {
                path: path.clone(),
                source: ManifestError::NotCommitted,
            });
        }
        let data = self.encode(manifest)?;
        self.backend
            .put_bytes(&path::sidecar_path(path), data, MANIFEST_CONTENT_TYPE)
            .await?;
        debug!(path = %path, chunks = manifest.chunks.len(), "Manifest committed");
        Ok(())
    }

    /// Writes (or rewrites) the pending record of an upload in progress.
    pub async fn put_pending(&self, manifest: &FileManifest) -> ProxyResult<()> {
        let path = &manifest.original_path;
        let data = self.encode(manifest)?;
        self.pending.insert(path.clone(), ());
        self.backend
            .put_bytes(&path::pending_path(path), data, MANIFEST_CONTENT_TYPE)
            .await?;
        Ok(())
    }

    /// Hands the chunks of `manifest` that could not be deleted to the
    /// sweep, by recording them as a pending upload at `path`.
    ///
    /// A pending record also keeps the leftovers from being rebuilt into a
    /// visible file.
    pub async fn park(&self, path: &str, manifest: &FileManifest) -> ProxyResult<()> {
        let mut leftover = manifest.clone();
        leftover.original_path = path.to_string();
        leftover.state = ManifestState::Pending;
        self.put_pending(&leftover).await
    }

    /// Deletes the committed manifest; returns false if there was none.
    pub async fn delete(&self, path: &str) -> ProxyResult<bool> {
        self.backend.delete(&path::sidecar_path(path)).await
    }

    /// Deletes the pending record of `path`.
    pub async fn delete_pending(&self, path: &str) -> ProxyResult<()> {
        self.backend.delete(&path::pending_path(path)).await?;
        self.pending.remove(path);
        Ok(())
    }

    /// Remembers that `path` has a pending record, for the sweep.
    pub fn note_pending(&self, path: &str) {
        self.pending.insert(path.to_string(), ());
    }

    /// Number of paths tracked for the sweep.
    pub fn tracked_pending(&self) -> usize {
        self.pending.len()
    }

    /// Rebuilds the manifest of `path` from a fresh listing of its parent.
    /// The caller holds the write lock.
    async fn heal(&self, path: &str) -> ProxyResult<FileManifest> {
        let listing = self.backend.propfind(path::parent(path), Depth::One).await?;
        let in_progress = match self.get_pending(path).await {
            Ok(pending) => pending.map(|m| m.upload_id),
            Err(_) => None,
        };
        self.rebuild_from_listing(path, &listing, in_progress.as_deref())
            .await
    }

    /// Rebuilds and stores the manifest of `path` from `listing`. The caller
    /// holds the write lock.
    pub async fn rebuild_from_listing(
        &self,
        path: &str,
        listing: &[Resource],
        exclude_upload: Option<&str>,
    ) -> ProxyResult<FileManifest> {
        match FileManifest::reconstruct(path, listing, exclude_upload) {
            Ok(manifest) => {
                self.put(&manifest).await?;
                self.stats.record_manifest_healed();
                info!(
                    path,
                    chunks = manifest.chunks.len(),
                    size = manifest.total_size,
                    "Rebuilt manifest from chunk listing"
                );
                Ok(manifest)
            }
            Err(source) => {
                error!(path, "Manifest reconstruction failed: {source}");
                Err(ProxyError::ManifestCorrupt {
                    path: path.to_string(),
                    source,
                })
            }
        }
    }

    /// Removes abandoned uploads older than `max_age`.
    ///
    /// Paths whose lock is held (an upload is running) are skipped.
    pub async fn sweep_pending(&self, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let paths: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();

        for path in paths {
            let Some(_guard) = self.locks.try_write(&path) else {
                report.busy += 1;
                continue;
            };
            let manifest = match self.get_pending(&path).await {
                Ok(Some(manifest)) => manifest,
                Ok(None) => {
                    self.pending.remove(&path);
                    continue;
                }
                Err(e) => {
                    warn!(path = %path, "Cannot read pending manifest: {e}");
                    report.kept += 1;
                    continue;
                }
            };
            let age = Utc::now()
                .signed_duration_since(manifest.created_at)
                .to_std()
                .unwrap_or_default();
            if age < max_age {
                report.kept += 1;
                continue;
            }
            match self.retire(&path, &manifest).await {
                Ok(true) => {
                    report.swept += 1;
                    self.stats.record_pending_swept();
                    info!(path = %path, upload = %manifest.upload_id, "Swept abandoned upload");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path, "Sweeping abandoned upload failed: {e}");
                    report.kept += 1;
                }
            }
        }
        report
    }

    /// Removes the pending record an earlier attempt left at `path`, with
    /// its chunks. The caller holds the write lock, so no upload is running.
    pub async fn clear_leftover(&self, path: &str) -> ProxyResult<()> {
        if let Some(manifest) = self.get_pending(path).await? {
            info!(path, upload = %manifest.upload_id, "Clearing leftovers of an earlier upload");
            self.retire(path, &manifest).await?;
        }
        Ok(())
    }

    /// Removes a stale pending record. Its chunks go too, unless the
    /// committed manifest belongs to the same upload (the record outlived a
    /// successful commit). Returns whether chunks were discarded.
    async fn retire(&self, path: &str, manifest: &FileManifest) -> ProxyResult<bool> {
        if self.committed_upload(path).await?.as_deref() == Some(manifest.upload_id.as_str()) {
            debug!(
                path,
                upload = %manifest.upload_id,
                "Removing pending record of a committed upload"
            );
            self.delete_pending(path).await?;
            return Ok(false);
        }
        self.discard_upload(path, manifest).await?;
        Ok(true)
    }

    /// Deletes every chunk of an abandoned upload, recorded or merely present
    /// in the parent listing, then its pending record. The record stays if
    /// any chunk survives.
    async fn discard_upload(&self, path: &str, manifest: &FileManifest) -> ProxyResult<()> {
        let parent = path::parent(path);
        let name = path::file_name(path);
        let mut doomed = manifest.chunk_paths(path);
        for resource in self.backend.propfind(parent, Depth::One).await? {
            if let Some(ReservedName::Chunk {
                target, upload_id, ..
            }) = path::classify(path::file_name(&resource.path))
                && target == name
                && upload_id == manifest.upload_id
                && !doomed.contains(&resource.path)
            {
                doomed.push(resource.path);
            }
        }
        for chunk in &doomed {
            self.backend.delete(chunk).await?;
        }
        self.delete_pending(path).await
    }

    fn encode(&self, manifest: &FileManifest) -> ProxyResult<Bytes> {
        manifest
            .to_json()
            .map_err(|source| ProxyError::ManifestCorrupt {
                path: manifest.original_path.clone(),
                source,
            })
    }
}
