//! Chunked uploads, deletes and copies of large objects.
//!
//! A PUT of at least `FILE_MAX_SIZE` bytes is cut into parts of the chunk
//! size target. Each part is spooled to disk, uploaded to
//! `<name>.<upload id>.part<NNNN>` next to the logical file and recorded in
//! a pending manifest. When the last part is stored the committed manifest
//! replaces the previous one in a single PUT and the superseded chunks are
//! deleted. Any failure before that point deletes everything the attempt
//! wrote. Chunks that refuse to go keep their pending record, which hides
//! them from readers and leaves them to the sweep.
//!
//! Every operation here holds the per-path write lock for its whole run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hyper::StatusCode;
use hyper::header::HeaderValue;
use reqwest::Body;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendClient, Depth};
use crate::body::RequestStream;
use crate::cache::MetadataCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::locks::PathLockManager;
use crate::manifest::{
    ChunkDescriptor, FileManifest, ManifestStore, chunk_count, chunk_len, new_upload_id,
};
use crate::path;
use crate::retry::{RetryPolicy, is_chunk_retryable};
use crate::spool::{BodySplitter, SpooledFile, spool_body};
use crate::stats::{ProxyStats, format_bytes};

/// Drives chunked writes.
pub struct ChunkManager {
    backend: BackendClient,
    manifests: Arc<ManifestStore>,
    cache: Arc<MetadataCache>,
    locks: Arc<PathLockManager>,
    stats: Arc<ProxyStats>,
    threshold: u64,
    chunk_size: u64,
    pipeline_depth: usize,
    retry: RetryPolicy,
    upload_timeout: Duration,
    spool_dir: PathBuf,
}

/// What a write found at its target before it started.
struct Existing {
    manifest: Option<FileManifest>,
    plain: bool,
}

impl Existing {
    fn exists(&self) -> bool {
        self.manifest.is_some() || self.plain
    }

    fn etag(&self) -> Option<&str> {
        self.manifest.as_ref().map(|m| m.entity_tag.as_str())
    }
}

impl ChunkManager {
    pub fn new(
        config: &ProxyConfig,
        backend: BackendClient,
        manifests: Arc<ManifestStore>,
        cache: Arc<MetadataCache>,
        locks: Arc<PathLockManager>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            backend,
            manifests,
            cache,
            locks,
            stats,
            threshold: config.file_max_size,
            chunk_size: config.chunk_size(),
            pipeline_depth: config.chunk_pipeline_depth.max(1),
            retry: RetryPolicy::new(config.chunk_retries),
            upload_timeout: config.chunk_upload_timeout(),
            spool_dir: config.spool_dir(),
        }
    }

    /// Whether a body of `len` bytes is stored in chunks.
    pub fn should_chunk(&self, len: u64) -> bool {
        len >= self.threshold
    }

    /// Stores a PUT body at `path`, chunked or passed through by size.
    ///
    /// The write runs in its own task under the path's write lock, so a
    /// client that goes away mid-upload still gets its partial data rolled
    /// back.
    pub async fn put(
        self: &Arc<Self>,
        path: &str,
        body: RequestStream,
        content_length: Option<u64>,
        content_type: Option<HeaderValue>,
    ) -> ProxyResult<StatusCode> {
        let guard = self.locks.write(path).await;
        let this = Arc::clone(self);
        let path = path.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = this
                .put_locked(&path, body, content_length, content_type)
                .await;
            this.cache.invalidate(&path);
            result
        });
        task.await.map_err(|e| ProxyError::Io(std::io::Error::other(e)))?
    }

    async fn put_locked(
        &self,
        path: &str,
        body: RequestStream,
        content_length: Option<u64>,
        content_type: Option<HeaderValue>,
    ) -> ProxyResult<StatusCode> {
        // Without a declared length the body is spooled to learn its size.
        let mut spooled: Option<SpooledFile> = None;
        let (body, len) = match content_length {
            Some(len) => (body, len),
            None => {
                let file = spool_body(body, &self.spool_dir).await?;
                let len = file.len();
                let reader: RequestStream = Box::pin(file.reader().await?);
                spooled = Some(file);
                (reader, len)
            }
        };
        let existing = self.inspect(path).await?;

        let result = if self.should_chunk(len) {
            let content_type = content_type
                .as_ref()
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            self.upload_chunked(path, body, len, content_type, &existing)
                .await
        } else {
            self.pass_through(path, body, len, content_type.as_ref(), &existing)
                .await
        };
        drop(spooled);
        result
    }

    async fn inspect(&self, path: &str) -> ProxyResult<Existing> {
        // The new upload takes over the pending slot of `path`.
        if let Err(e) = self.manifests.clear_leftover(path).await {
            warn!(path, "Could not clear leftovers of an earlier upload: {e}");
        }
        let manifest = match self.manifests.get_locked(path).await {
            Ok(manifest) => manifest,
            Err(ProxyError::ManifestCorrupt { source, .. }) => {
                warn!(path, "Overwriting unusable manifest: {source}");
                None
            }
            Err(e) => return Err(e),
        };
        let plain = matches!(
            self.backend.propfind(path, Depth::Zero).await,
            Ok(found) if found.iter().any(|r| !r.meta.is_collection)
        );
        Ok(Existing { manifest, plain })
    }

    async fn pass_through(
        &self,
        path: &str,
        body: RequestStream,
        len: u64,
        content_type: Option<&HeaderValue>,
        existing: &Existing,
    ) -> ProxyResult<StatusCode> {
        let status = self
            .backend
            .put_stream(path, Body::wrap_stream(body), Some(len), content_type)
            .await?;
        if let Some(old) = &existing.manifest {
            info!(path, "Replacing chunked object with a plain file");
            self.discard(path, old).await?;
        }
        Ok(status)
    }

    async fn upload_chunked(
        &self,
        path: &str,
        body: RequestStream,
        len: u64,
        content_type: Option<String>,
        existing: &Existing,
    ) -> ProxyResult<StatusCode> {
        let mut manifest =
            FileManifest::pending(path, len, self.chunk_size, new_upload_id(), content_type);
        self.manifests.put_pending(&manifest).await?;
        self.stats.record_chunked_upload();
        info!(
            path,
            upload = %manifest.upload_id,
            size = %format_bytes(len),
            chunks = manifest.expected_chunks(),
            "Starting chunked upload"
        );

        let mut started = 0;
        let outcome = match self.store_chunks(path, body, &mut manifest, &mut started).await {
            Ok(()) => self.commit(path, &mut manifest, existing).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.rollback(path, &manifest.upload_id, started).await;
            return Err(e);
        }

        self.supersede(path, existing).await;
        info!(path, upload = %manifest.upload_id, "Chunked upload committed");
        Ok(if existing.exists() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        })
    }

    /// Spools and uploads every part. `started` counts parts whose upload
    /// was started, so rollback knows which names may exist.
    async fn store_chunks(
        &self,
        path: &str,
        body: RequestStream,
        manifest: &mut FileManifest,
        started: &mut usize,
    ) -> ProxyResult<()> {
        let mut splitter = BodySplitter::new(body, &self.spool_dir);
        let mut pipeline: VecDeque<JoinHandle<ProxyResult<ChunkDescriptor>>> = VecDeque::new();
        let count = chunk_count(manifest.total_size, manifest.chunk_size_target);

        let mut result = Ok(());
        for index in 0..count {
            let len = chunk_len(manifest.total_size, manifest.chunk_size_target, index);
            let part = match splitter.next_part(len).await {
                Ok(part) => part,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            *started = index + 1;
            pipeline.push_back(self.spawn_upload(path, &manifest.upload_id, index, part));

            if pipeline.len() >= self.pipeline_depth
                && let Some(handle) = pipeline.pop_front()
                && let Err(e) = self.record(path, manifest, handle).await
            {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = splitter.expect_end().await;
        }
        while let Some(handle) = pipeline.pop_front() {
            if result.is_ok() {
                result = self.record(path, manifest, handle).await;
            } else {
                // Let uploads already sent finish before rollback deletes their names.
                let _ = handle.await;
            }
        }
        result
    }

    fn spawn_upload(
        &self,
        path: &str,
        upload_id: &str,
        index: usize,
        part: SpooledFile,
    ) -> JoinHandle<ProxyResult<ChunkDescriptor>> {
        let backend = self.backend.clone();
        let stats = Arc::clone(&self.stats);
        let retry = self.retry.clone();
        let timeout = self.upload_timeout;
        let logical = path.to_string();
        let location = path::chunk_name(path::file_name(path), upload_id, index);
        let chunk_path = path::join(path::parent(path), &location);

        tokio::spawn(async move {
            retry
                .run("chunk upload", is_chunk_retryable, |attempt| {
                    if attempt > 0 {
                        stats.record_chunk_retry();
                    }
                    backend.put_file(&chunk_path, part.path(), part.len(), timeout)
                })
                .await
                .map_err(|e| ProxyError::ChunkUploadFailure {
                    path: logical.clone(),
                    index,
                    reason: e.to_string(),
                })?;
            stats.record_chunk_uploaded(part.len());
            debug!(path = %logical, index, size = part.len(), "Chunk stored");
            Ok(ChunkDescriptor {
                index,
                location,
                size: part.len(),
                checksum: Some(part.checksum().to_string()),
            })
        })
    }

    /// Waits for one upload and appends it to the pending manifest.
    async fn record(
        &self,
        path: &str,
        manifest: &mut FileManifest,
        handle: JoinHandle<ProxyResult<ChunkDescriptor>>,
    ) -> ProxyResult<()> {
        let descriptor = handle.await.map_err(|e| ProxyError::ChunkUploadFailure {
            path: path.to_string(),
            index: manifest.chunks.len(),
            reason: e.to_string(),
        })??;
        manifest
            .append(descriptor)
            .map_err(|source| ProxyError::ManifestCorrupt {
                path: path.to_string(),
                source,
            })?;
        self.manifests.put_pending(manifest).await
    }

    /// Makes the upload visible, unless another writer got there first.
    async fn commit(
        &self,
        path: &str,
        manifest: &mut FileManifest,
        existing: &Existing,
    ) -> ProxyResult<()> {
        let current = match self.manifests.get_locked(path).await {
            Ok(current) => current,
            Err(ProxyError::ManifestCorrupt { .. }) => None,
            Err(e) => return Err(e),
        };
        if current.as_ref().map(|m| m.entity_tag.as_str()) != existing.etag() {
            warn!(path, "Manifest changed during upload, abandoning commit");
            return Err(ProxyError::ManifestConflict {
                path: path.to_string(),
            });
        }
        manifest
            .commit()
            .map_err(|source| ProxyError::ManifestCorrupt {
                path: path.to_string(),
                source,
            })?;
        self.manifests.put(manifest).await?;
        // A leftover record is harmless: the sweep sees the upload committed.
        if let Err(e) = self
            .retry
            .run("pending record cleanup", is_chunk_retryable, |_| {
                self.manifests.delete_pending(path)
            })
            .await
        {
            warn!(path, "Could not remove pending manifest after commit: {e}");
        }
        Ok(())
    }

    /// Removes what a committed upload replaced: the old chunks and any
    /// plain file at the same path. Failures only leave unreferenced data.
    async fn supersede(&self, path: &str, existing: &Existing) {
        if let Some(old) = &existing.manifest
            && !self.delete_chunks(path, old).await
        {
            self.park(path, old).await;
        }
        if existing.plain
            && let Err(e) = self.backend.delete(path).await
        {
            warn!(path, "Could not remove replaced plain file: {e}");
        }
    }

    /// Deletes the chunks an aborted attempt may have written, then its
    /// pending record. The record stays while any chunk survives.
    async fn rollback(&self, path: &str, upload_id: &str, started: usize) {
        self.stats.record_rollback();
        error!(path, upload = upload_id, chunks = started, "Rolling back chunked write");
        let name = path::file_name(path);
        let parent = path::parent(path);
        let mut clean = true;
        for index in 0..started {
            let chunk = path::join(parent, &path::chunk_name(name, upload_id, index));
            if let Err(e) = self.backend.delete(&chunk).await {
                warn!(chunk = %chunk, "Rollback could not delete chunk: {e}");
                clean = false;
            }
        }
        if !clean {
            warn!(
                path,
                upload = upload_id,
                "Chunks left behind; keeping pending record for the sweep"
            );
            self.manifests.note_pending(path);
            return;
        }
        if let Err(e) = self.manifests.delete_pending(path).await {
            warn!(path, "Rollback could not delete pending manifest: {e}");
        }
    }

    /// Deletes every chunk of `manifest`. Returns false if any is left.
    async fn delete_chunks(&self, path: &str, manifest: &FileManifest) -> bool {
        let deletions = manifest.chunk_paths(path).into_iter().map(|chunk| async move {
            match self.backend.delete(&chunk).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(chunk = %chunk, "Could not delete chunk: {e}");
                    false
                }
            }
        });
        futures::stream::iter(deletions)
            .buffer_unordered(self.pipeline_depth)
            .fold(true, |clean, deleted| async move { clean && deleted })
            .await
    }

    /// Records chunks that survived a delete as an abandoned upload.
    async fn park(&self, path: &str, manifest: &FileManifest) {
        warn!(path, upload = %manifest.upload_id, "Chunks left behind; handing them to the sweep");
        if let Err(e) = self.manifests.park(path, manifest).await {
            warn!(path, "Could not record leftover chunks: {e}");
        }
    }

    /// Deletes the manifest, then the chunks, of `path`. The caller holds
    /// the write lock.
    async fn discard(&self, path: &str, manifest: &FileManifest) -> ProxyResult<()> {
        self.manifests.delete(path).await?;
        if !self.delete_chunks(path, manifest).await {
            self.park(path, manifest).await;
        }
        Ok(())
    }

    /// DELETE of a logical path. Returns false when `path` is not chunked,
    /// leaving it to the caller to pass the request through.
    pub async fn remove(&self, path: &str) -> ProxyResult<bool> {
        let _guard = self.locks.write(path).await;
        let Some(manifest) = self.manifests.get_locked(path).await? else {
            return Ok(false);
        };
        self.discard(path, &manifest).await?;
        // A stale plain file would otherwise resurface.
        if let Err(e) = self.backend.delete(path).await {
            warn!(path, "Could not remove plain file behind chunked object: {e}");
        }
        self.cache.invalidate(path);
        info!(path, chunks = manifest.chunks.len(), "Deleted chunked object");
        Ok(true)
    }

    /// Drops the manifest of `path` after a pass-through write replaced it.
    pub async fn forget(&self, path: &str) -> ProxyResult<()> {
        let _guard = self.locks.write(path).await;
        if let Some(manifest) = self.manifests.get_locked(path).await? {
            self.discard(path, &manifest).await?;
        }
        self.cache.invalidate(path);
        Ok(())
    }

    /// COPY (or MOVE, with `remove_source`) of a chunked object.
    ///
    /// Chunks are copied server-side under fresh names, so source and
    /// destination never share parts.
    pub async fn relocate(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        remove_source: bool,
    ) -> ProxyResult<StatusCode> {
        if from == to {
            return Err(ProxyError::Forbidden(format!(
                "source and destination are the same: {from}"
            )));
        }
        let _guards = self.locks.write_ordered(&[from, to]).await;
        let source = self
            .manifests
            .get_locked(from)
            .await?
            .ok_or_else(|| ProxyError::NotFound(from.to_string()))?;
        let existing = self.inspect(to).await?;
        if existing.exists() && !overwrite {
            return Err(ProxyError::PreconditionFailed(to.to_string()));
        }

        let mut manifest = FileManifest::pending(
            to,
            source.total_size,
            source.chunk_size_target,
            new_upload_id(),
            source.content_type.clone(),
        );
        self.manifests.put_pending(&manifest).await?;

        let mut started = 0;
        let outcome = match self.copy_chunks(from, &source, &mut manifest, &mut started).await {
            Ok(()) => self.commit(to, &mut manifest, &existing).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.rollback(to, &manifest.upload_id, started).await;
            self.cache.invalidate(to);
            return Err(e);
        }
        self.supersede(to, &existing).await;
        self.cache.invalidate(to);

        if remove_source {
            self.discard(from, &source).await?;
            self.cache.invalidate(from);
        }
        info!(
            from,
            to,
            moved = remove_source,
            chunks = manifest.chunks.len(),
            "Relocated chunked object"
        );
        Ok(if existing.exists() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        })
    }

    async fn copy_chunks(
        &self,
        from: &str,
        source: &FileManifest,
        manifest: &mut FileManifest,
        started: &mut usize,
    ) -> ProxyResult<()> {
        let to = manifest.original_path.clone();
        let target_name = path::file_name(&to).to_string();
        let target_parent = path::parent(&to).to_string();
        let source_parent = path::parent(from);

        for chunk in &source.chunks {
            let location = path::chunk_name(&target_name, &manifest.upload_id, chunk.index);
            *started = chunk.index + 1;
            self.backend
                .copy(
                    &path::join(source_parent, &chunk.location),
                    &path::join(&target_parent, &location),
                    true,
                )
                .await
                .map_err(|e| ProxyError::ChunkUploadFailure {
                    path: to.clone(),
                    index: chunk.index,
                    reason: e.to_string(),
                })?;
            manifest
                .append(ChunkDescriptor {
                    location,
                    ..chunk.clone()
                })
                .map_err(|source| ProxyError::ManifestCorrupt {
                    path: to.clone(),
                    source,
                })?;
        }
        self.manifests.put_pending(manifest).await
    }
}
