//! The logical view of the backend tree.
//!
//! Listings hide every reserved name and show one file per committed
//! manifest, with the manifest's size and entity tag. Chunk parts left
//! without a manifest (a lost sidecar) are turned back into a file by
//! rebuilding the manifest from their names.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::{StreamExt, stream};
use tracing::{debug, warn};

use crate::backend::{BackendClient, Depth};
use crate::cache::{Lookup, MetadataCache};
use crate::error::{ProxyError, ProxyResult};
use crate::locks::PathLockManager;
use crate::manifest::ManifestStore;
use crate::metadata::{Resource, ResourceMeta};
use crate::path::{self, ReservedName};

/// Manifests fetched concurrently while building a listing.
const MANIFEST_FETCH_CONCURRENCY: usize = 8;

/// Stat and list operations over logical paths.
pub struct Namespace {
    backend: BackendClient,
    cache: Arc<MetadataCache>,
    manifests: Arc<ManifestStore>,
    locks: Arc<PathLockManager>,
}

impl Namespace {
    pub fn new(
        backend: BackendClient,
        cache: Arc<MetadataCache>,
        manifests: Arc<ManifestStore>,
        locks: Arc<PathLockManager>,
    ) -> Self {
        Self {
            backend,
            cache,
            manifests,
            locks,
        }
    }

    /// Metadata of `path`, from the cache or a listing of its parent.
    pub async fn stat(&self, path: &str) -> ProxyResult<Resource> {
        match self.cache.lookup(path) {
            Lookup::Found(entry) => {
                return Ok(Resource {
                    path: entry.path,
                    meta: entry.meta,
                });
            }
            Lookup::Absent => return Err(ProxyError::NotFound(path.to_string())),
            Lookup::Unknown => {}
        }

        if path == "/" {
            let generation = self.cache.generation();
            let root = self
                .backend
                .propfind("/", Depth::Zero)
                .await?
                .into_iter()
                .find(|r| r.path == "/")
                .unwrap_or_else(|| Resource {
                    path: "/".to_string(),
                    meta: ResourceMeta::collection(None),
                });
            self.cache.put_if_current(generation, &root.path, root.meta.clone());
            return Ok(root);
        }

        let (_, children) = match self.list(path::parent(path)).await {
            Ok(listing) => listing,
            Err(e) if e.is_not_found() => return Err(ProxyError::NotFound(path.to_string())),
            Err(e) => return Err(e),
        };
        children
            .into_iter()
            .find(|child| child.path == path)
            .ok_or_else(|| ProxyError::NotFound(path.to_string()))
    }

    /// The collection at `path` and its visible children.
    ///
    /// When `path` is a file, the file is returned with no children.
    pub async fn list(&self, path: &str) -> ProxyResult<(Resource, Vec<Resource>)> {
        if let Some((meta, children)) = self.cache.compose_listing(path) {
            debug!(path, children = children.len(), "Listing served from cache");
            return Ok((
                Resource {
                    path: path.to_string(),
                    meta,
                },
                children,
            ));
        }

        // A write that lands while the backend is listed makes this listing stale.
        let generation = self.cache.generation();
        let raw = self.backend.propfind(path, Depth::One).await?;
        let (own, raw_children): (Vec<Resource>, Vec<Resource>) =
            raw.into_iter().partition(|r| r.path == path);
        let collection = own.into_iter().next().unwrap_or_else(|| Resource {
            path: path.to_string(),
            meta: ResourceMeta::collection(None),
        });
        if !collection.meta.is_collection {
            self.cache
                .put_if_current(generation, &collection.path, collection.meta.clone());
            return Ok((collection, Vec::new()));
        }

        let children = self.synthesize(path, &raw_children).await;
        self.cache
            .put_listing_if_current(generation, &collection, &children);
        Ok((collection, children))
    }

    /// Builds the visible children of `parent` from a raw backend listing.
    async fn synthesize(&self, parent: &str, raw: &[Resource]) -> Vec<Resource> {
        let mut visible: BTreeMap<String, Resource> = BTreeMap::new();
        let mut sidecars: BTreeSet<&str> = BTreeSet::new();
        let mut chunked: BTreeSet<&str> = BTreeSet::new();
        let mut pending: BTreeSet<&str> = BTreeSet::new();

        for resource in raw {
            let name = path::file_name(&resource.path);
            match path::classify(name) {
                Some(ReservedName::Sidecar { target }) => {
                    sidecars.insert(target);
                }
                Some(ReservedName::Pending { target }) => {
                    self.manifests.note_pending(&path::join(parent, target));
                    pending.insert(target);
                }
                Some(ReservedName::Chunk { target, .. }) => {
                    chunked.insert(target);
                }
                None => {
                    visible.insert(name.to_string(), resource.clone());
                }
            }
        }

        let lookups: Vec<(String, String)> = sidecars
            .iter()
            .map(|target| ((*target).to_string(), path::join(parent, target)))
            .collect();
        let fetched: Vec<(String, String, ProxyResult<_>)> = stream::iter(lookups)
            .map(|(target, logical)| {
                let manifests = Arc::clone(&self.manifests);
                async move {
                    let result = manifests.get(&logical).await;
                    (target, logical, result)
                }
            })
            .buffer_unordered(MANIFEST_FETCH_CONCURRENCY)
            .collect()
            .await;
        for (target, logical, result) in fetched {
            match result {
                Ok(Some(manifest)) => {
                    visible.insert(
                        target,
                        Resource {
                            path: logical,
                            meta: manifest.meta(),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %logical, "Hiding chunked object with unusable manifest: {e}");
                }
            }
        }

        // Chunks without a sidecar and without an upload in progress.
        for target in chunked.difference(&sidecars) {
            if pending.contains(target) {
                continue;
            }
            let logical = path::join(parent, target);
            let Some(_guard) = self.locks.try_write(&logical) else {
                continue;
            };
            if let Ok(manifest) = self.manifests.rebuild_from_listing(&logical, raw, None).await {
                visible.insert(
                    (*target).to_string(),
                    Resource {
                        path: logical,
                        meta: manifest.meta(),
                    },
                );
            }
        }

        visible.into_values().collect()
    }
}
