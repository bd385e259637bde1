//! Streaming reads of chunked objects.
//!
//! A read is planned against the committed manifest, then served by opening
//! one backend stream per intersecting chunk, strictly in index order. Only
//! the first chunk is opened before the response headers go out; every
//! later chunk is opened when the previous one is exhausted.
//!
//! Each chunk stream is length-checked. Once headers are sent an error can
//! only end the body early, so the client sees a short transfer rather than
//! wrong bytes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use hyper::StatusCode;
use pin_project_lite::pin_project;
use tracing::{debug, error};

use crate::backend::{BackendClient, response_stream};
use crate::body::{self, ProxyBody};
use crate::error::{ProxyError, ProxyResult};
use crate::manifest::{FileManifest, ManifestError};
use crate::path;
use crate::range::{ByteRange, ChunkSlice, parse_range, plan};
use crate::retry::{RetryPolicy, is_transient};
use crate::stats::ProxyStats;

type ChunkStream = Pin<Box<dyn Stream<Item = ProxyResult<Bytes>> + Send>>;

pin_project! {
    /// Passes exactly `remaining` bytes of `inner` after dropping the first
    /// `skip`.
    ///
    /// Missing bytes are an error. Surplus bytes are an error too, unless
    /// `truncate` is set (the backend sent the whole chunk instead of the
    /// requested sub-range), in which case they are discarded.
    pub struct ExactLength<S> {
        #[pin]
        inner: S,
        skip: u64,
        remaining: u64,
        truncate: bool,
        done: bool,
    }
}

impl<S> ExactLength<S> {
    pub fn new(inner: S, skip: u64, len: u64, truncate: bool) -> Self {
        Self {
            inner,
            skip,
            remaining: len,
            truncate,
            done: false,
        }
    }
}

impl<S> Stream for ExactLength<S>
where
    S: Stream<Item = ProxyResult<Bytes>>,
{
    type Item = ProxyResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if *this.done {
                return Poll::Ready(None);
            }
            if *this.truncate && *this.remaining == 0 && *this.skip == 0 {
                *this.done = true;
                return Poll::Ready(None);
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(mut buf)) => {
                    if *this.skip > 0 {
                        let n = usize::try_from(*this.skip).unwrap_or(usize::MAX).min(buf.len());
                        buf = buf.slice(n..);
                        *this.skip -= n as u64;
                    }
                    if buf.is_empty() {
                        continue;
                    }
                    let len = buf.len() as u64;
                    if len > *this.remaining {
                        if !*this.truncate {
                            *this.done = true;
                            return Poll::Ready(Some(Err(ProxyError::BackendUnavailable(
                                "chunk is longer than its manifest entry".into(),
                            ))));
                        }
                        let keep = usize::try_from(*this.remaining).unwrap_or(usize::MAX);
                        buf.truncate(keep);
                    }
                    *this.remaining -= buf.len() as u64;
                    return Poll::Ready(Some(Ok(buf)));
                }
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    *this.done = true;
                    if *this.remaining > 0 || *this.skip > 0 {
                        return Poll::Ready(Some(Err(ProxyError::BackendUnavailable(format!(
                            "chunk ended {} bytes early",
                            *this.remaining + *this.skip
                        )))));
                    }
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// A planned read, ready to be sent.
pub struct Reassembly {
    /// The range served, when the client asked for one.
    pub range: Option<ByteRange>,
    /// Number of body bytes.
    pub len: u64,
    pub body: ProxyBody,
}

impl Reassembly {
    pub fn status(&self) -> StatusCode {
        if self.range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }
}

/// Serves GETs of chunked objects.
pub struct ReassemblyStreamer {
    backend: BackendClient,
    stats: Arc<ProxyStats>,
    retry: RetryPolicy,
}

impl ReassemblyStreamer {
    pub fn new(backend: BackendClient, stats: Arc<ProxyStats>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            stats,
            retry,
        }
    }

    /// Plans the read of `path` and opens its first chunk.
    ///
    /// A `Range` header in another unit, or one that does not parse, is
    /// ignored and the whole object is served.
    pub async fn open(
        &self,
        path: &str,
        manifest: &FileManifest,
        range_header: Option<&str>,
    ) -> ProxyResult<Reassembly> {
        let total = manifest.total_size;
        let requested = match range_header {
            Some(header) => parse_range(header, total)?,
            None => None,
        };
        let Some(wanted) = requested.or_else(|| ByteRange::full(total)) else {
            return Ok(Reassembly {
                range: None,
                len: 0,
                body: body::empty(),
            });
        };

        let mut slices = plan(manifest, &wanted).into_iter();
        let Some(first) = slices.next() else {
            return Err(ProxyError::ManifestCorrupt {
                path: path.to_string(),
                source: ManifestError::ChunkCount {
                    expected: manifest.expected_chunks(),
                    found: manifest.chunks.len(),
                },
            });
        };
        debug!(
            path,
            start = wanted.start,
            end = wanted.end,
            chunks = slices.len() + 1,
            "Reassembling chunked object"
        );
        self.stats.record_chunked_read();

        let parent = path::parent(path).to_string();
        let first = open_slice(
            self.backend.clone(),
            self.retry.clone(),
            path::join(&parent, &first.location),
            first,
        )
        .await?;

        let backend = self.backend.clone();
        let retry = self.retry.clone();
        let rest = stream::iter(slices)
            .then(move |slice| {
                open_slice(
                    backend.clone(),
                    retry.clone(),
                    path::join(&parent, &slice.location),
                    slice,
                )
            })
            .try_flatten();

        let logical = path.to_string();
        let counted = Arc::clone(&self.stats);
        let failures = Arc::clone(&self.stats);
        let body = first
            .chain(rest)
            .inspect_ok(move |buf| counted.record_bytes_downloaded(buf.len() as u64))
            .inspect_err(move |e| {
                failures.record_truncated_stream();
                error!(path = %logical, "Chunked read aborted mid-stream: {e}");
            });

        Ok(Reassembly {
            range: requested,
            len: wanted.len(),
            body: body::stream(body),
        })
    }
}

/// Opens the backend stream for one slice, retrying transient failures.
async fn open_slice(
    backend: BackendClient,
    retry: RetryPolicy,
    chunk_path: String,
    slice: ChunkSlice,
) -> ProxyResult<ChunkStream> {
    let sub_range = slice.sub_range();
    let response = retry
        .run("chunk read", is_transient, |_| {
            backend.get_stream(&chunk_path, sub_range)
        })
        .await?;
    // A 200 to a ranged request means the backend sent the whole chunk.
    let ignored_range = sub_range.is_some() && response.status() != StatusCode::PARTIAL_CONTENT;
    let skip = if ignored_range { slice.offset } else { 0 };
    Ok(Box::pin(ExactLength::new(
        response_stream(response),
        skip,
        slice.len,
        ignored_range,
    )))
}
