//! Spooling of request bodies to temporary files.
//!
//! Chunk uploads need a replayable body (a failed attempt is retried) and a
//! checksum before the part is recorded, so every part is written to disk
//! first. Memory use stays at one network frame per part regardless of the
//! chunk size.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::trace;

use crate::error::{ProxyError, ProxyResult};

/// A body (or part of one) stored in a temporary file.
///
/// The file is deleted when the value is dropped.
#[derive(Debug)]
pub struct SpooledFile {
    file: NamedTempFile,
    len: u64,
    checksum: String,
}

impl SpooledFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `sha256:<hex>` of the contents.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Streams the spooled contents back.
    pub async fn reader(
        &self,
    ) -> ProxyResult<impl Stream<Item = ProxyResult<Bytes>> + Send + 'static> {
        let file = tokio::fs::File::open(self.file.path()).await?;
        Ok(ReaderStream::new(file).map_err(ProxyError::from))
    }
}

/// Creates an empty temporary file in `dir`.
fn create_temp(dir: &Path) -> ProxyResult<(NamedTempFile, tokio::fs::File)> {
    let file = tempfile::Builder::new()
        .prefix("splitdav-")
        .suffix(".part")
        .tempfile_in(dir)?;
    let handle = tokio::fs::File::from_std(file.reopen()?);
    Ok((file, handle))
}

/// Cuts a body stream into consecutive parts of exact sizes.
pub struct BodySplitter<S> {
    stream: S,
    leftover: Bytes,
    dir: PathBuf,
    consumed: u64,
}

impl<S> BodySplitter<S>
where
    S: Stream<Item = ProxyResult<Bytes>> + Unpin,
{
    pub fn new(stream: S, dir: impl Into<PathBuf>) -> Self {
        Self {
            stream,
            leftover: Bytes::new(),
            dir: dir.into(),
            consumed: 0,
        }
    }

    /// Bytes handed out in parts so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    async fn next_buf(&mut self) -> ProxyResult<Option<Bytes>> {
        if !self.leftover.is_empty() {
            return Ok(Some(std::mem::take(&mut self.leftover)));
        }
        loop {
            match self.stream.next().await {
                Some(Ok(buf)) if buf.is_empty() => {}
                Some(Ok(buf)) => return Ok(Some(buf)),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    /// Spools the next `len` bytes. A body that ends early is a client error.
    pub async fn next_part(&mut self, len: u64) -> ProxyResult<SpooledFile> {
        let (file, mut handle) = create_temp(&self.dir)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        while written < len {
            let Some(mut buf) = self.next_buf().await? else {
                return Err(ProxyError::ClientBody(format!(
                    "body ended after {} bytes",
                    self.consumed + written
                )));
            };
            let room = usize::try_from(len - written).unwrap_or(usize::MAX);
            if buf.len() > room {
                self.leftover = buf.split_off(room);
            }
            hasher.update(&buf);
            handle.write_all(&buf).await?;
            written += buf.len() as u64;
        }
        handle.flush().await?;
        handle.sync_data().await?;
        self.consumed += written;
        trace!(len = written, "Spooled part");

        Ok(SpooledFile {
            file,
            len: written,
            checksum: format!("sha256:{}", hex::encode(hasher.finalize())),
        })
    }

    /// Fails if the body carries bytes beyond the parts already taken.
    pub async fn expect_end(&mut self) -> ProxyResult<()> {
        match self.next_buf().await? {
            None => Ok(()),
            Some(_) => Err(ProxyError::ClientBody(format!(
                "body is longer than the declared {} bytes",
                self.consumed
            ))),
        }
    }
}

/// Spools a whole body of unknown size.
pub async fn spool_body<S>(mut stream: S, dir: &Path) -> ProxyResult<SpooledFile>
where
    S: Stream<Item = ProxyResult<Bytes>> + Unpin,
{
    let (file, mut handle) = create_temp(dir)?;
    let mut hasher = Sha256::new();
    let mut len = 0u64;
    while let Some(buf) = stream.try_next().await? {
        hasher.update(&buf);
        handle.write_all(&buf).await?;
        len += buf.len() as u64;
    }
    handle.flush().await?;
    trace!(len, "Spooled body of unknown length");
    Ok(SpooledFile {
        file,
        len,
        checksum: format!("sha256:{}", hex::encode(hasher.finalize())),
    })
}
