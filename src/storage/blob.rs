//! Content blob files.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::temp_file::TempFileGuard;

/// Reference to a fully written blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: String,
    pub length: u64,
    /// blake3 of the content, lowercase hex
    pub hash: String,
}

/// Blob that is complete on disk but not yet referenced by a committed
/// record. Dropping it removes the file.
#[derive(Debug)]
pub struct StagedBlob {
    pub blob: BlobRef,
    guard: TempFileGuard,
}

impl StagedBlob {
    /// Call once a batch referencing the blob has committed.
    pub fn keep(self) -> BlobRef {
        self.guard.defuse();
        self.blob
    }
}

/// Streaming writer for a new blob. Hashes everything written through it.
pub struct BlobWriter {
    id: String,
    file: File,
    guard: TempFileGuard,
    hasher: blake3::Hasher,
    length: u64,
}

impl BlobWriter {
    pub(super) async fn create(dir: &Path) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = dir.join(&id);
        let guard = TempFileGuard::new(&path);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        Ok(Self {
            id,
            file,
            guard,
            hasher: blake3::Hasher::new(),
            length: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub async fn finish(mut self) -> Result<StagedBlob> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        Ok(StagedBlob {
            blob: BlobRef {
                id: self.id,
                length: self.length,
                hash: self.hasher.finalize().to_hex().to_string(),
            },
            guard: self.guard,
        })
    }
}

impl AsyncWrite for BlobWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.length += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writer_hashes_content() {
        let dir = TempDir::new().unwrap();
        let mut writer = BlobWriter::create(dir.path()).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        let staged = writer.finish().await.unwrap();

        assert_eq!(staged.blob.length, 11);
        assert_eq!(
            staged.blob.hash,
            blake3::hash(b"hello world").to_hex().to_string()
        );

        let blob = staged.keep();
        let content = std::fs::read(dir.path().join(&blob.id)).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn test_unfinished_writer_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut writer = BlobWriter::create(dir.path()).await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        let path = dir.path().join(writer.id());
        drop(writer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_staged_blob_dropped_before_commit() {
        let dir = TempDir::new().unwrap();
        let writer = BlobWriter::create(dir.path()).await.unwrap();
        let staged = writer.finish().await.unwrap();
        let path = dir.path().join(&staged.blob.id);
        assert!(path.exists());
        drop(staged);
        assert!(!path.exists());
    }
}
