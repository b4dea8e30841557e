//! Transactional file and configuration storage.
//!
//! Records and configuration entries live in a fjall keyspace; content bytes
//! live in blob files next to it. All mutations go through
//! [`Storage::batch`], which stages writes in an overlay and commits them as a
//! single fjall batch only when the closure succeeds.

mod accessor;
mod blob;

pub use accessor::StorageAccessor;
pub use blob::{BlobRef, BlobWriter, StagedBlob};

use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncRead;

use crate::error::{Result, SyncError};
use crate::metadata::Metadata;
use crate::tag::Etag;

const LAST_ETAG_KEY: &str = "last_etag";

/// Suffix of the record holding an in-progress incoming content transfer.
pub const DOWNLOADING_SUFFIX: &str = ".downloading";

pub fn downloading_name(file: &str) -> String {
    format!("{}{}", file, DOWNLOADING_SUFFIX)
}

/// Stored state of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub metadata: Metadata,
    /// Content blob id. `None` for tombstones.
    pub blob: Option<String>,
    pub length: u64,
}

impl FileRecord {
    pub fn etag(&self) -> Etag {
        self.metadata.etag().unwrap_or_default()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.metadata.content_hash()
    }

    pub fn is_tombstone(&self) -> bool {
        self.metadata.is_tombstone()
    }

    /// Internal records that never surface to users or peers.
    pub fn is_transient(&self) -> bool {
        self.name.ends_with(DOWNLOADING_SUFFIX)
    }
}

pub struct Storage {
    keyspace: Keyspace,
    files: PartitionHandle,
    config: PartitionHandle,
    signatures: PartitionHandle,
    meta: PartitionHandle,
    blob_dir: PathBuf,
    /// Last allocated etag counter. Holding the lock serializes batches.
    last_etag: Mutex<u128>,
}

impl Storage {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let blob_dir = data_dir.join("blobs");
        std::fs::create_dir_all(&blob_dir)?;

        let keyspace = fjall::Config::new(data_dir.join("db")).open()?;
        let files = keyspace.open_partition("files", PartitionCreateOptions::default())?;
        let config = keyspace.open_partition("config", PartitionCreateOptions::default())?;
        let signatures =
            keyspace.open_partition("signatures", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;

        let last_etag = match meta.get(LAST_ETAG_KEY)? {
            Some(value) => {
                let bytes: [u8; 16] = value.as_ref().try_into().map_err(|_| {
                    SyncError::Protocol("Corrupted etag counter in storage".to_string())
                })?;
                u128::from_be_bytes(bytes)
            }
            None => 0,
        };

        tracing::debug!(
            "Opened storage at {} (last etag {})",
            data_dir.display(),
            last_etag
        );

        Ok(Self {
            keyspace,
            files,
            config,
            signatures,
            meta,
            blob_dir,
            last_etag: Mutex::new(last_etag),
        })
    }

    /// Run `f` as one atomic batch. Nothing is written if `f` fails.
    pub fn batch<T>(&self, f: impl FnOnce(&mut StorageAccessor<'_>) -> Result<T>) -> Result<T> {
        let mut last_etag = self.last_etag.lock();
        let mut accessor = StorageAccessor::new(self, *last_etag);
        let value = f(&mut accessor)?;
        let (committed_etag, released) = accessor.commit()?;
        *last_etag = committed_etag;
        drop(last_etag);

        for blob in released {
            self.remove_blob(&blob);
        }
        Ok(value)
    }

    pub fn file(&self, name: &str) -> Result<Option<FileRecord>> {
        self.batch(|accessor| accessor.get_file(name))
    }

    pub fn config_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.batch(|accessor| accessor.get_config(key))
    }

    pub fn last_etag(&self) -> Etag {
        Etag::from_counter(*self.last_etag.lock())
    }

    // =========================================================================
    // Content blobs
    // =========================================================================

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.blob_dir.join(id)
    }

    pub async fn create_blob(&self) -> Result<BlobWriter> {
        BlobWriter::create(&self.blob_dir).await
    }

    /// Stream `reader` into a new blob, hashing as it goes.
    pub async fn write_blob<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<StagedBlob> {
        let mut writer = self.create_blob().await?;
        tokio::io::copy(reader, &mut writer).await?;
        writer.finish().await
    }

    /// Open the content of `record`. Records without content yield `None`.
    pub async fn open_content(&self, record: &FileRecord) -> Result<Option<File>> {
        match &record.blob {
            Some(id) => Ok(Some(File::open(self.blob_path(id)).await?)),
            None => Ok(None),
        }
    }

    fn remove_blob(&self, id: &str) {
        let path = self.blob_path(id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove blob {}: {}", path.display(), e);
            }
        }
    }

    // =========================================================================
    // Signature blobs
    // =========================================================================

    pub fn signature(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .signatures
            .get(key)?
            .map(|value| Bytes::copy_from_slice(value.as_ref())))
    }

    pub fn put_signature(&self, key: &str, value: &[u8]) -> Result<()> {
        self.signatures.insert(key, value)?;
        Ok(())
    }

    pub fn remove_signatures(&self, prefix: &str) -> Result<usize> {
        let mut keys = Vec::new();
        for item in self.signatures.prefix(prefix) {
            let (key, _) = item?;
            keys.push(key);
        }
        let count = keys.len();
        for key in keys {
            self.signatures.remove(key)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::keys;
    use tempfile::TempDir;

    async fn blob(storage: &Storage, content: &[u8]) -> BlobRef {
        let mut reader = std::io::Cursor::new(content.to_vec());
        storage.write_blob(&mut reader).await.unwrap().keep()
    }

    #[tokio::test]
    async fn test_batch_commits_only_on_success() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let result: Result<()> = storage.batch(|accessor| {
            accessor.set_config("sync/locks/a", &true)?;
            Err(SyncError::FileLocked("a".into()))
        });
        assert!(result.is_err());
        assert_eq!(storage.config_value::<bool>("sync/locks/a").unwrap(), None);

        storage
            .batch(|accessor| accessor.set_config("sync/locks/a", &true))
            .unwrap();
        assert_eq!(storage.config_value::<bool>("sync/locks/a").unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_writes_are_visible_within_batch() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let content = blob(&storage, b"hello").await;

        storage
            .batch(|accessor| {
                accessor.put_file("a.txt", Metadata::new(), Some(&content))?;
                let record = accessor.get_file("a.txt")?.unwrap();
                assert_eq!(record.length, 5);
                accessor.rename_file("a.txt", "b.txt")?;
                assert!(accessor.get_file("a.txt")?.is_none());
                Ok(())
            })
            .unwrap();

        let record = storage.file("b.txt").unwrap().unwrap();
        assert_eq!(record.blob.as_deref(), Some(content.id.as_str()));
        assert!(storage.blob_path(&content.id).exists());
    }

    #[tokio::test]
    async fn test_etags_increase_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let first;
        {
            let storage = Storage::open(dir.path()).unwrap();
            let content = blob(&storage, b"x").await;
            first = storage
                .batch(|accessor| accessor.put_file("a", Metadata::new(), Some(&content)))
                .unwrap();
            let second = storage
                .batch(|accessor| accessor.update_metadata("a", Metadata::new().with("k", "v")))
                .unwrap();
            assert!(second > first);
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.last_etag() > first);
        let record = storage.file("a").unwrap().unwrap();
        assert_eq!(record.metadata.get("k"), Some("v"));
    }

    #[tokio::test]
    async fn test_metadata_update_keeps_content_hash() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let content = blob(&storage, b"content").await;

        storage
            .batch(|accessor| accessor.put_file("a", Metadata::new(), Some(&content)))
            .unwrap();
        storage
            .batch(|accessor| {
                accessor.update_metadata("a", Metadata::new().with(keys::CONTENT_HASH, "forged"))
            })
            .unwrap();

        let record = storage.file("a").unwrap().unwrap();
        assert_eq!(record.content_hash(), Some(content.hash.as_str()));
    }

    #[tokio::test]
    async fn test_replaced_blob_is_removed_after_commit() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let old = blob(&storage, b"old").await;
        let new = blob(&storage, b"new").await;

        storage
            .batch(|accessor| accessor.put_file("a", Metadata::new(), Some(&old)))
            .unwrap();
        storage
            .batch(|accessor| accessor.put_file("a", Metadata::new(), Some(&new)))
            .unwrap();

        assert!(!storage.blob_path(&old.id).exists());
        assert!(storage.blob_path(&new.id).exists());
    }

    #[tokio::test]
    async fn test_signature_prefix_removal() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.put_signature("local/a@1.sig0", b"one").unwrap();
        storage.put_signature("local/a@1.sig1", b"two").unwrap();
        storage.put_signature("local/ab@1.sig0", b"other").unwrap();

        assert_eq!(storage.remove_signatures("local/a@").unwrap(), 2);
        assert!(storage.signature("local/ab@1.sig0").unwrap().is_some());
    }
}
