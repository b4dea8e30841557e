//! Local file API.
//!
//! Every write here is a local change: it goes through version bookkeeping
//! so it can later be propagated. Deletes and renames leave tombstones.

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncRead;

use super::SyncServer;
use crate::error::{Result, SyncError};
use crate::history;
use crate::metadata::{keys, Metadata};
use crate::notify::FileChangeAction;
use crate::storage::{FileRecord, DOWNLOADING_SUFFIX};
use crate::tag::Etag;

/// A live file as listed to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub length: u64,
    pub metadata: Metadata,
}

impl From<FileRecord> for FileInfo {
    fn from(record: FileRecord) -> Self {
        Self {
            name: record.name,
            length: record.length,
            metadata: record.metadata,
        }
    }
}

pub(super) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.ends_with(DOWNLOADING_SUFFIX) {
        return Err(SyncError::Protocol(format!("Invalid file name '{}'", name)));
    }
    Ok(())
}

pub(super) fn live(record: Option<FileRecord>, name: &str) -> Result<FileRecord> {
    record
        .filter(|r| !r.is_tombstone() && !r.is_transient())
        .ok_or_else(|| SyncError::not_found(name))
}

impl SyncServer {
    pub(super) fn history_length(&self) -> usize {
        self.config.synchronization.history_length
    }

    pub(super) fn forget_signatures(&self, name: &str) {
        if let Err(e) = self.signatures.remove_file(name) {
            tracing::warn!("Failed to remove signatures of {}: {}", name, e);
        }
    }

    /// Store `content` under `name`, creating or replacing the file.
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        name: &str,
        metadata: Metadata,
        content: &mut R,
    ) -> Result<Etag> {
        validate_name(name)?;
        let staged = self.storage.write_blob(content).await?;

        let (record, replaced) = self.storage.batch(|accessor| {
            let existing = accessor.get_file(name)?;
            let mut metadata = metadata.user_entries();
            history::record_local_write(
                existing.as_ref().map(|r| &r.metadata),
                &mut metadata,
                &self.id,
                self.history_length(),
            )?;
            accessor.put_file(name, metadata, Some(&staged.blob))?;
            let record = live(accessor.get_file(name)?, name)?;
            Ok((record, existing.map_or(false, |r| !r.is_tombstone())))
        })?;
        staged.keep();

        tracing::info!(
            "Stored {} ({} bytes, version {})",
            name,
            record.length,
            history::version(&record.metadata)
        );
        self.forget_signatures(name);
        self.search.index(name, &record.metadata);
        self.notifier.file_changed(
            name,
            if replaced {
                FileChangeAction::Update
            } else {
                FileChangeAction::Add
            },
        );
        Ok(record.etag())
    }

    /// Replace the user metadata of `name`. Content is untouched.
    pub fn update_metadata(&self, name: &str, metadata: Metadata) -> Result<Etag> {
        let record = self.storage.batch(|accessor| {
            let existing = live(accessor.get_file(name)?, name)?;
            let mut metadata = metadata.user_entries();
            history::record_local_write(
                Some(&existing.metadata),
                &mut metadata,
                &self.id,
                self.history_length(),
            )?;
            accessor.update_metadata(name, metadata)?;
            live(accessor.get_file(name)?, name)
        })?;

        tracing::debug!("Updated metadata of {}", name);
        self.search.index(name, &record.metadata);
        self.notifier.file_changed(name, FileChangeAction::Update);
        Ok(record.etag())
    }

    /// Move `old` to `new`. A tombstone pointing at `new` stays at `old`.
    pub fn rename(&self, old: &str, new: &str) -> Result<Etag> {
        validate_name(new)?;
        self.notifier.file_changed(old, FileChangeAction::Renaming);

        let record = self.storage.batch(|accessor| {
            let existing = live(accessor.get_file(old)?, old)?;
            if let Some(target) = accessor.get_file(new)? {
                if !target.is_tombstone() {
                    return Err(SyncError::Protocol(format!(
                        "Cannot rename {} to {}: target exists",
                        old, new
                    )));
                }
            }

            let mut metadata = existing.metadata.user_entries();
            history::record_local_write(
                Some(&existing.metadata),
                &mut metadata,
                &self.id,
                self.history_length(),
            )?;
            accessor.rename_file(old, new)?;

            // The tombstone gets the older etag so it is propagated first
            let mut tombstone = metadata.clone();
            tombstone.insert(keys::SYNC_DELETED, "true");
            tombstone.insert(keys::SYNC_RENAME, new);
            accessor.put_file(old, tombstone, None)?;
            accessor.update_metadata(new, metadata)?;
            live(accessor.get_file(new)?, new)
        })?;

        tracing::info!("Renamed {} to {}", old, new);
        self.forget_signatures(old);
        self.search.delete(old);
        self.search.index(new, &record.metadata);
        self.notifier.file_changed(new, FileChangeAction::Renamed);
        Ok(record.etag())
    }

    /// Delete `name`, leaving a tombstone for propagation.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.storage.batch(|accessor| {
            let existing = live(accessor.get_file(name)?, name)?;
            let mut metadata = existing.metadata.user_entries();
            history::record_local_write(
                Some(&existing.metadata),
                &mut metadata,
                &self.id,
                self.history_length(),
            )?;
            metadata.insert(keys::SYNC_DELETED, "true");
            accessor.put_file(name, metadata, None)?;
            Ok(())
        })?;

        tracing::info!("Deleted {}", name);
        self.forget_signatures(name);
        self.search.delete(name);
        self.notifier.file_changed(name, FileChangeAction::Delete);
        Ok(())
    }

    /// Open the content of a live file.
    pub async fn download(&self, name: &str) -> Result<File> {
        let record = live(self.storage.file(name)?, name)?;
        self.storage
            .open_content(&record)
            .await?
            .ok_or_else(|| SyncError::not_found(name))
    }

    /// Metadata of a live file.
    pub fn get_metadata(&self, name: &str) -> Result<Option<Metadata>> {
        Ok(self
            .storage
            .file(name)?
            .filter(|r| !r.is_tombstone() && !r.is_transient())
            .map(|r| r.metadata))
    }

    /// Metadata as peers see it: tombstones included.
    pub fn file_metadata(&self, name: &str) -> Result<Option<Metadata>> {
        Ok(self
            .storage
            .file(name)?
            .filter(|r| !r.is_transient())
            .map(|r| r.metadata))
    }

    pub fn list_files(&self) -> Result<Vec<FileInfo>> {
        let records = self.storage.batch(|accessor| accessor.list_files())?;
        Ok(records
            .into_iter()
            .filter(|r| !r.is_tombstone() && !r.is_transient())
            .map(FileInfo::from)
            .collect())
    }

    pub fn search(&self, query: &str) -> Vec<String> {
        self.search.query(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::destination::InProcessResolver;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn server(dir: &TempDir) -> SyncServer {
        SyncServer::open(
            Config::new(dir.path(), "local:1"),
            Arc::new(InProcessResolver::new()),
        )
        .unwrap()
    }

    async fn read_all(server: &SyncServer, name: &str) -> Vec<u8> {
        let mut content = Vec::new();
        server
            .download(name)
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        content
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let metadata = Metadata::new().with("Owner", "alice");
        server
            .upload("a.txt", metadata, &mut Cursor::new(b"hello".to_vec()))
            .await
            .unwrap();

        assert_eq!(read_all(&server, "a.txt").await, b"hello");
        let stored = server.get_metadata("a.txt").unwrap().unwrap();
        assert_eq!(stored.get("owner"), Some("alice"));
        assert_eq!(history::version(&stored), 1);
        assert_eq!(
            stored.content_hash(),
            Some(blake3::hash(b"hello").to_hex().as_str())
        );
    }

    #[tokio::test]
    async fn test_user_cannot_set_control_keys() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let metadata = Metadata::new()
            .with(keys::SYNC_VERSION, "99")
            .with(keys::CONTENT_HASH, "bogus");
        server
            .upload("a", metadata, &mut Cursor::new(b"x".to_vec()))
            .await
            .unwrap();

        let stored = server.get_metadata("a").unwrap().unwrap();
        assert_eq!(history::version(&stored), 1);
        assert_ne!(stored.content_hash(), Some("bogus"));
    }

    #[tokio::test]
    async fn test_metadata_update_bumps_version_and_keeps_hash() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .upload("a", Metadata::new(), &mut Cursor::new(b"content".to_vec()))
            .await
            .unwrap();
        let before = server.get_metadata("a").unwrap().unwrap();

        server
            .update_metadata("a", Metadata::new().with("Tag", "x"))
            .unwrap();
        let after = server.get_metadata("a").unwrap().unwrap();

        assert_eq!(history::version(&after), 2);
        assert_eq!(after.content_hash(), before.content_hash());
        assert_ne!(after.etag(), before.etag());
        assert_eq!(server.search("Tag:x"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_leaves_tombstone() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .upload("old", Metadata::new(), &mut Cursor::new(b"data".to_vec()))
            .await
            .unwrap();

        server.rename("old", "new").unwrap();

        assert!(server.get_metadata("old").unwrap().is_none());
        let tombstone = server.file_metadata("old").unwrap().unwrap();
        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.renamed_to(), Some("new"));
        assert_eq!(read_all(&server, "new").await, b"data");
        assert_eq!(
            server
                .list_files()
                .unwrap()
                .into_iter()
                .map(|f| f.name)
                .collect::<Vec<_>>(),
            vec!["new".to_string()]
        );
        assert_eq!(server.search("new"), vec!["new".to_string()]);
        assert!(server.search("old").is_empty());
    }

    #[tokio::test]
    async fn test_delete_hides_file() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .upload("a", Metadata::new(), &mut Cursor::new(b"data".to_vec()))
            .await
            .unwrap();

        server.delete("a").unwrap();

        assert!(server.get_metadata("a").unwrap().is_none());
        assert!(server.download("a").await.is_err());
        assert!(server.list_files().unwrap().is_empty());
        assert!(matches!(
            server.delete("a").unwrap_err(),
            SyncError::FileNotFound(_)
        ));

        // Re-creating continues the lineage
        server
            .upload("a", Metadata::new(), &mut Cursor::new(b"again".to_vec()))
            .await
            .unwrap();
        let stored = server.get_metadata("a").unwrap().unwrap();
        assert_eq!(history::version(&stored), 3);
    }

    #[tokio::test]
    async fn test_search_index_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let server = server(&dir);
            server
                .upload("kept", Metadata::new(), &mut Cursor::new(b"1".to_vec()))
                .await
                .unwrap();
            server
                .upload("gone", Metadata::new(), &mut Cursor::new(b"2".to_vec()))
                .await
                .unwrap();
            server.delete("gone").unwrap();
        }
        let server = server(&dir);
        assert_eq!(server.search(""), vec!["kept".to_string()]);
    }
}
