use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

use super::{BlobRef, FileRecord, Storage, LAST_ETAG_KEY};
use crate::error::{Result, SyncError};
use crate::metadata::{keys, Metadata};
use crate::tag::Etag;

/// Read/write view of storage inside one [`Storage::batch`].
///
/// Writes are staged here and become visible to later reads in the same
/// batch. They reach the keyspace only through [`commit`](Self::commit).
pub struct StorageAccessor<'a> {
    storage: &'a Storage,
    files: BTreeMap<String, Option<FileRecord>>,
    config: BTreeMap<String, Option<Vec<u8>>>,
    last_etag: u128,
    etag_dirty: bool,
    released_blobs: Vec<String>,
}

impl<'a> StorageAccessor<'a> {
    pub(super) fn new(storage: &'a Storage, last_etag: u128) -> Self {
        Self {
            storage,
            files: BTreeMap::new(),
            config: BTreeMap::new(),
            last_etag,
            etag_dirty: false,
            released_blobs: Vec::new(),
        }
    }

    fn next_etag(&mut self) -> Etag {
        self.last_etag += 1;
        self.etag_dirty = true;
        Etag::from_counter(self.last_etag)
    }

    fn release(&mut self, record: &FileRecord) {
        if let Some(blob) = &record.blob {
            self.released_blobs.push(blob.clone());
        }
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub fn get_file(&self, name: &str) -> Result<Option<FileRecord>> {
        if let Some(staged) = self.files.get(name) {
            return Ok(staged.clone());
        }
        match self.storage.files.get(name)? {
            Some(value) => Ok(Some(bincode::deserialize(value.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Create or replace `name`. `content` of `None` stores a record without
    /// content. The stored `ETag` and `Content-Hash` are always assigned here.
    pub fn put_file(
        &mut self,
        name: &str,
        mut metadata: Metadata,
        content: Option<&BlobRef>,
    ) -> Result<Etag> {
        if let Some(existing) = self.get_file(name)? {
            if existing.blob.as_deref() != content.map(|c| c.id.as_str()) {
                self.release(&existing);
            }
        }

        let etag = self.next_etag();
        metadata.insert(keys::ETAG, etag.to_hex());
        match content {
            Some(blob) => metadata.insert(keys::CONTENT_HASH, blob.hash.clone()),
            None => {
                metadata.remove(keys::CONTENT_HASH);
            }
        }

        let record = FileRecord {
            name: name.to_string(),
            metadata,
            blob: content.map(|c| c.id.clone()),
            length: content.map(|c| c.length).unwrap_or(0),
        };
        self.files.insert(name.to_string(), Some(record));
        Ok(etag)
    }

    /// Replace the metadata of an existing file. Content and its hash stay.
    pub fn update_metadata(&mut self, name: &str, mut metadata: Metadata) -> Result<Etag> {
        let mut record = self
            .get_file(name)?
            .ok_or_else(|| SyncError::not_found(name))?;

        let etag = self.next_etag();
        metadata.insert(keys::ETAG, etag.to_hex());
        match record.metadata.content_hash() {
            Some(hash) => metadata.insert(keys::CONTENT_HASH, hash.to_string()),
            None => {
                metadata.remove(keys::CONTENT_HASH);
            }
        }
        record.metadata = metadata;
        self.files.insert(name.to_string(), Some(record));
        Ok(etag)
    }

    pub fn delete_file(&mut self, name: &str) -> Result<Option<FileRecord>> {
        let existing = self.get_file(name)?;
        if let Some(record) = &existing {
            self.release(record);
            self.files.insert(name.to_string(), None);
        }
        Ok(existing)
    }

    /// Move `old` to `new`, replacing anything stored under `new`.
    pub fn rename_file(&mut self, old: &str, new: &str) -> Result<Etag> {
        let mut record = self.get_file(old)?.ok_or_else(|| SyncError::not_found(old))?;
        if let Some(target) = self.get_file(new)? {
            if target.blob != record.blob {
                self.release(&target);
            }
        }

        let etag = self.next_etag();
        record.name = new.to_string();
        record.metadata.insert(keys::ETAG, etag.to_hex());
        self.files.insert(old.to_string(), None);
        self.files.insert(new.to_string(), Some(record));
        Ok(etag)
    }

    /// All records, staged writes included, ordered by name.
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let mut records: BTreeMap<String, FileRecord> = BTreeMap::new();
        for item in self.storage.files.iter() {
            let (key, value) = item?;
            let record: FileRecord = bincode::deserialize(value.as_ref())?;
            records.insert(String::from_utf8_lossy(key.as_ref()).into_owned(), record);
        }
        for (name, staged) in &self.files {
            match staged {
                Some(record) => records.insert(name.clone(), record.clone()),
                None => records.remove(name),
            };
        }
        Ok(records.into_values().collect())
    }

    // =========================================================================
    // Configuration entries
    // =========================================================================

    fn raw_config(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.config.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.storage.config.get(key)?.map(|v| v.to_vec()))
    }

    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.raw_config(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn config_exists(&self, key: &str) -> Result<bool> {
        Ok(self.raw_config(key)?.is_some())
    }

    pub fn set_config<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.config.insert(key.to_string(), Some(raw));
        Ok(())
    }

    /// Returns whether an entry existed.
    pub fn delete_config(&mut self, key: &str) -> Result<bool> {
        let existed = self.config_exists(key)?;
        if existed {
            self.config.insert(key.to_string(), None);
        }
        Ok(existed)
    }

    /// Keys starting with `prefix`, ordered.
    pub fn config_names(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = std::collections::BTreeSet::new();
        for item in self.storage.config.prefix(prefix) {
            let (key, _) = item?;
            names.insert(String::from_utf8_lossy(key.as_ref()).into_owned());
        }
        for (key, staged) in self.config.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match staged {
                Some(_) => names.insert(key.clone()),
                None => names.remove(key),
            };
        }
        Ok(names.into_iter().collect())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Write staged changes. Returns the etag counter and the blobs no longer
    /// referenced by any record.
    pub(super) fn commit(self) -> Result<(u128, Vec<String>)> {
        if self.files.is_empty() && self.config.is_empty() && !self.etag_dirty {
            return Ok((self.last_etag, Vec::new()));
        }

        let mut batch = self.storage.keyspace.batch();
        for (name, staged) in &self.files {
            match staged {
                Some(record) => {
                    batch.insert(&self.storage.files, name.as_str(), bincode::serialize(record)?)
                }
                None => batch.remove(&self.storage.files, name.as_str()),
            }
        }
        for (key, staged) in &self.config {
            match staged {
                Some(raw) => batch.insert(&self.storage.config, key.as_str(), raw.as_slice()),
                None => batch.remove(&self.storage.config, key.as_str()),
            }
        }
        if self.etag_dirty {
            batch.insert(
                &self.storage.meta,
                LAST_ETAG_KEY,
                self.last_etag.to_be_bytes().as_slice(),
            );
        }
        batch.commit()?;

        let referenced: Vec<&str> = self
            .files
            .values()
            .flatten()
            .filter_map(|r| r.blob.as_deref())
            .collect();
        let released = self
            .released_blobs
            .into_iter()
            .filter(|blob| !referenced.contains(&blob.as_str()))
            .collect();

        Ok((self.last_etag, released))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_names_merge_staged_entries() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .batch(|accessor| {
                accessor.set_config("sync/reports/a", &1)?;
                accessor.set_config("sync/reports/b", &2)?;
                accessor.set_config("sync/locks/a", &3)
            })
            .unwrap();

        storage
            .batch(|accessor| {
                accessor.delete_config("sync/reports/a")?;
                accessor.set_config("sync/reports/c", &4)?;
                assert_eq!(
                    accessor.config_names("sync/reports/")?,
                    vec!["sync/reports/b".to_string(), "sync/reports/c".to_string()]
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_metadata_missing_file() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let err = storage
            .batch(|accessor| accessor.update_metadata("nope", Metadata::new()))
            .unwrap_err();
        assert!(matches!(err, SyncError::FileNotFound(_)));
    }

    #[test]
    fn test_tombstone_records_have_no_content() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .batch(|accessor| {
                accessor.put_file(
                    "gone",
                    Metadata::new()
                        .with(keys::SYNC_DELETED, "true")
                        .with(keys::CONTENT_HASH, "stale"),
                    None,
                )
            })
            .unwrap();

        let record = storage.file("gone").unwrap().unwrap();
        assert!(record.is_tombstone());
        assert_eq!(record.blob, None);
        assert_eq!(record.content_hash(), None);
        assert_eq!(storage.batch(|a| a.list_files()).unwrap().len(), 1);
    }
}
