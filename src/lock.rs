//! File lock manager.
//!
//! A lock is a config entry under `sync/locks/<file>`, created and removed
//! inside the same batch as the check that guards it. Locks never expire;
//! a stale lock left by a crash is cleared with [`force_unlock`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::storage::StorageAccessor;
use crate::tag::{Etag, ServerId};

pub const LOCKS_PREFIX: &str = "sync/locks/";

pub fn lock_key(file: &str) -> String {
    format!("{}{}", LOCKS_PREFIX, file)
}

/// Who holds the lock on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub file_name: String,
    pub source_server_id: ServerId,
    /// Source version being written
    pub file_etag: Etag,
    /// RFC 3339
    pub acquired_at: String,
}

pub fn is_locked(accessor: &StorageAccessor<'_>, file: &str) -> Result<bool> {
    accessor.config_exists(&lock_key(file))
}

pub fn assert_not_locked(accessor: &StorageAccessor<'_>, file: &str) -> Result<()> {
    if is_locked(accessor, file)? {
        return Err(SyncError::FileLocked(file.to_string()));
    }
    Ok(())
}

/// Take the lock, failing if it is already held.
pub fn lock(
    accessor: &mut StorageAccessor<'_>,
    file: &str,
    source_server_id: ServerId,
    file_etag: Etag,
) -> Result<()> {
    assert_not_locked(accessor, file)?;
    let entry = FileLock {
        file_name: file.to_string(),
        source_server_id,
        file_etag,
        acquired_at: chrono::Utc::now().to_rfc3339(),
    };
    accessor.set_config(&lock_key(file), &entry)?;
    tracing::debug!("Locked {} for synchronization from {}", file, source_server_id);
    Ok(())
}

pub fn unlock(accessor: &mut StorageAccessor<'_>, file: &str) -> Result<bool> {
    let released = accessor.delete_config(&lock_key(file))?;
    if released {
        tracing::debug!("Unlocked {}", file);
    }
    Ok(released)
}

pub fn locked_files(accessor: &StorageAccessor<'_>) -> Result<Vec<FileLock>> {
    let mut locks = Vec::new();
    for key in accessor.config_names(LOCKS_PREFIX)? {
        if let Some(entry) = accessor.get_config(&key)? {
            locks.push(entry);
        }
    }
    Ok(locks)
}

/// Administrative removal of a lock.
pub fn force_unlock(accessor: &mut StorageAccessor<'_>, file: &str) -> Result<bool> {
    let released = accessor.delete_config(&lock_key(file))?;
    if released {
        tracing::warn!("Forcibly released lock on {}", file);
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let source = ServerId::from_bytes([1; 16]);

        storage
            .batch(|accessor| lock(accessor, "a", source, Etag::from_counter(1)))
            .unwrap();
        let err = storage
            .batch(|accessor| lock(accessor, "a", source, Etag::from_counter(2)))
            .unwrap_err();
        assert!(matches!(err, SyncError::FileLocked(ref f) if f == "a"));
        assert_eq!(err.to_string(), "File a is being synced");

        // Other files are unaffected
        storage
            .batch(|accessor| lock(accessor, "b", source, Etag::from_counter(3)))
            .unwrap();

        let locks = storage.batch(|accessor| locked_files(accessor)).unwrap();
        assert_eq!(locks.len(), 2);
        assert_eq!(locks[0].file_etag, Etag::from_counter(1));
    }

    #[test]
    fn test_unlock_releases() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let source = ServerId::from_bytes([1; 16]);

        storage
            .batch(|accessor| lock(accessor, "a", source, Etag::EMPTY))
            .unwrap();
        assert!(storage.batch(|accessor| unlock(accessor, "a")).unwrap());
        assert!(!storage.batch(|accessor| unlock(accessor, "a")).unwrap());
        storage
            .batch(|accessor| assert_not_locked(accessor, "a"))
            .unwrap();
    }

    #[test]
    fn test_failed_batch_leaves_no_lock() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let source = ServerId::from_bytes([1; 16]);

        let result: Result<()> = storage.batch(|accessor| {
            lock(accessor, "a", source, Etag::EMPTY)?;
            Err(SyncError::Transfer("boom".into()))
        });
        assert!(result.is_err());
        assert!(!storage.batch(|accessor| is_locked(accessor, "a")).unwrap());
    }

    #[test]
    fn test_force_unlock_clears_stale_lock() {
        let dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage
                .batch(|accessor| lock(accessor, "a", ServerId::EMPTY, Etag::EMPTY))
                .unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.batch(|accessor| is_locked(accessor, "a")).unwrap());
        assert!(storage.batch(|accessor| force_unlock(accessor, "a")).unwrap());
        assert!(!storage.batch(|accessor| is_locked(accessor, "a")).unwrap());
    }
}
