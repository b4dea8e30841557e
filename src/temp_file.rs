//! Drop guard for blob files that are still being written.

use std::path::{Path, PathBuf};

/// Removes the guarded file on drop unless [`defuse`](Self::defuse) was
/// called. Used for content blobs that only become reachable once a storage
/// batch referencing them commits.
#[derive(Debug)]
pub struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the file.
    pub fn defuse(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed orphaned blob {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove orphaned blob {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"partial").unwrap();

        drop(TempFileGuard::new(&path));
        assert!(!path.exists());
    }

    #[test]
    fn test_defused_guard_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"complete").unwrap();

        TempFileGuard::new(&path).defuse();
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        drop(TempFileGuard::new(&dir.path().join("never-created")));
    }
}
