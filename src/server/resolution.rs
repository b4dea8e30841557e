//! Conflict registration and resolution.

use super::files::live;
use super::outgoing::PushOptions;
use super::SyncServer;
use crate::conflict::{self, ConflictItem, ConflictResolution, ConflictResolutionStrategy};
use crate::error::{Result, SyncError};
use crate::history::{self, HistoryItem};
use crate::notify::{ConflictStatus, Notification};
use crate::report::{ListPage, Paging};

impl SyncServer {
    fn publish_conflict(&self, conflict: &ConflictItem, status: ConflictStatus) {
        self.notifier.publish(Notification::Conflict {
            file: conflict.file_name.clone(),
            remote_server_url: conflict.remote_server_url.clone(),
            status,
        });
    }

    /// Register a conflict found outside of a synchronization.
    pub fn apply_conflict(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: Option<String>,
    ) -> Result<()> {
        let conflict = self.storage.batch(|accessor| {
            conflict::apply_conflict(accessor, file, remote, remote_history, remote_server_url)
        })?;

        tracing::warn!(
            "Registered conflict on {} with version {} from {}",
            file,
            remote.version,
            remote.server_id
        );
        self.publish_conflict(&conflict, ConflictStatus::Detected);
        Ok(())
    }

    /// Register a conflict and accept the remote version right away.
    ///
    /// Called by the other side of a conflict that keeps its own version and
    /// is about to push it here.
    pub fn resolve_conflict_in_favor_of_dest(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: String,
    ) -> Result<()> {
        let conflict = self.storage.batch(|accessor| {
            let conflict = conflict::apply_conflict(
                accessor,
                file,
                remote,
                remote_history,
                Some(remote_server_url.clone()),
            )?;
            let directive = ConflictResolution::accept_remote(&remote, Some(remote_server_url));
            conflict::set_resolution(accessor, file, &directive)?;
            Ok(conflict)
        })?;

        tracing::info!(
            "Conflict on {} will be resolved by version {} from {}",
            file,
            remote.version,
            remote.server_id
        );
        self.publish_conflict(&conflict, ConflictStatus::Detected);
        Ok(())
    }

    /// Apply `strategy` to the conflict recorded for `file`.
    pub async fn resolve_conflict(
        &self,
        file: &str,
        strategy: ConflictResolutionStrategy,
    ) -> Result<()> {
        let conflict = self
            .storage
            .batch(|accessor| conflict::get_artifact(accessor, file))?
            .ok_or_else(|| SyncError::FileNotFound(format!("File {} is not conflicted", file)))?;

        match strategy {
            ConflictResolutionStrategy::RemoteVersion => {
                let remote = *conflict.remote().ok_or_else(|| {
                    SyncError::Protocol(format!("Conflict record of {} has no remote version", file))
                })?;
                let directive =
                    ConflictResolution::accept_remote(&remote, conflict.remote_server_url.clone());
                self.storage
                    .batch(|accessor| conflict::set_resolution(accessor, file, &directive))?;
                tracing::info!(
                    "{} will accept version {} from {}",
                    file,
                    remote.version,
                    remote.server_id
                );
                Ok(())
            }
            ConflictResolutionStrategy::CurrentVersion => self.keep_current_version(&conflict).await,
        }
    }

    /// Push the local version back to the server the conflict came from.
    /// The conflict record stays until that push succeeds.
    async fn keep_current_version(&self, conflict: &ConflictItem) -> Result<()> {
        let file = conflict.file_name.as_str();
        let url = conflict.remote_server_url.as_deref().ok_or_else(|| {
            SyncError::Protocol(format!("Conflict on {} has no remote server to push to", file))
        })?;

        let record = live(self.storage.file(file)?, file)?;
        let current = history::current(&record.metadata).ok_or_else(|| {
            SyncError::Protocol(format!("{} has no version to keep", file))
        })?;
        let local_history = history::history(&record.metadata)?;

        let destination = self.resolver.resolve(url)?;
        destination
            .resolve_conflict_in_favor_of_dest(file, current, local_history, self.url().to_string())
            .await?;

        let options = PushOptions {
            allow_conflicted: true,
            check_etag: false,
        };
        let report = self.push_to(file, destination.as_ref(), options).await;
        if let Some(failure) = report.failure {
            tracing::warn!(
                "Failed to push current version of {} to {}: {}",
                file,
                url,
                failure.message
            );
            return Err(SyncError::from_remote(failure.kind, failure.message));
        }

        self.storage
            .batch(|accessor| conflict::remove_artifact(accessor, file))?;
        tracing::info!("Resolved conflict on {} in favor of the local version", file);
        self.publish_conflict(conflict, ConflictStatus::Resolved);
        Ok(())
    }

    pub fn conflicts(&self, paging: Paging) -> Result<ListPage<ConflictItem>> {
        let conflicts = self
            .storage
            .batch(|accessor| conflict::list_artifacts(accessor))?;
        Ok(ListPage::paginate(conflicts, paging))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::destination::InProcessResolver;
    use crate::error::FailureKind;
    use crate::metadata::Metadata;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn pair(dir: &TempDir) -> (Arc<SyncServer>, Arc<SyncServer>) {
        let resolver = Arc::new(InProcessResolver::new());
        let open = |name: &str| {
            Arc::new(
                SyncServer::open(
                    Config::new(dir.path().join(name), format!("{}:1", name)),
                    resolver.clone(),
                )
                .unwrap(),
            )
        };
        let (a, b) = (open("a"), open("b"));
        resolver.register(&a);
        resolver.register(&b);
        (a, b)
    }

    async fn upload(server: &SyncServer, name: &str, content: &[u8]) {
        server
            .upload(name, Metadata::new(), &mut Cursor::new(content.to_vec()))
            .await
            .unwrap();
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

    /// Both servers write `f` independently, then `a` pushes to `b`.
    async fn conflicted_pair(dir: &TempDir) -> (Arc<SyncServer>, Arc<SyncServer>) {
        let (a, b) = pair(dir);
        upload(&a, "f", b"from a").await;
        upload(&b, "f", b"from b").await;
        let report = a.push("f", b.url()).await.unwrap();
        assert_eq!(report.failure_kind(), Some(FailureKind::Conflicted));
        (a, b)
    }

    #[tokio::test]
    async fn test_resolve_without_conflict() {
        let dir = TempDir::new().unwrap();
        let (a, _b) = pair(&dir);
        upload(&a, "f", b"x").await;
        let err = a
            .resolve_conflict("f", ConflictResolutionStrategy::RemoteVersion)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_remote_version_accepts_next_push() {
        let dir = TempDir::new().unwrap();
        let (a, b) = conflicted_pair(&dir).await;

        b.resolve_conflict("f", ConflictResolutionStrategy::RemoteVersion)
            .await
            .unwrap();
        // Still recorded until the accepted version arrives
        assert_eq!(b.conflicts(Paging::default()).unwrap().total_count, 1);

        let report = a.push("f", b.url()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failure);
        assert_eq!(read_all(&b, "f").await, b"from a");
        assert_eq!(b.conflicts(Paging::default()).unwrap().total_count, 0);
        let metadata = b.get_metadata("f").unwrap().unwrap();
        assert!(!metadata.is_conflicted());
        assert!(conflict::resolution(&metadata).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_version_applies_to_one_version_only() {
        let dir = TempDir::new().unwrap();
        let (a, b) = conflicted_pair(&dir).await;
        b.resolve_conflict("f", ConflictResolutionStrategy::RemoteVersion)
            .await
            .unwrap();

        // a moves on before b sees the accepted version
        upload(&a, "f", b"from a, again").await;
        let report = a.push("f", b.url()).await.unwrap();
        assert_eq!(report.failure_kind(), Some(FailureKind::Conflicted));
        assert_eq!(read_all(&b, "f").await, b"from b");
    }

    #[tokio::test]
    async fn test_current_version_is_pushed_back() {
        let dir = TempDir::new().unwrap();
        let (a, b) = conflicted_pair(&dir).await;

        b.resolve_conflict("f", ConflictResolutionStrategy::CurrentVersion)
            .await
            .unwrap();

        assert_eq!(read_all(&a, "f").await, b"from b");
        assert_eq!(read_all(&b, "f").await, b"from b");
        assert!(a.conflicts(Paging::default()).unwrap().items.is_empty());
        assert!(b.conflicts(Paging::default()).unwrap().items.is_empty());
        assert!(!b.get_metadata("f").unwrap().unwrap().is_conflicted());

        let report = a.push("f", b.url()).await.unwrap();
        assert_eq!(report.failure_kind(), Some(FailureKind::NoWorkNeeded));
    }

    #[tokio::test]
    async fn test_apply_conflict_requires_file() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        let err = a
            .apply_conflict("missing", HistoryItem::new(b.id(), 1), vec![], None)
            .unwrap_err();
        assert!(matches!(err, SyncError::FileNotFound(_)));

        upload(&a, "f", b"x").await;
        a.apply_conflict("f", HistoryItem::new(b.id(), 3), vec![], Some(b.url().into()))
            .unwrap();
        let report = a.push("f", b.url()).await.unwrap();
        assert_eq!(report.failure_message(), Some("File f is conflicted"));
    }
}
