//! Destination side of a synchronization.
//!
//! Every incoming operation runs the same stages: take the file lock, check
//! the incoming lineage against the local one, apply the change, then
//! finalize (persist the report, release the lock, record the source etag on
//! success). Failures after the lock is taken still finalize; lock and limit
//! rejections leave no trace.

use tokio::fs::File;

use super::files::{live, validate_name};
use super::SyncServer;
use crate::conflict::{self, ConflictItem};
use crate::destination::{FileRequest, TransferMode};
use crate::error::{Result, SyncError};
use crate::lock;
use crate::metadata::{keys, Metadata};
use crate::notify::{
    ConflictStatus, FileChangeAction, Notification, SynchronizationAction,
    SynchronizationDirection,
};
use crate::rdc::{NeedListWriter, PartReceiver, TransferStats};
use crate::report::{
    report_key, source_key, ListPage, Paging, SourceInfo, SourceSynchronizationInformation,
    SynchronizationConfirmation, SynchronizationReport, SynchronizationStatus,
    SynchronizationType, REPORTS_PREFIX,
};
use crate::storage::{downloading_name, BlobWriter, FileRecord, StorageAccessor};
use crate::tag::{Etag, ServerId};

/// Result of checking an incoming write against local state.
struct Admission {
    local: Option<FileRecord>,
    /// A resolution directive accepted this write
    resolved: bool,
}

enum Decision {
    Proceed { resolved: bool },
    Conflict(ConflictItem),
}

/// Record `etag` as seen from `source` unless a newer one is recorded.
fn record_source(
    accessor: &mut StorageAccessor<'_>,
    source: &SourceInfo,
    etag: Etag,
    destination: ServerId,
) -> Result<bool> {
    let key = source_key(&source.server_id);
    let recorded: Option<SourceSynchronizationInformation> = accessor.get_config(&key)?;
    if let Some(recorded) = recorded {
        if etag < recorded.last_source_file_etag {
            return Ok(false);
        }
    }
    accessor.set_config(
        &key,
        &SourceSynchronizationInformation {
            last_source_file_etag: etag,
            source_server_url: Some(source.server_url.clone()),
            destination_server_id: destination,
        },
    )?;
    Ok(true)
}

/// Incoming metadata without the keys this server owns.
fn incoming_metadata(request: &FileRequest) -> Metadata {
    request.metadata.without_control_keys()
}

impl SyncServer {
    fn publish_sync(&self, request: &FileRequest, sync_type: SynchronizationType, action: SynchronizationAction) {
        self.notifier.publish(Notification::Synchronization {
            file: request.file_name.clone(),
            source_server_id: request.source.server_id,
            sync_type,
            action,
            direction: SynchronizationDirection::Incoming,
        });
    }

    /// Take the lock and clear what a previous attempt left behind.
    fn begin_incoming(&self, request: &FileRequest, sync_type: SynchronizationType) -> Result<()> {
        let name = &request.file_name;
        self.storage.batch(|accessor| {
            lock::assert_not_locked(accessor, name)?;
            accessor.delete_config(&report_key(name))?;
            if sync_type == SynchronizationType::ContentUpdate {
                accessor.delete_file(&downloading_name(name))?;
            }
            lock::lock(accessor, name, request.source.server_id, request.source_etag)
        })?;

        tracing::debug!(
            "Starting {} of {} from {}",
            sync_type,
            name,
            request.source.server_url
        );
        self.publish_sync(request, sync_type, SynchronizationAction::Start);
        Ok(())
    }

    /// Report for an attempt rejected before it took the lock.
    fn rejected(
        &self,
        request: &FileRequest,
        sync_type: SynchronizationType,
        err: SyncError,
    ) -> SynchronizationReport {
        tracing::warn!(
            "Rejected {} of {} from {}: {}",
            sync_type,
            request.file_name,
            request.source.server_url,
            err
        );
        SynchronizationReport::failed(&request.file_name, sync_type, &err)
    }

    /// Check the incoming lineage. A new conflict is recorded before the
    /// `Conflicted` error is returned.
    fn admit(&self, request: &FileRequest) -> Result<Admission> {
        let name = &request.file_name;
        let (local, decision) = self.storage.batch(|accessor| {
            let local = accessor.get_file(name)?;
            let decision = {
                let local_metadata = local
                    .as_ref()
                    .filter(|r| !r.is_tombstone())
                    .map(|r| &r.metadata);
                let found = conflict::detect_conflict(
                    name,
                    local_metadata,
                    &request.metadata,
                    Some(&request.source.server_url),
                )?;
                let resolved = match (local_metadata, &found) {
                    (Some(metadata), Some(found)) => conflict::is_resolved(metadata, found)?,
                    (Some(metadata), None) => {
                        conflict::accepts_incoming(metadata, &request.metadata)?
                    }
                    (None, _) => false,
                };
                if local_metadata.map_or(false, |m| m.is_conflicted()) && !resolved {
                    return Err(SyncError::Conflicted(name.clone()));
                }

                match found {
                    Some(found) if !resolved => Decision::Conflict(found),
                    _ => Decision::Proceed { resolved },
                }
            };
            if let Decision::Conflict(found) = &decision {
                conflict::create_artifact(accessor, name, found)?;
            }
            Ok((local, decision))
        })?;

        match decision {
            Decision::Proceed { resolved } => {
                if resolved {
                    tracing::info!("Incoming version of {} resolves its conflict", name);
                }
                Ok(Admission { local, resolved })
            }
            Decision::Conflict(found) => Err(self.conflict_detected(name, request, &found)),
        }
    }

    fn conflict_detected(&self, name: &str, request: &FileRequest, found: &ConflictItem) -> SyncError {
        tracing::warn!(
            "Conflict on {}: local {:?}, incoming {:?} from {}",
            name,
            found.current,
            found.remote(),
            request.source.server_url
        );
        self.notifier.publish(Notification::Conflict {
            file: name.to_string(),
            remote_server_url: found.remote_server_url.clone(),
            status: ConflictStatus::Detected,
        });
        SyncError::Conflicted(name.to_string())
    }

    /// Persist the report, release the lock and publish the outcome.
    fn finish_incoming(
        &self,
        request: &FileRequest,
        sync_type: SynchronizationType,
        stats: TransferStats,
        result: Result<()>,
    ) -> SynchronizationReport {
        let name = &request.file_name;
        let stored = result.and_then(|()| {
            self.storage
                .batch(|accessor| {
                    record_source(accessor, &request.source, request.source_etag, self.id)
                })
                .map(|_| ())
        });
        let mut report = match &stored {
            Ok(()) => SynchronizationReport::new(name, sync_type),
            Err(e) => SynchronizationReport::failed(name, sync_type, e),
        };
        report.bytes_copied = stats.bytes_copied;
        report.bytes_transferred = stats.bytes_transferred;
        report.need_list_length = stats.need_list_length;

        if stored.is_err() && sync_type == SynchronizationType::ContentUpdate {
            let temp = downloading_name(name);
            if let Err(e) = self.storage.batch(|accessor| accessor.delete_file(&temp)) {
                tracing::warn!("Failed to remove temporary file {}: {}", temp, e);
            }
        }

        if let Err(e) = self
            .storage
            .batch(|accessor| accessor.set_config(&report_key(name), &report))
        {
            tracing::warn!("Failed to store report of {}: {}", name, e);
            if report.is_success() {
                report.failure = Some((&e).into());
            }
        }
        if let Err(e) = self.storage.batch(|accessor| lock::unlock(accessor, name)) {
            tracing::error!("Failed to release lock of {}: {}", name, e);
        }

        match &stored {
            Ok(()) => tracing::info!(
                "Finished {} of {} from {}: {} bytes copied, {} bytes transferred, {} need list items",
                sync_type,
                name,
                request.source.server_url,
                report.bytes_copied,
                report.bytes_transferred,
                report.need_list_length
            ),
            Err(e) => tracing::warn!(
                "Failed {} of {} from {}: {}",
                sync_type,
                name,
                request.source.server_url,
                e
            ),
        }
        self.publish_sync(request, sync_type, SynchronizationAction::Finish);
        report
    }

    // =========================================================================
    // Content
    // =========================================================================

    /// Receive new content for a file as a stream of transfer parts.
    pub async fn receive_content(
        &self,
        request: FileRequest,
        mode: TransferMode,
        parts: PartReceiver,
    ) -> SynchronizationReport {
        let sync_type = SynchronizationType::ContentUpdate;
        if let Err(e) = validate_name(&request.file_name) {
            return self.rejected(&request, sync_type, e);
        }
        if let Err(e) = self.begin_incoming(&request, sync_type) {
            return self.rejected(&request, sync_type, e);
        }

        let mut stats = TransferStats::default();
        let result = match self.admit(&request) {
            Ok(admission) => {
                self.apply_content(&request, mode, parts, admission, &mut stats)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish_incoming(&request, sync_type, stats, result)
    }

    async fn apply_content(
        &self,
        request: &FileRequest,
        mode: TransferMode,
        mut parts: PartReceiver,
        admission: Admission,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let name = &request.file_name;
        let output = self.storage.create_blob().await?;
        let mut writer: NeedListWriter<File, BlobWriter> = match &mode {
            TransferMode::Bytes => NeedListWriter::raw(output),
            TransferMode::NeedList { seed_content_hash } => {
                let local = admission
                    .local
                    .as_ref()
                    .filter(|r| !r.is_tombstone())
                    .ok_or_else(|| {
                        SyncError::Transfer(format!("No local content of {} to use as seed", name))
                    })?;
                if local.content_hash() != Some(seed_content_hash.as_str()) {
                    return Err(SyncError::Transfer(format!(
                        "Local content of {} changed since its signatures were taken",
                        name
                    )));
                }
                NeedListWriter::new(self.storage.open_content(local).await?, output)
            }
        };

        while let Some(part) = parts.recv().await {
            writer.apply_part(part?).await?;
            *stats = writer.stats();
        }
        let (output, final_stats) = writer.finish().await?;
        *stats = final_stats;
        let staged = output.finish().await?;

        let temp = downloading_name(name);
        let metadata = incoming_metadata(request);
        self.storage
            .batch(|accessor| accessor.put_file(&temp, metadata, Some(&staged.blob)))?;
        staged.keep();

        let existed = admission
            .local
            .as_ref()
            .map_or(false, |r| !r.is_tombstone());
        let record = self.storage.batch(|accessor| {
            accessor.delete_file(name)?;
            accessor.rename_file(&temp, name)?;
            if admission.resolved {
                conflict::remove_artifact(accessor, name)?;
            }
            live(accessor.get_file(name)?, name)
        })?;

        self.forget_signatures(name);
        self.search.index(name, &record.metadata);
        self.notifier.file_changed(
            name,
            if existed {
                FileChangeAction::Update
            } else {
                FileChangeAction::Add
            },
        );
        if admission.resolved {
            self.publish_resolved(name, request);
        }
        Ok(())
    }

    fn publish_resolved(&self, name: &str, request: &FileRequest) {
        self.notifier.publish(Notification::Conflict {
            file: name.to_string(),
            remote_server_url: Some(request.source.server_url.clone()),
            status: ConflictStatus::Resolved,
        });
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Replace the metadata of a file. Content and content hash stay.
    pub async fn receive_metadata(&self, request: FileRequest) -> SynchronizationReport {
        let sync_type = SynchronizationType::MetadataUpdate;
        if let Err(e) = self.begin_incoming(&request, sync_type) {
            return self.rejected(&request, sync_type, e);
        }
        let result = self
            .admit(&request)
            .and_then(|admission| self.apply_metadata(&request, admission));
        self.finish_incoming(&request, sync_type, TransferStats::default(), result)
    }

    fn apply_metadata(&self, request: &FileRequest, admission: Admission) -> Result<()> {
        let name = &request.file_name;
        let metadata = incoming_metadata(request);
        let record = self.storage.batch(|accessor| {
            live(accessor.get_file(name)?, name)?;
            accessor.update_metadata(name, metadata)?;
            if admission.resolved {
                conflict::remove_artifact(accessor, name)?;
            }
            live(accessor.get_file(name)?, name)
        })?;

        self.search.index(name, &record.metadata);
        self.notifier.file_changed(name, FileChangeAction::Update);
        if admission.resolved {
            self.publish_resolved(name, request);
        }
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a file. Deleting a file that does not exist succeeds.
    pub async fn receive_delete(&self, request: FileRequest) -> SynchronizationReport {
        let sync_type = SynchronizationType::Delete;
        if let Err(e) = self.begin_incoming(&request, sync_type) {
            return self.rejected(&request, sync_type, e);
        }
        let result = self
            .admit(&request)
            .and_then(|admission| self.apply_delete(&request, admission));
        self.finish_incoming(&request, sync_type, TransferStats::default(), result)
    }

    fn apply_delete(&self, request: &FileRequest, admission: Admission) -> Result<()> {
        let name = &request.file_name;
        if admission.local.as_ref().map_or(true, |r| r.is_tombstone()) {
            tracing::debug!("Nothing to delete for {}", name);
            return Ok(());
        }

        let mut metadata = incoming_metadata(request);
        metadata.insert(keys::SYNC_DELETED, "true");
        self.storage.batch(|accessor| {
            accessor.put_file(name, metadata, None)?;
            if admission.resolved {
                conflict::remove_artifact(accessor, name)?;
            }
            Ok(())
        })?;

        self.forget_signatures(name);
        self.search.delete(name);
        self.notifier.file_changed(name, FileChangeAction::Delete);
        Ok(())
    }

    // =========================================================================
    // Rename
    // =========================================================================

    /// Rename a file. The lineage is checked against the old name.
    pub async fn receive_rename(&self, request: FileRequest, new_name: &str) -> SynchronizationReport {
        let sync_type = SynchronizationType::Rename;
        if let Err(e) = validate_name(new_name) {
            return self.rejected(&request, sync_type, e);
        }
        if let Err(e) = self.begin_incoming(&request, sync_type) {
            return self.rejected(&request, sync_type, e);
        }
        let result = self
            .admit(&request)
            .and_then(|admission| self.apply_rename(&request, new_name, admission));
        self.finish_incoming(&request, sync_type, TransferStats::default(), result)
    }

    fn apply_rename(&self, request: &FileRequest, new_name: &str, admission: Admission) -> Result<()> {
        let old = &request.file_name;
        let mut tombstone = incoming_metadata(request);
        tombstone.insert(keys::SYNC_DELETED, "true");
        tombstone.insert(keys::SYNC_RENAME, new_name);
        let mut metadata = tombstone.clone();
        metadata.remove(keys::SYNC_DELETED);
        metadata.remove(keys::SYNC_RENAME);

        self.notifier.file_changed(old, FileChangeAction::Renaming);
        let renamed = self.storage.batch(|accessor| {
            live(accessor.get_file(old)?, old)?;

            // A live target is only replaced by a later version of itself
            let target = accessor.get_file(new_name)?.filter(|r| !r.is_tombstone());
            if let Some(target) = target {
                if target.metadata.is_conflicted() {
                    return Err(SyncError::Conflicted(new_name.to_string()));
                }
                if let Some(found) = conflict::detect_conflict(
                    new_name,
                    Some(&target.metadata),
                    &request.metadata,
                    Some(&request.source.server_url),
                )? {
                    conflict::create_artifact(accessor, new_name, &found)?;
                    return Ok(Err(found));
                }
                tracing::debug!("Rename of {} replaces an older {}", old, new_name);
            }

            accessor.rename_file(old, new_name)?;
            accessor.update_metadata(new_name, metadata)?;
            accessor.put_file(old, tombstone, None)?;
            if admission.resolved {
                conflict::remove_artifact(accessor, old)?;
            }
            live(accessor.get_file(new_name)?, new_name).map(Ok)
        })?;
        let record = match renamed {
            Ok(record) => record,
            Err(found) => return Err(self.conflict_detected(new_name, request, &found)),
        };

        self.forget_signatures(old);
        self.search.delete(old);
        self.search.index(new_name, &record.metadata);
        self.notifier.file_changed(new_name, FileChangeAction::Renamed);
        Ok(())
    }

    // =========================================================================
    // Bookkeeping queries
    // =========================================================================

    /// Status of the last synchronization of each file.
    pub fn confirm(&self, files: &[String]) -> Result<Vec<SynchronizationConfirmation>> {
        self.storage.batch(|accessor| {
            files
                .iter()
                .map(|file| {
                    let report: Option<SynchronizationReport> =
                        accessor.get_config(&report_key(file))?;
                    let status = match report {
                        None => SynchronizationStatus::Unknown,
                        Some(report) if report.is_success() => SynchronizationStatus::Safe,
                        Some(_) => SynchronizationStatus::Broken,
                    };
                    Ok(SynchronizationConfirmation {
                        file_name: file.clone(),
                        status,
                    })
                })
                .collect()
        })
    }

    /// What this server recorded about `source`.
    pub fn last_synchronization(&self, source: &ServerId) -> Result<SourceSynchronizationInformation> {
        let recorded = self.storage.config_value(&source_key(source))?;
        Ok(recorded.unwrap_or(SourceSynchronizationInformation {
            last_source_file_etag: Etag::EMPTY,
            source_server_url: None,
            destination_server_id: self.id,
        }))
    }

    /// Advance the etag recorded for `source`. Older etags are ignored.
    pub fn increment_last_etag(&self, source: &SourceInfo, etag: Etag) -> Result<()> {
        let advanced = self
            .storage
            .batch(|accessor| record_source(accessor, source, etag, self.id))?;
        if advanced {
            tracing::debug!("Last etag from {} is now {}", source.server_url, etag);
        }
        Ok(())
    }

    /// Last report of every file synchronized to this server.
    pub fn finished(&self, paging: Paging) -> Result<ListPage<SynchronizationReport>> {
        let reports = self.storage.batch(|accessor| {
            let mut reports = Vec::new();
            for key in accessor.config_names(REPORTS_PREFIX)? {
                if let Some(report) = accessor.get_config(&key)? {
                    reports.push(report);
                }
            }
            Ok(reports)
        })?;
        Ok(ListPage::paginate(reports, paging))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::destination::InProcessResolver;
    use crate::history::{self, HistoryItem};
    use crate::rdc::{part_channel, TransferPart};
    use bytes::Bytes;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const SOURCE: ServerId = ServerId::from_bytes([9; 16]);

    fn server(dir: &TempDir) -> SyncServer {
        SyncServer::open(
            Config::new(dir.path(), "dest:1"),
            Arc::new(InProcessResolver::new()),
        )
        .unwrap()
    }

    fn request(file: &str, metadata: Metadata, etag: u128) -> FileRequest {
        FileRequest {
            file_name: file.to_string(),
            source: SourceInfo {
                server_id: SOURCE,
                server_url: "source:1".to_string(),
            },
            source_etag: Etag::from_counter(etag),
            metadata,
        }
    }

    fn source_write(existing: Option<&Metadata>) -> Metadata {
        let mut metadata = Metadata::new().with("Owner", "source");
        history::record_local_write(existing, &mut metadata, &SOURCE, 50).unwrap();
        metadata
    }

    async fn push_bytes(
        server: &SyncServer,
        request: FileRequest,
        content: &[u8],
    ) -> SynchronizationReport {
        let (tx, rx) = part_channel();
        if !content.is_empty() {
            tx.send(Ok(TransferPart::Data(Bytes::copy_from_slice(content))))
                .await
                .unwrap();
        }
        drop(tx);
        server.receive_content(request, TransferMode::Bytes, rx).await
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
    async fn test_first_content_update() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let metadata = source_write(None);
        let report = push_bytes(&server, request("a", metadata.clone(), 5), b"hello").await;

        assert!(report.is_success(), "{:?}", report.failure);
        assert_eq!(report.bytes_transferred, 5);
        assert_eq!(read_all(&server, "a").await, b"hello");

        let stored = server.get_metadata("a").unwrap().unwrap();
        assert_eq!(stored.get("Owner"), Some("source"));
        assert_eq!(history::current(&stored), history::current(&metadata));
        assert_eq!(
            server.last_synchronization(&SOURCE).unwrap().last_source_file_etag,
            Etag::from_counter(5)
        );
        assert!(server.locked_files().unwrap().is_empty());
        assert_eq!(
            server.confirm(&["a".to_string(), "b".to_string()]).unwrap(),
            vec![
                SynchronizationConfirmation {
                    file_name: "a".into(),
                    status: SynchronizationStatus::Safe
                },
                SynchronizationConfirmation {
                    file_name: "b".into(),
                    status: SynchronizationStatus::Unknown
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_locked_file_is_rejected_without_report() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .storage
            .batch(|accessor| lock::lock(accessor, "a", SOURCE, Etag::EMPTY))
            .unwrap();

        let report = server
            .receive_metadata(request("a", source_write(None), 1))
            .await;
        assert_eq!(report.failure_message(), Some("File a is being synced"));
        assert!(server.finished(Paging::default()).unwrap().items.is_empty());
        assert_eq!(server.locked_files().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_recorded_and_freezes_file() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .upload("a", Metadata::new(), &mut Cursor::new(b"local".to_vec()))
            .await
            .unwrap();

        let report = push_bytes(&server, request("a", source_write(None), 1), b"remote").await;
        assert_eq!(
            report.failure_kind(),
            Some(crate::error::FailureKind::Conflicted)
        );
        assert_eq!(report.failure_message(), Some("File a is conflicted"));
        assert_eq!(read_all(&server, "a").await, b"local");
        assert!(server.get_metadata("a").unwrap().unwrap().is_conflicted());
        assert!(server.locked_files().unwrap().is_empty());
        assert_eq!(
            server.confirm(&["a".to_string()]).unwrap()[0].status,
            SynchronizationStatus::Broken
        );

        let conflicts = server.conflicts(Paging::default()).unwrap();
        assert_eq!(conflicts.total_count, 1);
        assert_eq!(
            conflicts.items[0].remote(),
            Some(&HistoryItem::new(SOURCE, 1))
        );
        assert_eq!(conflicts.items[0].remote_server_url.as_deref(), Some("source:1"));

        // A later version from the same lineage is still refused
        let newer = source_write(Some(&source_write(None)));
        let report = server.receive_metadata(request("a", newer, 2)).await;
        assert_eq!(report.failure_message(), Some("File a is conflicted"));
        assert_eq!(
            server.last_synchronization(&SOURCE).unwrap().last_source_file_etag,
            Etag::EMPTY
        );
    }

    #[tokio::test]
    async fn test_truncated_transfer_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let (tx, rx) = part_channel();
        tx.send(Ok(TransferPart::Data(Bytes::from_static(b"partial"))))
            .await
            .unwrap();
        tx.send(Err(SyncError::Transfer("connection reset".into())))
            .await
            .unwrap();
        drop(tx);

        let report = server
            .receive_content(request("a", source_write(None), 1), TransferMode::Bytes, rx)
            .await;
        assert_eq!(
            report.failure_kind(),
            Some(crate::error::FailureKind::TransferFault)
        );
        assert_eq!(report.bytes_transferred, 7);
        assert!(server.storage.file("a").unwrap().is_none());
        assert!(server.storage.file(&downloading_name("a")).unwrap().is_none());
        assert!(server.locked_files().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("blobs")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_source_etag_never_regresses() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let info = SourceInfo {
            server_id: SOURCE,
            server_url: "source:1".into(),
        };

        server.increment_last_etag(&info, Etag::from_counter(10)).unwrap();
        server.increment_last_etag(&info, Etag::from_counter(3)).unwrap();
        let report = push_bytes(&server, request("a", source_write(None), 4), b"x").await;
        assert!(report.is_success());

        assert_eq!(
            server.last_synchronization(&SOURCE).unwrap().last_source_file_etag,
            Etag::from_counter(10)
        );
    }

    #[tokio::test]
    async fn test_delete_of_missing_file_succeeds() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let report = server
            .receive_delete(request("missing", source_write(None), 1))
            .await;
        assert!(report.is_success());
        assert_eq!(report.sync_type, SynchronizationType::Delete);
    }

    #[tokio::test]
    async fn test_rename_continues_lineage() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let original = source_write(None);
        assert!(push_bytes(&server, request("old", original.clone(), 1), b"data")
            .await
            .is_success());

        let mut renamed = source_write(Some(&original));
        renamed.insert(keys::SYNC_DELETED, "true");
        renamed.insert(keys::SYNC_RENAME, "new");
        let report = server.receive_rename(request("old", renamed, 2), "new").await;

        assert!(report.is_success(), "{:?}", report.failure);
        assert!(server.get_metadata("old").unwrap().is_none());
        assert_eq!(read_all(&server, "new").await, b"data");
        let moved = server.get_metadata("new").unwrap().unwrap();
        assert!(!moved.is_tombstone());
        assert_eq!(history::version(&moved), 2);
        assert_eq!(server.search(""), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_unrecordable_source_fails_report_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        server
            .storage
            .batch(|accessor| accessor.set_config(&source_key(&SOURCE), &true))
            .unwrap();

        let report = push_bytes(&server, request("a", source_write(None), 1), b"hi").await;
        assert!(!report.is_success());
        assert!(server.locked_files().unwrap().is_empty());

        let finished = server.finished(Paging::default()).unwrap();
        assert_eq!(finished.total_count, 1);
        assert_eq!(finished.items[0], report);
        assert_eq!(
            server.confirm(&["a".to_string()]).unwrap()[0].status,
            SynchronizationStatus::Broken
        );
    }

    #[tokio::test]
    async fn test_rename_onto_independent_file_conflicts() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let original = source_write(None);
        assert!(push_bytes(&server, request("old", original.clone(), 1), b"from source")
            .await
            .is_success());
        server
            .upload("new", Metadata::new(), &mut Cursor::new(b"local".to_vec()))
            .await
            .unwrap();

        let mut renamed = source_write(Some(&original));
        renamed.insert(keys::SYNC_DELETED, "true");
        renamed.insert(keys::SYNC_RENAME, "new");
        let report = server.receive_rename(request("old", renamed, 2), "new").await;

        assert_eq!(
            report.failure_kind(),
            Some(crate::error::FailureKind::Conflicted)
        );
        assert_eq!(report.failure_message(), Some("File new is conflicted"));
        assert_eq!(read_all(&server, "new").await, b"local");
        assert_eq!(read_all(&server, "old").await, b"from source");
        assert!(server.get_metadata("new").unwrap().unwrap().is_conflicted());

        let conflicts = server.conflicts(Paging::default()).unwrap();
        assert_eq!(conflicts.total_count, 1);
        assert_eq!(conflicts.items[0].file_name, "new");
        assert_eq!(conflicts.items[0].remote_server_url.as_deref(), Some("source:1"));
        assert!(server.locked_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_replaces_older_version_of_target() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let first = source_write(None);
        assert!(push_bytes(&server, request("new", first.clone(), 1), b"stale")
            .await
            .is_success());
        let second = source_write(Some(&first));
        assert!(push_bytes(&server, request("old", second.clone(), 2), b"fresh")
            .await
            .is_success());

        let mut renamed = source_write(Some(&second));
        renamed.insert(keys::SYNC_DELETED, "true");
        renamed.insert(keys::SYNC_RENAME, "new");
        let report = server.receive_rename(request("old", renamed, 3), "new").await;

        assert!(report.is_success(), "{:?}", report.failure);
        assert!(server.get_metadata("old").unwrap().is_none());
        assert_eq!(read_all(&server, "new").await, b"fresh");
        assert!(server.conflicts(Paging::default()).unwrap().items.is_empty());
    }
}
