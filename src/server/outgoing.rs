//! Source side of a synchronization: deciding what a destination needs and
//! sending it.

use futures::stream::{self, StreamExt};

use super::SyncServer;
use crate::destination::{FileRequest, SyncDestination, TransferMode};
use crate::error::{FailureKind, Result, SyncError};
use crate::history;
use crate::metadata::Metadata;
use crate::notify::{Notification, SynchronizationAction, SynchronizationDirection};
use crate::queue::SynchronizationDetails;
use crate::rdc::{
    create_need_list, decode_records, part_channel, send_bytes, send_need_list, summarize,
    synchronize_signatures, ForwardReader, NeedListItem,
};
use crate::report::{SynchronizationReport, SynchronizationType};
use crate::storage::FileRecord;

/// How a push treats the local and remembered state.
#[derive(Debug, Clone, Copy)]
pub(super) struct PushOptions {
    /// Push even though the local file is conflicted
    pub allow_conflicted: bool,
    /// Skip when the destination already saw this etag from us
    pub check_etag: bool,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            allow_conflicted: false,
            check_etag: true,
        }
    }
}

/// Operation implied by the local record alone.
fn local_sync_type(metadata: &Metadata) -> SynchronizationType {
    if metadata.renamed_to().is_some() {
        SynchronizationType::Rename
    } else if metadata.is_tombstone() {
        SynchronizationType::Delete
    } else {
        SynchronizationType::ContentUpdate
    }
}

/// Operation needed to bring `destination` to the state of `local`.
fn sync_type(local: &Metadata, destination: Option<&Metadata>) -> SynchronizationType {
    let destination = destination.filter(|m| !m.is_tombstone());
    match local_sync_type(local) {
        // Nothing to rename at the destination: deleting is enough
        SynchronizationType::Rename if destination.is_none() => SynchronizationType::Delete,
        SynchronizationType::ContentUpdate => match destination {
            Some(remote) if remote.content_hash().is_some() && remote.content_hash() == local.content_hash() => {
                SynchronizationType::MetadataUpdate
            }
            _ => SynchronizationType::ContentUpdate,
        },
        other => other,
    }
}

/// Whether the destination already holds the state of `local`.
fn destination_has(local: &Metadata, remote: Option<&Metadata>) -> Result<bool> {
    match (remote, history::current(local)) {
        (Some(remote), Some(current)) => history::lineage_contains(remote, &current),
        (None, _) => Ok(local.is_tombstone()),
        (Some(_), None) => Ok(false),
    }
}

/// Failures that leave the push to be done on a later pass.
fn is_retryable(kind: FailureKind) -> bool {
    !matches!(
        kind,
        FailureKind::NoWorkNeeded | FailureKind::Conflicted | FailureKind::FileNotFound
    )
}

impl SyncServer {
    /// Push the current state of `file` to the server at `destination_url`.
    ///
    /// Per-file failures are carried by the report; `Err` means the
    /// destination could not be resolved.
    pub async fn push(&self, file: &str, destination_url: &str) -> Result<SynchronizationReport> {
        let destination = self.resolver.resolve(destination_url)?;
        Ok(self
            .push_to(file, destination.as_ref(), PushOptions::default())
            .await)
    }

    pub(super) async fn push_to(
        &self,
        file: &str,
        destination: &dyn SyncDestination,
        options: PushOptions,
    ) -> SynchronizationReport {
        let record = match self.storage.file(file) {
            Ok(Some(record)) if !record.is_transient() => record,
            Ok(_) => {
                return SynchronizationReport::failed(
                    file,
                    SynchronizationType::ContentUpdate,
                    &SyncError::FileNotFound("File does not exist locally".to_string()),
                )
            }
            Err(e) => {
                return SynchronizationReport::failed(file, SynchronizationType::ContentUpdate, &e)
            }
        };

        let provisional = local_sync_type(&record.metadata);
        if record.metadata.is_conflicted() && !options.allow_conflicted {
            return SynchronizationReport::failed(
                file,
                provisional,
                &SyncError::Conflicted(file.to_string()),
            );
        }

        let remote = match destination.get_metadata(file).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Failed to read {} on {}: {}", file, destination.url(), e);
                return SynchronizationReport::failed(file, provisional, &e);
            }
        };
        let sync_type = sync_type(&record.metadata, remote.as_ref());

        let details = SynchronizationDetails {
            file_name: file.to_string(),
            destination_url: destination.url().to_string(),
            sync_type,
            file_etag: record.etag(),
        };
        let admitted = self
            .synchronization_limit()
            .and_then(|limit| self.queue.start(details.clone(), limit));
        let _job = match admitted {
            Ok(job) => job,
            Err(e) => {
                if matches!(e, SyncError::LimitExceeded { .. }) {
                    self.queue.enqueue_pending(details);
                }
                tracing::warn!("Cannot push {} to {}: {}", file, destination.url(), e);
                return SynchronizationReport::failed(file, sync_type, &e);
            }
        };

        self.publish_outgoing(file, sync_type, SynchronizationAction::Start);
        let report = match self
            .execute_push(&record, remote.as_ref(), sync_type, destination, options)
            .await
        {
            Ok(report) => report,
            Err(e) => SynchronizationReport::failed(file, sync_type, &e),
        };
        self.publish_outgoing(file, sync_type, SynchronizationAction::Finish);

        if report.failure_kind().map_or(false, is_retryable) {
            self.queue.enqueue_pending(details);
        }
        match &report.failure {
            None => tracing::info!(
                "Pushed {} of {} to {}: {} bytes copied, {} bytes transferred",
                sync_type,
                file,
                destination.url(),
                report.bytes_copied,
                report.bytes_transferred
            ),
            Some(failure) => tracing::info!(
                "Push of {} to {} ended: {}",
                file,
                destination.url(),
                failure.message
            ),
        }
        report
    }

    fn publish_outgoing(&self, file: &str, sync_type: SynchronizationType, action: SynchronizationAction) {
        self.notifier.publish(Notification::Synchronization {
            file: file.to_string(),
            source_server_id: self.id,
            sync_type,
            action,
            direction: SynchronizationDirection::Outgoing,
        });
    }

    fn file_request(&self, record: &FileRecord) -> FileRequest {
        FileRequest {
            file_name: record.name.clone(),
            source: self.source_info(),
            source_etag: record.etag(),
            metadata: record.metadata.clone(),
        }
    }

    async fn execute_push(
        &self,
        record: &FileRecord,
        remote: Option<&Metadata>,
        sync_type: SynchronizationType,
        destination: &dyn SyncDestination,
        options: PushOptions,
    ) -> Result<SynchronizationReport> {
        if options.check_etag {
            let seen = destination.last_synchronization(self.id).await?;
            if seen.last_source_file_etag >= record.etag() {
                if destination_has(&record.metadata, remote)? {
                    tracing::debug!(
                        "{} already saw etag {} of {}",
                        destination.url(),
                        record.etag(),
                        record.name
                    );
                    return Err(SyncError::NoWorkNeeded);
                }
                tracing::debug!(
                    "{} saw etag {} but misses {}",
                    destination.url(),
                    record.etag(),
                    record.name
                );
            }
        }

        if let (Some(remote), Some(current)) = (remote, history::current(&record.metadata)) {
            if history::lineage_contains(remote, &current)? {
                tracing::debug!(
                    "{} already has version {} of {}",
                    destination.url(),
                    current.version,
                    record.name
                );
                if let Err(e) = destination
                    .increment_last_etag(self.source_info(), record.etag())
                    .await
                {
                    tracing::warn!("Failed to advance last etag on {}: {}", destination.url(), e);
                }
                return Err(SyncError::NoWorkNeeded);
            }
        }

        let request = self.file_request(record);
        match sync_type {
            SynchronizationType::ContentUpdate => self.push_content(record, request, destination).await,
            SynchronizationType::MetadataUpdate => destination.update_metadata(request).await,
            SynchronizationType::Delete => destination.delete(request).await,
            SynchronizationType::Rename => {
                let new_name = record
                    .metadata
                    .renamed_to()
                    .ok_or_else(|| SyncError::Protocol(format!("{} is not a rename", record.name)))?
                    .to_string();
                destination.rename(request, &new_name).await
            }
        }
    }

    /// Need list against the destination's copy, if both sides have
    /// signatures. Returns the seed's content hash with the list.
    async fn need_list_for(
        &self,
        record: &FileRecord,
        destination: &dyn SyncDestination,
    ) -> Result<Option<(String, Vec<NeedListItem>)>> {
        let remote = match destination.signature_manifest(&record.name).await? {
            Some(remote) => remote,
            None => return Ok(None),
        };
        let local = match self.signatures.manifest(record).await? {
            Some(local) => local,
            None => return Ok(None),
        };

        let remote_server = destination.server_id().await?;
        let seed = synchronize_signatures(
            destination,
            &remote_server,
            &remote,
            Some(&local),
            &self.signatures,
        )
        .await?;

        let level0 = local.level(0).ok_or_else(|| {
            SyncError::Protocol(format!("Signature manifest of {} has no levels", record.name))
        })?;
        let blob = self.signatures.level(&level0.name)?.ok_or_else(|| {
            SyncError::Transfer(format!("Signature {} disappeared", level0.name))
        })?;
        let need_list = create_need_list(&seed, &decode_records(&blob)?);

        let summary = summarize(&need_list);
        tracing::debug!(
            "Need list for {}: {} items, {} bytes from seed, {} bytes to send",
            record.name,
            need_list.len(),
            summary.seed_bytes,
            summary.source_bytes
        );
        Ok(Some((remote.content_hash, need_list)))
    }

    async fn push_content(
        &self,
        record: &FileRecord,
        request: FileRequest,
        destination: &dyn SyncDestination,
    ) -> Result<SynchronizationReport> {
        let plan = self.need_list_for(record, destination).await?;
        let content = self
            .storage
            .open_content(record)
            .await?
            .ok_or_else(|| SyncError::FileNotFound("File does not exist locally".to_string()))?;

        let (mode, need_list) = match plan {
            Some((seed_content_hash, need_list)) => {
                (TransferMode::NeedList { seed_content_hash }, Some(need_list))
            }
            None => (TransferMode::Bytes, None),
        };

        let (tx, rx) = part_channel();
        let produce = async move {
            let sent = match &need_list {
                Some(need_list) => {
                    send_need_list(need_list, &mut ForwardReader::new(content), &tx).await
                }
                None => send_bytes(content, &tx).await,
            };
            if let Err(e) = sent {
                // The receiver may already be gone; its report says why
                let _ = tx.send(Err(e)).await;
            }
        };

        let (report, ()) = tokio::join!(destination.update_content(request, mode, rx), produce);
        report
    }

    /// Push every local change the destination has not seen yet.
    ///
    /// Changes are queued as pending work first, then the pending queue for
    /// the destination is drained concurrently within its limit.
    pub async fn synchronize_destination(
        &self,
        destination_url: &str,
    ) -> Result<Vec<SynchronizationReport>> {
        let destination = self.resolver.resolve(destination_url)?;
        let seen = destination.last_synchronization(self.id).await?;

        let mut changed: Vec<FileRecord> = self
            .storage
            .batch(|accessor| accessor.list_files())?
            .into_iter()
            .filter(|r| !r.is_transient() && r.etag() > seen.last_source_file_etag)
            .collect();
        changed.sort_by_key(|r| r.etag());

        for record in &changed {
            self.queue.enqueue_pending(SynchronizationDetails {
                file_name: record.name.clone(),
                destination_url: destination_url.to_string(),
                sync_type: local_sync_type(&record.metadata),
                file_etag: record.etag(),
            });
        }

        let pending = self.queue.take_pending(destination_url);
        tracing::info!(
            "Synchronizing {} file(s) to {} (last seen etag {})",
            pending.len(),
            destination_url,
            seen.last_source_file_etag
        );

        let concurrency = self.synchronization_limit()?.max(1) as usize;
        let options = PushOptions {
            allow_conflicted: false,
            check_etag: false,
        };
        let destination = destination.as_ref();
        let reports = stream::iter(pending)
            .map(|details| async move {
                self.push_to(&details.file_name, destination, options).await
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        Ok(reports)
    }
}
