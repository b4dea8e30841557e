//! The operations a synchronization source invokes on its destination.
//!
//! [`SyncDestination`] is implemented in-process by [`LocalDestination`] and
//! over TCP by [`RemoteDestination`](crate::wire::RemoteDestination).

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::conflict::{ConflictItem, ConflictResolutionStrategy};
use crate::error::{Result, SyncError};
use crate::history::HistoryItem;
use crate::metadata::Metadata;
use crate::queue::SynchronizationDetails;
use crate::rdc::{PartReceiver, SignatureManifest};
use crate::report::{
    ListPage, Paging, SourceInfo, SourceSynchronizationInformation, SynchronizationConfirmation,
    SynchronizationReport,
};
use crate::server::SyncServer;
use crate::tag::{Etag, ServerId};

/// Common header of every file operation sent to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    pub file_name: String,
    pub source: SourceInfo,
    /// Version tag of the file at the source
    pub source_etag: Etag,
    /// Full source metadata. Control keys are dropped by the receiver.
    pub metadata: Metadata,
}

/// How the parts of a content update are coded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Plain `Data` parts carrying the whole content
    Bytes,
    /// Need-list parts against the destination's content with this hash
    NeedList { seed_content_hash: String },
}

#[async_trait]
pub trait SyncDestination: Send + Sync {
    fn url(&self) -> &str;

    async fn server_id(&self) -> Result<ServerId>;

    /// Metadata of `file`, tombstones included.
    async fn get_metadata(&self, file: &str) -> Result<Option<Metadata>>;

    async fn signature_manifest(&self, file: &str) -> Result<Option<SignatureManifest>>;

    /// Range of a signature level blob, clamped to its end.
    async fn read_signature(&self, name: &str, offset: u64, length: u64) -> Result<Bytes>;

    async fn update_content(
        &self,
        request: FileRequest,
        mode: TransferMode,
        parts: PartReceiver,
    ) -> Result<SynchronizationReport>;

    async fn update_metadata(&self, request: FileRequest) -> Result<SynchronizationReport>;

    async fn delete(&self, request: FileRequest) -> Result<SynchronizationReport>;

    async fn rename(&self, request: FileRequest, new_name: &str)
        -> Result<SynchronizationReport>;

    async fn confirm(&self, files: Vec<String>) -> Result<Vec<SynchronizationConfirmation>>;

    async fn last_synchronization(
        &self,
        source: ServerId,
    ) -> Result<SourceSynchronizationInformation>;

    async fn increment_last_etag(&self, source: SourceInfo, etag: Etag) -> Result<()>;

    async fn apply_conflict(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: Option<String>,
    ) -> Result<()>;

    async fn resolve_conflict(&self, file: &str, strategy: ConflictResolutionStrategy)
        -> Result<()>;

    async fn resolve_conflict_in_favor_of_dest(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: String,
    ) -> Result<()>;

    async fn finished(&self, paging: Paging) -> Result<ListPage<SynchronizationReport>>;

    async fn active(&self, paging: Paging) -> Result<ListPage<SynchronizationDetails>>;

    async fn pending(&self, paging: Paging) -> Result<ListPage<SynchronizationDetails>>;

    async fn conflicts(&self, paging: Paging) -> Result<ListPage<ConflictItem>>;
}

/// Maps destination URLs to handles.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<Arc<dyn SyncDestination>>;
}

// =============================================================================
// In-process destination
// =============================================================================

/// Destination living in the same process.
pub struct LocalDestination {
    server: Arc<SyncServer>,
}

impl LocalDestination {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl SyncDestination for LocalDestination {
    fn url(&self) -> &str {
        self.server.url()
    }

    async fn server_id(&self) -> Result<ServerId> {
        Ok(self.server.id())
    }

    async fn get_metadata(&self, file: &str) -> Result<Option<Metadata>> {
        self.server.file_metadata(file)
    }

    async fn signature_manifest(&self, file: &str) -> Result<Option<SignatureManifest>> {
        self.server.signature_manifest(file).await
    }

    async fn read_signature(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.server.read_signature(name, offset, length)
    }

    async fn update_content(
        &self,
        request: FileRequest,
        mode: TransferMode,
        parts: PartReceiver,
    ) -> Result<SynchronizationReport> {
        Ok(self.server.receive_content(request, mode, parts).await)
    }

    async fn update_metadata(&self, request: FileRequest) -> Result<SynchronizationReport> {
        Ok(self.server.receive_metadata(request).await)
    }

    async fn delete(&self, request: FileRequest) -> Result<SynchronizationReport> {
        Ok(self.server.receive_delete(request).await)
    }

    async fn rename(
        &self,
        request: FileRequest,
        new_name: &str,
    ) -> Result<SynchronizationReport> {
        Ok(self.server.receive_rename(request, new_name).await)
    }

    async fn confirm(&self, files: Vec<String>) -> Result<Vec<SynchronizationConfirmation>> {
        self.server.confirm(&files)
    }

    async fn last_synchronization(
        &self,
        source: ServerId,
    ) -> Result<SourceSynchronizationInformation> {
        self.server.last_synchronization(&source)
    }

    async fn increment_last_etag(&self, source: SourceInfo, etag: Etag) -> Result<()> {
        self.server.increment_last_etag(&source, etag)
    }

    async fn apply_conflict(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: Option<String>,
    ) -> Result<()> {
        self.server
            .apply_conflict(file, remote, remote_history, remote_server_url)
    }

    async fn resolve_conflict(
        &self,
        file: &str,
        strategy: ConflictResolutionStrategy,
    ) -> Result<()> {
        self.server.resolve_conflict(file, strategy).await
    }

    async fn resolve_conflict_in_favor_of_dest(
        &self,
        file: &str,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: String,
    ) -> Result<()> {
        self.server
            .resolve_conflict_in_favor_of_dest(file, remote, remote_history, remote_server_url)
    }

    async fn finished(&self, paging: Paging) -> Result<ListPage<SynchronizationReport>> {
        self.server.finished(paging)
    }

    async fn active(&self, paging: Paging) -> Result<ListPage<SynchronizationDetails>> {
        Ok(self.server.queue().active(paging))
    }

    async fn pending(&self, paging: Paging) -> Result<ListPage<SynchronizationDetails>> {
        Ok(self.server.queue().pending(paging))
    }

    async fn conflicts(&self, paging: Paging) -> Result<ListPage<ConflictItem>> {
        self.server.conflicts(paging)
    }
}

/// Resolver over servers registered in this process.
///
/// Holds weak references so servers and the resolver they share can be
/// dropped independently.
#[derive(Default)]
pub struct InProcessResolver {
    servers: RwLock<HashMap<String, Weak<SyncServer>>>,
}

impl InProcessResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: &Arc<SyncServer>) {
        self.servers
            .write()
            .insert(server.url().to_string(), Arc::downgrade(server));
    }
}

impl DestinationResolver for InProcessResolver {
    fn resolve(&self, url: &str) -> Result<Arc<dyn SyncDestination>> {
        let server = self
            .servers
            .read()
            .get(url)
            .and_then(Weak::upgrade)
            .ok_or_else(|| SyncError::Transfer(format!("Destination {} is not reachable", url)))?;
        Ok(Arc::new(LocalDestination::new(server)))
    }
}
