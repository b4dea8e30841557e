//! Conflict detection and the persisted conflict records.
//!
//! A conflict record ("artifact") lives in the config namespace under
//! `sync/conflicts/<file>` and the file itself carries `Sync-Conflict: true`.
//! A pending resolution is stored in the file's metadata as
//! `Sync-Conflict-Resolution` and applies to exactly one remote version.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::history::{self, HistoryItem};
use crate::metadata::{keys, Metadata};
use crate::storage::StorageAccessor;
use crate::tag::ServerId;

pub const CONFLICTS_PREFIX: &str = "sync/conflicts/";

pub fn conflict_key(file: &str) -> String {
    format!("{}{}", CONFLICTS_PREFIX, file)
}

/// Divergence between the local state of a file and an incoming lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictItem {
    pub file_name: String,
    /// Local state when the conflict was recorded
    pub current: HistoryItem,
    /// Incoming lineage, newest last
    pub remote_history: Vec<HistoryItem>,
    pub remote_server_url: Option<String>,
}

impl ConflictItem {
    /// The incoming state the conflict is about.
    pub fn remote(&self) -> Option<&HistoryItem> {
        self.remote_history.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolutionStrategy {
    /// Keep the local content and push it back to the remote server
    CurrentVersion,
    /// Accept the remote version on its next synchronization
    RemoteVersion,
}

/// Directive stored on a conflicted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictResolutionStrategy,
    pub remote_server_id: ServerId,
    pub version: u64,
    pub remote_server_url: Option<String>,
}

impl ConflictResolution {
    pub fn accept_remote(remote: &HistoryItem, remote_server_url: Option<String>) -> Self {
        Self {
            strategy: ConflictResolutionStrategy::RemoteVersion,
            remote_server_id: remote.server_id,
            version: remote.version,
            remote_server_url,
        }
    }

    /// Whether this directive lets `incoming` through.
    pub fn accepts(&self, incoming: &HistoryItem) -> bool {
        self.strategy == ConflictResolutionStrategy::RemoteVersion
            && self.remote_server_id == incoming.server_id
            && self.version == incoming.version
    }
}

pub fn resolution(metadata: &Metadata) -> Result<Option<ConflictResolution>> {
    match metadata.get(keys::SYNC_CONFLICT_RESOLUTION) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

/// Check an incoming write against the local state of the file.
///
/// There is no conflict without a live local file, or when the incoming
/// lineage already contains the local current state.
pub fn detect_conflict(
    file_name: &str,
    local: Option<&Metadata>,
    incoming: &Metadata,
    remote_server_url: Option<&str>,
) -> Result<Option<ConflictItem>> {
    let local = match local {
        Some(local) if !local.is_tombstone() => local,
        _ => return Ok(None),
    };
    let current = match history::current(local) {
        Some(current) => current,
        None => return Ok(None),
    };

    let remote_history = history::lineage(incoming)?;
    if remote_history.contains(&current) {
        return Ok(None);
    }

    Ok(Some(ConflictItem {
        file_name: file_name.to_string(),
        current,
        remote_history,
        remote_server_url: remote_server_url.map(str::to_string),
    }))
}

/// Whether `local` holds a resolution directive for this exact incoming
/// version.
pub fn is_resolved(local: &Metadata, conflict: &ConflictItem) -> Result<bool> {
    let remote = match conflict.remote() {
        Some(remote) => remote,
        None => return Ok(false),
    };
    Ok(resolution(local)?
        .map(|directive| directive.accepts(remote))
        .unwrap_or(false))
}

/// Whether `local` holds a directive accepting the current state of
/// `incoming`.
pub fn accepts_incoming(local: &Metadata, incoming: &Metadata) -> Result<bool> {
    match (resolution(local)?, history::current(incoming)) {
        (Some(directive), Some(tip)) => Ok(directive.accepts(&tip)),
        _ => Ok(false),
    }
}

// =============================================================================
// Artifacts
// =============================================================================

pub fn get_artifact(accessor: &StorageAccessor<'_>, file: &str) -> Result<Option<ConflictItem>> {
    accessor.get_config(&conflict_key(file))
}

/// Persist `conflict` and flag the file as conflicted.
pub fn create_artifact(
    accessor: &mut StorageAccessor<'_>,
    file: &str,
    conflict: &ConflictItem,
) -> Result<()> {
    let record = accessor
        .get_file(file)?
        .ok_or_else(|| SyncError::not_found(file))?;

    accessor.set_config(&conflict_key(file), conflict)?;
    let mut metadata = record.metadata;
    metadata.insert(keys::SYNC_CONFLICT, "true");
    accessor.update_metadata(file, metadata)?;
    Ok(())
}

/// Remove the conflict record and the file's conflict markers. Returns
/// whether a record existed.
pub fn remove_artifact(accessor: &mut StorageAccessor<'_>, file: &str) -> Result<bool> {
    let existed = accessor.delete_config(&conflict_key(file))?;
    if let Some(record) = accessor.get_file(file)? {
        let mut metadata = record.metadata;
        let flagged = metadata.remove(keys::SYNC_CONFLICT).is_some();
        let directed = metadata.remove(keys::SYNC_CONFLICT_RESOLUTION).is_some();
        if flagged || directed {
            accessor.update_metadata(file, metadata)?;
        }
    }
    Ok(existed)
}

/// Register a conflict found out of band.
///
/// An existing record keeps its remote history; the new entries are
/// appended and `remote` becomes the tip.
pub fn apply_conflict(
    accessor: &mut StorageAccessor<'_>,
    file: &str,
    remote: HistoryItem,
    remote_history: Vec<HistoryItem>,
    remote_server_url: Option<String>,
) -> Result<ConflictItem> {
    let record = accessor
        .get_file(file)?
        .filter(|record| !record.is_tombstone())
        .ok_or_else(|| SyncError::not_found(file))?;
    let current = history::current(&record.metadata)
        .unwrap_or_else(|| HistoryItem::new(ServerId::EMPTY, history::version(&record.metadata)));

    let (mut items, url) = match get_artifact(accessor, file)? {
        Some(existing) => (
            existing.remote_history,
            remote_server_url.or(existing.remote_server_url),
        ),
        None => (Vec::new(), remote_server_url),
    };
    for item in remote_history {
        if !items.contains(&item) {
            items.push(item);
        }
    }
    items.retain(|item| *item != remote);
    items.push(remote);

    let conflict = ConflictItem {
        file_name: file.to_string(),
        current,
        remote_history: items,
        remote_server_url: url,
    };
    create_artifact(accessor, file, &conflict)?;
    Ok(conflict)
}

/// Store a resolution directive in the file's metadata.
pub fn set_resolution(
    accessor: &mut StorageAccessor<'_>,
    file: &str,
    directive: &ConflictResolution,
) -> Result<()> {
    let record = accessor
        .get_file(file)?
        .ok_or_else(|| SyncError::not_found(file))?;
    let mut metadata = record.metadata;
    metadata.insert(
        keys::SYNC_CONFLICT_RESOLUTION,
        serde_json::to_string(directive)?,
    );
    accessor.update_metadata(file, metadata)?;
    Ok(())
}

/// All conflict records, ordered by file name.
pub fn list_artifacts(accessor: &StorageAccessor<'_>) -> Result<Vec<ConflictItem>> {
    let mut conflicts = Vec::new();
    for key in accessor.config_names(CONFLICTS_PREFIX)? {
        if let Some(conflict) = accessor.get_config(&key)? {
            conflicts.push(conflict);
        }
    }
    Ok(conflicts)
}
