//! Per-file version history.
//!
//! A file's state is identified by the server that produced it and a version
//! number, both kept in metadata (`Sync-Source`, `Sync-Version`). Earlier
//! states are kept in `Sync-History`, newest last.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::metadata::{keys, Metadata};
use crate::tag::ServerId;

/// One state of a file as produced by `server_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryItem {
    pub server_id: ServerId,
    pub version: u64,
}

impl HistoryItem {
    pub fn new(server_id: ServerId, version: u64) -> Self {
        Self { server_id, version }
    }
}

/// Current version number. Files that never went through bookkeeping are 0.
pub fn version(metadata: &Metadata) -> u64 {
    metadata
        .get(keys::SYNC_VERSION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn source(metadata: &Metadata) -> Option<ServerId> {
    metadata.get(keys::SYNC_SOURCE).and_then(|v| v.parse().ok())
}

pub fn history(metadata: &Metadata) -> Result<Vec<HistoryItem>> {
    match metadata.get(keys::SYNC_HISTORY) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
            SyncError::Protocol(format!("Malformed {} value: {}", keys::SYNC_HISTORY, e))
        }),
        _ => Ok(Vec::new()),
    }
}

pub fn set_history(metadata: &mut Metadata, history: &[HistoryItem]) -> Result<()> {
    metadata.insert(keys::SYNC_HISTORY, serde_json::to_string(history)?);
    Ok(())
}

/// The `(source, version)` pair describing the file's current state.
pub fn current(metadata: &Metadata) -> Option<HistoryItem> {
    source(metadata).map(|server| HistoryItem::new(server, version(metadata)))
}

/// History followed by the current state.
pub fn lineage(metadata: &Metadata) -> Result<Vec<HistoryItem>> {
    let mut items = history(metadata)?;
    items.extend(current(metadata));
    Ok(items)
}

pub fn lineage_contains(metadata: &Metadata, item: &HistoryItem) -> Result<bool> {
    Ok(lineage(metadata)?.contains(item))
}

pub fn update_last_modified(metadata: &mut Metadata) {
    metadata.insert(
        keys::LAST_MODIFIED,
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    );
}

/// Stamp `metadata` as a local write by `server` over `existing`.
///
/// The existing state is appended to the history (trimmed to `max_length`
/// entries) and the version is bumped. A new file starts at version 1 with
/// an empty history. Conflict markers on the existing file carry over.
pub fn record_local_write(
    existing: Option<&Metadata>,
    metadata: &mut Metadata,
    server: &ServerId,
    max_length: usize,
) -> Result<()> {
    let (mut items, next_version) = match existing {
        Some(existing) => {
            let mut items = history(existing)?;
            items.extend(current(existing));
            (items, version(existing) + 1)
        }
        None => (Vec::new(), 1),
    };
    if items.len() > max_length {
        items.drain(..items.len() - max_length);
    }

    if let Some(existing) = existing {
        for key in [keys::SYNC_CONFLICT, keys::SYNC_CONFLICT_RESOLUTION] {
            match existing.get(key) {
                Some(value) => metadata.insert(key, value),
                None => {
                    metadata.remove(key);
                }
            }
        }
    }

    metadata.insert(keys::SYNC_VERSION, next_version.to_string());
    metadata.insert(keys::SYNC_SOURCE, server.to_hex());
    set_history(metadata, &items)?;
    update_last_modified(metadata);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(n: u8) -> ServerId {
        ServerId::from_bytes([n; 16])
    }

    #[test]
    fn test_new_file_starts_at_version_one() {
        let mut md = Metadata::new().with("Owner", "alice");
        record_local_write(None, &mut md, &server(1), 50).unwrap();

        assert_eq!(version(&md), 1);
        assert_eq!(source(&md), Some(server(1)));
        assert!(history(&md).unwrap().is_empty());
        assert!(md.get(keys::LAST_MODIFIED).is_some());
        assert_eq!(md.get("owner"), Some("alice"));
    }

    #[test]
    fn test_local_write_appends_previous_state() {
        let mut first = Metadata::new();
        record_local_write(None, &mut first, &server(1), 50).unwrap();
        let mut second = Metadata::new();
        record_local_write(Some(&first), &mut second, &server(1), 50).unwrap();

        assert_eq!(version(&second), 2);
        let items = history(&second).unwrap();
        assert_eq!(items, vec![HistoryItem::new(server(1), 1)]);
        assert_eq!(items.last().unwrap().version, version(&second) - 1);
    }

    #[test]
    fn test_write_over_replicated_file_keeps_origin_in_history() {
        let mut replicated = Metadata::new();
        record_local_write(None, &mut replicated, &server(1), 50).unwrap();

        let mut edited = Metadata::new();
        record_local_write(Some(&replicated), &mut edited, &server(2), 50).unwrap();

        assert_eq!(current(&edited), Some(HistoryItem::new(server(2), 2)));
        assert!(lineage_contains(&edited, &HistoryItem::new(server(1), 1)).unwrap());
    }

    #[test]
    fn test_history_is_trimmed() {
        let mut md = Metadata::new();
        record_local_write(None, &mut md, &server(1), 3).unwrap();
        for _ in 0..10 {
            let mut next = Metadata::new();
            record_local_write(Some(&md), &mut next, &server(1), 3).unwrap();
            md = next;
        }

        let items = history(&md).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items.last().unwrap().version, 10);
        assert_eq!(version(&md), 11);
    }

    #[test]
    fn test_conflict_markers_carry_over() {
        let mut existing = Metadata::new().with(keys::SYNC_CONFLICT, "true");
        record_local_write(None, &mut existing, &server(1), 50).unwrap();

        let mut next = Metadata::new().with(keys::SYNC_CONFLICT_RESOLUTION, "{}");
        record_local_write(Some(&existing), &mut next, &server(1), 50).unwrap();
        assert!(next.is_conflicted());
        assert!(next.get(keys::SYNC_CONFLICT_RESOLUTION).is_none());
    }

    #[test]
    fn test_malformed_history_is_an_error() {
        let md = Metadata::new().with(keys::SYNC_HISTORY, "not json");
        assert!(history(&md).is_err());
    }
}
