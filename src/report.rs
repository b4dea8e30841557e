//! Synchronization outcomes and the records derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FailureKind, SyncError};
use crate::tag::{Etag, ServerId};

/// Config namespace of the last report per file.
pub const REPORTS_PREFIX: &str = "sync/reports/";
/// Config namespace of per-source synchronization records.
pub const SOURCES_PREFIX: &str = "sync/sources/";

pub fn report_key(file: &str) -> String {
    format!("{}{}", REPORTS_PREFIX, file)
}

pub fn source_key(server: &ServerId) -> String {
    format!("{}{}", SOURCES_PREFIX, server)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynchronizationType {
    ContentUpdate,
    MetadataUpdate,
    Delete,
    Rename,
}

impl fmt::Display for SynchronizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SynchronizationType::ContentUpdate => "content update",
            SynchronizationType::MetadataUpdate => "metadata update",
            SynchronizationType::Delete => "delete",
            SynchronizationType::Rename => "rename",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&SyncError> for SyncFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one synchronization attempt of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationReport {
    pub file_name: String,
    pub sync_type: SynchronizationType,
    pub bytes_copied: u64,
    pub bytes_transferred: u64,
    pub need_list_length: u64,
    pub failure: Option<SyncFailure>,
}

impl SynchronizationReport {
    pub fn new(file_name: impl Into<String>, sync_type: SynchronizationType) -> Self {
        Self {
            file_name: file_name.into(),
            sync_type,
            bytes_copied: 0,
            bytes_transferred: 0,
            need_list_length: 0,
            failure: None,
        }
    }

    /// Report of an attempt that ended with `err`.
    pub fn failed(
        file_name: impl Into<String>,
        sync_type: SynchronizationType,
        err: &SyncError,
    ) -> Self {
        let mut report = Self::new(file_name, sync_type);
        report.failure = Some(err.into());
        report
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationStatus {
    Unknown,
    Safe,
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationConfirmation {
    pub file_name: String,
    pub status: SynchronizationStatus,
}

/// What a destination remembers about one source server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSynchronizationInformation {
    pub last_source_file_etag: Etag,
    pub source_server_url: Option<String>,
    pub destination_server_id: ServerId,
}

/// Identity of the server initiating a synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub server_id: ServerId,
    pub server_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub page: usize,
    pub page_size: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: 25,
        }
    }
}

impl Paging {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total_count: usize,
}

impl<T> ListPage<T> {
    pub fn paginate(items: Vec<T>, paging: Paging) -> Self {
        let total_count = items.len();
        let items = items
            .into_iter()
            .skip(paging.page.saturating_mul(paging.page_size))
            .take(paging.page_size)
            .collect();
        Self { items, total_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_report_carries_kind_and_message() {
        let report = SynchronizationReport::failed(
            "a.bin",
            SynchronizationType::ContentUpdate,
            &SyncError::Conflicted("a.bin".into()),
        );
        assert!(!report.is_success());
        assert_eq!(report.failure_kind(), Some(FailureKind::Conflicted));
        assert_eq!(report.failure_message(), Some("File a.bin is conflicted"));
        assert_eq!(report.bytes_transferred, 0);
    }

    #[test]
    fn test_paginate() {
        let page = ListPage::paginate((0..10).collect(), Paging::new(1, 4));
        assert_eq!(page.items, vec![4, 5, 6, 7]);
        assert_eq!(page.total_count, 10);

        let past_end = ListPage::paginate((0..3).collect::<Vec<i32>>(), Paging::new(5, 4));
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total_count, 3);
    }
}
