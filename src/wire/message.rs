//! JSON bodies of REQUEST and RESPONSE frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictItem, ConflictResolutionStrategy};
use crate::destination::{FileRequest, TransferMode};
use crate::error::{Result, SyncError};
use crate::history::HistoryItem;
use crate::metadata::Metadata;
use crate::queue::SynchronizationDetails;
use crate::report::{ListPage, Paging, SourceInfo, SyncFailure, SynchronizationReport};
use crate::server::FileInfo;
use crate::tag::{Etag, ServerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ServerId,
    GetMetadata {
        file: String,
    },
    SignatureManifest {
        file: String,
    },
    /// Answered with the range as base64
    ReadSignature {
        name: String,
        offset: u64,
        length: u64,
    },
    /// Followed by transfer parts
    UpdateContent {
        request: FileRequest,
        mode: TransferMode,
    },
    UpdateMetadata {
        request: FileRequest,
    },
    Delete {
        request: FileRequest,
    },
    Rename {
        request: FileRequest,
        new_name: String,
    },
    Confirm {
        files: Vec<String>,
    },
    LastSynchronization {
        source: ServerId,
    },
    IncrementLastEtag {
        source: SourceInfo,
        etag: Etag,
    },
    ApplyConflict {
        file: String,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: Option<String>,
    },
    ResolveConflict {
        file: String,
        strategy: ConflictResolutionStrategy,
    },
    ResolveConflictInFavorOfDest {
        file: String,
        remote: HistoryItem,
        remote_history: Vec<HistoryItem>,
        remote_server_url: String,
    },
    Finished {
        paging: Paging,
    },
    Active {
        paging: Paging,
    },
    Pending {
        paging: Paging,
    },
    Conflicts {
        paging: Paging,
    },

    // Administrative requests issued by the command line
    /// Followed by `Data` parts
    Upload {
        file: String,
        metadata: Metadata,
    },
    Push {
        file: String,
        destination_url: String,
    },
    SynchronizeDestination {
        destination_url: String,
    },
    Status,
}

impl Request {
    /// Whether transfer parts follow this request on the connection.
    pub fn has_parts(&self) -> bool {
        matches!(self, Request::UpdateContent { .. } | Request::Upload { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(serde_json::Value),
    Error(SyncFailure),
}

impl Response {
    pub fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| Ok(serde_json::to_value(value)?)) {
            Ok(value) => Response::Ok(value),
            Err(e) => Response::Error(SyncFailure::from(&e)),
        }
    }

    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Response::Ok(value) => Ok(serde_json::from_value(value)?),
            Response::Error(failure) => Err(SyncError::from_remote(failure.kind, failure.message)),
        }
    }
}

/// Overview returned by [`Request::Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: ServerId,
    pub url: String,
    pub files: Vec<FileInfo>,
    pub active: ListPage<SynchronizationDetails>,
    pub pending: ListPage<SynchronizationDetails>,
    pub finished: ListPage<SynchronizationReport>,
    pub conflicts: ListPage<ConflictItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_request_is_tagged_by_operation() {
        let json = serde_json::to_value(Request::GetMetadata { file: "a".into() }).unwrap();
        assert_eq!(json["op"], "get_metadata");
        assert_eq!(json["file"], "a");

        let parsed: Request = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, Request::GetMetadata { file: "a".into() });
        assert!(!parsed.has_parts());
    }

    #[test]
    fn test_error_response_keeps_kind() {
        let response = Response::from_result::<()>(Err(SyncError::FileLocked("a".into())));
        let err = response.into_result::<()>().unwrap_err();
        assert_eq!(err.kind(), FailureKind::FileLocked);
        assert_eq!(err.to_string(), "File a is being synced");
    }
}
