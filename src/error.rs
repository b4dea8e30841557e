//! Error types for synchronization.
//!
//! Every per-file failure ends up in a [`SynchronizationReport`] as a
//! [`FailureKind`] plus message, so the variants here map one-to-one onto the
//! kinds a peer can observe.
//!
//! [`SynchronizationReport`]: crate::report::SynchronizationReport

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message used when the destination already had the offered version.
pub const NO_WORK_NEEDED_MESSAGE: &str =
    "No synchronization work needed. Destination server had this file in the past.";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("File {0} is conflicted")]
    Conflicted(String),

    #[error(
        "The limit of active synchronizations to {destination} server has been achieved. Cannot process a file '{file}'."
    )]
    LimitExceeded { destination: String, file: String },

    #[error("File {0} is being synced")]
    FileLocked(String),

    #[error("{0}")]
    FileNotFound(String),

    #[error("{}", NO_WORK_NEEDED_MESSAGE)]
    NoWorkNeeded,

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Storage error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by a peer, kept with its original kind.
    #[error("{message}")]
    Remote { kind: FailureKind, message: String },
}

impl SyncError {
    /// Classify this error for reports and wire responses.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Conflicted(_) => FailureKind::Conflicted,
            SyncError::LimitExceeded { .. } => FailureKind::LimitExceeded,
            SyncError::FileLocked(_) => FailureKind::FileLocked,
            SyncError::FileNotFound(_) => FailureKind::FileNotFound,
            SyncError::NoWorkNeeded => FailureKind::NoWorkNeeded,
            SyncError::Transfer(_) => FailureKind::TransferFault,
            SyncError::Remote { kind, .. } => *kind,
            SyncError::Storage(_)
            | SyncError::Io(_)
            | SyncError::Json(_)
            | SyncError::Encoding(_)
            | SyncError::Protocol(_)
            | SyncError::Config(_) => FailureKind::Internal,
        }
    }

    /// Rebuild an error received from a peer.
    pub fn from_remote(kind: FailureKind, message: impl Into<String>) -> Self {
        SyncError::Remote {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(file: &str) -> Self {
        SyncError::FileNotFound(format!("File {} does not exist", file))
    }
}

/// Serializable failure classification carried by reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Conflicted,
    LimitExceeded,
    FileLocked,
    FileNotFound,
    NoWorkNeeded,
    TransferFault,
    Internal,
}

pub type Result<T> = std::result::Result<T, SyncError>;
