//! Fire-and-forget change notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::report::SynchronizationType;
use crate::tag::ServerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChangeAction {
    Add,
    Update,
    Delete,
    Renaming,
    Renamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationAction {
    Start,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Detected,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    FileChange {
        file: String,
        action: FileChangeAction,
    },
    Synchronization {
        file: String,
        source_server_id: ServerId,
        sync_type: SynchronizationType,
        action: SynchronizationAction,
        direction: SynchronizationDirection,
    },
    Conflict {
        file: String,
        remote_server_url: Option<String>,
        status: ConflictStatus,
    },
}

impl Notification {
    pub fn file(&self) -> &str {
        match self {
            Self::FileChange { file, .. }
            | Self::Synchronization { file, .. }
            | Self::Conflict { file, .. } => file,
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast publisher. Publishing never blocks; events sent while nobody
/// listens are dropped and slow subscribers lag independently.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        tracing::trace!("Publishing {:?}", notification);
        let _ = self.tx.send(notification);
    }

    pub fn file_changed(&self, file: &str, action: FileChangeAction) {
        self.publish(Notification::FileChange {
            file: file.to_string(),
            action,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}
