//! Admission control for outgoing synchronizations.
//!
//! Each destination has at most `limit` active jobs. Work that cannot start
//! stays pending until the next [`SyncServer::synchronize_destination`].
//!
//! [`SyncServer::synchronize_destination`]: crate::server::SyncServer::synchronize_destination

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::report::{ListPage, Paging, SynchronizationType};
use crate::tag::Etag;

/// One queued or running synchronization of a file to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationDetails {
    pub file_name: String,
    pub destination_url: String,
    pub sync_type: SynchronizationType,
    pub file_etag: Etag,
}

#[derive(Debug, Default)]
struct QueueState {
    active: BTreeMap<String, Vec<SynchronizationDetails>>,
    pending: BTreeMap<String, Vec<SynchronizationDetails>>,
}

#[derive(Debug, Clone, Default)]
pub struct SynchronizationQueue {
    state: Arc<Mutex<QueueState>>,
}

impl SynchronizationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `details` as an active job.
    ///
    /// Fails with `LimitExceeded` when the destination already runs `limit`
    /// jobs; a negative limit rejects everything. The job stays tracked until
    /// the returned guard is dropped.
    pub fn start(&self, details: SynchronizationDetails, limit: i32) -> Result<ActiveJob> {
        let mut state = self.state.lock();
        let running = state
            .active
            .get(&details.destination_url)
            .map(Vec::len)
            .unwrap_or(0);
        if limit < 0 || running >= limit as usize {
            return Err(SyncError::LimitExceeded {
                destination: details.destination_url.clone(),
                file: details.file_name.clone(),
            });
        }

        if let Some(pending) = state.pending.get_mut(&details.destination_url) {
            pending.retain(|job| job.file_name != details.file_name);
        }
        state
            .active
            .entry(details.destination_url.clone())
            .or_default()
            .push(details.clone());
        tracing::debug!(
            "Started {} of {} to {} ({} active)",
            details.sync_type,
            details.file_name,
            details.destination_url,
            running + 1
        );

        Ok(ActiveJob {
            state: self.state.clone(),
            details,
        })
    }

    /// Queue work for later. Replaces pending work for the same file.
    pub fn enqueue_pending(&self, details: SynchronizationDetails) {
        let mut state = self.state.lock();
        let pending = state
            .pending
            .entry(details.destination_url.clone())
            .or_default();
        pending.retain(|job| job.file_name != details.file_name);
        pending.push(details);
    }

    /// Remove and return the pending work for `destination`, oldest first.
    pub fn take_pending(&self, destination: &str) -> Vec<SynchronizationDetails> {
        self.state
            .lock()
            .pending
            .remove(destination)
            .unwrap_or_default()
    }

    pub fn active_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .active
            .get(destination)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn pending_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(destination)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn active(&self, paging: Paging) -> ListPage<SynchronizationDetails> {
        let all = self.state.lock().active.values().flatten().cloned().collect();
        ListPage::paginate(all, paging)
    }

    pub fn pending(&self, paging: Paging) -> ListPage<SynchronizationDetails> {
        let all = self.state.lock().pending.values().flatten().cloned().collect();
        ListPage::paginate(all, paging)
    }
}

/// Tracking handle of an admitted job. Dropping it ends the job.
#[derive(Debug)]
pub struct ActiveJob {
    state: Arc<Mutex<QueueState>>,
    details: SynchronizationDetails,
}

impl ActiveJob {
    pub fn details(&self) -> &SynchronizationDetails {
        &self.details
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.get_mut(&self.details.destination_url) {
            if let Some(i) = active.iter().position(|job| *job == self.details) {
                active.remove(i);
            }
            if active.is_empty() {
                state.active.remove(&self.details.destination_url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(file: &str, destination: &str) -> SynchronizationDetails {
        SynchronizationDetails {
            file_name: file.to_string(),
            destination_url: destination.to_string(),
            sync_type: SynchronizationType::ContentUpdate,
            file_etag: Etag::from_counter(1),
        }
    }

    #[test]
    fn test_limit_is_per_destination() {
        let queue = SynchronizationQueue::new();
        let _a = queue.start(job("a", "dest1"), 1).unwrap();
        let err = queue.start(job("b", "dest1"), 1).unwrap_err();
        assert!(matches!(err, SyncError::LimitExceeded { .. }));
        assert_eq!(
            err.to_string(),
            "The limit of active synchronizations to dest1 server has been achieved. Cannot process a file 'b'."
        );

        let _c = queue.start(job("c", "dest2"), 1).unwrap();
        assert_eq!(queue.active(Paging::default()).total_count, 2);
    }

    #[test]
    fn test_negative_limit_rejects_everything() {
        let queue = SynchronizationQueue::new();
        assert!(queue.start(job("a", "dest"), -1).is_err());
        assert_eq!(queue.active_count("dest"), 0);
    }

    #[test]
    fn test_dropping_job_frees_slot() {
        let queue = SynchronizationQueue::new();
        let first = queue.start(job("a", "dest"), 1).unwrap();
        assert_eq!(first.details().file_name, "a");
        drop(first);
        assert_eq!(queue.active_count("dest"), 0);
        let _second = queue.start(job("b", "dest"), 1).unwrap();
    }

    #[test]
    fn test_pending_is_deduplicated_and_cleared_on_start() {
        let queue = SynchronizationQueue::new();
        queue.enqueue_pending(job("a", "dest"));
        queue.enqueue_pending(job("b", "dest"));
        queue.enqueue_pending(job("a", "dest"));
        assert_eq!(queue.pending_count("dest"), 2);
        assert_eq!(queue.pending(Paging::default()).items[0].file_name, "b");

        let _a = queue.start(job("a", "dest"), 5).unwrap();
        assert_eq!(queue.pending_count("dest"), 1);
        assert_eq!(queue.pending(Paging::default()).items[0].file_name, "b");
    }

    #[test]
    fn test_take_pending_drains_one_destination() {
        let queue = SynchronizationQueue::new();
        queue.enqueue_pending(job("a", "dest1"));
        queue.enqueue_pending(job("b", "dest2"));

        let taken = queue.take_pending("dest1");
        assert_eq!(taken.len(), 1);
        assert_eq!(queue.pending_count("dest1"), 0);
        assert_eq!(queue.pending_count("dest2"), 1);
        assert!(queue.take_pending("dest1").is_empty());
    }
}
