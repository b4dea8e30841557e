//! Synchronization server.
//!
//! A [`SyncServer`] owns one storage and everything synchronization needs on
//! top of it: signatures, search index, notifier and the outgoing job queue.
//! Its operations are split by role:
//!
//! - `files`: the local file API (uploads, renames, deletes, reads)
//! - `incoming`: the destination side of every synchronization
//! - `outgoing`: pushing local changes to a destination
//! - `resolution`: conflict registration and resolution

mod files;
mod incoming;
mod outgoing;
mod resolution;

pub use files::FileInfo;

use bytes::Bytes;
use std::sync::Arc;

use crate::config::Config;
use crate::destination::DestinationResolver;
use crate::error::Result;
use crate::lock::{self, FileLock};
use crate::notify::Notifier;
use crate::queue::SynchronizationQueue;
use crate::rdc::{SignatureManifest, SignatureRepository};
use crate::report::SourceInfo;
use crate::search::{MemorySearchIndex, SearchIndex};
use crate::storage::Storage;
use crate::tag::ServerId;

const SERVER_ID_KEY: &str = "server/id";

/// Runtime override of `synchronization.limit`.
pub const LIMIT_KEY: &str = "sync/limit";

pub struct SyncServer {
    id: ServerId,
    config: Config,
    storage: Arc<Storage>,
    signatures: SignatureRepository,
    search: Arc<dyn SearchIndex>,
    notifier: Notifier,
    queue: SynchronizationQueue,
    resolver: Arc<dyn DestinationResolver>,
}

impl SyncServer {
    /// Open the server stored under `config.server.data_dir` with an
    /// in-memory search index.
    pub fn open(config: Config, resolver: Arc<dyn DestinationResolver>) -> Result<Self> {
        Self::with_search_index(config, resolver, Arc::new(MemorySearchIndex::new()))
    }

    pub fn with_search_index(
        config: Config,
        resolver: Arc<dyn DestinationResolver>,
        search: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.server.data_dir)?;
        let storage = Arc::new(Storage::open(&config.server.data_dir)?);

        let id = storage.batch(|accessor| match accessor.get_config(SERVER_ID_KEY)? {
            Some(id) => Ok(id),
            None => {
                let id = ServerId::generate();
                accessor.set_config(SERVER_ID_KEY, &id)?;
                Ok(id)
            }
        })?;

        let mut indexed = 0;
        for record in storage.batch(|accessor| accessor.list_files())? {
            if !record.is_tombstone() && !record.is_transient() {
                search.index(&record.name, &record.metadata);
                indexed += 1;
            }
        }

        tracing::info!(
            "Opened server {} at {} ({} files)",
            id,
            config.server.url,
            indexed
        );

        let signatures = SignatureRepository::new(storage.clone(), config.rdc.clone());
        Ok(Self {
            id,
            config,
            storage,
            signatures,
            search,
            notifier: Notifier::new(),
            queue: SynchronizationQueue::new(),
            resolver,
        })
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.config.server.url
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn queue(&self) -> &SynchronizationQueue {
        &self.queue
    }

    pub fn source_info(&self) -> SourceInfo {
        SourceInfo {
            server_id: self.id,
            server_url: self.url().to_string(),
        }
    }

    /// Active synchronizations allowed per destination.
    pub fn synchronization_limit(&self) -> Result<i32> {
        Ok(self
            .storage
            .config_value(LIMIT_KEY)?
            .unwrap_or(self.config.synchronization.limit))
    }

    /// Override the configured limit. `None` restores the configured value.
    pub fn set_synchronization_limit(&self, limit: Option<i32>) -> Result<()> {
        self.storage.batch(|accessor| match limit {
            Some(limit) => accessor.set_config(LIMIT_KEY, &limit),
            None => accessor.delete_config(LIMIT_KEY).map(|_| ()),
        })
    }

    // =========================================================================
    // Signatures
    // =========================================================================

    /// Manifest of the current content of `file`.
    pub async fn signature_manifest(&self, file: &str) -> Result<Option<SignatureManifest>> {
        match self.storage.file(file)? {
            Some(record) if !record.is_tombstone() && !record.is_transient() => {
                self.signatures.manifest(&record).await
            }
            _ => Ok(None),
        }
    }

    pub fn read_signature(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.signatures.read(name, offset, length)
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub fn locked_files(&self) -> Result<Vec<FileLock>> {
        self.storage.batch(|accessor| lock::locked_files(accessor))
    }

    /// Clear a lock left behind by an interrupted synchronization.
    pub fn force_unlock(&self, file: &str) -> Result<bool> {
        self.storage
            .batch(|accessor| lock::force_unlock(accessor, file))
    }
}
