//! Peer-to-peer file replication with conflict detection and remote
//! differential compression.
//!
//! Each [`SyncServer`] owns a transactional file store and pushes file
//! changes (content, metadata, renames, deletions) to peer servers through
//! the [`SyncDestination`] protocol surface, either in-process or over the
//! framed TCP protocol in [`wire`].

pub mod config;
pub mod conflict;
pub mod destination;
pub mod error;
pub mod history;
pub mod lock;
pub mod metadata;
pub mod notify;
pub mod queue;
pub mod rdc;
pub mod report;
pub mod search;
pub mod server;
pub mod storage;
pub mod tag;
pub mod temp_file;
pub mod wire;

pub use config::Config;
pub use destination::{DestinationResolver, InProcessResolver, SyncDestination};
pub use error::{FailureKind, Result, SyncError};
pub use metadata::Metadata;
pub use report::SynchronizationReport;
pub use server::SyncServer;
pub use tag::{Etag, ServerId};
