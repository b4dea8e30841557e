//! Fetching a peer's signatures with the differencing engine itself.
//!
//! Only the peer's top (smallest) level is downloaded whole. Every lower
//! level is rebuilt from the matching local level, using the level above it
//! as the source signature and fetching only the ranges the local copy lacks.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;

use super::apply::{apply_need_list, SourceAccess};
use super::chunker::Chunker;
use super::needlist::create_need_list;
use super::repository::SignatureRepository;
use super::signature::{decode_records, ChunkSignature, SignatureManifest};
use crate::destination::SyncDestination;
use crate::error::{Result, SyncError};
use crate::tag::ServerId;

/// Ranged reads of one remote signature level.
struct RemoteSignatureSource<'a> {
    destination: &'a dyn SyncDestination,
    name: &'a str,
    position: u64,
}

#[async_trait]
impl SourceAccess for RemoteSignatureSource<'_> {
    async fn read_at(&mut self, offset: u64, max: usize) -> Result<Bytes> {
        if offset < self.position {
            return Err(SyncError::Transfer(format!(
                "Backward read at {} of remote signature {}",
                offset, self.name
            )));
        }
        let data = self
            .destination
            .read_signature(self.name, offset, max as u64)
            .await?;
        self.position = offset + data.len() as u64;
        Ok(data)
    }
}

/// Level 0 signatures of the peer's copy described by `remote`.
///
/// Rebuilt levels are kept in the repository's namespace for `remote_server`.
pub async fn synchronize_signatures(
    destination: &dyn SyncDestination,
    remote_server: &ServerId,
    remote: &SignatureManifest,
    local: Option<&SignatureManifest>,
    repository: &SignatureRepository,
) -> Result<Vec<ChunkSignature>> {
    let top = match remote.top() {
        Some(top) => top,
        None => return Ok(Vec::new()),
    };

    let mut upper = destination.read_signature(&top.name, 0, top.length).await?;
    if upper.len() as u64 != top.length {
        return Err(SyncError::Transfer(format!(
            "Remote signature {} has {} bytes, expected {}",
            top.name,
            upper.len(),
            top.length
        )));
    }
    repository.store_remote(remote_server, &top.name, &upper)?;
    tracing::debug!(
        "Downloaded top signature level {} of {} ({} bytes)",
        top.level,
        remote.file_name,
        top.length
    );

    let chunker = Chunker::new(repository.config().signature_chunk);
    for level in (0..top.level).rev() {
        let info = remote.level(level).ok_or_else(|| {
            SyncError::Protocol(format!(
                "Signature manifest of {} is missing level {}",
                remote.file_name, level
            ))
        })?;

        let remote_records = decode_records(&upper)?;
        let local_blob = match local.and_then(|m| m.level(level)) {
            Some(local_info) => repository.level(&local_info.name)?.unwrap_or_default(),
            None => Bytes::new(),
        };
        let seed_records = chunker.signatures_of(&local_blob);
        let need_list = create_need_list(&seed_records, &remote_records);

        let mut source = RemoteSignatureSource {
            destination,
            name: &info.name,
            position: 0,
        };
        let output = Vec::with_capacity(info.length as usize);
        let (rebuilt, stats) =
            apply_need_list(&need_list, Some(Cursor::new(local_blob)), &mut source, output)
                .await?;

        if rebuilt.len() as u64 != info.length {
            return Err(SyncError::Transfer(format!(
                "Rebuilt signature {} has {} bytes, expected {}",
                info.name,
                rebuilt.len(),
                info.length
            )));
        }
        tracing::debug!(
            "Rebuilt signature level {} of {}: {} bytes copied, {} bytes fetched",
            level,
            remote.file_name,
            stats.bytes_copied,
            stats.bytes_transferred
        );

        repository.store_remote(remote_server, &info.name, &rebuilt)?;
        upper = Bytes::from(rebuilt);
    }

    decode_records(&upper)
}
