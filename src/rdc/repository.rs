//! Keyed store of signature level blobs and their manifests.

use bytes::Bytes;
use std::sync::Arc;

use super::signature::{generate_signatures, signature_name, SignatureInfo, SignatureManifest};
use crate::config::RdcConfig;
use crate::error::{Result, SyncError};
use crate::storage::{FileRecord, Storage};
use crate::tag::ServerId;

const LOCAL_PREFIX: &str = "local/";
const MANIFEST_PREFIX: &str = "manifest/";
const REMOTE_PREFIX: &str = "remote/";

/// Signature storage on top of the `signatures` partition.
///
/// Local signatures are built lazily and cached per content hash. Signatures
/// rebuilt from a peer live in a separate per-server namespace.
pub struct SignatureRepository {
    storage: Arc<Storage>,
    config: RdcConfig,
    generation: tokio::sync::Mutex<()>,
}

impl SignatureRepository {
    pub fn new(storage: Arc<Storage>, config: RdcConfig) -> Self {
        Self {
            storage,
            config,
            generation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RdcConfig {
        &self.config
    }

    fn manifest_key(file: &str, content_hash: &str) -> String {
        format!("{}{}", MANIFEST_PREFIX, signature_name(file, content_hash, 0))
    }

    fn local_key(name: &str) -> String {
        format!("{}{}", LOCAL_PREFIX, name)
    }

    fn remote_key(server: &ServerId, name: &str) -> String {
        format!("{}{}/{}", REMOTE_PREFIX, server, name)
    }

    fn cached_manifest(&self, key: &str) -> Result<Option<SignatureManifest>> {
        match self.storage.signature(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Manifest for the current content of `record`, generating and storing
    /// the signature levels on first use. Records without content have none.
    pub async fn manifest(&self, record: &FileRecord) -> Result<Option<SignatureManifest>> {
        let (blob, content_hash) = match (&record.blob, record.content_hash()) {
            (Some(blob), Some(hash)) => (blob.clone(), hash.to_string()),
            _ => return Ok(None),
        };

        let key = Self::manifest_key(&record.name, &content_hash);
        if let Some(manifest) = self.cached_manifest(&key)? {
            return Ok(Some(manifest));
        }

        let _generation = self.generation.lock().await;
        if let Some(manifest) = self.cached_manifest(&key)? {
            return Ok(Some(manifest));
        }

        let path = self.storage.blob_path(&blob);
        let config = self.config.clone();
        let levels = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            generate_signatures(std::io::BufReader::new(file), &config)
        })
        .await
        .map_err(|e| SyncError::Transfer(format!("Signature generation failed: {}", e)))??;

        self.remove_file(&record.name)?;

        let mut signatures = Vec::with_capacity(levels.len());
        for (level, blob) in levels.iter().enumerate() {
            let name = signature_name(&record.name, &content_hash, level as u32);
            self.storage.put_signature(&Self::local_key(&name), blob)?;
            signatures.push(SignatureInfo {
                name,
                level: level as u32,
                length: blob.len() as u64,
            });
        }

        let manifest = SignatureManifest {
            file_name: record.name.clone(),
            content_hash,
            file_length: record.length,
            signatures,
        };
        self.storage
            .put_signature(&key, &serde_json::to_vec(&manifest)?)?;

        tracing::debug!(
            "Generated {} signature level(s) for {} ({} bytes)",
            manifest.signatures.len(),
            record.name,
            record.length
        );
        Ok(Some(manifest))
    }

    /// Full local level blob.
    pub fn level(&self, name: &str) -> Result<Option<Bytes>> {
        self.storage.signature(&Self::local_key(name))
    }

    /// Range of a local level blob, clamped to its end.
    pub fn read(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        let blob = self
            .level(name)?
            .ok_or_else(|| SyncError::FileNotFound(format!("Signature {} does not exist", name)))?;
        let start = (offset as usize).min(blob.len());
        let end = start.saturating_add(length as usize).min(blob.len());
        Ok(blob.slice(start..end))
    }

    pub fn store_remote(&self, server: &ServerId, name: &str, blob: &[u8]) -> Result<()> {
        self.storage.put_signature(&Self::remote_key(server, name), blob)
    }

    pub fn remote(&self, server: &ServerId, name: &str) -> Result<Option<Bytes>> {
        self.storage.signature(&Self::remote_key(server, name))
    }

    /// Drop every local signature and manifest of `file`.
    pub fn remove_file(&self, file: &str) -> Result<()> {
        let prefix = format!("{}@", file);
        self.storage
            .remove_signatures(&format!("{}{}", LOCAL_PREFIX, prefix))?;
        self.storage
            .remove_signatures(&format!("{}{}", MANIFEST_PREFIX, prefix))?;
        Ok(())
    }
}
