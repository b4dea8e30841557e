//! Signature records, level blobs and manifests.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};

use super::chunker::Chunker;
use crate::config::RdcConfig;
use crate::error::{Result, SyncError};

/// Encoded size of one [`ChunkSignature`]: `u32` length + `u128` digest.
pub const RECORD_SIZE: usize = 20;

/// Hex digits of the content hash used in signature names.
const NAME_HASH_PREFIX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSignature {
    pub length: u32,
    pub hash: u128,
}

pub fn encode_records(records: &[ChunkSignature]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * RECORD_SIZE);
    for record in records {
        out.extend_from_slice(&record.length.to_be_bytes());
        out.extend_from_slice(&record.hash.to_be_bytes());
    }
    out
}

pub fn decode_records(blob: &[u8]) -> Result<Vec<ChunkSignature>> {
    if blob.len() % RECORD_SIZE != 0 {
        return Err(SyncError::Protocol(format!(
            "Signature blob length {} is not a multiple of {}",
            blob.len(),
            RECORD_SIZE
        )));
    }
    Ok(blob
        .chunks_exact(RECORD_SIZE)
        .map(|record| {
            let mut length = [0u8; 4];
            let mut hash = [0u8; 16];
            length.copy_from_slice(&record[..4]);
            hash.copy_from_slice(&record[4..]);
            ChunkSignature {
                length: u32::from_be_bytes(length),
                hash: u128::from_be_bytes(hash),
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub name: String,
    pub level: u32,
    /// Size of the level blob in bytes
    pub length: u64,
}

/// Signature levels of one file at one content version, finest first.
/// Level 0 signs the content; level n+1 signs the level n blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureManifest {
    pub file_name: String,
    pub content_hash: String,
    pub file_length: u64,
    pub signatures: Vec<SignatureInfo>,
}

impl SignatureManifest {
    pub fn level(&self, level: u32) -> Option<&SignatureInfo> {
        self.signatures.iter().find(|s| s.level == level)
    }

    pub fn top(&self) -> Option<&SignatureInfo> {
        self.signatures.last()
    }
}

pub fn signature_name(file: &str, content_hash: &str, level: u32) -> String {
    let prefix = &content_hash[..content_hash.len().min(NAME_HASH_PREFIX)];
    format!("{}@{}.sig{}", file, prefix, level)
}

/// Compute every signature level of `content`.
pub fn generate_signatures<R: Read>(content: R, config: &RdcConfig) -> io::Result<Vec<Vec<u8>>> {
    let level0 = Chunker::new(config.content_chunk).signatures(content)?;
    let mut levels = vec![encode_records(&level0)];

    let chunker = Chunker::new(config.signature_chunk);
    while levels.len() < config.max_levels {
        let last = &levels[levels.len() - 1];
        if last.len() <= config.recursion_threshold {
            break;
        }
        let next = encode_records(&chunker.signatures_of(last));
        levels.push(next);
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_record_encoding() {
        let records = vec![
            ChunkSignature {
                length: 7,
                hash: u128::MAX - 1,
            },
            ChunkSignature { length: 1, hash: 2 },
        ];
        let blob = encode_records(&records);
        assert_eq!(blob.len(), 2 * RECORD_SIZE);
        assert_eq!(&blob[..4], &[0, 0, 0, 7]);
        assert_eq!(decode_records(&blob).unwrap(), records);
        assert!(decode_records(&blob[..21]).is_err());
    }

    #[test]
    fn test_levels_recurse_until_threshold() {
        let config = RdcConfig::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let data: Vec<u8> = (0..2_000_000).map(|_| rng.gen()).collect();
        let levels = generate_signatures(std::io::Cursor::new(&data), &config).unwrap();

        assert!(levels.len() >= 2);
        assert!(levels.len() <= config.max_levels);
        assert!(levels[..levels.len() - 1]
            .iter()
            .all(|l| l.len() > config.recursion_threshold));
        let covered: u64 = decode_records(&levels[1])
            .unwrap()
            .iter()
            .map(|r| r.length as u64)
            .sum();
        assert_eq!(covered, levels[0].len() as u64);
    }

    #[test]
    fn test_empty_content_has_single_empty_level() {
        let levels = generate_signatures(std::io::empty(), &RdcConfig::default()).unwrap();
        assert_eq!(levels, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_signature_name() {
        assert_eq!(
            signature_name("dir/a.bin", "0123456789abcdef0123", 2),
            "dir/a.bin@0123456789abcdef.sig2"
        );
    }
}
