//! Server configuration loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Default config file name looked up by the binary.
pub const CONFIG_FILE: &str = "rdcsync.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub synchronization: SynchronizationConfig,
    pub rdc: RdcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of the fjall keyspace and content blobs
    pub data_dir: PathBuf,
    /// Address peers use to reach this server
    pub url: String,
    /// Bind address for `rdcsync serve`; falls back to `url`
    pub listen: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            url: "127.0.0.1:9090".to_string(),
            listen: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizationConfig {
    /// Active synchronizations allowed per destination. Negative disables.
    pub limit: i32,
    /// Entries kept in a file's version history
    pub history_length: usize,
    /// Offer zstd compression of data parts to peers
    pub compression: bool,
}

impl Default for SynchronizationConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            history_length: 50,
            compression: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSizes {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

impl ChunkSizes {
    pub fn validate(&self, what: &str) -> Result<()> {
        if self.min_size == 0 {
            return Err(SyncError::Config(format!("{}: min_size must be positive", what)));
        }
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(SyncError::Config(format!(
                "{}: expected min_size <= avg_size <= max_size, got {}/{}/{}",
                what, self.min_size, self.avg_size, self.max_size
            )));
        }
        if !self.avg_size.is_power_of_two() {
            return Err(SyncError::Config(format!(
                "{}: avg_size {} is not a power of two",
                what, self.avg_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RdcConfig {
    /// Chunking of file content (level 0 signatures)
    pub content_chunk: ChunkSizes,
    /// Chunking of signature blobs (levels 1 and up)
    pub signature_chunk: ChunkSizes,
    /// A level blob larger than this gets its own signature level
    pub recursion_threshold: usize,
    pub max_levels: usize,
}

impl Default for RdcConfig {
    fn default() -> Self {
        Self {
            content_chunk: ChunkSizes {
                min_size: 512,
                avg_size: 2048,
                max_size: 16 * 1024,
            },
            signature_chunk: ChunkSizes {
                min_size: 80,
                avg_size: 256,
                max_size: 2048,
            },
            recursion_threshold: 4096,
            max_levels: 4,
        }
    }
}

impl RdcConfig {
    pub fn validate(&self) -> Result<()> {
        self.content_chunk.validate("rdc.content_chunk")?;
        self.signature_chunk.validate("rdc.signature_chunk")?;
        if self.max_levels == 0 {
            return Err(SyncError::Config("rdc.max_levels must be at least 1".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Config rooted at `data_dir`, reachable at `url`.
    pub fn new(data_dir: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            server: ServerConfig {
                data_dir: data_dir.into(),
                url: url.into(),
                listen: None,
            },
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            SyncError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.url.is_empty() {
            return Err(SyncError::Config("server.url must not be empty".into()));
        }
        self.rdc.validate()
    }

    pub fn listen_address(&self) -> &str {
        self.server.listen.as_deref().unwrap_or(&self.server.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            url = "10.0.0.2:9090"

            [synchronization]
            limit = -1
            "#,
        )
        .unwrap();

        assert_eq!(config.server.url, "10.0.0.2:9090");
        assert_eq!(config.server.data_dir, PathBuf::from("data"));
        assert_eq!(config.synchronization.limit, -1);
        assert_eq!(config.synchronization.history_length, 50);
        assert_eq!(config.rdc.max_levels, 4);
        assert_eq!(config.listen_address(), "10.0.0.2:9090");
    }

    #[test]
    fn test_load_rejects_bad_chunk_sizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
            [rdc.content_chunk]
            min_size = 4096
            avg_size = 1024
            max_size = 8192
            "#,
        )
        .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("rdc.content_chunk"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.synchronization.limit, 5);
    }
}
