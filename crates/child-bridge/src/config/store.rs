//! Config Store
//!
//! Reads the shared configuration document from its persistent location.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::HomebridgeConfig;

/// Error type for reading the shared configuration document
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config store unavailable: {0}")]
    Unavailable(String),
}

/// Source of the shared configuration document
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Read the current document. Never served from a cache.
    async fn load(&self) -> Result<HomebridgeConfig, ConfigError>;
}

/// Store backed by a JSON file on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load(&self) -> Result<HomebridgeConfig, ConfigError> {
        debug!("Reading config from {}", self.path.display());

        let content = fs::read(&self.path).await.map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        serde_json::from_slice(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_reads_fresh_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"bridge":{"name":"First","pin":"111-11-111"}}"#)
            .await
            .unwrap();

        let store = JsonFileStore::new(&path);
        assert_eq!(store.load().await.unwrap().bridge.name, "First");

        fs::write(&path, r#"{"bridge":{"name":"Second","pin":"111-11-111"}}"#)
            .await
            .unwrap();
        assert_eq!(store.load().await.unwrap().bridge.name, "Second");
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").await.unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.json"));
    }
}
