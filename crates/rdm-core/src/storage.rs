//! Storage for the engine configuration file

use crate::error::EngineError;
use rdm_types::EngineConfig;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const CONFIG_FILE: &str = "config.json";

/// Reads and writes `<data_dir>/config.json`
#[derive(Clone, Debug)]
pub struct ConfigStore {
    data_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Load the configuration, falling back to defaults when no file exists
    ///
    /// `data_dir` always points at the directory the file lives in.
    pub async fn load(&self) -> Result<EngineConfig, EngineError> {
        let path = self.path();

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str::<EngineConfig>(&content)?
        } else {
            debug!("No config at {}, using defaults", path.display());
            EngineConfig::default()
        };

        config.data_dir = self.data_dir.clone();
        Ok(config)
    }

    /// Save the configuration
    pub async fn save(&self, config: &EngineConfig) -> Result<(), EngineError> {
        fs::create_dir_all(&self.data_dir).await?;

        let content = serde_json::to_string_pretty(config)?;
        fs::write(self.path(), content).await?;

        debug!("Saved config to {}", self.path().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let config = store.load().await.unwrap();
        assert!(!store.exists());
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.data_dir, dir.path());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested"));

        let config = EngineConfig {
            database_enabled: true,
            max_concurrent_downloads: 5,
            read_timeout_ms: 1_000,
            ..EngineConfig::default()
        };
        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert!(loaded.database_enabled);
        assert_eq!(loaded.max_concurrent_downloads, 5);
        assert_eq!(loaded.read_timeout_ms, 1_000);
        assert_eq!(loaded.data_dir, dir.path().join("nested"));
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        fs::write(store.path(), "{ not json").await.unwrap();

        assert!(matches!(
            store.load().await,
            Err(EngineError::Serialization(_))
        ));
    }
}
