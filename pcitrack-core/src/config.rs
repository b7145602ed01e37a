//! Configuration management.

use crate::error::{Result, TrackerError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent configuration for pcitrack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    /// Database file; empty means `pcitrack.db` under `data_dir`
    pub db_path: String,
    pub log_level: String,
    /// Rows handled per `backfill-uuids` run when no count is given
    pub uuid_backfill_batch: usize,
    /// Node used when a command does not name one
    pub compute_node_id: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: paths::data_dir().to_string_lossy().to_string(),
            db_path: String::new(),
            log_level: "info".to_string(),
            uuid_backfill_batch: 50,
            compute_node_id: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| TrackerError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TrackerError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrackerError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            TrackerError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(path, content)
            .map_err(|e| TrackerError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Resolved database file.
    pub fn db_path(&self) -> PathBuf {
        if self.db_path.is_empty() {
            PathBuf::from(&self.data_dir).join("pcitrack.db")
        } else {
            PathBuf::from(&self.db_path)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.uuid_backfill_batch == 0 {
            return Err(TrackerError::InvalidConfig {
                reason: "uuid_backfill_batch must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.uuid_backfill_batch, 50);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.db_path(), PathBuf::from(&config.data_dir).join("pcitrack.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            data_dir: "/srv/pcitrack".to_string(),
            db_path: "/srv/db/devices.db".to_string(),
            log_level: "debug".to_string(),
            uuid_backfill_batch: 10,
            compute_node_id: Some(3),
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.db_path(), PathBuf::from("/srv/db/devices.db"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"compute_node_id": 7}"#).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.compute_node_id, Some(7));
        assert_eq!(loaded.uuid_backfill_batch, 50);
    }

    #[test]
    fn test_invalid_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load_from(&path), Err(TrackerError::InvalidConfig { .. })));

        std::fs::write(&path, r#"{"uuid_backfill_batch": 0}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(TrackerError::InvalidConfig { .. })));
    }
}
