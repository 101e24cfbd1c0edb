//! Configuration manager

use crate::models::ScanConfig;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        let path = if let Some(dirs) = ProjectDirs::from("com", "edgescan", "edgescan") {
            dirs.config_dir().join("config.json")
        } else {
            PathBuf::from("config.json")
        };

        Self { path }
    }

    /// Use an explicit config file instead of the platform location
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ScanConfig, ConfigError> {
        if self.path.exists() {
            let content = fs::read_to_string(&self.path)?;
            match serde_json::from_str::<ScanConfig>(&content) {
                Ok(config) => Ok(config.normalized()),
                Err(e) => {
                    warn!(
                        "配置文件 {} 损坏，使用默认配置: {}",
                        self.path.display(),
                        e
                    );
                    Ok(ScanConfig::default())
                }
            }
        } else {
            Ok(ScanConfig::default())
        }
    }

    pub fn save(&self, config: &ScanConfig) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
