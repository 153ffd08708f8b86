//! Node configuration.
//!
//! A small JSON file holding the display username and the preferred
//! listen port, created with defaults on first run. Identity and key
//! material are deliberately absent: both are regenerated every run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::DEFAULT_TCP_PORT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine a config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name shown to other peers; not unique, not identity.
    pub username: String,

    /// Preferred TCP listen port; the listener may step past it.
    pub port: u16,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: default_username(),
            port: DEFAULT_TCP_PORT,
            path: None,
        }
    }
}

impl Config {
    /// Load from the platform config directory, creating defaults on
    /// first run.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = config_dir()?.join("config.json");
        Self::load_from(path).await
    }

    /// Load from an explicit path, creating defaults if absent.
    pub async fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if path.exists() {
            debug!("loading config from {path:?}");
            let content = tokio::fs::read_to_string(&path).await?;
            let mut config: Config = serde_json::from_str(&content)?;
            config.path = Some(path);
            Ok(config)
        } else {
            info!("creating default config at {path:?}");
            let mut config = Config::default();
            config.path = Some(path.clone());

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(&config)?;
            tokio::fs::write(&path, content).await?;

            Ok(config)
        }
    }

    /// Persist the current values.
    pub async fn save(&self) -> Result<(), ConfigError> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => config_dir()?.join("config.json"),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, content).await?;
        debug!("saved config to {path:?}");
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("parley"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Hostname, restricted to a tame charset, as the out-of-the-box name.
fn default_username() -> String {
    let name: String = hostname::get()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();

    if name.is_empty() {
        "anonymous".to_string()
    } else {
        name
    }
}
