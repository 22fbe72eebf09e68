//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which includes
//! the backend base URL, refresh and idle timings, the session-tracked paths,
//! and where credentials are stored.
//!
//! Configuration is stored at `~/.config/authkeeper/config.json`.
//! `AUTHKEEPER_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::session::{default_session_paths, IDLE_THRESHOLD_HOURS};
use crate::store::{FileBackend, KeyringBackend, Origin};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "authkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured
const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";

/// Refresh this many seconds before the access token expires.
const DEFAULT_REFRESH_MARGIN_SECS: u64 = 30;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How often to look for credential changes made by another process.
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 2;

const ENV_BASE_URL: &str = "AUTHKEEPER_BASE_URL";
const ENV_REFRESH_MARGIN: &str = "AUTHKEEPER_REFRESH_MARGIN_SECS";
const ENV_STORAGE: &str = "AUTHKEEPER_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    #[default]
    File,
    Keyring,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            other => Err(anyhow::anyhow!("Unknown storage kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub base_url: String,
    pub refresh_margin_secs: u64,
    pub idle_threshold_secs: u64,
    pub session_paths: Vec<String>,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub storage: StorageKind,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            idle_threshold_secs: (IDLE_THRESHOLD_HOURS * 3600) as u64,
            session_paths: default_session_paths(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            storage: StorageKind::default(),
        }
    }
}

impl AuthConfig {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(margin) = lookup(ENV_REFRESH_MARGIN) {
            self.refresh_margin_secs = margin
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_REFRESH_MARGIN))?;
        }
        if let Some(storage) = lookup(ENV_STORAGE) {
            self.storage = storage.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Session-tracked paths as they appear in request URLs, under the base URL's path.
    pub fn tracked_session_paths(&self) -> Vec<String> {
        let base_path = match reqwest::Url::parse(&self.base_url) {
            Ok(url) => url.path().trim_end_matches('/').to_string(),
            Err(e) => {
                warn!(
                    error = %e,
                    base_url = %self.base_url,
                    "Base URL does not parse, session paths left as configured"
                );
                String::new()
            }
        };
        self.session_paths
            .iter()
            .map(|path| format!("{}/{}", base_path, path.trim_start_matches('/')))
            .collect()
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Poll interval for changes written by other processes, at least one second
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// Open the configured credential storage
    pub fn open_store(&self) -> Result<Arc<Origin>> {
        Ok(match self.storage {
            StorageKind::Memory => Origin::in_memory(),
            StorageKind::File => Origin::new(FileBackend::in_dir(&self.cache_dir()?)),
            StorageKind::Keyring => Origin::new(KeyringBackend::default()),
        })
    }
}
