//! src/config.rs
//! ============================================================================
//! # Config: client configuration loader and saver
//!
//! Loads and saves settings as TOML from the platform config path using the
//! [`directories`](https://docs.rs/directories) crate. A missing file is
//! created with defaults on first load.
//!
//! ## Example
//! ```rust,ignore
//! let config = Config::load().await?;
//! config.save().await?;
//! ```

use std::{path::PathBuf, time::Duration};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::fs as TokioFs;
use tracing::info;

use crate::{logging::LoggerConfig, model::selection::UploadPolicy, util::debounce::DebounceConfig};

/// Overrides `api.base_url` when set.
pub const API_URL_ENV: &str = "CATALOG_API_URL";

/// Remote catalog endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL the `/files/` routes hang off.
    pub base_url: String,

    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Query cache configuration - embedded in main Config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a cached value counts as stale even without
    /// invalidation. `None` keeps values fresh until invalidated.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub stale_after: Option<Duration>,

    /// Maximum number of entries kept. Only idle entries are evicted, so the
    /// cache can exceed this while many keys are in use.
    pub max_entries: usize,

    /// Idle entries unread for this long are dropped
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub time_to_idle: Option<Duration>,

    /// Enable cache statistics
    pub enable_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after: None,
            max_entries: 256,
            time_to_idle: Some(Duration::from_secs(5 * 60)),
            enable_stats: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory downloaded files are saved into.
    pub directory: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let directory = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./downloads"));
        Self { directory }
    }
}

/// Main configuration struct for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Search box debounce
    #[serde(default)]
    pub search: DebounceConfig,

    #[serde(default)]
    pub upload: UploadPolicy,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub logging: LoggerConfig,
}

impl Config {
    /// Loads config from TOML at the platform config dir, or creates it with defaults.
    ///
    /// `CATALOG_API_URL` takes precedence over the file's `api.base_url`.
    pub async fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        let mut cfg = if TokioFs::try_exists(&path).await? {
            info!("Loading config from {}", path.display());
            let text = TokioFs::read_to_string(&path).await?;
            Self::from_toml(&text)?
        } else {
            info!(
                "No config file found at {}, using default configuration. Creating it now.",
                path.display()
            );

            let default_config = Self::default();
            default_config.save().await?;
            default_config
        };

        if let Ok(url) = std::env::var(API_URL_ENV)
            && !url.trim().is_empty()
        {
            info!("Using API base URL from {API_URL_ENV}");
            cfg.api.base_url = url.trim().to_string();
        }

        Ok(cfg)
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Saves config to TOML at the platform config dir.
    pub async fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;

        info!("Saving config to {}", path.display());

        if let Some(parent) = path.parent() {
            TokioFs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        TokioFs::write(&path, toml_str).await?;

        Ok(())
    }

    /// Returns the canonical config file path using `directories::ProjectDirs`.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "example", "CatalogSync")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory."))?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let text = r#"
            [api]
            base_url = "https://files.example.org/api"
            timeout = "5s"

            [cache]
            stale_after = "2m"
            enable_stats = false

            [search]
            delay = "150ms"
        "#;

        let cfg = Config::from_toml(text).unwrap();
        assert_eq!(cfg.api.base_url, "https://files.example.org/api");
        assert_eq!(cfg.api.timeout, Duration::from_secs(5));
        assert_eq!(cfg.cache.stale_after, Some(Duration::from_secs(120)));
        assert!(!cfg.cache.enable_stats);
        assert_eq!(cfg.search.delay, Duration::from_millis(150));
        assert_eq!(cfg.upload, UploadPolicy::default());
    }

    #[test]
    fn test_missing_sections_keep_other_settings() {
        let text = r#"
            [search]
            delay = "120ms"

            [upload]
            max_size = 2048
        "#;

        let cfg = Config::from_toml(text).unwrap();
        assert_eq!(cfg.api, ApiConfig::default());
        assert_eq!(cfg.cache, CacheConfig::default());
        assert_eq!(cfg.search.delay, Duration::from_millis(120));
        assert_eq!(cfg.upload.max_size, 2048);

        let cfg = Config::from_toml("[cache]\nmax_entries = 16\n").unwrap();
        assert_eq!(cfg.cache.max_entries, 16);
        assert!(cfg.cache.enable_stats);
        assert_eq!(cfg.cache.time_to_idle, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_default_search_delay() {
        assert_eq!(Config::default().search.delay, Duration::from_millis(300));
    }
}
