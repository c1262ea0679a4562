//! src/config.rs
//! ============================================================================
//! # Config: Listing Engine Configuration Loader and Saver
//!
//! User-editable settings for the listing engine, loaded and saved as TOML
//! from the cross-platform config path via the
//! [`directories`](https://docs.rs/directories) crate.
//!
//! The live-search timeout and result cap live here on purpose: the engine
//! treats them as externally supplied parameters, never as built-in
//! constants.
//!
//! ## Example
//! ```rust,ignore
//! let config = ListingConfig::load().await?;
//! config.save().await?;
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use tokio::fs as TokioFs;

use crate::error::ListingError;

/// Live network search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// A search ends once this much time passes since the last received
    /// result, evaluated on timer ticks.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Hard cap on accumulated results per search.
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_results: 100,
        }
    }
}

/// Main configuration struct for the listing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingConfig {
    pub search: SearchConfig,

    /// Run the ADL matcher automatically after every full load.
    pub match_adl: bool,

    /// Recheck dupe statuses when the share reports refreshed paths.
    pub dupe_check_on_refresh: bool,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            match_adl: true,
            dupe_check_on_refresh: true,
        }
    }
}

impl ListingConfig {
    /// Loads config from the TOML file at the XDG-compliant app config dir,
    /// or writes and returns defaults when no file exists yet. IO problems
    /// surface as `ListingError::Io`, malformed TOML as
    /// `ListingError::Config`.
    pub async fn load() -> Result<Self, ListingError> {
        let path = Self::config_path()?;
        if path.exists() {
            info!("Loading config from {}", path.display());
            let text = TokioFs::read_to_string(&path).await?;
            let cfg: Self = toml::from_str(&text)?;

            Ok(cfg)
        } else {
            info!(
                "No config file found at {}, using default configuration. Creating it now.",
                path.display()
            );

            let default_config = Self::default();
            default_config.save().await?;

            Ok(default_config)
        }
    }

    /// Saves config to the TOML file at the XDG-compliant app config dir.
    pub async fn save(&self) -> Result<(), ListingError> {
        let path = Self::config_path()?;

        info!("Saving config to {}", path.display());

        if let Some(parent) = path.parent() {
            TokioFs::create_dir_all(parent).await?;
        }

        let toml_str =
            toml::to_string_pretty(self).map_err(|e| ListingError::Other(e.to_string()))?;
        TokioFs::write(&path, toml_str).await?;

        Ok(())
    }

    /// Returns the canonical config file path using `directories::ProjectDirs`.
    pub fn config_path() -> Result<PathBuf, ListingError> {
        let proj_dirs = ProjectDirs::from("org", "example", "PeerListing").ok_or_else(|| {
            ListingError::Other(String::from("Could not determine config directory."))
        })?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Returns the config directory (without filename).
    pub fn config_dir() -> Result<PathBuf, ListingError> {
        let proj_dirs = ProjectDirs::from("org", "example", "PeerListing").ok_or_else(|| {
            ListingError::Other(String::from("Could not determine config directory."))
        })?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }
}
