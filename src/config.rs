//! Application configuration.
//!
//! Stored as TOML at `~/.config/ppsearch/config.toml` (or the XDG
//! equivalent). Every section is optional; a missing file means defaults.
//!
//! # Example Configuration
//!
//! ```toml
//! schema_dir = "/etc/ppsearch/schema"
//!
//! [upstream]
//! base_url = "https://api.hubapi.com"
//! page_size = 100
//!
//! [upstream.object_types]
//! partner = "2-1234567"
//! program = "2-1234568"
//! session = "2-1234569"
//!
//! [cache]
//! ttl_secs = 3600
//!
//! [associations]
//! batch_size = 50
//! inter_batch_delay_ms = 250
//!
//! [search.weights]
//! title = 3.0
//! partner = 2.0
//! other = 1.0
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheSettings;
use crate::search::SearchSettings;
use crate::upstream::{AssociationPolicy, UpstreamConfig};

const APP_DIR: &str = "ppsearch";
const CONFIG_FILE: &str = "config.toml";

/// Errors that can occur when loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding `partner.json`, `program.json` and `session.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_dir: Option<PathBuf>,
    pub upstream: UpstreamConfig,
    pub cache: CacheSettings,
    pub associations: AssociationPolicy,
    pub search: SearchSettings,
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Returns the default config if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Get the default configuration directory.
    ///
    /// `$XDG_CONFIG_HOME/ppsearch` when set, otherwise the platform config
    /// dir (e.g. `~/.config/ppsearch` on Linux).
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config).join(APP_DIR));
        }

        dirs::config_dir()
            .map(|p| p.join(APP_DIR))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Configured schema directory, or `<config dir>/schema`.
    pub fn schema_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.schema_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("schema")),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));

        let base = self.upstream.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return fail(format!("upstream.base_url must be an http(s) URL: {base}"));
        }
        if self.upstream.page_size == 0 {
            return fail("upstream.page_size must be at least 1".into());
        }
        for (kind, object_type) in [
            ("partner", &self.upstream.object_types.partner),
            ("program", &self.upstream.object_types.program),
            ("session", &self.upstream.object_types.session),
        ] {
            if object_type.trim().is_empty() {
                return fail(format!("upstream.object_types.{kind} cannot be empty"));
            }
        }

        if self.associations.batch_size == 0 {
            return fail("associations.batch_size must be at least 1".into());
        }

        let search = &self.search;
        if search.max_page_size == 0 || search.default_page_size == 0 {
            return fail("search page sizes must be at least 1".into());
        }
        if search.default_page_size > search.max_page_size {
            return fail(format!(
                "search.default_page_size ({}) exceeds search.max_page_size ({})",
                search.default_page_size, search.max_page_size
            ));
        }
        if !(search.fuzzy_threshold > 0.0 && search.fuzzy_threshold <= 1.0) {
            return fail(format!(
                "search.fuzzy_threshold must be in (0, 1], got {}",
                search.fuzzy_threshold
            ));
        }
        let w = &search.weights;
        if [w.title, w.partner, w.other]
            .iter()
            .any(|x| !x.is_finite() || *x < 0.0)
        {
            return fail("search.weights must be non-negative numbers".into());
        }

        Ok(())
    }
}
