//! Project configuration loaded from `.pluginctl/config.toml`.
//!
//! Every field has a default, so a missing file or an empty table is a valid
//! configuration. A handful of `PLUGINCTL_*` environment variables override
//! the file for one-off runs.

use crate::core::error::PluginctlError;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CATALOG_URL: &str = "PLUGINCTL_CATALOG_URL";
pub const ENV_PLUGINS_DIR: &str = "PLUGINCTL_PLUGINS_DIR";
pub const ENV_LOG: &str = "PLUGINCTL_LOG";

/// What to do when one statement of a manifest's SQL list fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlFailurePolicy {
    /// Roll back the whole operation and report a database error.
    #[default]
    Abort,
    /// Record a warning and keep executing the remaining statements.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when neither `PLUGINCTL_LOG` nor `--verbose` is given.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one folder per plugin, relative to the project root.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
    /// Remote catalog location; catalog commands fail without it.
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Branch used for catalog entries that do not name one.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Role that receives permission on newly installed nodes.
    #[serde(default = "default_admin_role_id")]
    pub admin_role_id: i64,
    #[serde(default)]
    pub sql_failure_policy: SqlFailurePolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_admin_role_id() -> i64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            catalog_url: None,
            http_timeout_secs: default_http_timeout_secs(),
            default_branch: default_branch(),
            admin_role_id: default_admin_role_id(),
            sql_failure_policy: SqlFailurePolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load the store's config file (if any) and apply environment overrides.
    pub fn load(store: &Store) -> Result<Self, PluginctlError> {
        let mut config = Self::load_file(&store.config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, PluginctlError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(PluginctlError::IoError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, PluginctlError> {
        toml::from_str(content).map_err(|e| PluginctlError::ConfigError(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, PluginctlError> {
        toml::to_string_pretty(self).map_err(|e| PluginctlError::ConfigError(e.to_string()))
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_CATALOG_URL).filter(|v| !v.is_empty()) {
            self.catalog_url = Some(url);
        }
        if let Some(dir) = lookup(ENV_PLUGINS_DIR).filter(|v| !v.is_empty()) {
            self.plugins_dir = PathBuf::from(dir);
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn plugins_path(&self, store: &Store) -> PathBuf {
        store.resolve(&self.plugins_dir)
    }
}
