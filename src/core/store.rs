//! Store layout for pluginctl's on-disk state.
//!
//! A project keeps everything pluginctl owns under `<root>/.pluginctl/`:
//! the SQLite database and broker audit log in `data/`, the catalog cache in
//! `cache/`, and scratch space for downloads in `tmp/`. Plugin folders live
//! outside of it, in the configured plugins directory.

use crate::core::error::PluginctlError;
use crate::core::schemas;
use std::path::{Path, PathBuf};

pub const STORE_DIR_NAME: &str = ".pluginctl";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const CATALOG_CACHE_NAME: &str = "repository.json";

/// Store handle representing one project's pluginctl workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Project root (parent of `.pluginctl/`)
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walk upwards from `start_dir` until a `.pluginctl` directory is found.
    pub fn discover(start_dir: &Path) -> Result<Self, PluginctlError> {
        let mut current_dir = PathBuf::from(start_dir);
        loop {
            if current_dir.join(STORE_DIR_NAME).is_dir() {
                return Ok(Self::new(current_dir));
            }
            if !current_dir.pop() {
                return Err(PluginctlError::NotFound(
                    "'.pluginctl' directory not found in current or parent directories. Run `pluginctl init` first.".to_string(),
                ));
            }
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join(CONFIG_FILE_NAME)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state_dir().join("data")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(schemas::PLUGINCTL_DB_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir().join("cache")
    }

    pub fn catalog_cache_path(&self) -> PathBuf {
        self.cache_dir().join(CATALOG_CACHE_NAME)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    /// Resolve a configured path relative to the project root.
    pub fn resolve(&self, configured: &Path) -> PathBuf {
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.root.join(configured)
        }
    }
}
