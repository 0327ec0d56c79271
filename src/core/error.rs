use rusqlite;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A manifest dependency whose providing class is not registered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    pub class: String,
    pub plugin: String,
}

impl std::fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (from plugin {})", self.class, self.plugin)
    }
}

fn join_missing(missing: &[MissingDependency]) -> String {
    missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum PluginctlError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),
    #[error("Manifest error: {0}")]
    ManifestError(String),
    #[error("Repository error: {0}")]
    RepositoryError(String),
    #[error("Filesystem error at {path}: {reason}")]
    FilesystemError { path: PathBuf, reason: String },
    #[error("Missing dependencies: {}", join_missing(.0))]
    DependencyError(Vec<MissingDependency>),
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("Database error running `{statement}`: {reason}")]
    DatabaseError { statement: String, reason: String },
    #[error("Cannot {action} plugin {plugin} while it is {state}")]
    InvalidTransition {
        plugin: String,
        state: String,
        action: String,
    },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Path error: {0}")]
    PathError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl PluginctlError {
    pub fn filesystem(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        PluginctlError::FilesystemError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
