//! Per-plugin status overview combining activation records, local folders and
//! the cached catalog.

use crate::core::error::PluginctlError;
use crate::plugins::activation::{ActivationStatus, ActivationStore};
use crate::plugins::manifest::{PluginManifest, manifest_path};
use crate::plugins::repository::{RepositoryClient, Transport};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Installed,
    UpgradeAvailable,
    Uninstalled,
    /// Activated, but the plugin folder is gone.
    MissingFiles,
    /// Listed in the catalog only.
    RemoteOnly,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusKind::Installed => "installed",
            StatusKind::UpgradeAvailable => "upgrade_available",
            StatusKind::Uninstalled => "uninstalled",
            StatusKind::MissingFiles => "missing_files",
            StatusKind::RemoteOnly => "remote_only",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub status: StatusKind,
    pub installed_version: Option<u32>,
    /// Latest version declared by the local manifest.
    pub available_version: Option<u32>,
    pub persistent: bool,
    pub local: bool,
    pub in_catalog: bool,
}

/// Classify one plugin.
pub fn classify(installed: Option<u32>, local: bool, available: Option<u32>) -> StatusKind {
    match (installed, local) {
        (Some(_), false) => StatusKind::MissingFiles,
        (Some(current), true) if available.is_some_and(|latest| latest > current) => {
            StatusKind::UpgradeAvailable
        }
        (Some(_), true) => StatusKind::Installed,
        (None, true) => StatusKind::Uninstalled,
        (None, false) => StatusKind::RemoteOnly,
    }
}

pub fn list_plugins<T: Transport>(
    conn: &Connection,
    client: &RepositoryClient<T>,
) -> Result<Vec<PluginStatus>, PluginctlError> {
    let records: BTreeMap<String, _> = ActivationStore::new(conn)
        .list()?
        .into_iter()
        .filter(|r| r.status == ActivationStatus::Install)
        .map(|r| (r.plugin_folder.clone(), r))
        .collect();
    let local: BTreeSet<String> = client.local_plugins()?.into_iter().collect();
    let catalog = match client.read_catalog() {
        Ok(catalog) => catalog.unwrap_or_default(),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable catalog cache");
            Default::default()
        }
    };

    let names: BTreeSet<&String> = records
        .keys()
        .chain(local.iter())
        .chain(catalog.plugins.keys())
        .collect();

    let mut statuses = Vec::with_capacity(names.len());
    for name in names {
        let record = records.get(name);
        let is_local = local.contains(name);
        let available = if is_local {
            match PluginManifest::from_file(&manifest_path(&client.plugin_dir(name)), name) {
                Ok(manifest) => Some(manifest.latest_version()),
                Err(err) => {
                    tracing::warn!(plugin = %name, error = %err, "local manifest is unreadable");
                    None
                }
            }
        } else {
            None
        };
        let installed = record.map(|r| r.version);
        statuses.push(PluginStatus {
            name: name.clone(),
            status: classify(installed, is_local, available),
            installed_version: installed,
            available_version: available,
            persistent: record.is_some_and(|r| r.persistent),
            local: is_local,
            in_catalog: catalog.plugins.contains_key(name),
        });
    }
    Ok(statuses)
}
