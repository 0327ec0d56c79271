//! Per-plugin activation records.

use crate::core::error::PluginctlError;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Install,
    Uninstalled,
}

impl ActivationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationStatus::Install => "install",
            ActivationStatus::Uninstalled => "uninstalled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "install" => ActivationStatus::Install,
            _ => ActivationStatus::Uninstalled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationRecord {
    pub plugin_folder: String,
    pub status: ActivationStatus,
    pub version: u32,
    pub persistent: bool,
}

pub struct ActivationStore<'a> {
    conn: &'a Connection,
}

impl<'a> ActivationStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, plugin: &str) -> Result<Option<ActivationRecord>, PluginctlError> {
        Ok(self
            .conn
            .query_row(
                "SELECT plugin_folder, status, version, persistent FROM plugin_activation
                 WHERE plugin_folder = ?1",
                params![plugin],
                record_from_row,
            )
            .optional()?)
    }

    /// Status of a plugin; no record means uninstalled.
    pub fn status(&self, plugin: &str) -> Result<ActivationStatus, PluginctlError> {
        Ok(self
            .get(plugin)?
            .map_or(ActivationStatus::Uninstalled, |r| r.status))
    }

    /// Insert or update a record, leaving the persistent flag alone.
    pub fn write(&self, plugin: &str, status: ActivationStatus, version: u32) -> Result<(), PluginctlError> {
        self.conn.execute(
            "INSERT INTO plugin_activation(plugin_folder, status, version, persistent)
             VALUES(?1, ?2, ?3, 0)
             ON CONFLICT(plugin_folder) DO UPDATE SET status = excluded.status, version = excluded.version",
            params![plugin, status.as_str(), version],
        )?;
        Ok(())
    }

    pub fn delete(&self, plugin: &str) -> Result<usize, PluginctlError> {
        Ok(self.conn.execute(
            "DELETE FROM plugin_activation WHERE plugin_folder = ?1",
            params![plugin],
        )?)
    }

    pub fn set_persistent(&self, plugin: &str, persistent: bool) -> Result<(), PluginctlError> {
        let updated = self.conn.execute(
            "UPDATE plugin_activation SET persistent = ?1 WHERE plugin_folder = ?2",
            params![persistent as i64, plugin],
        )?;
        if updated == 0 {
            return Err(PluginctlError::NotFound(format!("activation record for {plugin}")));
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ActivationRecord>, PluginctlError> {
        let mut stmt = self.conn.prepare(
            "SELECT plugin_folder, status, version, persistent FROM plugin_activation
             ORDER BY plugin_folder",
        )?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivationRecord> {
    let status: String = row.get(1)?;
    Ok(ActivationRecord {
        plugin_folder: row.get(0)?,
        status: ActivationStatus::parse(&status),
        version: row.get(2)?,
        persistent: row.get::<_, i64>(3)? != 0,
    })
}
