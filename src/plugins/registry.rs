//! Settings and class registrations contributed by plugins.

use crate::core::cache::Cache;
use crate::core::error::PluginctlError;
use crate::plugins::manifest::{ClassEntry, SettingEntry};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::BTreeSet;

const REGISTERED_CLASSES_KEY: &str = "registered_classes";

/// Storage key of a plugin setting.
pub fn setting_id(plugin: &str, name: &str) -> String {
    format!("{plugin}_{name}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredSetting {
    pub setting_id: String,
    pub plugin: String,
    pub name: String,
    pub value: String,
    pub note: Option<String>,
}

pub struct SettingsStore<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn write(&self, plugin: &str, entry: &SettingEntry) -> Result<(), PluginctlError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings(setting_id, plugin, name, setting_value, note)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                setting_id(plugin, &entry.name),
                plugin,
                entry.name,
                entry.value,
                entry.note
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, plugin: &str, name: &str) -> Result<Option<String>, PluginctlError> {
        Ok(self
            .conn
            .query_row(
                "SELECT setting_value FROM settings WHERE setting_id = ?1",
                params![setting_id(plugin, name)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete(&self, plugin: &str, name: &str) -> Result<usize, PluginctlError> {
        Ok(self.conn.execute(
            "DELETE FROM settings WHERE setting_id = ?1",
            params![setting_id(plugin, name)],
        )?)
    }

    pub fn delete_plugin(&self, plugin: &str) -> Result<usize, PluginctlError> {
        Ok(self
            .conn
            .execute("DELETE FROM settings WHERE plugin = ?1", params![plugin])?)
    }

    pub fn list(&self, plugin: &str) -> Result<Vec<StoredSetting>, PluginctlError> {
        let mut stmt = self.conn.prepare(
            "SELECT setting_id, plugin, name, setting_value, note FROM settings
             WHERE plugin = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![plugin], |row| {
            Ok(StoredSetting {
                setting_id: row.get(0)?,
                plugin: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                note: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassRegistration {
    pub class_id: i64,
    pub class_name: String,
    pub alias: Option<String>,
    pub plugin_folder: String,
    pub enabled: bool,
    pub rank: i64,
}

pub struct ClassRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> ClassRegistry<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Rank for an unranked registration: one past the highest existing rank
    /// for the same class name.
    pub fn next_rank(&self, class_name: &str) -> Result<i64, PluginctlError> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(class_rank) FROM classes WHERE class_name = ?1",
            params![class_name],
            |row| row.get(0),
        )?;
        Ok(max.map_or(1, |m| m + 1))
    }

    pub fn register(&self, entry: &ClassEntry) -> Result<i64, PluginctlError> {
        let rank = match entry.rank {
            Some(rank) => rank,
            None => self.next_rank(&entry.name)?,
        };
        self.conn.execute(
            "INSERT INTO classes(class_name, alias, plugin_folder, enable, class_rank)
             VALUES(?1, ?2, ?3, 1, ?4)",
            params![entry.name, entry.alias, entry.plugin, rank],
        )?;
        Ok(rank)
    }

    pub fn delete_plugin(&self, plugin: &str) -> Result<usize, PluginctlError> {
        Ok(self
            .conn
            .execute("DELETE FROM classes WHERE plugin_folder = ?1", params![plugin])?)
    }

    pub fn list(&self) -> Result<Vec<ClassRegistration>, PluginctlError> {
        let mut stmt = self.conn.prepare(
            "SELECT class_id, class_name, alias, plugin_folder, enable, class_rank FROM classes
             ORDER BY class_name, class_rank, class_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClassRegistration {
                class_id: row.get(0)?,
                class_name: row.get(1)?,
                alias: row.get(2)?,
                plugin_folder: row.get(3)?,
                enabled: row.get::<_, i64>(4)? != 0,
                rank: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Names and aliases of every enabled class. Read through the cache.
    pub fn registered_names(&self) -> Result<BTreeSet<String>, PluginctlError> {
        let cache = Cache::new(self.conn);
        if let Some(names) = cache.get::<BTreeSet<String>>(REGISTERED_CLASSES_KEY)? {
            return Ok(names);
        }
        let mut names = BTreeSet::new();
        for class in self.list()?.into_iter().filter(|c| c.enabled) {
            if let Some(alias) = class.alias {
                names.insert(alias);
            }
            names.insert(class.class_name);
        }
        cache.put(REGISTERED_CLASSES_KEY, &names)?;
        Ok(names)
    }
}
