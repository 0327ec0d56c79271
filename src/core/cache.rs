//! Key/value cache stored next to the plugin tables.
//!
//! Derived lookups (the registered class set, for one) are memoized here and
//! the whole cache is flushed after every lifecycle operation.

use crate::core::error::PluginctlError;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub struct Cache<'a> {
    conn: &'a Connection,
}

impl<'a> Cache<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PluginctlError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT cache_value FROM cache_entries WHERE cache_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            // A value that no longer deserializes is treated as a miss.
            Some(text) => Ok(serde_json::from_str(&text).ok()),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PluginctlError> {
        let text = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries(cache_key, cache_value, stored_at) VALUES(?1, ?2, ?3)",
            params![key, text, time::now_epoch_z()],
        )?;
        Ok(())
    }

    /// Drop every cached entry. Returns how many were removed.
    pub fn flush(&self) -> Result<usize, PluginctlError> {
        let removed = self.conn.execute("DELETE FROM cache_entries", [])?;
        tracing::debug!(removed, "cache flushed");
        Ok(removed)
    }
}
