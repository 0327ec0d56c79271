//! Serialized database access with an append-only audit trail.
//!
//! Every command that touches the plugin database goes through
//! [`DbBroker::with_conn`]. Calls are serialized in-process and each one leaves
//! a JSON line in `data/broker.events.jsonl` saying who ran which operation and
//! how it ended.

use crate::core::db;
use crate::core::error::PluginctlError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    /// `success` or `error`.
    pub status: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DbBroker {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            audit_log_path: data_dir.join(schemas::BROKER_EVENTS_NAME),
        }
    }

    /// Open `db_path`, run `f` against it and record the outcome. Only one
    /// brokered call runs at a time within the process.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, PluginctlError>
    where
        F: FnOnce(&Connection) -> Result<R, PluginctlError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _lock = DB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let started = Instant::now();
        let db_id = db_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let conn = db::db_connect(&db_path.to_string_lossy())?;
        db::ensure_schema(&conn)?;

        let result = f(&conn);

        let event = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op_name.to_string(),
            db_id,
            status: if result.is_ok() { "success" } else { "error" }.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        tracing::debug!(op = op_name, status = %event.status, duration_ms = event.duration_ms, "brokered operation finished");
        self.append(&event)?;

        result
    }

    fn append(&self, event: &BrokerEvent) -> Result<(), PluginctlError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(|e| PluginctlError::filesystem(&self.audit_log_path, e))?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    /// The audit log, oldest first.
    pub fn audit_events(&self) -> Result<Vec<BrokerEvent>, PluginctlError> {
        if !self.audit_log_path.is_file() {
            return Ok(Vec::new());
        }
        fs::read_to_string(&self.audit_log_path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PluginctlError::JsonError))
            .collect()
    }

    /// The last `limit` audit events, oldest first.
    pub fn audit_tail(&self, limit: usize) -> Result<Vec<BrokerEvent>, PluginctlError> {
        let mut events = self.audit_events()?;
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
        Ok(events)
    }
}
