use crate::core::error::PluginctlError;
use crate::core::schemas;
use crate::core::store::Store;
use rusqlite::{Connection, params};
use std::fs;

pub fn db_connect(db_path: &str) -> Result<Connection, PluginctlError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(PluginctlError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(PluginctlError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(PluginctlError::RusqliteError)?;
    Ok(conn)
}

/// Create every table and index if missing and stamp the schema version.
pub fn ensure_schema(conn: &Connection) -> Result<(), PluginctlError> {
    for statement in schemas::ALL_SCHEMAS {
        conn.execute(statement, [])?;
    }
    conn.execute(
        "INSERT OR REPLACE INTO meta(key, value) VALUES('schema_version', ?1)",
        params![schemas::SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub fn initialize_db(store: &Store) -> Result<(), PluginctlError> {
    fs::create_dir_all(store.data_dir()).map_err(PluginctlError::IoError)?;
    let conn = db_connect(&store.db_path().to_string_lossy())?;
    ensure_schema(&conn)?;
    Ok(())
}

/// Open an in-memory database with the full schema. Used by tests and dry runs.
pub fn open_in_memory() -> Result<Connection, PluginctlError> {
    let conn = Connection::open_in_memory()?;
    ensure_schema(&conn)?;
    Ok(conn)
}

/// Run `f` inside a named savepoint.
///
/// Savepoints nest, so the same helper gives atomicity both for a standalone
/// call (where the savepoint opens a transaction) and for a step inside a
/// larger operation that already holds one. On error everything done since the
/// savepoint is rolled back and the error is returned unchanged.
pub fn with_savepoint<F, R>(conn: &Connection, name: &str, f: F) -> Result<R, PluginctlError>
where
    F: FnOnce(&Connection) -> Result<R, PluginctlError>,
{
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) =
                conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            {
                tracing::error!(savepoint = name, error = %rollback_err, "savepoint rollback failed");
            }
            Err(err)
        }
    }
}
