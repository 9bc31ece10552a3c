use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Handle factory for sessions.db.
///
/// Unlike a pooled or long-lived connection, every operation opens its own
/// connection, runs, and drops it on every exit path. WAL mode gives one
/// writer at a time with non-blocking readers; a writer that cannot acquire
/// the lock within busy_timeout surfaces `StoreError::Busy`.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Create the parent directory if needed, apply the schema, and return
    /// the factory. The schema connection is dropped before returning.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let db = Self {
            path: path.to_owned(),
        };

        let conn = db.connect()?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }

        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open a short-lived connection, run the closure, and release the
    /// connection unconditionally (the `Connection` drops on all paths).
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        Ok(conn)
    }
}
