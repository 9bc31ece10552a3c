#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Caller-contract violation: surfaced immediately, never retried.
    #[error("usage error: {0}")]
    Usage(String),

    /// A required session is missing. Probing lookups (`load`) return
    /// `Option` instead; this variant is for hard misses such as a branch
    /// source that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Index storage busy or lock wait exceeded. Transient: the caller may
    /// retry with backoff, the store itself never does.
    #[error("storage busy: {0}")]
    Busy(String),

    /// A stored row failed to decode.
    #[error("corrupt record in {table}.{column}: {detail}")]
    CorruptRecord {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Busy(e.to_string());
            }
        }
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_from_sqlite_busy_code() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(StoreError::from(sqlite_err), StoreError::Busy(_)));
    }

    #[test]
    fn other_sqlite_errors_map_to_database() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("constraint failed".into()),
        );
        assert!(matches!(StoreError::from(sqlite_err), StoreError::Database(_)));
    }

    #[test]
    fn serde_errors_map_to_serialization() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err = StoreError::from(bad.unwrap_err());
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
