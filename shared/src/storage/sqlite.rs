use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use tracing::{debug, instrument};

use super::{
    check_value_sizes, KeyValueStore, StorageError, StorageErrorCode, StorageKey, WriteOp,
    MAX_VALUE_BYTES,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// SQLite-backed store. Batches run inside one transaction.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Opens or creates a database at `path` in WAL mode.
    #[instrument(skip_all)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqlite_error)?;
        debug!(path = %path.as_ref().display(), "Opened SQLite store");
        Self::init_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_sqlite_error)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(map_sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError> {
        let conn = self.conn.lock();
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key.raw()],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_error)?;
        Ok(value.map(Bytes::from))
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        check_value_sizes(batch, MAX_VALUE_BYTES)?;

        let now = i64::try_from(crate::UnixTimeMs::now().as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_sqlite_error)?;
        for op in batch {
            match op {
                WriteOp::Put { key, value } => {
                    tx.execute(
                        "INSERT INTO kv(key, value, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                        params![key.raw(), value.as_ref(), now],
                    )
                    .map_err(map_sqlite_error)?;
                }
                WriteOp::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])
                        .map_err(map_sqlite_error)?;
                }
            }
        }
        tx.commit().map_err(map_sqlite_error)
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> StorageError {
    let code = match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => StorageErrorCode::Corrupted,
        Some(ErrorCode::PermissionDenied | ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        Some(ErrorCode::SystemIoFailure | ErrorCode::CannotOpen) => StorageErrorCode::IoError,
        _ => StorageErrorCode::Unknown,
    };
    StorageError::backend(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyNamespace;
    use tempfile::tempdir;

    fn key(name: &str) -> StorageKey {
        StorageKey::new(KeyNamespace::Media, name).unwrap()
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("media.db");

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store
                .apply(&[
                    WriteOp::put(key("pending"), b"[]".to_vec()),
                    WriteOp::put(key("blob"), vec![0u8, 159, 146, 150]),
                ])
                .unwrap();
        }

        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(
            store.get(&key("pending")).unwrap(),
            Some(Bytes::from_static(b"[]"))
        );
        assert_eq!(
            store.get(&key("blob")).unwrap().unwrap().as_ref(),
            &[0u8, 159, 146, 150]
        );
    }

    #[test]
    fn test_put_overwrites_and_delete_removes() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.set(&key("a"), Bytes::from_static(b"one")).unwrap();
        store.set(&key("a"), Bytes::from_static(b"two")).unwrap();
        assert_eq!(store.get(&key("a")).unwrap(), Some(Bytes::from_static(b"two")));

        store.delete(&key("a")).unwrap();
        assert_eq!(store.get(&key("a")).unwrap(), None);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        assert!(store.apply(&[]).is_ok());
        assert_eq!(store.get(&key("missing")).unwrap(), None);
    }
}
