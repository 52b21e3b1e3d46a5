//! SQLite-backed key/value store.

use super::{KvStore, StoreError};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Durable key/value store.
///
/// # Schema
/// ```sql
/// CREATE TABLE kv_store (
///     key        TEXT PRIMARY KEY,
///     value      BLOB NOT NULL,
///     expires_at INTEGER            -- unix millis, NULL = never
/// );
/// ```
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Opens (or creates) the database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store DB at {}", path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv_store(expires_at);",
        )
        .context("Failed to create kv_store table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError("connection lock poisoned".to_string()))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl KvStore for SqliteKvStore {
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl
            .map(|ttl| {
                i64::try_from(ttl.as_millis())
                    .ok()
                    .and_then(|millis| now_millis().checked_add(millis))
                    .ok_or_else(|| StoreError(format!("ttl of {:?} is out of range", ttl)))
            })
            .transpose()?;

        self.conn()?.execute(
            "INSERT INTO kv_store (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM kv_store
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        // Only a live row counts as removed; an expired leftover is reclaimed silently.
        let removed = conn.execute(
            "DELETE FROM kv_store WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now_millis()],
        )?;
        if removed == 0 {
            conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        }
        Ok(removed > 0)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_millis()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_store() -> SqliteKvStore {
        SqliteKvStore::new(":memory:").expect("in-memory store failed")
    }

    #[test]
    fn test_set_get_delete() {
        let store = in_memory_store();

        store.set("k1", b"value-1", None).unwrap();
        assert_eq!(store.get("k1").unwrap(), Some(b"value-1".to_vec()));

        assert!(store.delete("k1").unwrap());
        assert_eq!(store.get("k1").unwrap(), None);

        // Second delete finds nothing
        assert!(!store.delete("k1").unwrap());
    }

    #[test]
    fn test_set_overwrites() {
        let store = in_memory_store();

        store.set("k1", b"first", None).unwrap();
        store.set("k1", b"second", None).unwrap();

        assert_eq!(store.get("k1").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_missing_key() {
        let store = in_memory_store();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_ttl_expiry_hides_entry() {
        let store = in_memory_store();

        store
            .set("short", b"lived", Some(Duration::from_millis(50)))
            .unwrap();
        assert!(store.get("short").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(store.get("short").unwrap(), None);
        // An expired entry cannot be "taken" either
        assert!(!store.delete("short").unwrap());
    }

    #[test]
    fn test_out_of_range_ttl_rejected() {
        let store = in_memory_store();

        assert!(store.set("forever", b"x", Some(Duration::MAX)).is_err());
        assert_eq!(store.get("forever").unwrap(), None);
    }

    #[test]
    fn test_purge_expired() {
        let store = in_memory_store();

        store.set("a", b"1", Some(Duration::from_millis(20))).unwrap();
        store.set("b", b"2", Some(Duration::from_millis(20))).unwrap();
        store.set("c", b"3", None).unwrap();

        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(store.purge_expired().unwrap(), 2);
        assert_eq!(store.get("c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = SqliteKvStore::new(&path).unwrap();
            store.set("durable", b"yes", None).unwrap();
        }

        let reopened = SqliteKvStore::new(&path).unwrap();
        assert_eq!(reopened.get("durable").unwrap(), Some(b"yes".to_vec()));
    }
}
