//! Key/value persistence shared by the authorization sessions and the token vault.
//!
//! Two backends implement [`KvStore`]:
//! - [`SqliteKvStore`]: durable, used by the server binary
//! - [`MemoryKvStore`]: process-local, used by tests
//!
//! Entries written with a TTL disappear from `get` once they expire, whether or
//! not [`KvStore::purge_expired`] has reclaimed them yet.

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Backend failure. Always fatal to the operation that hit it.
#[derive(Debug, Error)]
#[error("key/value store unavailable: {0}")]
pub struct StoreError(pub String);

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError(err.to_string())
    }
}

pub trait KvStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// `ttl = None` keeps the entry until it is deleted.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns the live value for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Removes `key`. Returns whether this call removed a live entry, so two
    /// racing deletes of the same key never both see `true`.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Drops every expired entry, returning how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Background task that periodically reclaims expired entries.
pub async fn run_store_cleanup(store: Arc<dyn KvStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        match store.purge_expired() {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Purged expired store entries"),
            Err(e) => tracing::warn!(error = %e, "Store cleanup failed"),
        }
    }
}
