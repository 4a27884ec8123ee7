//! Durable key/value storage behind the approval store.

use crate::db::{build_pool, DuckDBConnectionManager};
use r2d2::Pool;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store database error: {0}")]
    Database(String),
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("stored value is not valid: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store task failed: {0}")]
    Task(String),
}

impl From<duckdb::Error> for StoreError {
    fn from(err: duckdb::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Connection(err.to_string())
    }
}

/// String keys to string values. Calls block.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Every pair whose key starts with `prefix`, ordered by key.
    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Number of keys starting with `prefix`.
    fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        Ok(self.list(prefix)?.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count())
    }
}

/// Key/value pairs in a single DuckDB table.
pub struct DuckDbStore {
    pool: Pool<DuckDBConnectionManager>,
}

impl DuckDbStore {
    pub fn new(pool: Pool<DuckDBConnectionManager>) -> Result<Self, StoreError> {
        let conn = pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS approved_queries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )?;
        Ok(Self { pool })
    }

    pub fn open(path: &str) -> Result<Self, StoreError> {
        info!("Opening approval store at {}", path);
        let manager = DuckDBConnectionManager::new(path.to_string());
        Self::new(build_pool(manager, 2)?)
    }
}

impl KeyValueStore for DuckDbStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT value FROM approved_queries WHERE key = ?")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO approved_queries (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM approved_queries WHERE starts_with(key, ?) ORDER BY key",
        )?;
        let pairs = stmt
            .query_map([prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM approved_queries WHERE starts_with(key, ?)",
            [prefix],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn KeyValueStore) {
        store.set("approved:b", "2").unwrap();
        store.set("approved:a", "1").unwrap();
        store.set("other:c", "3").unwrap();
        store.set("approved:a", "one").unwrap();

        assert_eq!(store.get("approved:a").unwrap().as_deref(), Some("one"));
        assert_eq!(store.get("missing").unwrap(), None);
        assert_eq!(
            store.list("approved:").unwrap(),
            vec![
                ("approved:a".to_string(), "one".to_string()),
                ("approved:b".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(store.count("approved:").unwrap(), 2);
        assert_eq!(store.count("other:").unwrap(), 1);
        assert_eq!(store.count("none:").unwrap(), 0);
    }

    #[test]
    fn memory_store_roundtrip() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn duckdb_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("approved.duckdb");
        let path = path.to_str().unwrap();

        {
            let store = DuckDbStore::open(path).unwrap();
            exercise(&store);
        }

        let reopened = DuckDbStore::open(path).unwrap();
        assert_eq!(reopened.get("approved:b").unwrap().as_deref(), Some("2"));
    }
}
