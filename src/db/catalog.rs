use crate::db::pool::DuckDBConnectionManager;
use duckdb::Connection;
use r2d2::Pool;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Cached set of tables present in the embedded database. Names are kept
/// lowercased, both bare and schema-qualified.
pub struct MaterializedCatalog {
    tables: RwLock<HashSet<String>>,
    last_refresh: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl Default for MaterializedCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterializedCatalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashSet::new()),
            last_refresh: RwLock::new(None),
        }
    }

    /// Re-reads the table list from the database behind `pool`.
    pub async fn refresh(
        &self,
        pool: &Pool<DuckDBConnectionManager>,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        info!("Refreshing materialized table catalog");

        let pool = pool.clone();
        let tables = tokio::task::spawn_blocking(
            move || -> Result<Vec<(String, String)>, Box<dyn std::error::Error + Send + Sync>> {
                let conn = pool.get()?;
                list_tables(&conn)
            },
        )
        .await??;

        let mut names = HashSet::new();
        for (schema, table) in &tables {
            let table = table.to_lowercase();
            names.insert(format!("{}.{}", schema.to_lowercase(), table));
            names.insert(table);
        }
        let count = tables.len();

        *self.tables.write().await = names;
        *self.last_refresh.write().await = Some(chrono::Utc::now());

        info!("Catalog refreshed: {} materialized tables", count);
        Ok(count)
    }

    pub async fn contains(&self, table: &str) -> bool {
        self.tables.read().await.contains(&table.to_lowercase())
    }

    pub async fn last_refresh(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.last_refresh.read().await
    }
}

fn list_tables(
    conn: &Connection,
) -> Result<Vec<(String, String)>, Box<dyn std::error::Error + Send + Sync>> {
    let query = "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_schema NOT IN ('information_schema', 'pg_catalog')";

    match conn.prepare(query) {
        Ok(mut stmt) => {
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let tables: Vec<(String, String)> = rows.filter_map(Result::ok).collect();
            debug!("Found {} tables via information_schema", tables.len());
            Ok(tables)
        }
        Err(e) => {
            error!("Error preparing information_schema query: {}", e);

            // Fall back to SHOW TABLES, which only sees the current schema
            let mut stmt = conn.prepare("SHOW TABLES")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows
                .filter_map(Result::ok)
                .map(|name| ("main".to_string(), name))
                .collect())
        }
    }
}
