use duckdb::Connection;
use r2d2::{ManageConnection, Pool};

/// r2d2 manager for DuckDB connections. Each connection runs `init_sql`
/// right after opening, which is where extensions get loaded or settings
/// applied.
///
/// Every connection to `:memory:` is its own database, so pools meant to
/// share tables need a file path or a remote connection string.
pub struct DuckDBConnectionManager {
    connection_string: String,
    init_sql: Option<String>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            init_sql: None,
        }
    }

    pub fn with_init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql = Some(sql.into());
        self
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = Connection::open(&self.connection_string)?;
        if let Some(sql) = &self.init_sql {
            conn.execute_batch(sql)?;
        }
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub fn build_pool(
    manager: DuckDBConnectionManager,
    size: usize,
) -> Result<Pool<DuckDBConnectionManager>, r2d2::Error> {
    Pool::builder()
        .max_size(size.max(1) as u32)
        .build(manager)
}
