pub mod duck;
pub mod router;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use duck::DuckDbExecutor;
pub use router::{ExecutionFailed, ExecutionRouter};

/// One result row, column name to value, in select-list order.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Local DuckDB holding materialized copies of some tables.
    Embedded,
    /// Remote warehouse holding every table.
    Warehouse,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Embedded => write!(f, "embedded"),
            Target::Warehouse => write!(f, "warehouse"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("{0} target is not configured")]
    NotConfigured(Target),
    #[error("execution task failed: {0}")]
    Task(String),
}

impl From<duckdb::Error> for ExecError {
    fn from(err: duckdb::Error) -> Self {
        ExecError::Query(err.to_string())
    }
}

impl From<r2d2::Error> for ExecError {
    fn from(err: r2d2::Error) -> Self {
        ExecError::Connection(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub target: Target,
    pub row_count: usize,
    pub elapsed_ms: u64,
}

/// Something that runs SQL and hands back rows.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn run(&self, sql: &str) -> Result<RowSet, ExecError>;

    /// Whether `table` can be queried on this target without falling back.
    async fn is_materialized(&self, _table: &str) -> bool {
        true
    }

    /// Reloads whatever table list backs `is_materialized`, returning the
    /// number of tables seen. Targets without one report 0.
    async fn refresh_catalog(&self) -> Result<usize, ExecError> {
        Ok(0)
    }
}
