use crate::db::{DuckDBConnectionManager, MaterializedCatalog};
use crate::exec::{ExecError, Row, RowSet, SqlExecutor, Target};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, ValueRef};
use r2d2::Pool;
use serde_json::{Number, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Runs SQL on a DuckDB database. Used for both targets: the embedded one
/// opens a local file and tracks which tables it holds, the warehouse one
/// opens a remote connection string and holds everything.
pub struct DuckDbExecutor {
    target: Target,
    pool: Pool<DuckDBConnectionManager>,
    catalog: Option<Arc<MaterializedCatalog>>,
}

impl DuckDbExecutor {
    pub fn embedded(pool: Pool<DuckDBConnectionManager>) -> Self {
        Self {
            target: Target::Embedded,
            pool,
            catalog: Some(Arc::new(MaterializedCatalog::new())),
        }
    }

    pub fn warehouse(pool: Pool<DuckDBConnectionManager>) -> Self {
        Self {
            target: Target::Warehouse,
            pool,
            catalog: None,
        }
    }
}

#[async_trait]
impl SqlExecutor for DuckDbExecutor {
    async fn run(&self, sql: &str) -> Result<RowSet, ExecError> {
        info!("Executing SQL on {} target", self.target);
        debug!("SQL: {}", sql);

        let pool = self.pool.clone();
        let sql = sql.to_string();
        let task = tokio::task::spawn_blocking(move || -> Result<RowSet, ExecError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;

            let columns = rows
                .as_ref()
                .map(|stmt| stmt.column_names())
                .unwrap_or_default();

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    let value = json_value(row.get_ref(i)?);
                    record.insert(name.clone(), value);
                }
                out.push(record);
            }

            Ok(RowSet { columns, rows: out })
        });

        match task.await {
            Ok(result) => {
                if let Err(e) = &result {
                    error!("{} execution failed: {}", self.target, e);
                }
                result
            }
            Err(join_err) => {
                error!("Task join error: {}", join_err);
                Err(ExecError::Task(join_err.to_string()))
            }
        }
    }

    async fn is_materialized(&self, table: &str) -> bool {
        match &self.catalog {
            Some(catalog) => catalog.contains(table).await,
            None => true,
        }
    }

    async fn refresh_catalog(&self) -> Result<usize, ExecError> {
        match &self.catalog {
            Some(catalog) => catalog
                .refresh(&self.pool)
                .await
                .map_err(|e| ExecError::Connection(e.to_string())),
            None => Ok(0),
        }
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => Value::from(small),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => float_value(f as f64),
        ValueRef::Double(f) => float_value(f),
        ValueRef::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(text))
        }
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
        ValueRef::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + 719_163)
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null)
        }
        other => {
            warn!("Unsupported DuckDB value type, returning debug form");
            Value::String(format!("{:?}", other))
        }
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}
