use crate::config::ExecutionConfig;
use crate::exec::{ExecError, ExecutionResult, SqlExecutor, Target};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Every target tried for one statement, in order, with its error.
#[derive(Debug)]
pub struct ExecutionFailed {
    pub attempts: Vec<(Target, ExecError)>,
}

impl fmt::Display for ExecutionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution failed")?;
        for (target, err) in &self.attempts {
            write!(f, "; {}: {}", target, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.attempts
            .last()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

/// Picks the target for a statement and falls back from the embedded
/// engine to the warehouse. Nothing is retried on the final target: a
/// statement that failed on the warehouse is not safe to replay blindly.
pub struct ExecutionRouter {
    targets: HashMap<Target, Arc<dyn SqlExecutor>>,
    preferred: Target,
    enable_materialization: bool,
}

impl ExecutionRouter {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            targets: HashMap::new(),
            preferred: config.preferred_target,
            enable_materialization: config.enable_materialization,
        }
    }

    pub fn with_target(mut self, target: Target, executor: Arc<dyn SqlExecutor>) -> Self {
        self.targets.insert(target, executor);
        self
    }

    /// Targets to try for `table`, in order.
    pub async fn plan(&self, table_name: &str) -> Vec<Target> {
        if self.preferred == Target::Warehouse || !self.enable_materialization {
            return vec![Target::Warehouse];
        }

        let materialized = match self.targets.get(&Target::Embedded) {
            Some(embedded) => embedded.is_materialized(table_name).await,
            None => false,
        };

        if materialized {
            vec![Target::Embedded, Target::Warehouse]
        } else {
            info!(
                "Table {} is not materialized locally, using warehouse",
                table_name
            );
            vec![Target::Warehouse]
        }
    }

    pub async fn execute(
        &self,
        sql: &str,
        table_name: &str,
    ) -> Result<ExecutionResult, ExecutionFailed> {
        let mut attempts = Vec::new();

        for target in self.plan(table_name).await {
            let Some(executor) = self.targets.get(&target) else {
                attempts.push((target, ExecError::NotConfigured(target)));
                continue;
            };

            let start = Instant::now();
            match executor.run(sql).await {
                Ok(rows) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    info!(
                        "Executed on {} in {}ms, {} rows",
                        target,
                        elapsed_ms,
                        rows.rows.len()
                    );
                    return Ok(ExecutionResult {
                        row_count: rows.rows.len(),
                        rows: rows.rows,
                        columns: rows.columns,
                        target,
                        elapsed_ms,
                    });
                }
                Err(e) => {
                    warn!("Execution on {} failed: {}", target, e);
                    attempts.push((target, e));
                }
            }
        }

        Err(ExecutionFailed { attempts })
    }

    /// Reloads every target's table catalog so tables materialized after
    /// startup are routed locally. Returns the number of tables seen.
    pub async fn refresh_catalogs(&self) -> Result<usize, ExecutionFailed> {
        let mut total = 0;
        let mut attempts = Vec::new();

        for target in [Target::Embedded, Target::Warehouse] {
            let Some(executor) = self.targets.get(&target) else {
                continue;
            };
            match executor.refresh_catalog().await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!("Catalog refresh on {} failed: {}", target, e);
                    attempts.push((target, e));
                }
            }
        }

        if attempts.is_empty() {
            Ok(total)
        } else {
            Err(ExecutionFailed { attempts })
        }
    }
}
