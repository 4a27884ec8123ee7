//! Queries a human has vetted, with running execution statistics.

pub mod store;

use crate::llm::Provider;
use crate::models::QueryResult;
use crate::similarity::{find_top_k_with, SimilarityMetric};
use crate::util::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

pub use store::{DuckDbStore, KeyValueStore, MemoryStore, StoreError};

const KEY_PREFIX: &str = "approved:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedQuery {
    pub id: String,
    pub natural_language_query: String,
    pub sql: String,
    pub table_name: String,
    pub provider: Provider,
    pub approved_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_by: Option<String>,
    pub execution_count: u64,
    pub last_executed: DateTime<Utc>,
    pub avg_execution_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarApproved {
    pub query: ApprovedQuery,
    pub similarity: f64,
}

pub struct ApprovalStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    metric: SimilarityMetric,
    threshold: f64,
    /// Serializes approve's read-modify-write.
    write_lock: Mutex<()>,
}

impl ApprovalStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        metric: SimilarityMetric,
        threshold: f64,
    ) -> Self {
        Self {
            store,
            clock,
            metric,
            threshold,
            write_lock: Mutex::new(()),
        }
    }

    fn key(id: &str) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    /// Records an approval of `result`. The first approval creates the
    /// entry; later ones fold the execution time into the running mean.
    pub fn approve(
        &self,
        result: &QueryResult,
        approved_by: Option<&str>,
    ) -> Result<ApprovedQuery, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

        let id = result.key();
        let key = Self::key(&id);
        let now = self.clock.now();
        let elapsed = result.executed.elapsed_ms as f64;

        let approved = match self.store.get(&key)? {
            Some(raw) => {
                let mut existing: ApprovedQuery = serde_json::from_str(&raw)?;
                existing.execution_count += 1;
                existing.last_executed = now;
                let n = existing.execution_count as f64;
                existing.avg_execution_ms = (existing.avg_execution_ms * (n - 1.0) + elapsed) / n;
                existing
            }
            None => ApprovedQuery {
                id,
                natural_language_query: result.natural_language_query.clone(),
                sql: result.generated.sql.clone(),
                table_name: result.table_name.clone(),
                provider: result.generated.provider,
                approved_at: now,
                approved_by: approved_by.map(str::to_string),
                execution_count: 1,
                last_executed: now,
                avg_execution_ms: elapsed,
            },
        };

        self.store.set(&key, &serde_json::to_string(&approved)?)?;
        info!(
            "Approved query {} (executions: {})",
            approved.id, approved.execution_count
        );
        Ok(approved)
    }

    pub fn get(&self, id: &str) -> Result<Option<ApprovedQuery>, StoreError> {
        match self.store.get(&Self::key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Approved queries, optionally for one table, most recently executed first.
    pub fn list(&self, table_name: Option<&str>) -> Result<Vec<ApprovedQuery>, StoreError> {
        let mut approved = Vec::new();
        for (_, raw) in self.store.list(KEY_PREFIX)? {
            let query: ApprovedQuery = serde_json::from_str(&raw)?;
            if table_name.is_none_or(|t| query.table_name == t) {
                approved.push(query);
            }
        }
        approved.sort_by(|a, b| {
            b.last_executed
                .cmp(&a.last_executed)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(approved)
    }

    /// Number of approved queries, without decoding them.
    pub fn count(&self) -> Result<usize, StoreError> {
        self.store.count(KEY_PREFIX)
    }

    /// Approved queries on `table_name` whose prompt resembles `prompt`,
    /// best first.
    pub fn find_similar(
        &self,
        prompt: &str,
        table_name: &str,
        limit: usize,
    ) -> Result<Vec<SimilarApproved>, StoreError> {
        let candidates = self.list(Some(table_name))?;
        let texts: Vec<&str> = candidates
            .iter()
            .map(|q| q.natural_language_query.as_str())
            .collect();

        Ok(find_top_k_with(self.metric, prompt, &texts, self.threshold, limit)
            .into_iter()
            .map(|m| SimilarApproved {
                query: candidates[m.index].clone(),
                similarity: m.score,
            })
            .collect())
    }
}
