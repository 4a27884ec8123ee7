use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chart::ChartRecommendation;
use crate::exec::ExecutionResult;
use crate::llm::models::GeneratedQuery;

/// A caller's question against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub natural_language_query: String,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl QueryRequest {
    pub fn new(natural_language_query: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            natural_language_query: natural_language_query.into(),
            table_name: table_name.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn key(&self) -> String {
        derive_key(&self.table_name, &self.natural_language_query)
    }
}

/// One generation plus one execution for a request. This is what the cache
/// stores and what an approval promotes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub natural_language_query: String,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub generated: GeneratedQuery,
    pub executed: ExecutionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartRecommendation>,
}

impl QueryResult {
    pub fn new(request: &QueryRequest, generated: GeneratedQuery, executed: ExecutionResult) -> Self {
        Self {
            natural_language_query: request.natural_language_query.clone(),
            table_name: request.table_name.clone(),
            user_id: request.user_id.clone(),
            generated,
            executed,
            chart: None,
        }
    }

    pub fn key(&self) -> String {
        derive_key(&self.table_name, &self.natural_language_query)
    }
}

/// `sha256(table + ":" + lowercase(trim(prompt)))` as lowercase hex.
/// Prompts differing only in case or surrounding whitespace share a key.
pub fn derive_key(table_name: &str, natural_language_query: &str) -> String {
    let normalized = natural_language_query.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(table_name.as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}
