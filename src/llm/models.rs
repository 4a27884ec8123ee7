use serde::{Deserialize, Serialize};

use crate::llm::Provider;
use crate::semantic::SemanticQuery;

/// What a provider answer parses into.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlGenerationOutput {
    Sql {
        sql: String,
        explanation: Option<String>,
    },
    /// Structured answer still to be compiled against the semantic model.
    Semantic(SemanticQuery),
}

/// SQL produced by one successful generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<SemanticQuery>,
}
