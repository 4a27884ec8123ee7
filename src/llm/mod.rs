pub mod models;
pub mod parse;
pub mod prompt;
pub mod providers;
pub mod router;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use router::{GenerationFailed, GenerationRouter};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
    /// The provider answered, but not with anything usable as SQL.
    #[error("LLM output malformed: {0}")]
    Malformed(String),
}

/// Generation providers, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Ollama-style local model server.
    Local,
    /// OpenAI-compatible chat completions endpoint.
    Remote,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Local => write!(f, "local"),
            Provider::Remote => write!(f, "remote"),
        }
    }
}

/// A provider turns a question plus table context into a raw completion.
/// Parsing the completion is the router's job.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, context: &str) -> Result<String, LlmError>;
}
