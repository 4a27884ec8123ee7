use crate::approval::StoreError;
use crate::exec::ExecutionFailed;
use crate::llm::GenerationFailed;
use thiserror::Error;

/// Errors a caller of the orchestrator can see. Cache trouble never shows
/// up here; a broken cache only costs a miss.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    ValidationFailed(String),
    #[error(transparent)]
    GenerationFailed(#[from] GenerationFailed),
    #[error(transparent)]
    ExecutionFailed(#[from] ExecutionFailed),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// The error message followed by every attempt or source behind it.
    pub fn causes(&self) -> Vec<String> {
        match self {
            EngineError::GenerationFailed(failed) => failed
                .attempts
                .iter()
                .map(|(provider, err)| format!("{}: {}", provider, err))
                .collect(),
            EngineError::ExecutionFailed(failed) => failed
                .attempts
                .iter()
                .map(|(target, err)| format!("{}: {}", target, err))
                .collect(),
            _ => Vec::new(),
        }
    }
}
