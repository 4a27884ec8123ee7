use crate::config::AppConfig;
use crate::orchestrator::QueryOrchestrator;
use std::sync::Arc;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: Arc<QueryOrchestrator>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Arc<QueryOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            startup_time: chrono::Utc::now(),
        }
    }
}
