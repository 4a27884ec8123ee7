use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::approval::{ApprovedQuery, SimilarApproved};
use crate::cache::{CacheEntry, CacheStats};
use crate::error::EngineError;
use crate::exec::Target;
use crate::llm::Provider;
use crate::models::QueryRequest;
use crate::orchestrator::QueryResponse;
use crate::web::state::AppState;

const DEFAULT_RECENT_LIMIT: usize = 20;
const DEFAULT_SIMILAR_LIMIT: usize = 5;

// Error mapping

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    causes: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::GenerationFailed(_) | EngineError::ExecutionFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = ErrorBody {
            error: self.0.to_string(),
            causes: self.0.causes(),
        };
        (status, Json(body)).into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize, Default)]
pub struct ApproveRequest {
    pub approved_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovedParams {
    pub table: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SimilarRequest {
    pub prompt: String,
    pub table_name: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub tables: usize,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub preferred_provider: Provider,
    pub preferred_target: Target,
    pub cache: CacheStats,
    pub approved_count: usize,
}

// Handlers

pub async fn run_query(
    state: State<Arc<AppState>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    info!(
        "Query on {}: {}",
        payload.table_name, payload.natural_language_query
    );
    let response = state.orchestrator.run(payload).await?;
    Ok(Json(response))
}

pub async fn approve(
    state: State<Arc<AppState>>,
    Path(cache_id): Path<String>,
    payload: Option<Json<ApproveRequest>>,
) -> Result<Json<ApprovedQuery>, ApiError> {
    let approved_by = payload.and_then(|Json(body)| body.approved_by);
    let approved = state.orchestrator.approve(&cache_id, approved_by).await?;
    Ok(Json(approved))
}

pub async fn list_approved(
    state: State<Arc<AppState>>,
    Query(params): Query<ApprovedParams>,
) -> Result<Json<Vec<ApprovedQuery>>, ApiError> {
    let approved = state.orchestrator.approved(params.table).await?;
    Ok(Json(approved))
}

pub async fn similar_approved(
    state: State<Arc<AppState>>,
    Json(payload): Json<SimilarRequest>,
) -> Result<Json<Vec<SimilarApproved>>, ApiError> {
    let similar = state
        .orchestrator
        .find_similar_approved(
            &payload.prompt,
            &payload.table_name,
            payload.limit.unwrap_or(DEFAULT_SIMILAR_LIMIT),
        )
        .await?;
    Ok(Json(similar))
}

pub async fn recent_cache(
    state: State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Json<Vec<CacheEntry>> {
    Json(
        state
            .orchestrator
            .recent(params.limit.unwrap_or(DEFAULT_RECENT_LIMIT)),
    )
}

pub async fn sweep_cache(state: State<Arc<AppState>>) -> Json<SweepResponse> {
    Json(SweepResponse {
        removed: state.orchestrator.sweep_cache(),
    })
}

pub async fn refresh_catalog(
    state: State<Arc<AppState>>,
) -> Result<Json<CatalogResponse>, ApiError> {
    let tables = state.orchestrator.refresh_catalog().await?;
    Ok(Json(CatalogResponse { tables }))
}

pub async fn system_status(
    state: State<Arc<AppState>>,
) -> Result<Json<SystemStatus>, ApiError> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();
    let approved_count = state.orchestrator.approved_count().await?;

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        preferred_provider: state.config.generation.preferred_provider,
        preferred_target: state.config.execution.preferred_target,
        cache: state.orchestrator.cache_stats(),
        approved_count,
    }))
}
