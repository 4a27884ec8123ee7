//! Drives one request through cache lookup, generation, execution and
//! caching, and fronts the approval store.

use crate::approval::{ApprovalStore, ApprovedQuery, SimilarApproved, StoreError};
use crate::cache::{CacheEntry, CacheStats, SemanticCache};
use crate::chart::{classify, ChartRecommendation};
use crate::error::EngineError;
use crate::exec::ExecutionRouter;
use crate::llm::GenerationRouter;
use crate::llm::models::GeneratedQuery;
use crate::models::{QueryRequest, QueryResult};
use crate::semantic::SemanticModel;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    CacheCheck,
    CacheHit,
    Generating,
    Executing,
    Caching,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub result: QueryResult,
    pub from_cache: bool,
    /// Set when the result came from a similar, not identical, prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    pub cache_id: String,
    pub transitions: Vec<OrchestratorState>,
}

pub struct QueryOrchestrator {
    generation: GenerationRouter,
    execution: ExecutionRouter,
    cache: Arc<SemanticCache>,
    approvals: Arc<ApprovalStore>,
    semantic: Option<Arc<SemanticModel>>,
    reuse_threshold: f64,
}

impl QueryOrchestrator {
    pub fn new(
        generation: GenerationRouter,
        execution: ExecutionRouter,
        cache: Arc<SemanticCache>,
        approvals: Arc<ApprovalStore>,
        reuse_threshold: f64,
    ) -> Self {
        Self {
            generation,
            execution,
            cache,
            approvals,
            semantic: None,
            reuse_threshold,
        }
    }

    pub fn with_semantic_model(mut self, model: Arc<SemanticModel>) -> Self {
        self.semantic = Some(model);
        self
    }

    fn validate(&self, request: &QueryRequest) -> Result<(), EngineError> {
        if request.natural_language_query.trim().is_empty() {
            return Err(EngineError::ValidationFailed(
                "natural_language_query must not be empty".to_string(),
            ));
        }
        if request.table_name.trim().is_empty() {
            return Err(EngineError::ValidationFailed(
                "table_name must not be empty".to_string(),
            ));
        }

        if let Some(model) = &self.semantic {
            let table = model
                .require_table(&request.table_name)
                .map_err(|e| EngineError::ValidationFailed(e.to_string()))?;
            table
                .validate_prompt(&request.table_name, &request.natural_language_query)
                .map_err(|e| EngineError::ValidationFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Table name the SQL actually runs against.
    fn physical_table(&self, table_name: &str) -> String {
        self.semantic
            .as_ref()
            .and_then(|model| model.table(table_name))
            .map(|table| table.table.clone())
            .unwrap_or_else(|| table_name.to_string())
    }

    fn chart_for(&self, table_name: &str, generated: &GeneratedQuery) -> Option<ChartRecommendation> {
        let spec = generated.spec.as_ref()?;
        let table = self.semantic.as_ref()?.table(table_name)?;
        let meta = table.dimension_meta(&spec.dimensions);
        Some(classify(spec.dimensions.len(), spec.measures.len(), &meta))
    }

    fn cache_lookup(&self, request: &QueryRequest) -> Option<(QueryResult, String, Option<f64>)> {
        let table = &request.table_name;
        let prompt = &request.natural_language_query;

        match self.cache.get(table, prompt) {
            Ok(Some(result)) => return Some((result, request.key(), None)),
            Ok(None) => {}
            Err(e) => warn!("Cache lookup failed, treating as miss: {}", e),
        }

        match self.cache.get_similar(table, prompt, self.reuse_threshold) {
            Ok(Some(hit)) => Some((hit.result, hit.id, Some(hit.similarity))),
            Ok(None) => None,
            Err(e) => {
                warn!("Similar cache lookup failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Answers one request, from the cache when possible.
    ///
    /// Identical requests that miss concurrently are not coalesced: each
    /// generates and executes, and the first to reach the cache wins.
    pub async fn run(&self, request: QueryRequest) -> Result<QueryResponse, EngineError> {
        let mut transitions = vec![OrchestratorState::Idle];
        self.validate(&request)?;

        transitions.push(OrchestratorState::CacheCheck);
        if let Some((result, cache_id, similarity)) = self.cache_lookup(&request) {
            info!(
                "Cache hit for '{}' on {}",
                request.natural_language_query, request.table_name
            );
            transitions.push(OrchestratorState::CacheHit);
            transitions.push(OrchestratorState::Done);
            return Ok(QueryResponse {
                result,
                from_cache: true,
                similarity,
                cache_id,
                transitions,
            });
        }

        transitions.push(OrchestratorState::Generating);
        let generated = match self
            .generation
            .generate(&request.natural_language_query, &request.table_name, None)
            .await
        {
            Ok(generated) => generated,
            Err(e) => {
                transitions.push(OrchestratorState::Error);
                error!("Generation failed after {:?}: {}", transitions, e);
                return Err(e.into());
            }
        };
        debug!("Generated SQL: {}", generated.sql);

        transitions.push(OrchestratorState::Executing);
        let physical = self.physical_table(&request.table_name);
        let executed = match self.execution.execute(&generated.sql, &physical).await {
            Ok(executed) => executed,
            Err(e) => {
                transitions.push(OrchestratorState::Error);
                error!("Execution failed after {:?}: {}", transitions, e);
                return Err(e.into());
            }
        };

        let chart = self.chart_for(&request.table_name, &generated);
        let mut result = QueryResult::new(&request, generated, executed);
        result.chart = chart;

        transitions.push(OrchestratorState::Caching);
        let cache_id = result.key();
        if let Err(e) = self.cache.put(result.clone()) {
            warn!("Failed to cache result {}: {}", cache_id, e);
        }
        transitions.push(OrchestratorState::Done);

        Ok(QueryResponse {
            result,
            from_cache: false,
            similarity: None,
            cache_id,
            transitions,
        })
    }

    async fn with_approvals<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&ApprovalStore) -> Result<T, StoreError> + Send + 'static,
    {
        let approvals = self.approvals.clone();
        let outcome = tokio::task::spawn_blocking(move || f(&approvals))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        Ok(outcome?)
    }

    /// Promotes a cached result into the approval store.
    pub async fn approve(
        &self,
        cache_id: &str,
        approved_by: Option<String>,
    ) -> Result<ApprovedQuery, EngineError> {
        let entry = match self.cache.get_by_id(cache_id) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache lookup for approval failed: {}", e);
                None
            }
        };
        let entry =
            entry.ok_or_else(|| EngineError::NotFound(format!("cache entry {}", cache_id)))?;

        self.with_approvals(move |approvals| {
            approvals.approve(&entry.result, approved_by.as_deref())
        })
        .await
    }

    pub async fn find_similar_approved(
        &self,
        prompt: &str,
        table_name: &str,
        limit: usize,
    ) -> Result<Vec<SimilarApproved>, EngineError> {
        let prompt = prompt.to_string();
        let table_name = table_name.to_string();
        self.with_approvals(move |approvals| approvals.find_similar(&prompt, &table_name, limit))
            .await
    }

    pub async fn approved(&self, table_name: Option<String>) -> Result<Vec<ApprovedQuery>, EngineError> {
        self.with_approvals(move |approvals| approvals.list(table_name.as_deref()))
            .await
    }

    pub async fn approved_count(&self) -> Result<usize, EngineError> {
        self.with_approvals(|approvals| approvals.count()).await
    }

    /// Drops expired cache entries; a broken cache counts as nothing removed.
    pub fn sweep_cache(&self) -> usize {
        match self.cache.sweep_expired() {
            Ok(removed) => {
                if removed > 0 {
                    info!("Swept {} expired cache entries", removed);
                }
                removed
            }
            Err(e) => {
                warn!("Cache sweep failed: {}", e);
                0
            }
        }
    }

    /// Re-reads which tables each execution target holds.
    pub async fn refresh_catalog(&self) -> Result<usize, EngineError> {
        let tables = self.execution.refresh_catalogs().await?;
        info!("Execution catalogs list {} tables", tables);
        Ok(tables)
    }

    pub fn recent(&self, limit: usize) -> Vec<CacheEntry> {
        self.cache.recent(limit).unwrap_or_else(|e| {
            warn!("Failed to list recent cache entries: {}", e);
            Vec::new()
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats().unwrap_or_else(|e| {
            warn!("Failed to read cache stats: {}", e);
            CacheStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::MemoryStore;
    use crate::config::{ExecutionConfig, GenerationConfig};
    use crate::exec::{ExecError, Row, RowSet, SqlExecutor, Target};
    use crate::llm::{LlmError, Provider, SqlGenerator};
    use crate::similarity::SimilarityMetric;
    use crate::util::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        answer: Result<&'static str, &'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SqlGenerator for CountingGenerator {
        async fn generate_sql(&self, _question: &str, _context: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .map(str::to_string)
                .map_err(|e| LlmError::ConnectionError(e.to_string()))
        }
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SqlExecutor for CountingExecutor {
        async fn run(&self, _sql: &str) -> Result<RowSet, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut row = Row::new();
            row.insert("traffic_source".to_string(), "organic".into());
            row.insert("revenue".to_string(), 10.into());
            Ok(RowSet {
                columns: vec!["traffic_source".to_string(), "revenue".to_string()],
                rows: vec![row],
            })
        }
    }

    struct Harness {
        orchestrator: QueryOrchestrator,
        generator: Arc<CountingGenerator>,
        executor: Arc<CountingExecutor>,
        clock: Arc<ManualClock>,
    }

    fn harness(answer: Result<&'static str, &'static str>) -> Harness {
        let generator = Arc::new(CountingGenerator {
            answer,
            calls: AtomicUsize::new(0),
        });
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::default());
        let model = Arc::new(crate::semantic::tests::model());

        let generation = GenerationRouter::new(
            &GenerationConfig {
                preferred_provider: Provider::Local,
                fallback_enabled: false,
                ..Default::default()
            },
            Some(model.clone()),
        )
        .with_provider(Provider::Local, generator.clone());
        let execution = ExecutionRouter::new(&ExecutionConfig {
            preferred_target: Target::Warehouse,
            enable_materialization: true,
        })
        .with_target(Target::Warehouse, executor.clone());

        let cache = Arc::new(SemanticCache::new(Duration::minutes(60), 10, clock.clone()));
        let approvals = Arc::new(ApprovalStore::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            SimilarityMetric::Cosine,
            0.3,
        ));

        let orchestrator = QueryOrchestrator::new(generation, execution, cache, approvals, 0.85)
            .with_semantic_model(model);
        Harness {
            orchestrator,
            generator,
            executor,
            clock,
        }
    }

    const STRUCTURED: &str = r#"{"table": "sessions", "dimensions": ["traffic_source"], "measures": ["revenue"]}"#;

    #[tokio::test]
    async fn validation_happens_before_any_call() {
        let h = harness(Ok(STRUCTURED));
        for request in [
            QueryRequest::new("   ", "sessions"),
            QueryRequest::new("revenue", ""),
            QueryRequest::new("revenue", "users"),
            QueryRequest::new("revenue by device_type", "sessions"),
        ] {
            let err = h.orchestrator.run(request).await.unwrap_err();
            assert!(matches!(err, EngineError::ValidationFailed(_)), "{:?}", err);
        }
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn structured_answer_gets_a_chart() {
        let h = harness(Ok(STRUCTURED));
        let response = h
            .orchestrator
            .run(QueryRequest::new("revenue by traffic source", "sessions"))
            .await
            .unwrap();

        let chart = response.result.chart.unwrap();
        assert_eq!(chart.chart_type, crate::chart::ChartType::Pie);
        assert_eq!(response.result.executed.target, Target::Warehouse);
    }

    #[tokio::test]
    async fn similar_prompt_is_served_from_cache() {
        let h = harness(Ok(STRUCTURED));
        let first = h
            .orchestrator
            .run(QueryRequest::new("total revenue by traffic source", "sessions"))
            .await
            .unwrap();
        let second = h
            .orchestrator
            .run(QueryRequest::new("revenue by traffic source", "sessions"))
            .await
            .unwrap();

        assert!(second.from_cache);
        assert_eq!(second.cache_id, first.cache_id);
        assert!(second.similarity.unwrap() >= 0.85);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exact_entry_wins_over_equally_similar_older_entry() {
        let h = harness(Ok(STRUCTURED));
        let older = crate::cache::tests::result("sessions", "revenue by traffic source", 11);
        let exact = crate::cache::tests::result("sessions", "traffic source by revenue", 22);
        h.orchestrator.cache.put(older).unwrap();
        h.clock.advance(Duration::seconds(1));
        h.orchestrator.cache.put(exact.clone()).unwrap();

        let response = h
            .orchestrator
            .run(QueryRequest::new("traffic source by revenue", "sessions"))
            .await
            .unwrap();

        assert!(response.from_cache);
        assert_eq!(response.similarity, None);
        assert_eq!(response.cache_id, exact.key());
        assert_eq!(response.result.natural_language_query, "traffic source by revenue");
        assert_eq!(response.result.executed.elapsed_ms, 22);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generation_failure_ends_in_error_and_caches_nothing() {
        let h = harness(Err("connection refused"));
        let err = h
            .orchestrator
            .run(QueryRequest::new("revenue by traffic source", "sessions"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::GenerationFailed(_)));
        assert_eq!(err.causes(), vec!["local: LLM connection error: connection refused"]);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.recent(10).is_empty());
    }

    #[tokio::test]
    async fn approve_unknown_or_expired_entry_is_not_found() {
        let h = harness(Ok(STRUCTURED));
        let err = h.orchestrator.approve("nope", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let response = h
            .orchestrator
            .run(QueryRequest::new("revenue by traffic source", "sessions"))
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(61));
        let err = h
            .orchestrator
            .approve(&response.cache_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(h.orchestrator.sweep_cache(), 1);
    }

    #[tokio::test]
    async fn approved_queries_are_suggested() {
        let h = harness(Ok(STRUCTURED));
        let response = h
            .orchestrator
            .run(QueryRequest::new("revenue by traffic source", "sessions"))
            .await
            .unwrap();
        let approved = h
            .orchestrator
            .approve(&response.cache_id, Some("ana".to_string()))
            .await
            .unwrap();
        assert_eq!(approved.execution_count, 1);
        assert_eq!(approved.id, response.cache_id);

        let similar = h
            .orchestrator
            .find_similar_approved("revenue split by source", "sessions", 3)
            .await
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(h.orchestrator.approved(None).await.unwrap().len(), 1);
        assert_eq!(h.orchestrator.approved_count().await.unwrap(), 1);
    }
}
