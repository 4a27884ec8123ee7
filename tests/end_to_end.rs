use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use nl_query::approval::{ApprovalStore, MemoryStore};
use nl_query::cache::SemanticCache;
use nl_query::config::{AppConfig, ExecutionConfig, GenerationConfig};
use nl_query::db::{build_pool, DuckDBConnectionManager};
use nl_query::error::EngineError;
use nl_query::exec::{DuckDbExecutor, ExecError, ExecutionRouter, RowSet, SqlExecutor, Target};
use nl_query::llm::{GenerationRouter, LlmError, Provider, SqlGenerator};
use nl_query::models::QueryRequest;
use nl_query::orchestrator::{OrchestratorState, QueryOrchestrator};
use nl_query::semantic::SemanticModel;
use nl_query::similarity::SimilarityMetric;
use nl_query::util::clock::ManualClock;
use nl_query::web;
use nl_query::web::state::AppState;

const MODEL: &str = r#"{
    "tables": {
        "sessions_fct": {
            "table": "sessions_fct",
            "dimensions": {
                "traffic_source": {"column": "traffic_source", "type": "string", "values": ["organic", "paid"]}
            },
            "measures": {
                "revenue": {"aggregation": "SUM(revenue)"}
            }
        }
    }
}"#;

const REVENUE_SQL: &str = "```sql\nSELECT traffic_source, SUM(revenue) AS revenue FROM sessions_fct GROUP BY 1 ORDER BY 1\n```";

struct ScriptedGenerator {
    answer: Result<&'static str, &'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate_sql(&self, _question: &str, _context: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .map(str::to_string)
            .map_err(|e| LlmError::ConnectionError(e.to_string()))
    }
}

/// Delegates to a real executor and counts calls.
struct Counted<E> {
    inner: E,
    calls: AtomicUsize,
}

#[async_trait]
impl<E: SqlExecutor> SqlExecutor for Counted<E> {
    async fn run(&self, sql: &str) -> Result<RowSet, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run(sql).await
    }

    async fn is_materialized(&self, table: &str) -> bool {
        self.inner.is_materialized(table).await
    }

    async fn refresh_catalog(&self) -> Result<usize, ExecError> {
        self.inner.refresh_catalog().await
    }
}

struct Unreachable;

#[async_trait]
impl SqlExecutor for Unreachable {
    async fn run(&self, _sql: &str) -> Result<RowSet, ExecError> {
        Err(ExecError::Connection("warehouse unreachable".to_string()))
    }
}

struct Fixture {
    _dir: TempDir,
    pool: r2d2::Pool<DuckDBConnectionManager>,
    orchestrator: Arc<QueryOrchestrator>,
    local: Arc<ScriptedGenerator>,
    remote: Arc<ScriptedGenerator>,
    embedded: Arc<Counted<DuckDbExecutor>>,
    warehouse: Arc<Counted<Unreachable>>,
    clock: Arc<ManualClock>,
}

async fn fixture(
    local_answer: Result<&'static str, &'static str>,
    remote_answer: Result<&'static str, &'static str>,
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("embedded.duckdb");
    {
        let conn = duckdb::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sessions_fct (traffic_source TEXT, revenue DOUBLE);
             INSERT INTO sessions_fct VALUES ('organic', 10.0), ('paid', 4.5), ('organic', 2.0);",
        )
        .unwrap();
    }

    let pool = build_pool(
        DuckDBConnectionManager::new(path.to_str().unwrap().to_string()),
        2,
    )
    .unwrap();
    let duck = DuckDbExecutor::embedded(pool.clone());
    duck.refresh_catalog().await.unwrap();

    let embedded = Arc::new(Counted {
        inner: duck,
        calls: AtomicUsize::new(0),
    });
    let warehouse = Arc::new(Counted {
        inner: Unreachable,
        calls: AtomicUsize::new(0),
    });
    let local = Arc::new(ScriptedGenerator {
        answer: local_answer,
        calls: AtomicUsize::new(0),
    });
    let remote = Arc::new(ScriptedGenerator {
        answer: remote_answer,
        calls: AtomicUsize::new(0),
    });

    let model = Arc::new(SemanticModel::from_json(MODEL).unwrap());
    let generation = GenerationRouter::new(
        &GenerationConfig {
            preferred_provider: Provider::Local,
            fallback_enabled: true,
            fallback: vec![Provider::Remote],
            ..Default::default()
        },
        Some(model.clone()),
    )
    .with_provider(Provider::Local, local.clone())
    .with_provider(Provider::Remote, remote.clone());

    let execution = ExecutionRouter::new(&ExecutionConfig {
        preferred_target: Target::Embedded,
        enable_materialization: true,
    })
    .with_target(Target::Embedded, embedded.clone())
    .with_target(Target::Warehouse, warehouse.clone());

    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(SemanticCache::new(Duration::minutes(60), 100, clock.clone()));
    let approvals = Arc::new(ApprovalStore::new(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        SimilarityMetric::Cosine,
        0.3,
    ));

    let orchestrator = Arc::new(
        QueryOrchestrator::new(generation, execution, cache, approvals, 0.85)
            .with_semantic_model(model),
    );

    Fixture {
        _dir: dir,
        pool,
        orchestrator,
        local,
        remote,
        embedded,
        warehouse,
        clock,
    }
}

fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let f = fixture(Ok(REVENUE_SQL), Err("unused")).await;

    let first = f
        .orchestrator
        .run(QueryRequest::new("revenue by traffic source", "sessions_fct"))
        .await
        .unwrap();

    use OrchestratorState::*;
    assert_eq!(
        first.transitions,
        vec![Idle, CacheCheck, Generating, Executing, Caching, Done]
    );
    assert!(!first.from_cache);
    assert_eq!(first.result.generated.provider, Provider::Local);
    assert_eq!(first.result.executed.target, Target::Embedded);
    assert_eq!(first.result.executed.row_count, 2);
    assert_eq!(first.result.executed.rows[0]["traffic_source"], json!("organic"));
    assert_eq!(first.result.executed.rows[0]["revenue"], json!(12.0));

    let second = f
        .orchestrator
        .run(QueryRequest::new("  Revenue by traffic SOURCE", "sessions_fct"))
        .await
        .unwrap();

    assert_eq!(second.transitions, vec![Idle, CacheCheck, CacheHit, Done]);
    assert!(second.from_cache);
    assert!(second.similarity.is_none());
    assert_eq!(second.cache_id, first.cache_id);
    assert_eq!(second.result.executed.rows, first.result.executed.rows);

    assert_eq!(calls(&f.local.calls), 1);
    assert_eq!(calls(&f.remote.calls), 0);
    assert_eq!(calls(&f.embedded.calls), 1);
    assert_eq!(calls(&f.warehouse.calls), 0);
}

#[tokio::test]
async fn expired_result_is_regenerated() {
    let f = fixture(Ok(REVENUE_SQL), Err("unused")).await;
    let request = QueryRequest::new("revenue by traffic source", "sessions_fct");

    f.orchestrator.run(request.clone()).await.unwrap();
    f.clock.advance(Duration::minutes(60));
    let again = f.orchestrator.run(request).await.unwrap();

    assert!(!again.from_cache);
    assert_eq!(calls(&f.local.calls), 2);
}

#[tokio::test]
async fn failing_provider_falls_back() {
    let f = fixture(Err("connection refused"), Ok(REVENUE_SQL)).await;

    let response = f
        .orchestrator
        .run(QueryRequest::new("revenue by traffic source", "sessions_fct"))
        .await
        .unwrap();

    assert_eq!(response.result.generated.provider, Provider::Remote);
    assert_eq!(calls(&f.local.calls), 1);
    assert_eq!(calls(&f.remote.calls), 1);
}

#[tokio::test]
async fn bad_sql_falls_back_to_warehouse_and_reports_both() {
    let f = fixture(Ok("SELECT nope FROM sessions_fct"), Err("unused")).await;

    let err = f
        .orchestrator
        .run(QueryRequest::new("revenue by traffic source", "sessions_fct"))
        .await
        .unwrap_err();

    let EngineError::ExecutionFailed(failed) = &err else {
        panic!("expected execution failure, got {:?}", err);
    };
    let targets: Vec<Target> = failed.attempts.iter().map(|(t, _)| *t).collect();
    assert_eq!(targets, vec![Target::Embedded, Target::Warehouse]);
    assert_eq!(calls(&f.warehouse.calls), 1);
    assert!(f.orchestrator.recent(10).is_empty());
}

#[tokio::test]
async fn invalid_requests_never_reach_providers_or_targets() {
    let f = fixture(Ok(REVENUE_SQL), Ok(REVENUE_SQL)).await;

    for request in [
        QueryRequest::new("", "sessions_fct"),
        QueryRequest::new("revenue by device_type", "sessions_fct"),
        QueryRequest::new("revenue", "orders_fct"),
    ] {
        let err = f.orchestrator.run(request).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    assert_eq!(calls(&f.local.calls), 0);
    assert_eq!(calls(&f.remote.calls), 0);
    assert_eq!(calls(&f.embedded.calls), 0);
    assert_eq!(calls(&f.warehouse.calls), 0);
}

#[tokio::test]
async fn approving_twice_accumulates() {
    let f = fixture(Ok(REVENUE_SQL), Err("unused")).await;
    let response = f
        .orchestrator
        .run(QueryRequest::new("revenue by traffic source", "sessions_fct"))
        .await
        .unwrap();

    f.orchestrator
        .approve(&response.cache_id, Some("ana".to_string()))
        .await
        .unwrap();
    let approved = f.orchestrator.approve(&response.cache_id, None).await.unwrap();

    assert_eq!(approved.execution_count, 2);
    assert_eq!(approved.approved_by.as_deref(), Some("ana"));
    assert_eq!(approved.sql, response.result.generated.sql);
    assert_eq!(
        f.orchestrator
            .approved(Some("sessions_fct".to_string()))
            .await
            .unwrap()
            .len(),
        1
    );
}

fn server(f: &Fixture) -> TestServer {
    let app = web::app(Arc::new(AppState::new(
        AppConfig::default(),
        f.orchestrator.clone(),
    )));
    TestServer::new(app).unwrap()
}

#[tokio::test]
async fn http_surface_maps_outcomes_to_status_codes() {
    let f = fixture(Ok(REVENUE_SQL), Err("unused")).await;
    let server = server(&f);

    let response = server
        .post("/api/query")
        .json(&json!({"natural_language_query": "revenue by traffic source", "table_name": "sessions_fct"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["from_cache"], json!(false));
    assert_eq!(body["transitions"][2], json!("generating"));
    let cache_id = body["cache_id"].as_str().unwrap().to_string();

    let response = server
        .post("/api/query")
        .json(&json!({"natural_language_query": "revenue by device_type", "table_name": "sessions_fct"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("device_type"));

    let response = server.post("/api/approve/unknown").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = server
        .post(&format!("/api/approve/{}", cache_id))
        .json(&json!({"approved_by": "ana"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["execution_count"], json!(1));

    let response = server
        .get("/api/approved")
        .add_query_param("table", "sessions_fct")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>().as_array().unwrap().len(), 1);

    let response = server
        .post("/api/similar")
        .json(&json!({"prompt": "revenue per traffic source", "table_name": "sessions_fct"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()[0]["query"]["id"], json!(cache_id));

    let response = server
        .get("/api/cache/recent")
        .add_query_param("limit", 5)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()[0]["id"], json!(cache_id));

    f.clock.advance(Duration::hours(2));
    let response = server.post("/api/cache/sweep").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["removed"], json!(1));

    let response = server.get("/api/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["approved_count"], json!(1));
    assert_eq!(body["cache"]["entries"], json!(0));
}

#[tokio::test]
async fn generation_failure_is_a_bad_gateway_with_every_cause() {
    let f = fixture(Err("connection refused"), Ok("no idea")).await;
    let server = server(&f);

    let response = server
        .post("/api/query")
        .json(&json!({"natural_language_query": "revenue by traffic source", "table_name": "sessions_fct"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    let causes = body["causes"].as_array().unwrap();
    assert_eq!(causes.len(), 2);
    assert!(causes[0].as_str().unwrap().starts_with("local:"));
    assert!(causes[1].as_str().unwrap().starts_with("remote: LLM output malformed"));
}

#[tokio::test]
async fn catalog_refresh_picks_up_tables_materialized_after_startup() {
    let f = fixture(Ok(REVENUE_SQL), Err("unused")).await;
    let server = server(&f);

    f.pool
        .get()
        .unwrap()
        .execute_batch("CREATE TABLE orders_fct (order_id INTEGER, amount DOUBLE);")
        .unwrap();
    assert!(!f.embedded.is_materialized("orders_fct").await);

    let response = server.post("/api/catalog/refresh").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["tables"], json!(2));
    assert!(f.embedded.is_materialized("orders_fct").await);
    assert!(f.embedded.is_materialized("sessions_fct").await);
}
