use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use nl_query::approval::{ApprovalStore, DuckDbStore, KeyValueStore, MemoryStore};
use nl_query::cache::SemanticCache;
use nl_query::config::{AppConfig, CliArgs};
use nl_query::db::{build_pool, DuckDBConnectionManager};
use nl_query::exec::{DuckDbExecutor, ExecutionRouter, Target};
use nl_query::llm::GenerationRouter;
use nl_query::orchestrator::QueryOrchestrator;
use nl_query::semantic::SemanticModel;
use nl_query::util::clock::{Clock, SystemClock};
use nl_query::util::logging::init_tracing;
use nl_query::web;
use nl_query::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = CliArgs::parse();

    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    let semantic = match &config.semantic.model_path {
        Some(path) => {
            info!("Loading semantic model from {}", path.display());
            Some(Arc::new(SemanticModel::load(path)?))
        }
        None => {
            warn!("No semantic model configured, prompts are not checked against table fields");
            None
        }
    };

    info!(
        "Opening embedded database {}",
        config.database.connection_string
    );
    let embedded_pool = build_pool(
        DuckDBConnectionManager::new(config.database.connection_string.clone()),
        config.database.pool_size,
    )?;
    let embedded = Arc::new(DuckDbExecutor::embedded(embedded_pool));

    let mut execution = ExecutionRouter::new(&config.execution)
        .with_target(Target::Embedded, embedded);
    if let Some(connection_string) = &config.warehouse.connection_string {
        info!("Connecting warehouse target");
        let mut manager = DuckDBConnectionManager::new(connection_string.clone());
        if let Some(sql) = &config.warehouse.init_sql {
            manager = manager.with_init_sql(sql.clone());
        }
        let pool = build_pool(
            manager,
            config
                .warehouse
                .pool_size
                .unwrap_or(config.database.pool_size),
        )?;
        execution = execution.with_target(Target::Warehouse, Arc::new(DuckDbExecutor::warehouse(pool)));
    } else {
        warn!("No warehouse configured, only materialized tables can be queried");
    }
    if let Err(e) = execution.refresh_catalogs().await {
        // Not fatal: unknown tables go to the warehouse. POST /api/catalog/refresh retries.
        error!("Failed to load materialized table catalog: {}", e);
    }

    info!(
        "Initializing generation router, preferred provider: {}",
        config.generation.preferred_provider
    );
    let generation = GenerationRouter::from_config(&config.generation, semantic.clone())?;
    info!("Provider chain: {:?}", generation.chain());

    let store: Arc<dyn KeyValueStore> = match &config.approval.store_path {
        Some(path) => Arc::new(DuckDbStore::open(path)?),
        None => {
            warn!("No approval store path configured, approvals are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let approvals = Arc::new(ApprovalStore::new(
        store,
        clock.clone(),
        config.approval.metric,
        config.approval.similarity_threshold,
    ));
    let cache = Arc::new(SemanticCache::from_config(&config.cache, clock));

    let mut orchestrator = QueryOrchestrator::new(
        generation,
        execution,
        cache,
        approvals,
        config.cache.reuse_threshold,
    );
    if let Some(model) = semantic {
        orchestrator = orchestrator.with_semantic_model(model);
    }
    let orchestrator = Arc::new(orchestrator);

    let sweeper = orchestrator.clone();
    let sweep_every = Duration::from_secs(config.cache.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweeper.sweep_cache();
        }
    });

    let app_state = Arc::new(AppState::new(config.clone(), orchestrator));

    info!("Starting nl-query server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            let e: Box<dyn std::error::Error> = e;
            return Err(e);
        }
    }

    Ok(())
}
