use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::exec::Target;
use crate::llm::Provider;
use crate::similarity::SimilarityMetric;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

/// Embedded DuckDB database holding materialized tables.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
}

/// Remote warehouse reached through DuckDB (e.g. an `md:` connection string).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WarehouseConfig {
    pub connection_string: Option<String>,
    pub pool_size: Option<usize>,
    /// Run on every new connection, e.g. `LOAD motherduck;`.
    pub init_sql: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub preferred_provider: Provider,
    pub fallback_enabled: bool,
    /// Tried in order after the preferred provider fails.
    pub fallback: Vec<Provider>,
    pub local: ProviderConfig,
    pub remote: Option<ProviderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub preferred_target: Target,
    pub enable_materialization: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_minutes: i64,
    pub max_entries: usize,
    pub reuse_threshold: f64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApprovalConfig {
    /// DuckDB file for approved queries. In-memory when unset.
    pub store_path: Option<String>,
    pub similarity_threshold: f64,
    pub metric: SimilarityMetric,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SemanticConfig {
    /// JSON file declaring tables, dimensions and measures.
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub web: WebConfig,
    pub database: DatabaseConfig,
    pub warehouse: WarehouseConfig,
    pub generation: GenerationConfig,
    pub execution: ExecutionConfig,
    pub cache: CacheConfig,
    pub approval: ApprovalConfig,
    pub semantic: SemanticConfig,
    pub data_dir: String,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for data storage
    #[arg(long)]
    pub data_dir: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = [
                "config.toml",
                "config/config.toml",
                "/etc/nl-query/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NL_QUERY__CACHE__TTL_MINUTES=5 and friends
        config_builder = config_builder.add_source(
            Environment::with_prefix("NL_QUERY")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        config.resolve_data_paths();

        config.validate()?;
        Ok(config)
    }

    /// Places relative DuckDB file paths under `data_dir`.
    fn resolve_data_paths(&mut self) {
        self.database.connection_string =
            in_data_dir(&self.data_dir, &self.database.connection_string);
        if let Some(path) = &self.approval.store_path {
            self.approval.store_path = Some(in_data_dir(&self.data_dir, path));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("cache.reuse_threshold", self.cache.reuse_threshold),
            ("approval.similarity_threshold", self.approval.similarity_threshold),
        ];
        for (key, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Message(format!(
                    "{} must be within [0, 1], got {}",
                    key, value
                )));
            }
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Message(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.cache.ttl_minutes <= 0 {
            return Err(ConfigError::Message(
                "cache.ttl_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// `:memory:` and `md:...` style connection strings are not file paths.
fn in_data_dir(data_dir: &str, path: &str) -> String {
    if path.contains(':') || Path::new(path).is_absolute() {
        return path.to_string();
    }
    Path::new(data_dir).join(path).to_string_lossy().into_owned()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            database: DatabaseConfig::default(),
            warehouse: WarehouseConfig::default(),
            generation: GenerationConfig::default(),
            execution: ExecutionConfig::default(),
            cache: CacheConfig::default(),
            approval: ApprovalConfig::default(),
            semantic: SemanticConfig::default(),
            data_dir: "data".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "nl-query.duckdb".to_string(),
            pool_size: 5,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            preferred_provider: Provider::Local,
            fallback_enabled: true,
            fallback: vec![Provider::Remote],
            local: ProviderConfig::default(),
            remote: None,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            preferred_target: Target::Embedded,
            enable_materialization: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            max_entries: 100,
            reuse_threshold: 0.85,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            similarity_threshold: 0.3,
            metric: SimilarityMetric::Cosine,
        }
    }
}
