use crate::config::GenerationConfig;
use crate::llm::models::{GeneratedQuery, SqlGenerationOutput};
use crate::llm::parse::parse_completion;
use crate::llm::providers::{OllamaProvider, RemoteLlmProvider};
use crate::llm::{LlmError, Provider, SqlGenerator};
use crate::semantic::SemanticModel;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Every provider tried for one prompt, in order, with its error.
#[derive(Debug)]
pub struct GenerationFailed {
    pub attempts: Vec<(Provider, LlmError)>,
}

impl fmt::Display for GenerationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generation failed")?;
        for (provider, err) in &self.attempts {
            write!(f, "; {}: {}", provider, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for GenerationFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.attempts
            .last()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

/// Walks the configured provider chain until one yields usable SQL.
pub struct GenerationRouter {
    providers: HashMap<Provider, Arc<dyn SqlGenerator>>,
    chain: Vec<Provider>,
    semantic: Option<Arc<SemanticModel>>,
}

impl GenerationRouter {
    /// Router with no providers registered yet; see [`Self::with_provider`].
    pub fn new(config: &GenerationConfig, semantic: Option<Arc<SemanticModel>>) -> Self {
        let mut chain = vec![config.preferred_provider];
        if config.fallback_enabled {
            for provider in &config.fallback {
                if !chain.contains(provider) {
                    chain.push(*provider);
                }
            }
        }

        Self {
            providers: HashMap::new(),
            chain,
            semantic,
        }
    }

    /// Router with the HTTP providers described by `config`.
    pub fn from_config(
        config: &GenerationConfig,
        semantic: Option<Arc<SemanticModel>>,
    ) -> Result<Self, LlmError> {
        let mut router = Self::new(config, semantic)
            .with_provider(Provider::Local, Arc::new(OllamaProvider::new(&config.local)?));

        if let Some(remote) = &config.remote {
            router = router.with_provider(Provider::Remote, Arc::new(RemoteLlmProvider::new(remote)?));
        }

        Ok(router)
    }

    pub fn with_provider(mut self, provider: Provider, generator: Arc<dyn SqlGenerator>) -> Self {
        self.providers.insert(provider, generator);
        self
    }

    pub fn chain(&self) -> &[Provider] {
        &self.chain
    }

    fn context_for(&self, table_name: &str, metadata: Option<&str>) -> String {
        if let Some(metadata) = metadata {
            return metadata.to_string();
        }
        self.semantic
            .as_ref()
            .and_then(|model| model.table(table_name))
            .map(|table| table.describe())
            .unwrap_or_else(|| format!("Table: {}\n", table_name))
    }

    pub async fn generate(
        &self,
        prompt: &str,
        table_name: &str,
        metadata: Option<&str>,
    ) -> Result<GeneratedQuery, GenerationFailed> {
        let context = self.context_for(table_name, metadata);
        let mut attempts = Vec::new();

        for &provider in &self.chain {
            let Some(generator) = self.providers.get(&provider) else {
                attempts.push((
                    provider,
                    LlmError::ConfigError(format!("provider {} is not configured", provider)),
                ));
                continue;
            };

            let attempt = match generator.generate_sql(prompt, &context).await {
                Ok(content) => self.interpret(provider, table_name, &content),
                Err(e) => Err(e),
            };

            match attempt {
                Ok(generated) => {
                    info!("Generated SQL with {} provider", provider);
                    return Ok(generated);
                }
                Err(e) => {
                    warn!("Provider {} failed: {}", provider, e);
                    attempts.push((provider, e));
                }
            }
        }

        Err(GenerationFailed { attempts })
    }

    fn interpret(
        &self,
        provider: Provider,
        table_name: &str,
        content: &str,
    ) -> Result<GeneratedQuery, LlmError> {
        let generated_at = chrono::Utc::now();

        match parse_completion(content)? {
            SqlGenerationOutput::Sql { sql, explanation } => Ok(GeneratedQuery {
                sql,
                provider,
                explanation,
                generated_at,
                spec: None,
            }),
            SqlGenerationOutput::Semantic(spec) => {
                let model = self.semantic.as_ref().ok_or_else(|| {
                    LlmError::Malformed("structured answer without a semantic model".to_string())
                })?;
                let table = model
                    .require_table(table_name)
                    .map_err(|e| LlmError::Malformed(e.to_string()))?;
                // The answer must describe the requested table, by model or physical name.
                match model.table(&spec.table) {
                    Some(named) if std::ptr::eq(named, table) => {}
                    _ => {
                        return Err(LlmError::Malformed(format!(
                            "answer targets table {}, expected {}",
                            spec.table, table_name
                        )));
                    }
                }
                let sql = table
                    .compile(&spec)
                    .map_err(|e| LlmError::Malformed(e.to_string()))?;

                Ok(GeneratedQuery {
                    sql,
                    provider,
                    explanation: spec.explanation.clone(),
                    generated_at,
                    spec: Some(spec),
                })
            }
        }
    }
}
