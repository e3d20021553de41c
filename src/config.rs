//! Configuration parsing and validation.
//!
//! The platform is configured via a TOML file (default: `config/ragctl.toml`).
//! The config wires together the embedding service (C4), the model router
//! (C5), the chunker (C6), the vector store (C8), the ingestion manager
//! (C14), and the ambient HTTP/logging layers, following the teacher's
//! "one struct per concern, validated top to bottom in `load_config`"
//! convention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::chunk::ChunkingConfig;
use crate::index::IndexType;
use crate::metric::Metric;
use crate::models::{EmbeddingModelConfig, IndexBackendParams};
use crate::rag::GeneratorConfig;
use crate::router::RouterConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub embedding: EmbeddingServiceConfig,
    pub router: RouterConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub store: VectorStoreConfig,
    pub ingestion: IngestionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
}

/// `{templates_path}` — one JSON file per [`crate::models::PromptTemplate`]
/// under this directory, loaded at startup (C10). Absent means the RAG
/// orchestrator always falls back to its built-in plain-context prompt.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub templates_path: Option<PathBuf>,
}

/// `{models, default_model, cache, max_parallel}` (§6).
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingServiceConfig {
    pub models: Vec<EmbeddingModelConfig>,
    pub default_model: String,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Bound on concurrent adapter calls in flight (§5). Defaults to
    /// twice the detected CPU count, the teacher's own rule of thumb for
    /// its fastembed worker pool generalised to every adapter.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_max_parallel() -> usize {
    std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4)
}

/// `{index_type, metric, dimensions, default_embedding_model,
/// embedding_models, storage_path, backend_params}` (§6).
#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    pub index_type: IndexType,
    #[serde(default)]
    pub metric: Metric,
    /// Per-model embedding dimensionality, cross-checked at load time
    /// against `embedding.models`.
    pub dimensions: HashMap<String, usize>,
    pub default_embedding_model: String,
    pub embedding_models: Vec<String>,
    pub storage_path: PathBuf,
    #[serde(default)]
    pub backend_params: IndexBackendParams,
}

/// `{config_path, max_jobs}` (§6, §4.14).
#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    pub config_path: PathBuf,
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
}

fn default_max_jobs() -> usize {
    5
}

/// `{bind}` — unchanged from the teacher.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// `{level}`, defaulting to `info`; `RUST_LOG` still overrides at
/// startup per C17.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.embedding.models.is_empty() {
        anyhow::bail!("embedding.models must have at least one entry");
    }
    if !config.embedding.models.iter().any(|m| m.id == config.embedding.default_model) {
        anyhow::bail!("embedding.default_model '{}' is not among embedding.models", config.embedding.default_model);
    }
    for m in &config.embedding.models {
        if m.dimensions == 0 {
            anyhow::bail!("embedding model '{}' must declare dimensions > 0", m.id);
        }
    }

    if !config.embedding.models.iter().any(|m| m.id == config.router.default_model_id) {
        anyhow::bail!("router.default_model_id '{}' is not among embedding.models", config.router.default_model_id);
    }
    if let Some(fallback) = &config.router.fallback_model_id {
        if !config.embedding.models.iter().any(|m| &m.id == fallback) {
            anyhow::bail!("router.fallback_model_id '{fallback}' is not among embedding.models");
        }
    }

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.store.embedding_models.is_empty() {
        anyhow::bail!("store.embedding_models must name at least one model");
    }
    if !config.store.embedding_models.contains(&config.store.default_embedding_model) {
        anyhow::bail!(
            "store.default_embedding_model '{}' is not among store.embedding_models",
            config.store.default_embedding_model
        );
    }
    for model_id in &config.store.embedding_models {
        let declared = config
            .store
            .dimensions
            .get(model_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("store.dimensions is missing an entry for '{model_id}'"))?;
        let configured = config
            .embedding
            .models
            .iter()
            .find(|m| &m.id == model_id)
            .ok_or_else(|| anyhow::anyhow!("store.embedding_models references unknown model '{model_id}'"))?;
        if declared != configured.dimensions {
            anyhow::bail!(
                "store.dimensions['{model_id}'] = {declared} does not match embedding.models['{model_id}'].dimensions = {}",
                configured.dimensions
            );
        }
    }

    if config.ingestion.max_jobs == 0 {
        anyhow::bail!("ingestion.max_jobs must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmbeddingProviderKind;
    use std::io::Write;

    fn sample_toml() -> String {
        r#"
[embedding]
default_model = "m1"

[[embedding.models]]
id = "m1"
provider = "local_http"
dimensions = 4
api_base_url = "http://localhost:0/unused"

[router]
default_model_id = "m1"

[store]
index_type = "hnsw"
default_embedding_model = "m1"
embedding_models = ["m1"]
storage_path = "./data/index"

[store.dimensions]
m1 = 4

[ingestion]
config_path = "./data/agents"

[server]
bind = "127.0.0.1:8080"
"#
        .to_string()
    }

    #[test]
    fn round_trips_a_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.embedding.default_model, "m1");
        assert_eq!(config.embedding.models[0].provider, EmbeddingProviderKind::LocalHttp);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ingestion.max_jobs, 5);
    }

    #[test]
    fn rejects_default_model_not_in_list() {
        let toml = sample_toml().replace(r#"default_model = "m1""#, r#"default_model = "missing""#);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let toml = sample_toml().replace("m1 = 4", "m1 = 8");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
