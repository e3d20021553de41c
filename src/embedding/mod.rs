//! Embedding pipeline: adapters (C3) plus the service that fronts them
//! (C4).
//!
//! `EmbeddingService` owns a registry of configured models, a shared
//! cache, and lazily-built adapter instances. Callers never talk to an
//! adapter directly — they go through the service so caching, batching,
//! and the default-model fallback are applied uniformly.

mod adapters;
mod local;
mod local_tract;

pub use adapters::{EmbeddingAdapter, HttpEmbeddingAdapter, StubEmbeddingAdapter};
pub use local::LocalSentenceTransformerAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::EmbeddingCache;
use crate::error::{RagError, Result};
use crate::metric::{cosine_distance, distance_to_similarity, Metric};
use crate::models::{EmbeddingModelConfig, EmbeddingProviderKind};

/// Build the right adapter for a model's configured provider.
fn build_adapter(config: &EmbeddingModelConfig) -> Result<Arc<dyn EmbeddingAdapter>> {
    match config.provider {
        EmbeddingProviderKind::LocalSentenceTransformer => {
            Ok(Arc::new(LocalSentenceTransformerAdapter::initialize(config)?))
        }
        _ => Ok(Arc::new(HttpEmbeddingAdapter::initialize(config.clone())?)),
    }
}

struct ModelEntry {
    config: EmbeddingModelConfig,
    adapter: Arc<dyn EmbeddingAdapter>,
}

/// Front door for the embedding pipeline (C4). Holds every configured
/// model plus the process-wide cache; `create_embedding` is the single
/// path every caller (chunker, router, RAG orchestrator, agents) uses to
/// turn text into vectors.
pub struct EmbeddingService {
    models: RwLock<HashMap<String, ModelEntry>>,
    default_model_id: RwLock<Option<String>>,
    cache: Arc<EmbeddingCache>,
}

impl EmbeddingService {
    /// Build a service from the configured model list. Fails fast if any
    /// provider can't authenticate (§4.3) or the default model isn't in
    /// the list.
    pub fn new(configs: Vec<EmbeddingModelConfig>, default_model_id: String, cache: Arc<EmbeddingCache>) -> Result<Self> {
        if !configs.iter().any(|c| c.id == default_model_id) {
            return Err(RagError::ConfigInvalid(format!(
                "default_model {default_model_id} is not among the configured models"
            )));
        }
        let mut models = HashMap::new();
        for config in configs {
            let adapter = build_adapter(&config)?;
            models.insert(config.id.clone(), ModelEntry { config, adapter });
        }
        Ok(Self {
            models: RwLock::new(models),
            default_model_id: RwLock::new(Some(default_model_id)),
            cache,
        })
    }

    pub async fn default_model_id(&self) -> Option<String> {
        self.default_model_id.read().await.clone()
    }

    pub async fn model_ids(&self) -> Vec<String> {
        self.models.read().await.keys().cloned().collect()
    }

    pub async fn model_config(&self, model_id: &str) -> Result<EmbeddingModelConfig> {
        self.models
            .read()
            .await
            .get(model_id)
            .map(|e| e.config.clone())
            .ok_or_else(|| RagError::ModelNotFound(model_id.to_string()))
    }

    /// Register a new model at runtime, or replace an existing one under
    /// the same id.
    pub async fn add_model(&self, config: EmbeddingModelConfig) -> Result<()> {
        let adapter = build_adapter(&config)?;
        self.models
            .write()
            .await
            .insert(config.id.clone(), ModelEntry { config, adapter });
        Ok(())
    }

    /// Remove a model. If it was the default, reassigns the default to an
    /// arbitrary remaining model, or clears it if none remain (§4.4).
    pub async fn remove_model(&self, model_id: &str) -> Result<()> {
        let mut models = self.models.write().await;
        if models.remove(model_id).is_none() {
            return Err(RagError::ModelNotFound(model_id.to_string()));
        }
        let mut default = self.default_model_id.write().await;
        if default.as_deref() == Some(model_id) {
            *default = models.keys().next().cloned();
        }
        Ok(())
    }

    pub async fn set_default_model(&self, model_id: &str) -> Result<()> {
        if !self.models.read().await.contains_key(model_id) {
            return Err(RagError::ModelNotFound(model_id.to_string()));
        }
        *self.default_model_id.write().await = Some(model_id.to_string());
        Ok(())
    }

    /// Embed one piece of text with `model_id` (or the default model),
    /// consulting the cache first (§4.2).
    pub async fn create_embedding(&self, text: &str, model_id: Option<&str>) -> Result<Vec<f32>> {
        let resolved = self.resolve_model_id(model_id).await?;
        let models = self.models.read().await;
        let entry = models
            .get(&resolved)
            .ok_or_else(|| RagError::ModelNotFound(resolved.clone()))?;

        if entry.config.cache_enabled {
            if let Some(cached) = self.cache.get(&resolved, text) {
                debug!(model = %resolved, "embedding cache hit");
                return Ok(cached);
            }
        }

        let vector = entry.adapter.embed(text).await?;
        if vector.len() != entry.adapter.dimensions() {
            return Err(RagError::DimensionMismatch {
                expected: entry.adapter.dimensions(),
                actual: vector.len(),
            });
        }
        if entry.config.cache_enabled {
            self.cache.put(&resolved, text, vector.clone());
        }
        Ok(vector)
    }

    /// Batch-embed texts with `model_id` (or the default model). Cache
    /// hits are served directly; misses are coalesced and dispatched in
    /// the provider's own `batch_size` chunks.
    pub async fn create_batch_embeddings(&self, texts: &[String], model_id: Option<&str>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resolved = self.resolve_model_id(model_id).await?;
        let models = self.models.read().await;
        let entry = models
            .get(&resolved)
            .ok_or_else(|| RagError::ModelNotFound(resolved.clone()))?;

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_idx = Vec::new();
        let mut miss_texts = Vec::new();

        for (i, t) in texts.iter().enumerate() {
            if entry.config.cache_enabled {
                if let Some(cached) = self.cache.get(&resolved, t) {
                    out[i] = Some(cached);
                    continue;
                }
            }
            miss_idx.push(i);
            miss_texts.push(t.clone());
        }

        let batch_size = entry.config.batch_size.max(1);
        let mut cursor = 0;
        while cursor < miss_texts.len() {
            let end = (cursor + batch_size).min(miss_texts.len());
            let batch = &miss_texts[cursor..end];
            let vectors = entry.adapter.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::Transport(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (offset, vector) in vectors.into_iter().enumerate() {
                let global_i = miss_idx[cursor + offset];
                if entry.config.cache_enabled {
                    self.cache.put(&resolved, &miss_texts[cursor + offset], vector.clone());
                }
                out[global_i] = Some(vector);
            }
            cursor = end;
        }

        Ok(out.into_iter().map(|o| o.unwrap_or_default()).collect())
    }

    /// Cosine similarity between two already-computed vectors of equal
    /// dimensionality, mapped into `[0, 1]` per §4.1.
    pub fn calculate_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(RagError::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        let d = cosine_distance(a, b);
        Ok(distance_to_similarity(Metric::Cosine, d))
    }

    async fn resolve_model_id(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(id) => Ok(id.to_string()),
            None => self
                .default_model_id
                .read()
                .await
                .clone()
                .ok_or_else(|| RagError::ConfigInvalid("no default embedding model is configured".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    fn stub_config(id: &str, dims: usize) -> EmbeddingModelConfig {
        EmbeddingModelConfig {
            id: id.to_string(),
            provider: EmbeddingProviderKind::LocalHttp,
            remote_model_id: None,
            dimensions: dims,
            api_key_env: None,
            api_base_url: Some("http://localhost:0/unused".to_string()),
            options: HashMap::new(),
            batch_size: 2,
            normalize: false,
            cache_enabled: true,
            timeout_secs: 5,
            rate_limit_rpm: 1000,
        }
    }

    #[test]
    fn calculate_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = EmbeddingService::calculate_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn calculate_similarity_rejects_dimension_mismatch() {
        let err = EmbeddingService::calculate_similarity(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert_eq!(err.code(), "dimension_mismatch");
    }

    #[tokio::test]
    async fn rejects_unknown_default_model() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let err = EmbeddingService::new(vec![stub_config("a", 4)], "missing".to_string(), cache).unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }

    #[tokio::test]
    async fn set_default_model_rejects_unknown_id() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let svc = EmbeddingService::new(vec![stub_config("a", 4)], "a".to_string(), cache).unwrap();
        let err = svc.set_default_model("b").await.unwrap_err();
        assert_eq!(err.code(), "model_not_found");
    }

    #[tokio::test]
    async fn remove_model_reassigns_default_to_a_remaining_model() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let svc = EmbeddingService::new(vec![stub_config("a", 4), stub_config("b", 4)], "a".to_string(), cache).unwrap();
        svc.remove_model("a").await.unwrap();
        assert_eq!(svc.default_model_id().await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn remove_model_clears_default_when_no_models_remain() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let svc = EmbeddingService::new(vec![stub_config("a", 4)], "a".to_string(), cache).unwrap();
        svc.remove_model("a").await.unwrap();
        assert_eq!(svc.default_model_id().await, None);
    }

    #[tokio::test]
    async fn create_embedding_fails_with_no_default_model() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let svc = EmbeddingService::new(vec![stub_config("a", 4)], "a".to_string(), cache).unwrap();
        svc.remove_model("a").await.unwrap();
        let err = svc.create_embedding("hello", None).await.unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }
}
