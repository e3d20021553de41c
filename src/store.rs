//! Vector store facade (C8).
//!
//! Owns one index adapter ("shard") per configured embedding model plus
//! the chunk/document metadata store. Callers never touch a shard
//! directly — everything goes through `VectorStore`, which is
//! responsible for keeping every shard's content in sync with the
//! chunk store and for fan-out/fan-in across shards on hybrid queries.
//! When a model router (C5) is attached via `with_router`, queries that
//! don't pin an `embedding_model` are resolved through it instead of
//! always falling back to the configured default.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::embedding::EmbeddingService;
use crate::error::{RagError, Result};
use crate::index::{build_adapter, IndexAdapter, IndexStats, IndexType};
use crate::metric::Metric;
use crate::models::{Chunk, IndexBackendParams, SearchResult, SearchResultSource, SubScores};
use crate::retriever::{hybrid_fuse, matches_filter, HybridWeights, SparseIndex};
use crate::router::Router;

/// Per-model shard configuration (§6 "Vector store").
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub model_id: String,
    pub index_type: IndexType,
    pub metric: Metric,
    pub dimensions: usize,
    pub params: IndexBackendParams,
}

struct Shard {
    adapter: RwLock<Box<dyn IndexAdapter>>,
    config: ShardConfig,
}

/// The facade described in §4.8.
pub struct VectorStore {
    shards: HashMap<String, Shard>,
    chunks: RwLock<HashMap<String, Chunk>>,
    sparse: RwLock<SparseIndex>,
    default_embedding_model: String,
    storage_path: PathBuf,
    embeddings: Arc<EmbeddingService>,
    router: Option<Arc<Router>>,
}

impl VectorStore {
    pub fn new(shard_configs: Vec<ShardConfig>, default_embedding_model: String, storage_path: PathBuf, embeddings: Arc<EmbeddingService>) -> Result<Self> {
        let mut shards = HashMap::new();
        for config in shard_configs {
            let adapter = build_adapter(config.index_type, config.dimensions, config.metric, &config.params)?;
            let model_id = config.model_id.clone();
            shards.insert(
                model_id,
                Shard {
                    adapter: RwLock::new(adapter),
                    config,
                },
            );
        }
        if !shards.contains_key(&default_embedding_model) {
            return Err(RagError::ConfigInvalid(format!(
                "default_embedding_model {default_embedding_model} has no configured shard"
            )));
        }
        Ok(Self {
            shards,
            chunks: RwLock::new(HashMap::new()),
            sparse: RwLock::new(SparseIndex::new()),
            default_embedding_model,
            storage_path,
            embeddings,
            router: None,
        })
    }

    /// Attach a model router (C5, §4.5): `search_by_text`/`hybrid_search`
    /// then consult it instead of always resolving straight to the
    /// default model whenever a caller doesn't pin `embedding_model`.
    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn shard_model_ids(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    pub fn default_embedding_model(&self) -> &str {
        &self.default_embedding_model
    }

    /// Ensure each chunk carries an embedding for every configured
    /// model (computing misses through C4), then insert into every
    /// shard and the chunk store.
    pub async fn add_batch(&self, mut chunks: Vec<Chunk>) -> Result<()> {
        for chunk in chunks.iter_mut() {
            for model_id in self.shards.keys() {
                if !chunk.embeddings.contains_key(model_id) {
                    let vector = self.embeddings.create_embedding(&chunk.text, Some(model_id)).await?;
                    chunk.embeddings.insert(model_id.clone(), vector);
                }
            }
        }

        for (model_id, shard) in self.shards.iter() {
            let items: Vec<(Vec<f32>, String)> = chunks
                .iter()
                .filter_map(|c| c.embeddings.get(model_id).map(|v| (v.clone(), c.id.clone())))
                .collect();
            if !items.is_empty() {
                shard.adapter.write().await.add_items_batch(items).await?;
            }
        }

        {
            let mut store = self.chunks.write().await;
            let mut sparse = self.sparse.write().await;
            for chunk in chunks {
                sparse.index_chunk(&chunk.id, &chunk.text);
                store.insert(chunk.id.clone(), chunk);
            }
        }
        Ok(())
    }

    /// Resolve the shard to query: an explicit `embedding_model` always
    /// wins; otherwise, when a router is attached, its pick for `query`
    /// is used (§4.5) — `Router::route` itself falls back to the
    /// configured default whenever auto-routing is disabled.
    fn resolve_model<'a>(&'a self, embedding_model: Option<&str>, query: &str) -> Result<(&'a str, &'a Shard)> {
        let model_id = match embedding_model {
            Some(id) => id.to_string(),
            None => match &self.router {
                Some(router) => router.route(query),
                None => self.default_embedding_model.clone(),
            },
        };
        let (key, shard) = self
            .shards
            .get_key_value(model_id.as_str())
            .ok_or_else(|| RagError::ModelNotFound(model_id.clone()))?;
        Ok((key.as_str(), shard))
    }

    /// Dense search over one shard, joined with the chunk store and
    /// post-filtered by metadata (§4.8).
    pub async fn search_by_text(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&Value>,
        min_score: Option<f32>,
        embedding_model: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let (model_id, shard) = self.resolve_model(embedding_model, query)?;
        let q_vec = self.embeddings.create_embedding(query, Some(model_id)).await?;

        let overshoot = (limit * 3).max(limit + 10);
        let hits = shard.adapter.read().await.search(&q_vec, overshoot, min_score).await?;

        let store = self.chunks.read().await;
        let mut out = Vec::new();
        for (chunk_id, score) in hits {
            let Some(chunk) = store.get(&chunk_id) else { continue };
            if let Some(f) = filter {
                if !matches_filter(&chunk.metadata, f) {
                    continue;
                }
            }
            out.push(SearchResult {
                chunk: chunk.clone(),
                score,
                source: SearchResultSource::Dense,
                sub_scores: None,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Dense + sparse + metadata, fused per §4.9.
    pub async fn hybrid_search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&Value>,
        min_score: Option<f32>,
        embedding_model: Option<&str>,
        weights: HybridWeights,
    ) -> Result<Vec<SearchResult>> {
        let (model_id, shard) = self.resolve_model(embedding_model, query)?;
        let q_vec = self.embeddings.create_embedding(query, Some(model_id)).await?;

        let overshoot = (limit * 4).max(limit + 20);
        let dense_hits = match shard.adapter.read().await.search(&q_vec, overshoot, None).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, model = model_id, "dense shard search failed, degrading to sparse-only for this shard");
                Vec::new()
            }
        };

        let sparse_hits = self.sparse.read().await.search(query, overshoot);

        let store = self.chunks.read().await;
        let fused = hybrid_fuse(&dense_hits, &sparse_hits, weights);

        let mut out = Vec::new();
        for (chunk_id, score, sub) in fused {
            let Some(chunk) = store.get(&chunk_id) else { continue };
            if let Some(f) = filter {
                if !matches_filter(&chunk.metadata, f) {
                    continue;
                }
            }
            if let Some(min) = min_score {
                if score < min {
                    continue;
                }
            }
            out.push(SearchResult {
                chunk: chunk.clone(),
                score,
                source: SearchResultSource::Hybrid,
                sub_scores: Some(SubScores {
                    dense: sub.0,
                    sparse: sub.1,
                }),
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub async fn metadata_search(&self, filter: &Value, limit: usize) -> Vec<SearchResult> {
        let store = self.chunks.read().await;
        store
            .values()
            .filter(|c| matches_filter(&c.metadata, filter))
            .take(limit)
            .map(|c| SearchResult {
                chunk: c.clone(),
                score: 1.0,
                source: SearchResultSource::Metadata,
                sub_scores: None,
            })
            .collect()
    }

    pub async fn delete(&self, chunk_id: &str) -> Result<()> {
        let mut errors = Vec::new();
        for (model_id, shard) in self.shards.iter() {
            if let Err(e) = shard.adapter.write().await.delete_item(chunk_id).await {
                if !matches!(e, RagError::NotFound(_)) {
                    errors.push(format!("{model_id}: {e}"));
                }
            }
        }
        self.chunks.write().await.remove(chunk_id);
        self.sparse.write().await.remove_chunk(chunk_id);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RagError::Transport(errors.join("; ")))
        }
    }

    /// Reinitialise one or all shards from the chunk store (§4.8),
    /// recomputing any missing embeddings through C4.
    pub async fn rebuild_index(&self, model_id: Option<&str>) -> Result<()> {
        let model_ids: Vec<String> = match model_id {
            Some(id) => vec![id.to_string()],
            None => self.shards.keys().cloned().collect(),
        };
        let chunks: Vec<Chunk> = self.chunks.read().await.values().cloned().collect();

        for model_id in model_ids {
            let shard = self.shards.get(&model_id).ok_or_else(|| RagError::ModelNotFound(model_id.clone()))?;
            let mut items = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                let vector = if let Some(v) = chunk.embeddings.get(&model_id) {
                    v.clone()
                } else {
                    self.embeddings.create_embedding(&chunk.text, Some(&model_id)).await?
                };
                items.push((vector, chunk.id.clone()));
            }
            let mut adapter = shard.adapter.write().await;
            *adapter = build_adapter(shard.config.index_type, shard.config.dimensions, shard.config.metric, &shard.config.params)?;
            adapter.add_items_batch(items).await?;
        }
        Ok(())
    }

    pub async fn stats(&self, model_id: &str) -> Result<IndexStats> {
        let shard = self.shards.get(model_id).ok_or_else(|| RagError::ModelNotFound(model_id.to_string()))?;
        Ok(shard.adapter.read().await.stats().await)
    }

    fn chunks_path(&self) -> PathBuf {
        self.storage_path.join("chunks.jsonl")
    }

    /// Persist the chunk store as JSONL plus every shard's native
    /// artefact under `storage_path/<model_id>/` (§6).
    pub async fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let store = self.chunks.read().await;
        let mut file = std::fs::File::create(self.chunks_path()).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        for chunk in store.values() {
            let line = serde_json::to_string(chunk).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
            writeln!(file, "{line}").map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        }
        drop(store);

        for (model_id, shard) in self.shards.iter() {
            let shard_dir = self.storage_path.join(model_id);
            shard.adapter.read().await.save(&shard_dir).await?;
        }
        Ok(())
    }

    /// Load the chunk store from JSONL, rebuild the sparse index, and
    /// load each shard's native artefact.
    pub async fn load(&self) -> Result<()> {
        let path = self.chunks_path();
        if path.exists() {
            let file = std::fs::File::open(&path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
            let mut store = self.chunks.write().await;
            let mut sparse = self.sparse.write().await;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                let chunk: Chunk = serde_json::from_str(&line).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
                sparse.index_chunk(&chunk.id, &chunk.text);
                store.insert(chunk.id.clone(), chunk);
            }
        }

        for (model_id, shard) in self.shards.iter() {
            let shard_dir = self.storage_path.join(model_id);
            if shard_dir.exists() {
                let _ = shard.adapter.write().await.load(&shard_dir).await;
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, EmbeddingCache};
    use crate::models::{EmbeddingModelConfig, EmbeddingProviderKind};

    async fn make_store() -> VectorStore {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let config = EmbeddingModelConfig {
            id: "m1".into(),
            provider: EmbeddingProviderKind::LocalHttp,
            remote_model_id: None,
            dimensions: 2,
            api_key_env: None,
            api_base_url: Some("http://localhost:0/unused".into()),
            options: HashMap::new(),
            batch_size: 8,
            normalize: false,
            cache_enabled: false,
            timeout_secs: 5,
            rate_limit_rpm: 1000,
        };
        let embeddings = Arc::new(EmbeddingService::new(vec![config], "m1".to_string(), cache).unwrap());
        let shard = ShardConfig {
            model_id: "m1".into(),
            index_type: IndexType::Hnsw,
            metric: Metric::Cosine,
            dimensions: 2,
            params: IndexBackendParams::default(),
        };
        let dir = tempfile::tempdir().unwrap();
        VectorStore::new(vec![shard], "m1".to_string(), dir.path().to_path_buf(), embeddings).unwrap()
    }

    #[tokio::test]
    async fn rejects_unknown_default_model() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let embeddings = Arc::new(
            EmbeddingService::new(
                vec![EmbeddingModelConfig {
                    id: "m1".into(),
                    provider: EmbeddingProviderKind::LocalHttp,
                    remote_model_id: None,
                    dimensions: 2,
                    api_key_env: None,
                    api_base_url: Some("http://localhost:0/unused".into()),
                    options: HashMap::new(),
                    batch_size: 8,
                    normalize: false,
                    cache_enabled: false,
                    timeout_secs: 5,
                    rate_limit_rpm: 1000,
                }],
                "m1".to_string(),
                cache,
            )
            .unwrap(),
        );
        let shard = ShardConfig {
            model_id: "m1".into(),
            index_type: IndexType::Hnsw,
            metric: Metric::Cosine,
            dimensions: 2,
            params: IndexBackendParams::default(),
        };
        let dir = tempfile::tempdir().unwrap();
        let err = VectorStore::new(vec![shard], "missing".to_string(), dir.path().to_path_buf(), embeddings).unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }

    #[tokio::test]
    async fn search_without_an_explicit_model_consults_the_router() {
        use crate::router::{EnsembleMethod, Router, RouterConfig};

        let store = make_store().await;
        // Route finance-flavoured text to a model with no configured
        // shard. If `resolve_model` still just used the default ("m1",
        // which *is* configured), this would succeed instead.
        let router = Router::new(RouterConfig {
            default_model_id: "m1".into(),
            fallback_model_id: None,
            language_models: HashMap::new(),
            domain_models: HashMap::from([("finance".to_string(), "routed-away".to_string())]),
            enable_auto_routing: true,
            enable_ensemble: false,
            ensemble_method: EnsembleMethod::WeightedAverage,
            model_weights: HashMap::new(),
        });
        let store = store.with_router(Arc::new(router));

        let err = store
            .search_by_text("Our quarterly revenue and equity portfolio grew substantially this year.", 5, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "model_not_found");
    }

    #[tokio::test]
    async fn metadata_search_scans_chunk_store() {
        let store = make_store().await;
        let mut chunk = Chunk {
            id: "doc1_0".into(),
            document_id: "doc1".into(),
            chunk_index: 0,
            text: "hello world".into(),
            metadata: HashMap::new(),
            embeddings: HashMap::new(),
        };
        chunk.metadata.insert("category".into(), serde_json::json!("finance"));
        store.add_batch(vec![chunk]).await.unwrap();

        let hits = store.metadata_search(&serde_json::json!({"category": "finance"}), 10).await;
        assert_eq!(hits.len(), 1);
        let misses = store.metadata_search(&serde_json::json!({"category": "legal"}), 10).await;
        assert!(misses.is_empty());
    }
}
