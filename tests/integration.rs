//! End-to-end scenarios (§8 S1/S2/S4) driven through the real
//! `EmbeddingService` → `VectorStore` pipeline against a tiny in-process
//! HTTP server standing in for a `local_http` embedding backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};

use ragctl::cache::{CacheConfig, EmbeddingCache};
use ragctl::chunk::{chunk_text, ChunkingConfig};
use ragctl::embedding::EmbeddingService;
use ragctl::index::IndexType;
use ragctl::metric::Metric;
use ragctl::models::{EmbeddingModelConfig, EmbeddingProviderKind, IndexBackendParams};
use ragctl::retriever::HybridWeights;
use ragctl::store::{ShardConfig, VectorStore};

/// A deterministic stand-in for a real embedding backend: "apple" maps
/// to `[1,0,0,0]`, anything else to `[0,1,0,0]`. Speaks the same
/// OpenAI-compatible `{model,input}` -> `{data:[{index,embedding}]}`
/// shape `HttpEmbeddingAdapter` sends.
async fn spawn_embedding_server(calls: Arc<AtomicUsize>) -> String {
    async fn embed(axum::extract::State(calls): axum::extract::State<Arc<AtomicUsize>>, Json(body): Json<Value>) -> Json<Value> {
        calls.fetch_add(1, Ordering::SeqCst);
        let inputs = body.get("input").and_then(Value::as_array).cloned().unwrap_or_default();
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let text = text.as_str().unwrap_or_default().to_lowercase();
                let embedding = if text.contains("apple") { vec![1.0, 0.0, 0.0, 0.0] } else { vec![0.0, 1.0, 0.0, 0.0] };
                json!({ "index": i, "embedding": embedding })
            })
            .collect();
        Json(json!({ "data": data }))
    }

    let app = Router::new().route("/embed", post(embed)).with_state(calls);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/embed")
}

fn model_config(api_base_url: String, cache_enabled: bool) -> EmbeddingModelConfig {
    EmbeddingModelConfig {
        id: "m1".into(),
        provider: EmbeddingProviderKind::LocalHttp,
        remote_model_id: None,
        dimensions: 4,
        api_key_env: None,
        api_base_url: Some(api_base_url),
        options: HashMap::new(),
        batch_size: 8,
        normalize: false,
        cache_enabled,
        timeout_secs: 5,
        rate_limit_rpm: 1000,
    }
}

async fn build_store(api_base_url: String) -> VectorStore {
    let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
    let embeddings = Arc::new(EmbeddingService::new(vec![model_config(api_base_url, false)], "m1".to_string(), cache).unwrap());
    let shard = ShardConfig {
        model_id: "m1".into(),
        index_type: IndexType::Hnsw,
        metric: Metric::Cosine,
        dimensions: 4,
        params: IndexBackendParams::default(),
    };
    let dir = tempfile::tempdir().unwrap();
    VectorStore::new(vec![shard], "m1".to_string(), dir.path().to_path_buf(), embeddings).unwrap()
}

#[tokio::test]
async fn s1_ingest_and_retrieve() {
    let server_url = spawn_embedding_server(Arc::new(AtomicUsize::new(0))).await;
    let store = build_store(server_url).await;

    let chunking = ChunkingConfig::default();
    let d1 = chunk_text("D1", "I like apple pie", &chunking);
    let d2 = chunk_text("D2", "Bananas are yellow", &chunking);

    store.add_batch(d1).await.unwrap();
    store.add_batch(d2).await.unwrap();

    let hits = store.search_by_text("apple", 1, None, None, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.document_id, "D1");
    assert!(hits[0].score >= 0.999);
}

#[tokio::test]
async fn s2_hybrid_fusion_prefers_the_same_document_at_every_alpha() {
    let server_url = spawn_embedding_server(Arc::new(AtomicUsize::new(0))).await;
    let store = build_store(server_url).await;

    let chunking = ChunkingConfig::default();
    store.add_batch(chunk_text("D1", "I like apple pie", &chunking)).await.unwrap();
    store.add_batch(chunk_text("D2", "Bananas are yellow", &chunking)).await.unwrap();

    for alpha in [0.0, 0.5, 1.0] {
        let hits = store.hybrid_search("apple", 2, None, None, None, HybridWeights { alpha }).await.unwrap();
        assert_eq!(hits.first().unwrap().chunk.document_id, "D1", "alpha={alpha} should still rank D1 first");
    }
}

#[tokio::test]
async fn s4_cache_hit_skips_the_adapter_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server_url = spawn_embedding_server(calls.clone()).await;

    let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
    let embeddings = EmbeddingService::new(vec![model_config(server_url.clone(), true)], "m1".to_string(), cache).unwrap();

    embeddings.create_embedding("a recurring query", None).await.unwrap();
    embeddings.create_embedding("a recurring query", None).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second call should be served from cache");

    let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
    let uncached = EmbeddingService::new(vec![model_config(server_url, false)], "m1".to_string(), cache).unwrap();
    uncached.create_embedding("a recurring query", None).await.unwrap();
    uncached.create_embedding("a recurring query", None).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3, "disabling the cache should invoke the adapter every time");
}

#[tokio::test]
async fn boundary_empty_text_embeds_to_the_zero_vector() {
    let server_url = spawn_embedding_server(Arc::new(AtomicUsize::new(0))).await;
    let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
    let embeddings = EmbeddingService::new(vec![model_config(server_url, false)], "m1".to_string(), cache).unwrap();

    let vector = embeddings.create_embedding("", None).await.unwrap();
    assert_eq!(vector, vec![0.0, 0.0, 0.0, 0.0]);
}
