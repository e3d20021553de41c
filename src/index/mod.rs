//! Vector index adapters (C7): a uniform contract over local ANN
//! libraries and remote vector databases.
//!
//! Every adapter lives behind one `tokio::sync::RwLock` per shard
//! ([`crate::store::VectorStore`]); mutating calls (`add_*`,
//! `delete_item`, `load`, `optimize`) take `&mut self`, read-only calls
//! (`search`, `save`, `stats`) take `&self`, so the lock type at the
//! call site tells you which access the shard needs.

pub mod hnsw;
pub mod remote;

#[cfg(feature = "faiss-backend")]
pub mod faiss_family;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metric::Metric;
use crate::models::IndexBackendParams;

/// Which backend a shard's index is implemented by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Hnsw,
    Flat,
    Ivf,
    Pq,
    IvfPq,
    Qdrant,
    Weaviate,
    Pinecone,
    Milvus,
    Elasticsearch,
}

impl IndexType {
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            IndexType::Qdrant | IndexType::Weaviate | IndexType::Pinecone | IndexType::Milvus | IndexType::Elasticsearch
        )
    }
}

/// Snapshot of a shard's health/size, returned by `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub index_type: IndexType,
    pub count: usize,
    pub dimensions: usize,
    pub deleted_count: usize,
}

/// Uniform index contract (§4.7).
#[async_trait]
pub trait IndexAdapter: Send + Sync {
    async fn add_item(&mut self, vector: Vec<f32>, doc_id: String) -> Result<()>;

    async fn add_items_batch(&mut self, items: Vec<(Vec<f32>, String)>) -> Result<()> {
        for (vector, doc_id) in items {
            self.add_item(vector, doc_id).await?;
        }
        Ok(())
    }

    /// Returns `(doc_id, similarity)` sorted by similarity descending,
    /// similarity already normalised into `[0, 1]` via C1. Deleted ids
    /// never appear.
    async fn search(&self, query: &[f32], top_k: usize, min_score: Option<f32>) -> Result<Vec<(String, f32)>>;

    async fn delete_item(&mut self, doc_id: &str) -> Result<()>;

    async fn save(&self, path: &Path) -> Result<()>;

    async fn load(&mut self, path: &Path) -> Result<()>;

    /// Compact deleted slots / retrain on accumulated data. A no-op for
    /// backends with nothing to compact.
    async fn optimize(&mut self) -> Result<()>;

    async fn stats(&self) -> IndexStats;
}

/// Build the adapter named by `index_type` for one shard.
pub fn build_adapter(
    index_type: IndexType,
    dimensions: usize,
    metric: Metric,
    params: &IndexBackendParams,
) -> Result<Box<dyn IndexAdapter>> {
    match index_type {
        IndexType::Hnsw => Ok(Box::new(hnsw::HnswAdapter::new(dimensions, metric, params))),
        IndexType::Qdrant | IndexType::Weaviate | IndexType::Pinecone | IndexType::Milvus | IndexType::Elasticsearch => {
            Ok(Box::new(remote::RemoteAdapter::new(index_type, dimensions, metric, params)?))
        }
        #[cfg(feature = "faiss-backend")]
        IndexType::Flat | IndexType::Ivf | IndexType::Pq | IndexType::IvfPq => {
            Ok(Box::new(faiss_family::FaissAdapter::new(index_type, dimensions, metric, params)?))
        }
        #[cfg(not(feature = "faiss-backend"))]
        IndexType::Flat | IndexType::Ivf | IndexType::Pq | IndexType::IvfPq => {
            Err(crate::error::RagError::ConfigInvalid(
                "FAISS-family index types require the faiss-backend feature".into(),
            ))
        }
    }
}
