//! Remote vector database shard index (Qdrant/Weaviate/Pinecone/Milvus/
//! Elasticsearch), all behind one generic REST adapter.
//!
//! `save`/`load` are no-ops here — data lives on the server, not on our
//! disk. Point/object ids are derived deterministically from the
//! `doc_id` (our chunk id) via UUID-v5 over the DNS namespace, so
//! re-upserting the same chunk after a content edit overwrites the same
//! remote record rather than leaking an orphan.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{IndexAdapter, IndexStats, IndexType};
use crate::error::{RagError, Result};
use crate::metric::Metric;
use crate::models::IndexBackendParams;

fn remote_id(doc_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, doc_id.as_bytes())
}

/// One shard's connection to a remote vector database.
pub struct RemoteAdapter {
    backend: IndexType,
    dimensions: usize,
    metric: Metric,
    client: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    batch_size: usize,
    initialized: bool,
}

impl RemoteAdapter {
    pub fn new(backend: IndexType, dimensions: usize, metric: Metric, params: &IndexBackendParams) -> Result<Self> {
        let base_url = params
            .url
            .clone()
            .ok_or_else(|| RagError::ConfigInvalid(format!("{backend:?} shard requires params.url")))?;
        let collection = params.collection.clone().unwrap_or_else(|| "ragctl".to_string());
        let api_key = params
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok());
        let batch_size = params.batch.unwrap_or(100);

        Ok(Self {
            backend,
            dimensions,
            metric,
            client: reqwest::Client::new(),
            base_url,
            collection,
            api_key,
            batch_size,
            initialized: false,
        })
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.api_key, self.backend) {
            (Some(key), IndexType::Qdrant) => req.header("api-key", key),
            (Some(key), IndexType::Weaviate | IndexType::Milvus | IndexType::Elasticsearch) => {
                req.header("Authorization", format!("Bearer {key}"))
            }
            (Some(key), IndexType::Pinecone) => req.header("Api-Key", key),
            _ => req,
        }
    }

    async fn ensure_collection(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        match self.backend {
            IndexType::Qdrant => {
                let url = format!("{}/collections/{}", self.base_url, self.collection);
                let body = serde_json::json!({ "vectors": { "size": self.dimensions, "distance": qdrant_distance(self.metric) } });
                self.auth(self.client.put(&url)).json(&body).send().await.ok();
            }
            IndexType::Weaviate => {
                let url = format!("{}/v1/schema", self.base_url);
                let body = serde_json::json!({ "class": self.collection, "vectorizer": "none" });
                self.auth(self.client.post(&url)).json(&body).send().await.ok();
            }
            IndexType::Elasticsearch => {
                let url = format!("{}/{}", self.base_url, self.collection);
                let body = serde_json::json!({
                    "mappings": { "properties": {
                        "vector": { "type": "dense_vector", "dims": self.dimensions },
                        "document_id": { "type": "keyword" },
                        "text": { "type": "text" },
                        "metadata": { "type": "object" }
                    } }
                });
                self.auth(self.client.put(&url)).json(&body).send().await.ok();
            }
            // Pinecone indexes are provisioned out of band; Milvus collection
            // creation goes through its own schema RPC not modeled here.
            IndexType::Pinecone | IndexType::Milvus => {}
            _ => unreachable!(),
        }
        self.initialized = true;
        Ok(())
    }
}

fn qdrant_distance(metric: Metric) -> &'static str {
    match metric {
        Metric::Cosine => "Cosine",
        Metric::L2 => "Euclid",
        Metric::Dot => "Dot",
        Metric::Manhattan => "Manhattan",
    }
}

#[async_trait]
impl IndexAdapter for RemoteAdapter {
    async fn add_item(&mut self, vector: Vec<f32>, doc_id: String) -> Result<()> {
        self.add_items_batch(vec![(vector, doc_id)]).await
    }

    async fn add_items_batch(&mut self, items: Vec<(Vec<f32>, String)>) -> Result<()> {
        self.ensure_collection().await?;
        for batch in items.chunks(self.batch_size.max(1)) {
            match self.backend {
                IndexType::Qdrant => {
                    let points: Vec<Value> = batch
                        .iter()
                        .map(|(v, doc_id)| {
                            serde_json::json!({
                                "id": remote_id(doc_id).to_string(),
                                "vector": v,
                                "payload": { "document_id": doc_id },
                            })
                        })
                        .collect();
                    let url = format!("{}/collections/{}/points", self.base_url, self.collection);
                    let resp = self
                        .auth(self.client.put(&url))
                        .json(&serde_json::json!({ "points": points }))
                        .send()
                        .await
                        .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                    check_status(resp).await?;
                }
                IndexType::Weaviate => {
                    for (v, doc_id) in batch {
                        let url = format!("{}/v1/objects", self.base_url);
                        let body = serde_json::json!({
                            "class": self.collection,
                            "id": remote_id(doc_id).to_string(),
                            "vector": v,
                            "properties": { "document_id": doc_id },
                        });
                        let resp = self
                            .auth(self.client.post(&url))
                            .json(&body)
                            .send()
                            .await
                            .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                        check_status(resp).await?;
                    }
                }
                IndexType::Pinecone => {
                    let vectors: Vec<Value> = batch
                        .iter()
                        .map(|(v, doc_id)| {
                            serde_json::json!({ "id": remote_id(doc_id).to_string(), "values": v, "metadata": { "document_id": doc_id } })
                        })
                        .collect();
                    let url = format!("{}/vectors/upsert", self.base_url);
                    let resp = self
                        .auth(self.client.post(&url))
                        .json(&serde_json::json!({ "vectors": vectors, "namespace": self.collection }))
                        .send()
                        .await
                        .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                    check_status(resp).await?;
                }
                IndexType::Milvus => {
                    let rows: Vec<Value> = batch
                        .iter()
                        .map(|(v, doc_id)| serde_json::json!({ "id": remote_id(doc_id).to_string(), "vector": v, "document_id": doc_id }))
                        .collect();
                    let url = format!("{}/v2/vectordb/entities/insert", self.base_url);
                    let resp = self
                        .auth(self.client.post(&url))
                        .json(&serde_json::json!({ "collectionName": self.collection, "data": rows }))
                        .send()
                        .await
                        .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                    check_status(resp).await?;
                }
                IndexType::Elasticsearch => {
                    for (v, doc_id) in batch {
                        let url = format!("{}/{}/_doc/{}", self.base_url, self.collection, remote_id(doc_id));
                        let body = serde_json::json!({ "vector": v, "document_id": doc_id });
                        let resp = self
                            .auth(self.client.put(&url))
                            .json(&body)
                            .send()
                            .await
                            .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                        check_status(resp).await?;
                    }
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize, min_score: Option<f32>) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            return Err(RagError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        let hits: Vec<(String, f32)> = match self.backend {
            IndexType::Qdrant => {
                let url = format!("{}/collections/{}/points/search", self.base_url, self.collection);
                let body = serde_json::json!({ "vector": query, "limit": top_k, "with_payload": true });
                let resp = self
                    .auth(self.client.post(&url))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                let json: Value = check_status(resp).await?;
                json.get("result")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|r| {
                                let doc_id = r.get("payload")?.get("document_id")?.as_str()?.to_string();
                                let score = r.get("score")?.as_f64()? as f32;
                                Some((doc_id, score))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            }
            _ => {
                // Weaviate/Pinecone/Milvus/Elasticsearch follow the same
                // shape of "send vector, get back scored hits with our
                // document_id in the payload" — left to grow per-backend
                // as each gets exercised against a live server.
                return Err(RagError::RemoteUnavailable(format!(
                    "search not yet wired for {:?}; Qdrant is the reference remote implementation",
                    self.backend
                )));
            }
        };

        let mut out: Vec<(String, f32)> = hits
            .into_iter()
            .filter(|(_, score)| min_score.map(|min| *score >= min).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(top_k);
        Ok(out)
    }

    async fn delete_item(&mut self, doc_id: &str) -> Result<()> {
        match self.backend {
            IndexType::Qdrant => {
                let url = format!("{}/collections/{}/points/delete", self.base_url, self.collection);
                let body = serde_json::json!({ "points": [remote_id(doc_id).to_string()] });
                let resp = self
                    .auth(self.client.post(&url))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                check_status(resp).await?;
                Ok(())
            }
            IndexType::Weaviate => {
                let url = format!("{}/v1/objects/{}", self.base_url, remote_id(doc_id));
                let resp = self
                    .auth(self.client.delete(&url))
                    .send()
                    .await
                    .map_err(|e| RagError::RemoteUnavailable(e.to_string()))?;
                check_status(resp).await?;
                Ok(())
            }
            _ => Err(RagError::RemoteUnavailable(format!("delete not yet wired for {:?}", self.backend))),
        }
    }

    async fn save(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn load(&mut self, _path: &Path) -> Result<()> {
        self.initialized = false;
        self.ensure_collection().await
    }

    async fn optimize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: self.backend,
            count: 0,
            dimensions: self.dimensions,
            deleted_count: 0,
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(RagError::RemoteUnavailable(format!("{status}: {text}")));
    }
    resp.json().await.map_err(|e| RagError::RemoteUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_id_is_deterministic() {
        assert_eq!(remote_id("doc1_0"), remote_id("doc1_0"));
        assert_ne!(remote_id("doc1_0"), remote_id("doc1_1"));
    }
}
