//! HNSW-backed shard index, via `hnsw_rs`.
//!
//! `hnsw_rs`'s graph is fixed-capacity at construction, so capacity is
//! grown by rebuilding into a bigger graph rather than by any in-place
//! resize — the same "auto-grow by max(2x, 1.5x required)" rule a
//! caller would expect from a capacity-planned index. True deletion
//! isn't supported by the library either: `delete_item` drops the
//! id↔doc_id mapping and records the internal id as tombstoned; search
//! filters tombstones out post-hoc, and `optimize` rebuilds the graph
//! from the surviving vectors to reclaim the space.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hnsw_rs::dist::{DistCosine, DistDot, DistL1, DistL2};
use hnsw_rs::prelude::Hnsw;
use serde::{Deserialize, Serialize};

use super::{IndexAdapter, IndexStats, IndexType};
use crate::error::{RagError, Result};
use crate::metric::{distance_to_similarity, Metric};
use crate::models::IndexBackendParams;

const DEFAULT_M: usize = 16;
const DEFAULT_EF_CONSTRUCTION: usize = 200;
const DEFAULT_EF_SEARCH: usize = 64;
const DEFAULT_MAX_ELEMENTS: usize = 10_000;
const MAX_LAYER: usize = 16;

#[derive(Serialize, Deserialize)]
struct Mappings {
    id_to_docid: HashMap<usize, String>,
    next_id: usize,
}

#[derive(Serialize, Deserialize)]
struct HnswConfigSnapshot {
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    max_elements: usize,
    metric: Metric,
    dimensions: usize,
}

/// Thin enum so one adapter struct can hold whichever distance the
/// configured metric calls for; `hnsw_rs` is generic over the distance
/// type, so each variant owns its own graph instance.
enum Graph {
    Cosine(Hnsw<'static, f32, DistCosine>),
    L2(Hnsw<'static, f32, DistL2>),
    Dot(Hnsw<'static, f32, DistDot>),
    Manhattan(Hnsw<'static, f32, DistL1>),
}

impl Graph {
    fn new(metric: Metric, m: usize, max_elements: usize, ef_construction: usize) -> Self {
        match metric {
            Metric::Cosine => Graph::Cosine(Hnsw::new(m, max_elements, MAX_LAYER, ef_construction, DistCosine {})),
            Metric::L2 => Graph::L2(Hnsw::new(m, max_elements, MAX_LAYER, ef_construction, DistL2 {})),
            Metric::Dot => Graph::Dot(Hnsw::new(m, max_elements, MAX_LAYER, ef_construction, DistDot {})),
            Metric::Manhattan => Graph::Manhattan(Hnsw::new(m, max_elements, MAX_LAYER, ef_construction, DistL1 {})),
        }
    }

    fn insert(&mut self, vector: &[f32], id: usize) {
        match self {
            Graph::Cosine(g) => g.insert((vector, id)),
            Graph::L2(g) => g.insert((vector, id)),
            Graph::Dot(g) => g.insert((vector, id)),
            Graph::Manhattan(g) => g.insert((vector, id)),
        }
    }

    fn search(&self, vector: &[f32], top_k: usize, ef_search: usize) -> Vec<(usize, f32)> {
        match self {
            Graph::Cosine(g) => g.search(vector, top_k, ef_search).into_iter().map(|n| (n.d_id, n.distance)).collect(),
            Graph::L2(g) => g.search(vector, top_k, ef_search).into_iter().map(|n| (n.d_id, n.distance)).collect(),
            Graph::Dot(g) => g.search(vector, top_k, ef_search).into_iter().map(|n| (n.d_id, n.distance)).collect(),
            Graph::Manhattan(g) => g.search(vector, top_k, ef_search).into_iter().map(|n| (n.d_id, n.distance)).collect(),
        }
    }
}

/// Local HNSW shard index.
pub struct HnswAdapter {
    graph: Graph,
    dimensions: usize,
    metric: Metric,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    max_elements: usize,
    id_to_docid: HashMap<usize, String>,
    docid_to_id: HashMap<String, usize>,
    vectors: HashMap<usize, Vec<f32>>,
    deleted: std::collections::HashSet<usize>,
    next_id: usize,
}

impl HnswAdapter {
    pub fn new(dimensions: usize, metric: Metric, params: &IndexBackendParams) -> Self {
        let m = params.m.unwrap_or(DEFAULT_M);
        let ef_construction = params.ef_construction.unwrap_or(DEFAULT_EF_CONSTRUCTION);
        let ef_search = params.ef_search.unwrap_or(DEFAULT_EF_SEARCH);
        let max_elements = params.max_elements.unwrap_or(DEFAULT_MAX_ELEMENTS);
        Self {
            graph: Graph::new(metric, m, max_elements, ef_construction),
            dimensions,
            metric,
            m,
            ef_construction,
            ef_search,
            max_elements,
            id_to_docid: HashMap::new(),
            docid_to_id: HashMap::new(),
            vectors: HashMap::new(),
            deleted: std::collections::HashSet::new(),
            next_id: 0,
        }
    }

    fn live_count(&self) -> usize {
        self.id_to_docid.len()
    }

    /// Grow capacity to `max(2x current, 1.5x required)` and reinsert
    /// every surviving vector (§4.7 HNSW invariant).
    fn grow_and_rebuild(&mut self, required: usize) {
        let new_capacity = std::cmp::max(self.max_elements * 2, (required as f64 * 1.5).ceil() as usize);
        self.max_elements = new_capacity;
        self.graph = Graph::new(self.metric, self.m, new_capacity, self.ef_construction);
        for (&id, vector) in self.vectors.iter() {
            if !self.deleted.contains(&id) {
                self.graph.insert(vector, id);
            }
        }
    }

    fn paths(base: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (
            base.join("hnsw_index.bin"),
            base.join("hnsw_mappings.json"),
            base.join("hnsw_config.json"),
        )
    }
}

#[async_trait]
impl IndexAdapter for HnswAdapter {
    async fn add_item(&mut self, vector: Vec<f32>, doc_id: String) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(RagError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        if let Some(&existing) = self.docid_to_id.get(&doc_id) {
            self.deleted.insert(existing);
            self.id_to_docid.remove(&existing);
        }

        let required = self.live_count() + 1;
        if required > self.max_elements {
            self.grow_and_rebuild(required);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.id_to_docid.insert(id, doc_id.clone());
        self.docid_to_id.insert(doc_id, id);
        self.vectors.insert(id, vector.clone());
        self.graph.insert(&vector, id);
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize, min_score: Option<f32>) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            return Err(RagError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        // Overshoot to compensate for tombstoned hits.
        let overshoot = (top_k * 3).max(top_k + self.deleted.len().min(64));
        let raw = self.graph.search(query, overshoot, self.ef_search);

        let mut out: Vec<(String, f32)> = raw
            .into_iter()
            .filter(|(id, _)| !self.deleted.contains(id))
            .filter_map(|(id, dist)| self.id_to_docid.get(&id).map(|doc_id| (doc_id.clone(), dist)))
            .map(|(doc_id, dist)| (doc_id, distance_to_similarity(self.metric, dist)))
            .filter(|(_, sim)| min_score.map(|min| *sim >= min).unwrap_or(true))
            .collect();

        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(top_k);
        Ok(out)
    }

    async fn delete_item(&mut self, doc_id: &str) -> Result<()> {
        let id = self
            .docid_to_id
            .remove(doc_id)
            .ok_or_else(|| RagError::NotFound(doc_id.to_string()))?;
        self.id_to_docid.remove(&id);
        self.deleted.insert(id);
        Ok(())
    }

    async fn save(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let (index_path, mappings_path, config_path) = Self::paths(path);

        // hnsw_rs vectors are reconstructed from our own `vectors` map on
        // load rather than round-tripped through the library's own
        // serializer, so `hnsw_index.bin` just carries our raw matrix.
        let mut flat: Vec<(usize, Vec<f32>)> = self.vectors.iter().map(|(k, v)| (*k, v.clone())).collect();
        flat.sort_by_key(|(id, _)| *id);
        let bytes = bincode_like_encode(&flat);
        std::fs::write(&index_path, bytes).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;

        let mappings = Mappings {
            id_to_docid: self.id_to_docid.clone(),
            next_id: self.next_id,
        };
        std::fs::write(&mappings_path, serde_json::to_vec(&mappings).unwrap()).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;

        let config = HnswConfigSnapshot {
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            max_elements: self.max_elements,
            metric: self.metric,
            dimensions: self.dimensions,
        };
        std::fs::write(&config_path, serde_json::to_vec(&config).unwrap()).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        Ok(())
    }

    async fn load(&mut self, path: &Path) -> Result<()> {
        let (index_path, mappings_path, config_path) = Self::paths(path);
        let config_bytes = std::fs::read(&config_path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let config: HnswConfigSnapshot = serde_json::from_slice(&config_bytes).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let mappings_bytes = std::fs::read(&mappings_path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let mappings: Mappings = serde_json::from_slice(&mappings_bytes).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let index_bytes = std::fs::read(&index_path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let flat: Vec<(usize, Vec<f32>)> = bincode_like_decode(&index_bytes).ok_or_else(|| RagError::IndexCorrupt("corrupt hnsw_index.bin".into()))?;

        self.dimensions = config.dimensions;
        self.metric = config.metric;
        self.m = config.m;
        self.ef_construction = config.ef_construction;
        self.ef_search = config.ef_search;
        self.max_elements = config.max_elements;
        self.id_to_docid = mappings.id_to_docid;
        self.docid_to_id = self.id_to_docid.iter().map(|(id, doc)| (doc.clone(), *id)).collect();
        self.next_id = mappings.next_id;
        self.deleted.clear();
        self.vectors = flat.into_iter().collect();

        self.graph = Graph::new(self.metric, self.m, self.max_elements, self.ef_construction);
        for (&id, vector) in self.vectors.iter() {
            self.graph.insert(vector, id);
        }
        Ok(())
    }

    async fn optimize(&mut self) -> Result<()> {
        let live: Vec<usize> = self.vectors.keys().copied().filter(|id| !self.deleted.contains(id)).collect();
        self.vectors.retain(|id, _| live.contains(id));
        self.deleted.clear();
        self.graph = Graph::new(self.metric, self.m, self.max_elements, self.ef_construction);
        for (&id, vector) in self.vectors.iter() {
            self.graph.insert(vector, id);
        }
        Ok(())
    }

    async fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: IndexType::Hnsw,
            count: self.live_count(),
            dimensions: self.dimensions,
            deleted_count: self.deleted.len(),
        }
    }
}

/// Minimal length-prefixed f32-matrix encoding — avoids pulling in a
/// general serialization crate just to persist `vectors.bin`-style
/// artefacts.
fn bincode_like_encode(rows: &[(usize, Vec<f32>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    for (id, vec) in rows {
        out.extend_from_slice(&(*id as u64).to_le_bytes());
        out.extend_from_slice(&(vec.len() as u64).to_le_bytes());
        for v in vec {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

fn bincode_like_decode(bytes: &[u8]) -> Option<Vec<(usize, Vec<f32>)>> {
    let mut cursor = 0usize;
    let read_u64 = |cursor: &mut usize, bytes: &[u8]| -> Option<u64> {
        let slice = bytes.get(*cursor..*cursor + 8)?;
        *cursor += 8;
        Some(u64::from_le_bytes(slice.try_into().ok()?))
    };
    let count = read_u64(&mut cursor, bytes)? as usize;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_u64(&mut cursor, bytes)? as usize;
        let len = read_u64(&mut cursor, bytes)? as usize;
        let mut vec = Vec::with_capacity(len);
        for _ in 0..len {
            let slice = bytes.get(cursor..cursor + 4)?;
            cursor += 4;
            vec.push(f32::from_le_bytes(slice.try_into().ok()?));
        }
        rows.push((id, vec));
    }
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> IndexBackendParams {
        IndexBackendParams::default()
    }

    #[tokio::test]
    async fn add_then_search_finds_nearest() {
        let mut idx = HnswAdapter::new(2, Metric::Cosine, &params());
        idx.add_item(vec![1.0, 0.0], "a".into()).await.unwrap();
        idx.add_item(vec![0.0, 1.0], "b".into()).await.unwrap();
        let results = idx.search(&[0.9, 0.1], 1, None).await.unwrap();
        assert_eq!(results[0].0, "a");
    }

    #[tokio::test]
    async fn delete_removes_mutual_mapping_and_hides_from_search() {
        let mut idx = HnswAdapter::new(2, Metric::Cosine, &params());
        idx.add_item(vec![1.0, 0.0], "a".into()).await.unwrap();
        idx.delete_item("a").await.unwrap();
        assert!(idx.docid_to_id.get("a").is_none());
        let results = idx.search(&[1.0, 0.0], 5, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn re_adding_same_doc_id_replaces_old_vector() {
        let mut idx = HnswAdapter::new(2, Metric::Cosine, &params());
        idx.add_item(vec![1.0, 0.0], "a".into()).await.unwrap();
        idx.add_item(vec![0.0, 1.0], "a".into()).await.unwrap();
        let results = idx.search(&[0.0, 1.0], 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
    }

    #[tokio::test]
    async fn save_and_load_roundtrips_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = HnswAdapter::new(2, Metric::Cosine, &params());
        idx.add_item(vec![1.0, 0.0], "a".into()).await.unwrap();
        idx.add_item(vec![0.0, 1.0], "b".into()).await.unwrap();
        idx.save(dir.path()).await.unwrap();

        let mut reloaded = HnswAdapter::new(2, Metric::Cosine, &params());
        reloaded.load(dir.path()).await.unwrap();
        let results = reloaded.search(&[0.9, 0.1], 1, None).await.unwrap();
        assert_eq!(results[0].0, "a");
    }
}
