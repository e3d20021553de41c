//! FAISS-family shard index (Flat/IVF/PQ/IVFPQ), behind `faiss-backend`.
//!
//! FAISS indexes don't support in-place update or delete, so mutation
//! always goes through a full rebuild: reset the index, retrain on the
//! surviving vectors, re-add them. IVF/PQ indexes additionally need to
//! be *trained* before the first add; we train on a small amount of
//! dummy (random unit) data at construction so the index is usable
//! immediately, then retrain on real data once the stored count passes
//! the threshold in §4.7 (`nlist` for IVF, 1000 for PQ).

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use faiss::{index_factory, Index, MetricType};

use super::{IndexAdapter, IndexStats, IndexType};
use crate::error::{RagError, Result};
use crate::metric::{distance_to_similarity, Metric};
use crate::models::IndexBackendParams;

const DEFAULT_NLIST: usize = 100;
const DEFAULT_NBITS: usize = 8;
const DEFAULT_M_SUB: usize = 8;
const PQ_RETRAIN_THRESHOLD: usize = 1000;

fn description_for(index_type: IndexType, params: &IndexBackendParams) -> (String, usize) {
    match index_type {
        IndexType::Flat => ("Flat".to_string(), 0),
        IndexType::Ivf => (format!("IVF{},Flat", params.nlist.unwrap_or(DEFAULT_NLIST)), params.nlist.unwrap_or(DEFAULT_NLIST)),
        IndexType::Pq => (
            format!("PQ{}x{}", params.m_sub.unwrap_or(DEFAULT_M_SUB), params.nbits.unwrap_or(DEFAULT_NBITS)),
            0,
        ),
        IndexType::IvfPq => (
            format!(
                "IVF{},PQ{}x{}",
                params.nlist.unwrap_or(DEFAULT_NLIST),
                params.m_sub.unwrap_or(DEFAULT_M_SUB),
                params.nbits.unwrap_or(DEFAULT_NBITS)
            ),
            params.nlist.unwrap_or(DEFAULT_NLIST),
        ),
        _ => unreachable!("faiss_family only handles Flat/Ivf/Pq/IvfPq"),
    }
}

fn metric_type(metric: Metric) -> MetricType {
    match metric {
        Metric::Dot => MetricType::InnerProduct,
        _ => MetricType::L2,
    }
}

fn dummy_training_data(dims: usize, n: usize) -> Vec<f32> {
    // Deterministic pseudo-random unit vectors — good enough to make an
    // IVF/PQ index trainable before real data arrives; retrained for
    // real once the threshold is crossed.
    let mut out = Vec::with_capacity(n * dims);
    let mut state: u64 = 0x9E3779B97F4A7C15;
    for _ in 0..(n * dims) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let v = ((state % 2000) as f32 / 1000.0) - 1.0;
        out.push(v);
    }
    out
}

/// FAISS-backed shard index for the Flat/IVF/PQ/IVFPQ family.
pub struct FaissAdapter {
    index_type: IndexType,
    dimensions: usize,
    metric: Metric,
    nlist: usize,
    inner: Box<dyn Index>,
    vectors: HashMap<u64, Vec<f32>>,
    id_to_docid: HashMap<u64, String>,
    docid_to_id: HashMap<String, u64>,
    deleted: std::collections::HashSet<u64>,
    next_id: u64,
    params: IndexBackendParams,
}

impl FaissAdapter {
    pub fn new(index_type: IndexType, dimensions: usize, metric: Metric, params: &IndexBackendParams) -> Result<Self> {
        let (description, nlist) = description_for(index_type, params);
        let mut inner = index_factory(dimensions as u32, &description, metric_type(metric))
            .map_err(|e| RagError::ConfigInvalid(format!("faiss index_factory failed: {e}")))?;

        if !matches!(index_type, IndexType::Flat) {
            let dummy = dummy_training_data(dimensions, nlist.max(256));
            inner
                .train(&dummy)
                .map_err(|e| RagError::IndexCorrupt(format!("faiss dummy training failed: {e}")))?;
        }

        Ok(Self {
            index_type,
            dimensions,
            metric,
            nlist,
            inner: Box::new(inner),
            vectors: HashMap::new(),
            id_to_docid: HashMap::new(),
            docid_to_id: HashMap::new(),
            deleted: std::collections::HashSet::new(),
            next_id: 0,
            params: params.clone(),
        })
    }

    fn should_retrain(&self) -> bool {
        match self.index_type {
            IndexType::Ivf | IndexType::IvfPq => self.vectors.len() > self.nlist,
            IndexType::Pq => self.vectors.len() > PQ_RETRAIN_THRESHOLD,
            IndexType::Flat => false,
        }
    }

    /// Full rebuild: reset, retrain on surviving real data, re-add.
    fn rebuild(&mut self) -> Result<()> {
        let (description, _) = description_for(self.index_type, &self.params);
        let mut fresh = index_factory(self.dimensions as u32, &description, metric_type(self.metric))
            .map_err(|e| RagError::ConfigInvalid(format!("faiss index_factory failed: {e}")))?;

        let live_ids: Vec<u64> = self.id_to_docid.keys().copied().collect();
        let training_data: Vec<f32> = if live_ids.is_empty() {
            dummy_training_data(self.dimensions, self.nlist.max(256))
        } else {
            live_ids.iter().flat_map(|id| self.vectors[id].clone()).collect()
        };

        if !matches!(self.index_type, IndexType::Flat) {
            fresh
                .train(&training_data)
                .map_err(|e| RagError::IndexCorrupt(format!("faiss retrain failed: {e}")))?;
        }

        for &id in &live_ids {
            let vector = &self.vectors[&id];
            fresh
                .add_with_ids(vector, &[faiss::Idx::new(id)])
                .map_err(|e| RagError::IndexCorrupt(format!("faiss re-add failed: {e}")))?;
        }

        self.inner = Box::new(fresh);
        self.deleted.clear();
        Ok(())
    }
}

#[async_trait]
impl IndexAdapter for FaissAdapter {
    async fn add_item(&mut self, vector: Vec<f32>, doc_id: String) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(RagError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        if let Some(&old_id) = self.docid_to_id.get(&doc_id) {
            self.deleted.insert(old_id);
            self.id_to_docid.remove(&old_id);
            self.vectors.remove(&old_id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.vectors.insert(id, vector.clone());
        self.id_to_docid.insert(id, doc_id.clone());
        self.docid_to_id.insert(doc_id, id);

        // Mutation always goes through a rebuild for this family (§4.7).
        self.rebuild()?;
        if self.should_retrain() {
            self.rebuild()?;
        }
        Ok(())
    }

    async fn add_items_batch(&mut self, items: Vec<(Vec<f32>, String)>) -> Result<()> {
        for (vector, doc_id) in items {
            if vector.len() != self.dimensions {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: vector.len(),
                });
            }
            if let Some(&old_id) = self.docid_to_id.get(&doc_id) {
                self.deleted.insert(old_id);
                self.id_to_docid.remove(&old_id);
                self.vectors.remove(&old_id);
            }
            let id = self.next_id;
            self.next_id += 1;
            self.vectors.insert(id, vector.clone());
            self.id_to_docid.insert(id, doc_id.clone());
            self.docid_to_id.insert(doc_id, id);
        }
        self.rebuild()
    }

    async fn search(&self, query: &[f32], top_k: usize, min_score: Option<f32>) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            return Err(RagError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        let overshoot = top_k * 3;
        let result = self
            .inner
            .search(query, overshoot)
            .map_err(|e| RagError::Transport(format!("faiss search failed: {e}")))?;

        let mut out: Vec<(String, f32)> = result
            .labels
            .into_iter()
            .zip(result.distances.into_iter())
            .filter_map(|(label, dist)| label.get().map(|id| (id, dist)))
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
        self.vectors.remove(&id);
        self.deleted.insert(id);
        self.rebuild()
    }

    async fn save(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let prefix = match self.index_type {
            IndexType::Flat => "flat",
            IndexType::Ivf => "ivf",
            IndexType::Pq => "pq",
            IndexType::IvfPq => "ivfpq",
            _ => unreachable!(),
        };
        let mappings_path = path.join(format!("{prefix}_mappings.json"));
        let config_path = path.join(format!("{prefix}_config.json"));
        let vectors_path = path.join("vectors.bin");

        #[derive(serde::Serialize)]
        struct Mappings<'a> {
            id_to_docid: &'a HashMap<u64, String>,
            next_id: u64,
        }
        std::fs::write(
            &mappings_path,
            serde_json::to_vec(&Mappings {
                id_to_docid: &self.id_to_docid,
                next_id: self.next_id,
            })
            .unwrap(),
        )
        .map_err(|e| RagError::IndexCorrupt(e.to_string()))?;

        std::fs::write(&config_path, serde_json::to_vec(&self.dimensions).unwrap()).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;

        let mut bytes = Vec::new();
        let mut ids: Vec<u64> = self.vectors.keys().copied().collect();
        ids.sort();
        for id in ids {
            for f in &self.vectors[&id] {
                bytes.extend_from_slice(&f.to_le_bytes());
            }
        }
        std::fs::write(&vectors_path, bytes).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        Ok(())
    }

    async fn load(&mut self, path: &Path) -> Result<()> {
        let prefix = match self.index_type {
            IndexType::Flat => "flat",
            IndexType::Ivf => "ivf",
            IndexType::Pq => "pq",
            IndexType::IvfPq => "ivfpq",
            _ => unreachable!(),
        };
        let mappings_path = path.join(format!("{prefix}_mappings.json"));
        let vectors_path = path.join("vectors.bin");

        #[derive(serde::Deserialize)]
        struct Mappings {
            id_to_docid: HashMap<u64, String>,
            next_id: u64,
        }
        let mappings: Mappings = serde_json::from_slice(&std::fs::read(&mappings_path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?)
            .map_err(|e| RagError::IndexCorrupt(e.to_string()))?;
        let raw = std::fs::read(&vectors_path).map_err(|e| RagError::IndexCorrupt(e.to_string()))?;

        let mut ids: Vec<u64> = mappings.id_to_docid.keys().copied().collect();
        ids.sort();
        let floats_per_row = self.dimensions;
        let mut vectors = HashMap::new();
        for (row, id) in ids.iter().enumerate() {
            let start = row * floats_per_row * 4;
            let end = start + floats_per_row * 4;
            let slice = raw.get(start..end).ok_or_else(|| RagError::IndexCorrupt("vectors.bin truncated".into()))?;
            let vector: Vec<f32> = slice.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
            vectors.insert(*id, vector);
        }

        self.id_to_docid = mappings.id_to_docid;
        self.docid_to_id = self.id_to_docid.iter().map(|(id, doc)| (doc.clone(), *id)).collect();
        self.next_id = mappings.next_id;
        self.vectors = vectors;
        self.deleted.clear();
        self.rebuild()
    }

    async fn optimize(&mut self) -> Result<()> {
        self.rebuild()
    }

    async fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: self.index_type,
            count: self.id_to_docid.len(),
            dimensions: self.dimensions,
            deleted_count: self.deleted.len(),
        }
    }
}
