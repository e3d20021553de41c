//! Sparse + hybrid retrieval (C9).
//!
//! `SparseIndex` is a hand-rolled BM25 over chunk text — Unicode-aware
//! lowercasing, whitespace tokenisation, an optional stopword list.
//! `hybrid_fuse` combines it with a dense shard's hits via min-max
//! normalisation and a weighted sum; `matches_filter` implements the
//! metadata-filter semantics the vector store facade applies
//! post-retrieval.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

fn default_stopwords() -> &'static [&'static str] {
    &[
        "a", "an", "the", "is", "are", "was", "were", "and", "or", "of", "to", "in", "on", "for", "with", "as", "by",
        "at", "it", "this", "that", "be", "have", "has",
    ]
}

fn tokenize(text: &str) -> Vec<String> {
    let stop: HashSet<&str> = default_stopwords().iter().copied().collect();
    text.to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty() && !stop.contains(t.as_str()))
        .collect()
}

struct Doc {
    term_freqs: HashMap<String, u32>,
    length: usize,
}

/// BM25 index over chunk text, keyed by chunk id.
pub struct SparseIndex {
    docs: HashMap<String, Doc>,
    doc_freq: HashMap<String, usize>,
    total_length: usize,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self {
            docs: HashMap::new(),
            doc_freq: HashMap::new(),
            total_length: 0,
        }
    }

    pub fn index_chunk(&mut self, chunk_id: &str, text: &str) {
        self.remove_chunk(chunk_id);
        let tokens = tokenize(text);
        let mut term_freqs = HashMap::new();
        for t in &tokens {
            *term_freqs.entry(t.clone()).or_insert(0) += 1;
        }
        for t in term_freqs.keys() {
            *self.doc_freq.entry(t.clone()).or_insert(0) += 1;
        }
        self.total_length += tokens.len();
        self.docs.insert(
            chunk_id.to_string(),
            Doc {
                term_freqs,
                length: tokens.len(),
            },
        );
    }

    pub fn remove_chunk(&mut self, chunk_id: &str) {
        if let Some(doc) = self.docs.remove(chunk_id) {
            for t in doc.term_freqs.keys() {
                if let Some(count) = self.doc_freq.get_mut(t) {
                    *count = count.saturating_sub(1);
                }
            }
            self.total_length = self.total_length.saturating_sub(doc.length);
        }
    }

    fn avg_doc_length(&self) -> f32 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.docs.len() as f32
        }
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = *self.doc_freq.get(term).unwrap_or(&0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score(&self, query_tokens: &[String], doc: &Doc) -> f32 {
        let avg_len = self.avg_doc_length();
        let mut score = 0.0;
        for term in query_tokens {
            let tf = *doc.term_freqs.get(term).unwrap_or(&0) as f32;
            if tf == 0.0 {
                continue;
            }
            let idf = self.idf(term);
            let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc.length as f32 / avg_len.max(1.0));
            score += idf * (tf * (BM25_K1 + 1.0)) / denom;
        }
        score
    }

    /// Keyword search returning `(chunk_id, bm25_score)`, raw (not yet
    /// normalised — callers normalise relative to their own result set).
    pub fn search_raw(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(String, f32)> = self
            .docs
            .iter()
            .map(|(id, doc)| (id.clone(), self.score(&query_tokens, doc)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }

    /// Keyword search with the score normalised into `[0, 1]` via
    /// min-max over the returned set (§4.9).
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let raw = self.search_raw(query, limit);
        min_max_normalize(raw)
    }
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn min_max_normalize(scored: Vec<(String, f32)>) -> Vec<(String, f32)> {
    if scored.is_empty() {
        return scored;
    }
    let max = scored.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
    let min = scored.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
    let range = max - min;
    scored
        .into_iter()
        .map(|(id, s)| if range > f32::EPSILON { (id, (s - min) / range) } else { (id, 1.0) })
        .collect()
}

/// Weights for [`hybrid_fuse`]; `alpha` is the dense weight, `1 - alpha`
/// the sparse weight.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub alpha: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

/// Fuse dense hits `(chunk_id, similarity)` and sparse hits
/// `(chunk_id, normalised_bm25)` per §4.9: independently min-max
/// normalise both sets, then `alpha*dense + (1-alpha)*sparse`. Ties
/// break by dense score, then chunk id. Returns
/// `(chunk_id, fused_score, (dense_component, sparse_component))`.
pub fn hybrid_fuse(dense: &[(String, f32)], sparse: &[(String, f32)], weights: HybridWeights) -> Vec<(String, f32, (Option<f32>, Option<f32>))> {
    let dense_norm: HashMap<String, f32> = min_max_normalize(dense.to_vec()).into_iter().collect();
    let sparse_norm: HashMap<String, f32> = min_max_normalize(sparse.to_vec()).into_iter().collect();

    let mut ids: Vec<String> = dense_norm.keys().chain(sparse_norm.keys()).cloned().collect();
    ids.sort();
    ids.dedup();

    let mut out: Vec<(String, f32, (Option<f32>, Option<f32>))> = ids
        .into_iter()
        .map(|id| {
            let d = dense_norm.get(&id).copied();
            let s = sparse_norm.get(&id).copied();
            let fused = weights.alpha * d.unwrap_or(0.0) + (1.0 - weights.alpha) * s.unwrap_or(0.0);
            (id, fused, (d, s))
        })
        .collect();

    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.2 .0.partial_cmp(&a.2 .0).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}

/// Dot-path lookup into a metadata map, e.g. `"author.name"`.
fn get_path<'a>(metadata: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = metadata.get(first)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Metadata filter semantics (§4.9): shallow equality, list-membership
/// for arrays, dot-path lookup, set-intersection when both sides are
/// lists. A missing field never matches.
pub fn matches_filter(metadata: &HashMap<String, Value>, filter: &Value) -> bool {
    let Some(filter_obj) = filter.as_object() else { return true };
    for (key, expected) in filter_obj {
        let Some(actual) = get_path(metadata, key) else { return false };
        if !value_matches(actual, expected) {
            return false;
        }
    }
    true
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(actual_list), Value::Array(expected_list)) => expected_list.iter().any(|e| actual_list.contains(e)),
        (Value::Array(actual_list), expected_scalar) => actual_list.contains(expected_scalar),
        (actual_scalar, Value::Array(expected_list)) => expected_list.contains(actual_scalar),
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm25_ranks_exact_term_match_higher() {
        let mut idx = SparseIndex::new();
        idx.index_chunk("a", "the quick brown fox jumps over the lazy dog");
        idx.index_chunk("b", "completely unrelated text about gardening");
        let hits = idx.search("fox", 10);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn remove_chunk_drops_it_from_results() {
        let mut idx = SparseIndex::new();
        idx.index_chunk("a", "fox fox fox");
        idx.remove_chunk("a");
        assert!(idx.search("fox", 10).is_empty());
    }

    #[test]
    fn hybrid_fuse_combines_dense_and_sparse() {
        let dense = vec![("a".to_string(), 0.9), ("b".to_string(), 0.1)];
        let sparse = vec![("a".to_string(), 0.2), ("b".to_string(), 0.8)];
        let fused = hybrid_fuse(&dense, &sparse, HybridWeights { alpha: 0.5 });
        let a = fused.iter().find(|(id, _, _)| id == "a").unwrap();
        assert!((a.1 - 0.5).abs() < 1e-5);
    }

    #[test]
    fn hybrid_fuse_is_monotonic_in_dense_score() {
        let sparse = vec![("a".to_string(), 0.5), ("b".to_string(), 0.5)];
        let low_dense = vec![("a".to_string(), 0.1), ("b".to_string(), 0.9)];
        let high_dense = vec![("a".to_string(), 0.9), ("b".to_string(), 0.9)];
        let fused_low = hybrid_fuse(&low_dense, &sparse, HybridWeights::default());
        let fused_high = hybrid_fuse(&high_dense, &sparse, HybridWeights::default());
        let a_low = fused_low.iter().find(|(id, _, _)| id == "a").unwrap().1;
        let a_high = fused_high.iter().find(|(id, _, _)| id == "a").unwrap().1;
        assert!(a_high >= a_low);
    }

    #[test]
    fn metadata_filter_dot_path_and_missing_field() {
        let mut meta = HashMap::new();
        meta.insert("author".to_string(), serde_json::json!({"name": "ada"}));
        assert!(matches_filter(&meta, &serde_json::json!({"author.name": "ada"})));
        assert!(!matches_filter(&meta, &serde_json::json!({"author.name": "grace"})));
        assert!(!matches_filter(&meta, &serde_json::json!({"missing": "x"})));
    }

    #[test]
    fn metadata_filter_list_intersection() {
        let mut meta = HashMap::new();
        meta.insert("tags".to_string(), serde_json::json!(["rust", "rag", "search"]));
        assert!(matches_filter(&meta, &serde_json::json!({"tags": ["rag"]})));
        assert!(!matches_filter(&meta, &serde_json::json!({"tags": ["python"]})));
    }
}
