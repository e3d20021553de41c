//! Model router (C5).
//!
//! Decides which embedding model(s) serve a given piece of text and, in
//! ensemble mode, fuses multiple models' vectors into one. Language and
//! domain detection are both cheap heuristics — this is a routing layer,
//! not a classifier — cached by a hash of the text prefix so repeated
//! queries against the same corpus don't redo the work.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RagError, Result};
use crate::metric::normalize;

/// How an ensemble's per-model vectors are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMethod {
    WeightedAverage,
    Concatenate,
}

/// Router configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub default_model_id: String,
    #[serde(default)]
    pub fallback_model_id: Option<String>,
    #[serde(default)]
    pub language_models: HashMap<String, String>,
    #[serde(default)]
    pub domain_models: HashMap<String, String>,
    #[serde(default)]
    pub enable_auto_routing: bool,
    #[serde(default)]
    pub enable_ensemble: bool,
    #[serde(default = "default_ensemble_method")]
    pub ensemble_method: EnsembleMethod,
    #[serde(default)]
    pub model_weights: HashMap<String, f32>,
}

fn default_ensemble_method() -> EnsembleMethod {
    EnsembleMethod::WeightedAverage
}

/// Minimum text length before auto-routing even attempts detection;
/// shorter strings ("ok", "yes") route to the default model.
const MIN_ROUTABLE_LEN: usize = 10;

/// Minimum keyword-vote count before a domain is considered detected.
const DOMAIN_VOTE_THRESHOLD: usize = 2;

const MAX_ENSEMBLE_MODELS: usize = 3;
const MAX_CONCATENATED_DIMS: usize = 5000;

fn domain_keywords() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        ("finance", &["revenue", "equity", "portfolio", "invoice", "balance sheet", "dividend", "stock", "asset"]),
        ("legal", &["plaintiff", "defendant", "statute", "contract", "liability", "jurisdiction", "clause", "tort"]),
        ("medical", &["diagnosis", "patient", "symptom", "treatment", "dosage", "prescription", "clinical", "pathology"]),
        ("tech", &["algorithm", "database", "api", "latency", "deployment", "kubernetes", "compiler", "runtime"]),
    ]
}

fn detect_domain(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;
    for (domain, keywords) in domain_keywords() {
        let votes = keywords.iter().filter(|kw| lower.contains(**kw)).count();
        if votes >= DOMAIN_VOTE_THRESHOLD && best.map(|(_, v)| votes > v).unwrap_or(true) {
            best = Some((domain, votes));
        }
    }
    best.map(|(d, _)| d)
}

/// Extremely coarse language detection: looks for script/diacritic
/// signals and a short stopword list. Good enough to route between a
/// handful of configured `language_models`, not a substitute for a real
/// language-id model.
fn detect_language(text: &str) -> &'static str {
    let has_cjk = text.chars().any(|c| {
        let c = c as u32;
        (0x4E00..=0x9FFF).contains(&c) || (0x3040..=0x30FF).contains(&c) || (0xAC00..=0xD7A3).contains(&c)
    });
    if has_cjk {
        return "zh";
    }
    let lower = text.to_lowercase();
    let spanish_hits = ["el ", "la ", "de ", "que ", "y ", "en ", "los ", "es "]
        .iter()
        .filter(|w| lower.contains(*w))
        .count();
    let french_hits = ["le ", "la ", "les ", "de ", "et ", "une ", "est "]
        .iter()
        .filter(|w| lower.contains(*w))
        .count();
    if spanish_hits >= 3 {
        return "es";
    }
    if french_hits >= 3 {
        return "fr";
    }
    "en"
}

fn prefix_hash(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let prefix: String = text.chars().take(128).collect();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prefix.hash(&mut hasher);
    hasher.finish()
}

/// Selects embedding model(s) for incoming text and fuses ensemble
/// results.
pub struct Router {
    config: RouterConfig,
    language_cache: Mutex<HashMap<u64, &'static str>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            language_cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached_language(&self, text: &str) -> &'static str {
        let key = prefix_hash(text);
        if let Some(lang) = self.language_cache.lock().unwrap().get(&key) {
            return lang;
        }
        let lang = detect_language(text);
        self.language_cache.lock().unwrap().insert(key, lang);
        lang
    }

    /// Pick the single best model for `text` (§4.5 steps 1-3).
    pub fn route(&self, text: &str) -> String {
        if !self.config.enable_auto_routing {
            return self.config.default_model_id.clone();
        }
        if text.len() < MIN_ROUTABLE_LEN {
            return self.config.default_model_id.clone();
        }

        let lang = self.cached_language(text);
        if let Some(model) = self.config.language_models.get(lang) {
            return model.clone();
        }

        if let Some(domain) = detect_domain(text) {
            if let Some(model) = self.config.domain_models.get(domain) {
                return model.clone();
            }
        }

        self.config
            .fallback_model_id
            .clone()
            .unwrap_or_else(|| self.config.default_model_id.clone())
    }

    /// Pick the model set used for an ensemble call (§4.5 step 4): the
    /// language pick and the domain pick, topped up with the default
    /// until at least 2 are selected, capped at 3, de-duplicated, order
    /// preserved.
    pub fn select_models_for_text(&self, text: &str) -> Vec<String> {
        if !self.config.enable_ensemble {
            return vec![self.route(text)];
        }

        let mut picks: Vec<String> = Vec::new();
        let lang = self.cached_language(text);
        if let Some(model) = self.config.language_models.get(lang) {
            picks.push(model.clone());
        }
        if let Some(domain) = detect_domain(text) {
            if let Some(model) = self.config.domain_models.get(domain) {
                if !picks.contains(model) {
                    picks.push(model.clone());
                }
            }
        }
        while picks.len() < 2 && picks.len() < MAX_ENSEMBLE_MODELS {
            if !picks.contains(&self.config.default_model_id) {
                picks.push(self.config.default_model_id.clone());
            } else {
                break;
            }
        }
        picks.truncate(MAX_ENSEMBLE_MODELS);
        if picks.is_empty() {
            picks.push(self.config.default_model_id.clone());
        }
        picks
    }

    fn weight_for(&self, model_id: &str, n: usize) -> f32 {
        self.config
            .model_weights
            .get(model_id)
            .copied()
            .unwrap_or(1.0 / n as f32)
    }

    /// Fuse per-model vectors for an ensemble call per §4.5. `vectors`
    /// must be given in the same order as `model_ids`. Mismatched
    /// dimensions in weighted-average mode fall back to the largest
    /// single vector, with a warning — they are never averaged.
    pub fn fuse_embeddings(&self, model_ids: &[String], vectors: Vec<Vec<f32>>) -> Result<Vec<f32>> {
        if vectors.is_empty() {
            return Err(RagError::ConfigInvalid("fuse_embeddings called with no vectors".into()));
        }
        if vectors.len() == 1 {
            return Ok(vectors.into_iter().next().unwrap());
        }

        match self.config.ensemble_method {
            EnsembleMethod::WeightedAverage => {
                let dims = vectors[0].len();
                if vectors.iter().any(|v| v.len() != dims) {
                    warn!("ensemble vectors have mismatched dimensions, falling back to largest vector");
                    let largest = vectors.into_iter().max_by_key(|v| v.len()).unwrap();
                    return Ok(largest);
                }
                let raw_weights: Vec<f32> = model_ids
                    .iter()
                    .map(|id| self.weight_for(id, model_ids.len()))
                    .collect();
                let total: f32 = raw_weights.iter().sum();
                let weights: Vec<f32> = if total > f32::EPSILON {
                    raw_weights.iter().map(|w| w / total).collect()
                } else {
                    vec![1.0 / vectors.len() as f32; vectors.len()]
                };

                let mut fused = vec![0.0f32; dims];
                for (vec, w) in vectors.iter().zip(weights.iter()) {
                    for (f, v) in fused.iter_mut().zip(vec.iter()) {
                        *f += v * w;
                    }
                }
                normalize(&mut fused);
                Ok(fused)
            }
            EnsembleMethod::Concatenate => {
                let mut pairs: Vec<(&String, Vec<f32>)> = model_ids.iter().zip(vectors.into_iter()).collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                let mut fused: Vec<f32> = pairs.into_iter().flat_map(|(_, v)| v).collect();
                fused.truncate(MAX_CONCATENATED_DIMS);
                normalize(&mut fused);
                Ok(fused)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RouterConfig {
        RouterConfig {
            default_model_id: "default".into(),
            fallback_model_id: Some("fallback".into()),
            language_models: HashMap::from([("zh".to_string(), "zh-model".to_string())]),
            domain_models: HashMap::from([("finance".to_string(), "finance-model".to_string())]),
            enable_auto_routing: true,
            enable_ensemble: false,
            ensemble_method: EnsembleMethod::WeightedAverage,
            model_weights: HashMap::new(),
        }
    }

    #[test]
    fn short_text_routes_to_default() {
        let router = Router::new(base_config());
        assert_eq!(router.route("hi"), "default");
    }

    #[test]
    fn disabled_auto_routing_always_returns_default() {
        let mut cfg = base_config();
        cfg.enable_auto_routing = false;
        let router = Router::new(cfg);
        assert_eq!(router.route("a long piece of financial revenue equity text"), "default");
    }

    #[test]
    fn domain_keywords_route_to_domain_model() {
        let router = Router::new(base_config());
        let text = "Our quarterly revenue and equity portfolio grew substantially this year.";
        assert_eq!(router.route(text), "finance-model");
    }

    #[test]
    fn unmatched_text_falls_back() {
        let router = Router::new(base_config());
        let text = "The quick brown fox jumps over the lazy dog in the park today.";
        assert_eq!(router.route(text), "fallback");
    }

    #[test]
    fn ensemble_selection_tops_up_to_two_with_default() {
        let mut cfg = base_config();
        cfg.enable_ensemble = true;
        let router = Router::new(cfg);
        let text = "Our quarterly revenue and equity portfolio grew substantially this year.";
        let picks = router.select_models_for_text(text);
        assert!(picks.len() >= 2);
        assert!(picks.contains(&"finance-model".to_string()));
    }

    #[test]
    fn weighted_average_fuses_and_renormalises() {
        let router = Router::new(base_config());
        let ids = vec!["a".to_string(), "b".to_string()];
        let vecs = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let fused = router.fuse_embeddings(&ids, vecs).unwrap();
        assert!((fused[0] - fused[1]).abs() < 1e-5);
        let norm = (fused[0].powi(2) + fused[1].powi(2)).sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_dimensions_fall_back_to_largest() {
        let router = Router::new(base_config());
        let ids = vec!["a".to_string(), "b".to_string()];
        let vecs = vec![vec![1.0, 0.0], vec![0.0, 1.0, 0.0]];
        let fused = router.fuse_embeddings(&ids, vecs).unwrap();
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn concatenate_orders_by_model_id() {
        let mut cfg = base_config();
        cfg.ensemble_method = EnsembleMethod::Concatenate;
        let router = Router::new(cfg);
        let ids = vec!["z".to_string(), "a".to_string()];
        let vecs = vec![vec![9.0], vec![1.0]];
        let fused = router.fuse_embeddings(&ids, vecs).unwrap();
        // "a" sorts before "z", so its component comes first pre-normalisation.
        assert_eq!(fused.len(), 2);
    }
}
