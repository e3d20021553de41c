//! Local, in-process embedding adapter (`EmbeddingProviderKind::LocalSentenceTransformer`).
//!
//! Two backends are compiled in behind feature flags, mirroring the
//! platform split the teacher already drew: `fastembed` (bundled ORT,
//! the primary path) and a pure-Rust `tract-onnx` fallback for targets
//! where a prebuilt ONNX Runtime binary isn't available (musl, Intel
//! Mac). Both are expensive to construct — model weights get downloaded
//! and loaded into memory — so instances are cached process-wide, keyed
//! by `remote_model_id`, per §4.3.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;

use super::EmbeddingAdapter;
use crate::error::{RagError, Result};
use crate::models::EmbeddingModelConfig;

#[cfg(feature = "local-embeddings-fastembed")]
static FASTEMBED_CACHE: OnceLock<Mutex<HashMap<String, std::sync::Arc<Mutex<fastembed::TextEmbedding>>>>> =
    OnceLock::new();

/// Known local sentence-transformer models and their output dimensionality.
/// Anything not on this list must declare `dimensions` explicitly in config.
pub fn resolve_local_model(model_name: &str) -> Option<usize> {
    match model_name {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" => Some(384),
        "all-minilm-l12-v2" => Some(384),
        "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => Some(768),
        "bge-large-en-v1.5" | "mxbai-embed-large-v1" => Some(1024),
        "multilingual-e5-small" => Some(384),
        "multilingual-e5-base" => Some(768),
        "multilingual-e5-large" => Some(1024),
        _ => None,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(model_name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel;
    let m = match model_name {
        "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
        "all-minilm-l12-v2" => EmbeddingModel::AllMiniLML12V2,
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        "mxbai-embed-large-v1" => EmbeddingModel::MxbaiEmbedLargeV1,
        "multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
        "multilingual-e5-base" => EmbeddingModel::MultilingualE5Base,
        "multilingual-e5-large" => EmbeddingModel::MultilingualE5Large,
        other => return Err(RagError::ModelNotFound(format!("unknown local model {other}"))),
    };
    Ok(m)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn get_or_init_fastembed(model_name: &str) -> Result<std::sync::Arc<Mutex<fastembed::TextEmbedding>>> {
    let cache = FASTEMBED_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap();
    if let Some(existing) = guard.get(model_name) {
        return Ok(existing.clone());
    }
    let fe_model = config_to_fastembed_model(model_name)?;
    let init = fastembed::InitOptions::new(fe_model).with_show_download_progress(true);
    let model = fastembed::TextEmbedding::try_new(init)
        .map_err(|e| RagError::Transport(format!("fastembed init failed: {e}")))?;
    let arc = std::sync::Arc::new(Mutex::new(model));
    guard.insert(model_name.to_string(), arc.clone());
    Ok(arc)
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(model_name: &str, batch_size: usize, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model_name = model_name.to_string();
    let texts = texts.to_vec();
    tokio::task::spawn_blocking(move || {
        let model = get_or_init_fastembed(&model_name)?;
        let guard = model.lock().unwrap();
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        guard
            .embed(inputs, Some(batch_size))
            .map_err(|e| RagError::Transport(format!("fastembed inference failed: {e}")))
    })
    .await
    .map_err(|e| RagError::Transport(format!("fastembed task panicked: {e}")))?
}

#[cfg(feature = "local-embeddings-tract")]
async fn embed_local_tract(model_name: &str, batch_size: usize, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    super::local_tract::embed_local_tract(model_name, batch_size, texts)
        .await
        .map_err(|e| RagError::Transport(e.to_string()))
}

/// Adapter implementation for in-process local sentence-transformer
/// models. Picks whichever backend feature is compiled in, preferring
/// `fastembed` when both are present (same preference order the
/// teacher's doc comments describe for the two features).
pub struct LocalSentenceTransformerAdapter {
    model_name: String,
    dims: usize,
    batch_size: usize,
}

impl LocalSentenceTransformerAdapter {
    pub fn initialize(config: &EmbeddingModelConfig) -> Result<Self> {
        let model_name = config
            .remote_model_id
            .clone()
            .unwrap_or_else(|| config.id.clone());
        let dims = if config.dimensions > 0 {
            config.dimensions
        } else {
            resolve_local_model(&model_name)
                .ok_or_else(|| RagError::ConfigInvalid(format!("unknown local model {model_name}, set dimensions explicitly")))?
        };
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl EmbeddingAdapter for LocalSentenceTransformerAdapter {
    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut to_send = Vec::new();
        let mut idx = Vec::new();
        for (i, t) in texts.iter().enumerate() {
            if t.is_empty() {
                out[i] = Some(vec![0.0; self.dims]);
            } else {
                to_send.push(t.clone());
                idx.push(i);
            }
        }

        if !to_send.is_empty() {
            let vecs = self.run_backend(&to_send).await?;
            for (k, v) in idx.into_iter().zip(vecs.into_iter()) {
                out[k] = Some(v);
            }
        }

        Ok(out.into_iter().map(|o| o.unwrap_or_default()).collect())
    }
}

impl LocalSentenceTransformerAdapter {
    #[cfg(feature = "local-embeddings-fastembed")]
    async fn run_backend(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_local_fastembed(&self.model_name, self.batch_size, texts).await
    }

    #[cfg(all(not(feature = "local-embeddings-fastembed"), feature = "local-embeddings-tract"))]
    async fn run_backend(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_local_tract(&self.model_name, self.batch_size, texts).await
    }

    #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
    async fn run_backend(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::ConfigInvalid(
            "no local-embeddings backend compiled in (enable local-embeddings-fastembed or local-embeddings-tract)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_model_dims() {
        assert_eq!(resolve_local_model("all-minilm-l6-v2"), Some(384));
        assert_eq!(resolve_local_model("bge-large-en-v1.5"), Some(1024));
        assert_eq!(resolve_local_model("nonexistent-model"), None);
    }
}
