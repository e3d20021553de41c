//! Embedding model adapters (C3).
//!
//! Every adapter implements the [`EmbeddingAdapter`] trait from
//! [`super::EmbeddingAdapter`]. Remote HTTP-backed providers (OpenAI,
//! Azure, Cohere, HuggingFace, Google, and a generic local-HTTP provider)
//! all go through [`HttpEmbeddingAdapter`], which owns the shared
//! contract from §4.3: truncation-with-warning instead of rejection, the
//! zero vector for empty text, one rate-limit retry with provider-shaped
//! backoff, batch-splitting on repeated rate limits, and strict
//! input-order preservation. Per-provider request/response shape is
//! dispatched by a free function (`call_provider`) keyed on the provider
//! enum — the same config-keyed-match pattern the teacher uses in
//! `embed_texts`/`create_provider`, kept as a free function because
//! `async_trait` object-safety does not extend cleanly to dispatch by a
//! runtime tag.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{RagError, Result};
use crate::metric::normalize;
use crate::models::{EmbeddingModelConfig, EmbeddingProviderKind};

/// Maximum input length (in chars) before an adapter truncates with a
/// warning rather than rejecting the call.
const DEFAULT_MAX_CHARS: usize = 32_000;

/// Uniform contract every embedding backend implements (§4.3).
#[async_trait]
pub trait EmbeddingAdapter: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_batch(std::slice::from_ref(&text.to_string())).await?.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A remote, HTTP-backed embedding adapter. Covers OpenAI, Azure, Cohere,
/// HuggingFace, Google, and a generic "local-http" server speaking a
/// compatible JSON contract.
pub struct HttpEmbeddingAdapter {
    config: EmbeddingModelConfig,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpEmbeddingAdapter {
    /// Providers other than `LocalHttp` fail fast here if the configured
    /// API key env var is unset (§4.3: "Providers with no API key
    /// configured fail fast at initialize").
    pub fn initialize(config: EmbeddingModelConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => {
                let key = std::env::var(var).map_err(|_| {
                    RagError::ProviderAuth(format!(
                        "environment variable {var} not set for model {}",
                        config.id
                    ))
                })?;
                Some(key)
            }
            None if config.provider == EmbeddingProviderKind::LocalHttp => None,
            None => {
                return Err(RagError::ProviderAuth(format!(
                    "model {} requires api_key_env",
                    config.id
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            client,
            api_key,
        })
    }

    fn max_chars(&self) -> usize {
        self.config
            .options
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CHARS)
    }

    /// Truncate any text over the provider limit, logging a warning; the
    /// contract never rejects long input.
    fn truncate_inputs(&self, texts: &[String]) -> Vec<String> {
        let max = self.max_chars();
        texts
            .iter()
            .map(|t| {
                if t.chars().count() > max {
                    warn!(model = %self.config.id, len = t.chars().count(), max, "truncating embedding input");
                    t.chars().take(max).collect()
                } else {
                    t.clone()
                }
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingAdapter for HttpEmbeddingAdapter {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Empty strings short-circuit to the zero vector and never reach
        // the provider (§4.3).
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut to_send = Vec::new();
        let mut send_idx = Vec::new();
        for (i, t) in texts.iter().enumerate() {
            if t.is_empty() {
                out[i] = Some(vec![0.0; self.dimensions()]);
            } else {
                to_send.push(t.clone());
                send_idx.push(i);
            }
        }

        if !to_send.is_empty() {
            let truncated = self.truncate_inputs(&to_send);
            let results = self.call_with_retry(&truncated).await?;
            for (k, v) in send_idx.into_iter().zip(results.into_iter()) {
                out[k] = Some(v);
            }
        }

        Ok(out.into_iter().map(|o| o.unwrap_or_default()).collect())
    }
}

impl HttpEmbeddingAdapter {
    /// Retry/backoff/split envelope around [`call_provider`], per §4.3
    /// and §7: one retry on rate limit (fallback 2s single / 5s batch),
    /// repeated rate limit on a batch splits it in half; transient
    /// transport errors and timeouts get up to 3 retries with exponential
    /// backoff (2-10s); any other error propagates unchanged.
    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match call_provider(&self.config, &self.client, self.api_key.as_deref(), texts).await {
            Ok(v) => Ok(v),
            Err(RagError::RateLimited(_)) => {
                let delay = if texts.len() == 1 {
                    Duration::from_secs(2)
                } else {
                    Duration::from_secs(5)
                };
                warn!(model = %self.config.id, ?delay, "rate limited, retrying once");
                tokio::time::sleep(delay).await;
                match call_provider(&self.config, &self.client, self.api_key.as_deref(), texts).await {
                    Ok(v) => Ok(v),
                    Err(RagError::RateLimited(msg)) if texts.len() > 1 => {
                        warn!(model = %self.config.id, "rate limited again, splitting batch");
                        let mid = texts.len() / 2;
                        let (a, b) = texts.split_at(mid);
                        let (ra, rb) = (
                            Box::pin(self.call_with_retry(a)).await,
                            Box::pin(self.call_with_retry(b)).await,
                        );
                        match (ra, rb) {
                            (Ok(mut va), Ok(vb)) => {
                                va.extend(vb);
                                Ok(va)
                            }
                            _ => Err(RagError::RateLimited(msg)),
                        }
                    }
                    Err(e @ (RagError::Transient(_) | RagError::Timeout(_))) => self.retry_transient(texts, e).await,
                    Err(e) => Err(e),
                }
            }
            Err(e @ (RagError::Transient(_) | RagError::Timeout(_))) => self.retry_transient(texts, e).await,
            Err(e) => Err(e),
        }
    }

    /// Up to 3 retries with exponential backoff (2s, 4s, 8s, capped at
    /// 10s) for a transient transport error or timeout.
    async fn retry_transient(&self, texts: &[String], first_err: RagError) -> Result<Vec<Vec<f32>>> {
        let mut last_err = first_err;
        let mut delay = Duration::from_secs(2);
        for attempt in 1..=3 {
            warn!(model = %self.config.id, attempt, ?delay, error = %last_err, "transient error, retrying");
            tokio::time::sleep(delay).await;
            match call_provider(&self.config, &self.client, self.api_key.as_deref(), texts).await {
                Ok(v) => return Ok(v),
                Err(e @ (RagError::Transient(_) | RagError::Timeout(_))) => last_err = e,
                Err(e) => return Err(e),
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }
        Err(last_err)
    }
}

/// Build the provider-specific request, send it, and parse the
/// provider-specific response shape. Response order is preserved by the
/// caller zipping against `send_idx`; providers that return items
/// out of order (§4.3) must be re-sorted here by an `index` field before
/// returning.
async fn call_provider(
    config: &EmbeddingModelConfig,
    client: &reqwest::Client,
    api_key: Option<&str>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    match config.provider {
        EmbeddingProviderKind::OpenAi => call_openai_compatible(config, client, api_key, texts, "https://api.openai.com/v1/embeddings").await,
        EmbeddingProviderKind::Azure => {
            let base = config
                .api_base_url
                .as_deref()
                .ok_or_else(|| RagError::ConfigInvalid(format!("{} requires api_base_url", config.id)))?;
            call_openai_compatible(config, client, api_key, texts, base).await
        }
        EmbeddingProviderKind::LocalHttp => {
            let base = config
                .api_base_url
                .as_deref()
                .unwrap_or("http://localhost:8080/embed");
            call_openai_compatible(config, client, api_key, texts, base).await
        }
        EmbeddingProviderKind::Cohere => call_cohere(config, client, api_key, texts).await,
        EmbeddingProviderKind::HuggingFace => call_huggingface(config, client, api_key, texts).await,
        EmbeddingProviderKind::Google => call_google(config, client, api_key, texts).await,
        EmbeddingProviderKind::LocalSentenceTransformer => Err(RagError::ConfigInvalid(
            "local-sentence-transformer models are served by the local adapter, not HttpEmbeddingAdapter".into(),
        )),
    }
}

fn map_transport_status(status: reqwest::StatusCode, body: String) -> RagError {
    if status.as_u16() == 429 {
        RagError::RateLimited(body)
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        RagError::ProviderAuth(body)
    } else if status.is_server_error() {
        RagError::Transient(format!("{status}: {body}"))
    } else {
        RagError::Transport(format!("{status}: {body}"))
    }
}

async fn call_openai_compatible(
    config: &EmbeddingModelConfig,
    client: &reqwest::Client,
    api_key: Option<&str>,
    texts: &[String],
    url: &str,
) -> Result<Vec<Vec<f32>>> {
    let model = config.remote_model_id.clone().unwrap_or_else(|| config.id.clone());
    let body = serde_json::json!({ "model": model, "input": texts });

    let mut req = client.post(url).json(&body);
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {key}"));
    }

    let resp = req.send().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(map_transport_status(status, text));
    }

    let json: Value = resp.json().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| RagError::Transport("missing data array in embeddings response".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let idx = item.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let vec: Vec<f32> = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| RagError::Transport("missing embedding field".into()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((idx, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    let mut out: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();
    if config.normalize {
        for v in out.iter_mut() {
            normalize(v);
        }
    }
    Ok(out)
}

async fn call_cohere(
    config: &EmbeddingModelConfig,
    client: &reqwest::Client,
    api_key: Option<&str>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let url = config
        .api_base_url
        .clone()
        .unwrap_or_else(|| "https://api.cohere.com/v1/embed".to_string());
    let model = config.remote_model_id.clone().unwrap_or_else(|| config.id.clone());
    let body = serde_json::json!({ "model": model, "texts": texts, "input_type": "search_document" });

    let mut req = client.post(&url).json(&body);
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {key}"));
    }
    let resp = req.send().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(map_transport_status(status, text));
    }
    let json: Value = resp.json().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let vecs = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| RagError::Transport("missing embeddings array".into()))?;
    let mut out = Vec::with_capacity(vecs.len());
    for v in vecs {
        let vec: Vec<f32> = v
            .as_array()
            .ok_or_else(|| RagError::Transport("malformed cohere embedding".into()))?
            .iter()
            .map(|x| x.as_f64().unwrap_or(0.0) as f32)
            .collect();
        out.push(vec);
    }
    if config.normalize {
        for v in out.iter_mut() {
            normalize(v);
        }
    }
    Ok(out)
}

async fn call_huggingface(
    config: &EmbeddingModelConfig,
    client: &reqwest::Client,
    api_key: Option<&str>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let model = config.remote_model_id.clone().unwrap_or_else(|| config.id.clone());
    let url = config.api_base_url.clone().unwrap_or_else(|| {
        format!("https://api-inference.huggingface.co/pipeline/feature-extraction/{model}")
    });
    let body = serde_json::json!({ "inputs": texts, "options": { "wait_for_model": true } });

    let mut req = client.post(&url).json(&body);
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {key}"));
    }
    let resp = req.send().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(map_transport_status(status, text));
    }
    let json: Value = resp.json().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let arr = json
        .as_array()
        .ok_or_else(|| RagError::Transport("expected top-level array from HF inference".into()))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        // HF feature-extraction can return per-token vectors ([seq, dims]);
        // mean-pool to a single sentence vector when nested.
        let vec = if item.as_array().map(|a| a.first().map(|f| f.is_array()).unwrap_or(false)).unwrap_or(false) {
            mean_pool(item)
        } else {
            item.as_array()
                .ok_or_else(|| RagError::Transport("malformed HF embedding".into()))?
                .iter()
                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                .collect()
        };
        out.push(vec);
    }
    if config.normalize {
        for v in out.iter_mut() {
            normalize(v);
        }
    }
    Ok(out)
}

fn mean_pool(tokens: &Value) -> Vec<f32> {
    let rows = tokens.as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        return Vec::new();
    }
    let dims = rows[0].as_array().map(|a| a.len()).unwrap_or(0);
    let mut sum = vec![0f32; dims];
    for row in &rows {
        if let Some(arr) = row.as_array() {
            for (i, v) in arr.iter().enumerate().take(dims) {
                sum[i] += v.as_f64().unwrap_or(0.0) as f32;
            }
        }
    }
    let n = rows.len() as f32;
    for v in sum.iter_mut() {
        *v /= n;
    }
    sum
}

async fn call_google(
    config: &EmbeddingModelConfig,
    client: &reqwest::Client,
    api_key: Option<&str>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let model = config
        .remote_model_id
        .clone()
        .unwrap_or_else(|| "models/embedding-001".to_string());
    let base = config
        .api_base_url
        .clone()
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
    let key = api_key.ok_or_else(|| RagError::ProviderAuth("google embeddings require an API key".into()))?;
    let url = format!("{base}/{model}:batchEmbedContents?key={key}");

    let requests: Vec<Value> = texts
        .iter()
        .map(|t| serde_json::json!({ "model": model, "content": { "parts": [{ "text": t }] } }))
        .collect();
    let body = serde_json::json!({ "requests": requests });

    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| RagError::Transport(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(map_transport_status(status, text));
    }
    let json: Value = resp.json().await.map_err(|e| RagError::Transport(e.to_string()))?;
    let embeddings = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| RagError::Transport("missing embeddings array".into()))?;
    let mut out = Vec::with_capacity(embeddings.len());
    for e in embeddings {
        let vec: Vec<f32> = e
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| RagError::Transport("missing values field".into()))?
            .iter()
            .map(|x| x.as_f64().unwrap_or(0.0) as f32)
            .collect();
        out.push(vec);
    }
    if config.normalize {
        for v in out.iter_mut() {
            normalize(v);
        }
    }
    Ok(out)
}

/// A fixed-vocabulary stub adapter used by tests (S1/S3 in §8) and by
/// `local-http` deployments that want deterministic vectors without a
/// network call. Maps keyword substrings to vectors, falling back to the
/// zero vector otherwise.
pub struct StubEmbeddingAdapter {
    dims: usize,
    rules: Vec<(String, Vec<f32>)>,
    pub calls: std::sync::atomic::AtomicUsize,
}

impl StubEmbeddingAdapter {
    pub fn new(dims: usize, rules: Vec<(String, Vec<f32>)>) -> Self {
        Self {
            dims,
            rules,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingAdapter for StubEmbeddingAdapter {
    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            if t.is_empty() {
                out.push(vec![0.0; self.dims]);
                continue;
            }
            let lower = t.to_lowercase();
            let hit = self.rules.iter().find(|(kw, _)| lower.contains(kw.as_str()));
            match hit {
                Some((_, v)) => out.push(v.clone()),
                None => out.push(vec![0.0; self.dims]),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_adapter_returns_zero_vector_for_empty_text() {
        let adapter = StubEmbeddingAdapter::new(4, vec![("apple".into(), vec![1.0, 0.0, 0.0, 0.0])]);
        let v = adapter.embed("").await.unwrap();
        assert_eq!(v, vec![0.0, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn stub_adapter_preserves_order() {
        let adapter = StubEmbeddingAdapter::new(
            2,
            vec![("cat".into(), vec![1.0, 0.0]), ("dog".into(), vec![0.0, 1.0])],
        );
        let out = adapter
            .embed_batch(&["dog food".into(), "cat toy".into(), "neither".into()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![0.0, 1.0]);
        assert_eq!(out[1], vec![1.0, 0.0]);
        assert_eq!(out[2], vec![0.0, 0.0]);
    }
}
