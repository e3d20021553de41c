//! RAG orchestrator (C11).
//!
//! Wires the vector store's hybrid search (C8/C9) through the prompt
//! renderer (C10) to a `Generator`. The orchestrator owns no state of
//! its own beyond its handles — `query` is the one entry point every
//! caller (CLI, HTTP) drives.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::{PromptTemplate, PromptTemplateType};
use crate::prompt::{self, ChatMessage};
use crate::retriever::HybridWeights;
use crate::store::VectorStore;

/// Sampling parameters for one `Generator::complete` call. `temperature`
/// defaults to 0.3 per §4.11; both are caller-overridable.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: Option<String>,
    pub temperature: f32,
    pub top_p: Option<f32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.3,
            top_p: None,
        }
    }
}

/// The external generator contract (§6): turn a chat transcript into an
/// answer. The core does not prescribe a wire protocol beyond this
/// trait.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, messages: Vec<ChatMessage>, params: GenerationParams) -> Result<String>;
}

/// Deterministic generator for tests and dry runs: either returns a
/// fixed canned answer, or otherwise echoes the last message's content
/// prefixed with a recognisable marker.
pub struct StubGenerator {
    canned: Option<String>,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self { canned: None }
    }

    pub fn with_canned(answer: impl Into<String>) -> Self {
        Self { canned: Some(answer.into()) }
    }
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn complete(&self, messages: Vec<ChatMessage>, _params: GenerationParams) -> Result<String> {
        if let Some(answer) = &self.canned {
            return Ok(answer.clone());
        }
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("stub answer for: {last}"))
    }
}

fn default_gen_timeout_secs() -> u64 {
    60
}

/// Config for [`HttpGenerator`] — an OpenAI-chat-completions-compatible
/// endpoint (§6 "Generator contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub api_base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
}

/// HTTP-backed generator speaking the OpenAI `/chat/completions` shape,
/// the one concrete wire protocol this platform drives end to end.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn initialize(config: GeneratorConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| RagError::ProviderAuth(format!("environment variable {var} is not set")))?,
            ),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::ConfigInvalid(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_base_url,
            model: config.model,
            api_key,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn complete(&self, messages: Vec<ChatMessage>, params: GenerationParams) -> Result<String> {
        let model = params.model.unwrap_or_else(|| self.model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
        });
        if let Some(top_p) = params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| RagError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 {
                RagError::RateLimited(text)
            } else if status.as_u16() == 401 || status.as_u16() == 403 {
                RagError::ProviderAuth(text)
            } else {
                RagError::Transport(format!("{status}: {text}"))
            });
        }
        let json: Value = resp.json().await.map_err(|e| RagError::Transport(e.to_string()))?;
        json.get("choices")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RagError::Transport("generator response missing choices[0].message.content".to_string()))
    }
}

const QUESTION_ANSWER_TEMPLATE_ID: &str = "question_answer";

fn fallback_prompt(context: &str, question: &str) -> String {
    format!("Use the following context to answer the question.\nContext:\n{context}\n\nQuestion: {question}\n\nAnswer:")
}

/// One retrieved source surfaced alongside an answer, truncated to a
/// snippet so a caller never sees the full chunk text (§4.11).
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnippet {
    pub chunk_id: String,
    pub document_id: String,
    pub snippet: String,
    pub score: f32,
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// Result of one `RagOrchestrator::query` call (§4.11).
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceSnippet>>,
    pub llm_model: Option<String>,
    pub embedding_model: String,
}

/// Options for one `query` call.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions<'a> {
    pub filter: Option<&'a Value>,
    pub include_sources: bool,
    pub llm_model: Option<&'a str>,
    pub embedding_model: Option<&'a str>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// The C11 pipeline: retrieve, build context, render a prompt, call a
/// generator.
pub struct RagOrchestrator {
    store: Arc<VectorStore>,
    generator: Arc<dyn Generator>,
    templates: HashMap<String, PromptTemplate>,
}

impl RagOrchestrator {
    pub fn new(store: Arc<VectorStore>, generator: Arc<dyn Generator>, templates: Vec<PromptTemplate>) -> Self {
        Self {
            store,
            generator,
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub async fn query(&self, question: &str, context_limit: usize, options: QueryOptions<'_>) -> Result<RagAnswer> {
        let hits = self
            .store
            .hybrid_search(question, context_limit, options.filter, None, options.embedding_model, HybridWeights::default())
            .await?;

        let context = hits
            .iter()
            .enumerate()
            .map(|(i, h)| format!("[{}] {}", i + 1, h.chunk.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut params = HashMap::new();
        params.insert("context".to_string(), Value::String(context.clone()));
        params.insert("question".to_string(), Value::String(question.to_string()));

        let prompt_text = match self.templates.get(QUESTION_ANSWER_TEMPLATE_ID) {
            Some(tpl) if tpl.template_type != PromptTemplateType::Chat => prompt::render_text(tpl, options.llm_model, &params)?,
            _ => fallback_prompt(&context, question),
        };

        let gen_params = GenerationParams {
            model: options.llm_model.map(String::from),
            temperature: options.temperature.unwrap_or(0.3),
            top_p: options.top_p,
        };

        debug!(hits = hits.len(), context_chars = context.len(), "rag context assembled");
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt_text,
        }];
        let answer = self.generator.complete(messages, gen_params).await?;

        let sources = options.include_sources.then(|| {
            hits.iter()
                .map(|h| SourceSnippet {
                    chunk_id: h.chunk.id.clone(),
                    document_id: h.chunk.document_id.clone(),
                    snippet: snippet(&h.chunk.text, 100),
                    score: h.score,
                })
                .collect()
        });

        Ok(RagAnswer {
            answer,
            sources,
            llm_model: options.llm_model.map(String::from),
            embedding_model: options.embedding_model.unwrap_or_else(|| self.store.default_embedding_model()).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, EmbeddingCache};
    use crate::embedding::EmbeddingService;
    use crate::index::IndexType;
    use crate::metric::Metric;
    use crate::models::{Chunk, EmbeddingModelConfig, EmbeddingProviderKind, IndexBackendParams};
    use crate::store::ShardConfig;
    use std::collections::HashMap as Map;

    async fn make_orchestrator() -> RagOrchestrator {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let config = EmbeddingModelConfig {
            id: "m1".into(),
            provider: EmbeddingProviderKind::LocalHttp,
            remote_model_id: None,
            dimensions: 2,
            api_key_env: None,
            api_base_url: Some("http://localhost:0/unused".into()),
            options: Map::new(),
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
        let store = Arc::new(VectorStore::new(vec![shard], "m1".to_string(), dir.path().to_path_buf(), embeddings).unwrap());

        let chunk = Chunk {
            id: "doc1_0".into(),
            document_id: "doc1".into(),
            chunk_index: 0,
            text: "Rust is a systems programming language focused on safety.".into(),
            metadata: Map::new(),
            embeddings: Map::new(),
        };
        store.add_batch(vec![chunk]).await.unwrap();

        RagOrchestrator::new(store, Arc::new(StubGenerator::new()), Vec::new())
    }

    #[tokio::test]
    async fn query_falls_back_to_plain_prompt_without_a_template() {
        let orchestrator = make_orchestrator().await;
        let answer = orchestrator.query("what is rust?", 5, QueryOptions::default()).await.unwrap();
        assert!(answer.answer.starts_with("stub answer for:"));
        assert!(answer.answer.contains("Question: what is rust?"));
        assert!(answer.sources.is_none());
    }

    #[tokio::test]
    async fn query_includes_truncated_sources_when_requested() {
        let orchestrator = make_orchestrator().await;
        let answer = orchestrator
            .query(
                "what is rust?",
                5,
                QueryOptions {
                    include_sources: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let sources = answer.sources.unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].snippet.chars().count() <= 100);
    }

    #[tokio::test]
    async fn query_uses_question_answer_template_when_present() {
        let cache = Arc::new(EmbeddingCache::new(CacheConfig::default()));
        let config = EmbeddingModelConfig {
            id: "m1".into(),
            provider: EmbeddingProviderKind::LocalHttp,
            remote_model_id: None,
            dimensions: 2,
            api_key_env: None,
            api_base_url: Some("http://localhost:0/unused".into()),
            options: Map::new(),
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
        let store = Arc::new(VectorStore::new(vec![shard], "m1".to_string(), dir.path().to_path_buf(), embeddings).unwrap());
        store
            .add_batch(vec![Chunk {
                id: "doc1_0".into(),
                document_id: "doc1".into(),
                chunk_index: 0,
                text: "context text".into(),
                metadata: Map::new(),
                embeddings: Map::new(),
            }])
            .await
            .unwrap();

        let tpl = PromptTemplate {
            id: QUESTION_ANSWER_TEMPLATE_ID.into(),
            template_type: PromptTemplateType::Qa,
            template: "CTX:{{ context }} Q:{{ question }}".into(),
            default_parameters: Map::new(),
            model_specific_versions: Map::new(),
        };
        let orchestrator = RagOrchestrator::new(store, Arc::new(StubGenerator::new()), vec![tpl]);
        let answer = orchestrator.query("hello?", 3, QueryOptions::default()).await.unwrap();
        assert!(answer.answer.contains("Q:hello?"));
    }
}
