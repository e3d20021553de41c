//! Core data model (§3): documents, chunks, and the records that travel
//! between the embedding pipeline, vector store, and ingestion scheduler.
//!
//! All identifiers are opaque strings; external keys are derived
//! deterministically where the spec requires it (chunk id =
//! `<document_id>_<chunk_index>`), never randomly generated, so
//! re-ingesting unchanged content is idempotent at the id level.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A source document prior to chunking. Immutable after ingestion except
/// via delete-and-reinsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub chunk_ids: Vec<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: HashMap::new(),
            chunk_ids: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Smallest unit of retrievable text, derived from a [`Document`] by the
/// chunker (C6). The same chunk text may carry multiple embeddings, one
/// per configured embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub embeddings: HashMap<String, Vec<f32>>,
}

impl Chunk {
    /// Deterministic chunk id per §3/§4.6.
    pub fn make_id(document_id: &str, chunk_index: usize) -> String {
        format!("{document_id}_{chunk_index}")
    }

    /// Whether this chunk carries an embedding for `model_id` with the
    /// expected dimensionality (invariant 1 in §8).
    pub fn has_valid_embedding(&self, model_id: &str, dims: usize) -> bool {
        self.embeddings
            .get(model_id)
            .map(|v| v.len() == dims)
            .unwrap_or(false)
    }
}

/// Which provider backs an [`EmbeddingModelConfig`] (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    OpenAi,
    Azure,
    Cohere,
    HuggingFace,
    Google,
    LocalSentenceTransformer,
    LocalHttp,
}

/// Configuration for one embedding model (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    /// Unique stable handle, e.g. `"openai-small"`.
    pub id: String,
    pub provider: EmbeddingProviderKind,
    #[serde(default)]
    pub remote_model_id: Option<String>,
    pub dimensions: usize,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub normalize: bool,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
}

fn default_batch_size() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_rate_limit_rpm() -> u32 {
    3000
}

/// Backend-specific index parameters (§3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexBackendParams {
    // HNSW
    #[serde(default)]
    pub m: Option<usize>,
    #[serde(default)]
    pub ef_construction: Option<usize>,
    #[serde(default)]
    pub ef_search: Option<usize>,
    #[serde(default)]
    pub max_elements: Option<usize>,
    // IVF / PQ
    #[serde(default)]
    pub nlist: Option<usize>,
    #[serde(default)]
    pub nprobe: Option<usize>,
    #[serde(default)]
    pub m_sub: Option<usize>,
    #[serde(default)]
    pub nbits: Option<usize>,
    // Remote
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub batch: Option<usize>,
}

/// A fused/ranked retrieval hit (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
    pub source: SearchResultSource,
    #[serde(default)]
    pub sub_scores: Option<SubScores>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchResultSource {
    Dense,
    Sparse,
    Metadata,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubScores {
    pub dense: Option<f32>,
    pub sparse: Option<f32>,
}

/// Which of the seven source types an [`AgentConfig`] drives (C12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    WebCrawler,
    Rss,
    Api,
    Filesystem,
    Database,
    Email,
    Custom,
}

/// Configuration for one ingestion agent (§3). Mutated only by the
/// ingestion manager under its lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub name: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    pub schedule: String,
    #[serde(default)]
    pub filters: HashMap<String, Value>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    #[serde(default)]
    pub metadata_mapping: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
}

impl AgentConfig {
    pub fn new(agent_type: AgentType, name: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            agent_type,
            name: name.into(),
            source_url: String::new(),
            credentials: HashMap::new(),
            schedule: schedule.into(),
            filters: HashMap::new(),
            options: HashMap::new(),
            metadata_mapping: HashMap::new(),
            enabled: true,
            max_items: None,
            last_run: None,
            error_count: 0,
        }
    }
}

/// Result of one invocation of an agent (§3). Last run per agent is
/// retained; a new run overwrites the previous record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub job_id: String,
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(default)]
    pub item_count: usize,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Prompt template kind (§3), used to pick a default when the RAG
/// orchestrator has no explicit `llm_model` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplateType {
    Instruction,
    Chat,
    Rag,
    Qa,
    Summarisation,
    Extraction,
    Classification,
}

/// A stored prompt template (§3, C10). Validated at create/update time;
/// must render successfully with `default_parameters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    #[serde(rename = "type")]
    pub template_type: PromptTemplateType,
    pub template: String,
    #[serde(default)]
    pub default_parameters: HashMap<String, Value>,
    #[serde(default)]
    pub model_specific_versions: HashMap<String, String>,
}

impl PromptTemplate {
    /// Resolve the template text to use for a given (optional) model id.
    pub fn template_for(&self, model_id: Option<&str>) -> &str {
        if let Some(m) = model_id {
            if let Some(t) = self.model_specific_versions.get(m) {
                return t;
            }
        }
        &self.template
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_deterministic() {
        assert_eq!(Chunk::make_id("doc1", 3), "doc1_3");
        assert_eq!(Chunk::make_id("doc1", 3), Chunk::make_id("doc1", 3));
    }

    #[test]
    fn template_for_falls_back_to_default() {
        let t = PromptTemplate {
            id: "qa".into(),
            template_type: PromptTemplateType::Qa,
            template: "default".into(),
            default_parameters: HashMap::new(),
            model_specific_versions: HashMap::from([("gpt-4".to_string(), "override".to_string())]),
        };
        assert_eq!(t.template_for(Some("gpt-4")), "override");
        assert_eq!(t.template_for(Some("other")), "default");
        assert_eq!(t.template_for(None), "default");
    }
}
