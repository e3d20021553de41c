//! Ingestion manager (C14).
//!
//! Owns the agent registry: an in-memory map of [`AgentConfig`]s backed
//! by one JSON file per agent under `config_path`, mutated only while
//! holding `registry`'s lock (reads don't need the lock — the
//! in-memory map is the source of truth and the files are a durability
//! mirror, written synchronously inside the same critical section).
//!
//! `run_agent` drives the full per-agent pipeline: fetch source
//! documents (C12), chunk them (C6), embed and index them (C8), and
//! record an [`AgentRun`]. Five consecutive failures disable the agent
//! so a broken source stops burning the tick loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agents::{run_agent_source, CustomAgentRegistry};
use crate::chunk::{chunk_text, ChunkingConfig};
use crate::error::{RagError, Result};
use crate::models::{AgentConfig, AgentRun};
use crate::scheduler::{is_due, parse_schedule, ScheduledRunner};
use crate::store::VectorStore;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;

pub struct IngestionManager {
    config_path: PathBuf,
    registry: Mutex<HashMap<String, AgentConfig>>,
    runs: Mutex<HashMap<String, AgentRun>>,
    store: Arc<VectorStore>,
    chunking: ChunkingConfig,
    custom_agents: CustomAgentRegistry,
}

impl IngestionManager {
    /// Load every `*.json` agent config under `config_path` into memory.
    pub async fn load(config_path: PathBuf, store: Arc<VectorStore>, chunking: ChunkingConfig, custom_agents: CustomAgentRegistry) -> Result<Self> {
        std::fs::create_dir_all(&config_path).map_err(|e| RagError::ConfigInvalid(format!("failed to create ingestion config_path: {e}")))?;

        let mut registry = HashMap::new();
        let entries = std::fs::read_dir(&config_path).map_err(|e| RagError::ConfigInvalid(format!("failed to read ingestion config_path: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| RagError::ConfigInvalid(format!("failed to read agent config entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| RagError::ConfigInvalid(format!("failed to read {}: {e}", path.display())))?;
            let config: AgentConfig = serde_json::from_str(&content).map_err(|e| RagError::ConfigInvalid(format!("invalid agent config {}: {e}", path.display())))?;
            registry.insert(config.agent_id.clone(), config);
        }

        Ok(Self {
            config_path,
            registry: Mutex::new(registry),
            runs: Mutex::new(HashMap::new()),
            store,
            chunking,
            custom_agents,
        })
    }

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.config_path.join(format!("{agent_id}.json"))
    }

    fn persist(&self, config: &AgentConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config).map_err(|e| RagError::ConfigInvalid(format!("failed to serialize agent config: {e}")))?;
        std::fs::write(self.agent_path(&config.agent_id), content).map_err(|e| RagError::ConfigInvalid(format!("failed to persist agent config: {e}")))
    }

    pub async fn add_agent(&self, config: AgentConfig) -> Result<()> {
        parse_schedule(&config.schedule)?;
        self.persist(&config)?;
        self.registry.lock().await.insert(config.agent_id.clone(), config);
        Ok(())
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.remove(agent_id).is_none() {
            return Err(RagError::NotFound(format!("agent {agent_id}")));
        }
        let _ = std::fs::remove_file(self.agent_path(agent_id));
        Ok(())
    }

    pub async fn list_agents(&self) -> Vec<AgentConfig> {
        self.registry.lock().await.values().cloned().collect()
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentConfig> {
        self.registry.lock().await.get(agent_id).cloned().ok_or_else(|| RagError::NotFound(format!("agent {agent_id}")))
    }

    pub async fn set_enabled(&self, agent_id: &str, enabled: bool) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let config = registry.get_mut(agent_id).ok_or_else(|| RagError::NotFound(format!("agent {agent_id}")))?;
        config.enabled = enabled;
        let snapshot = config.clone();
        drop(registry);
        self.persist(&snapshot)
    }

    pub async fn last_result(&self, agent_id: &str) -> Option<AgentRun> {
        self.runs.lock().await.get(agent_id).cloned()
    }

    /// Full per-agent ingest pipeline: fetch, chunk, index, record.
    pub async fn run_agent(&self, agent_id: &str) -> Result<AgentRun> {
        let config = self.get_agent(agent_id).await?;
        let job_id = uuid::Uuid::new_v4().to_string();
        let start_time = Utc::now();

        let outcome = run_pipeline(&config, &self.store, &self.chunking, &self.custom_agents).await;

        let mut run = AgentRun {
            job_id,
            agent_id: agent_id.to_string(),
            start_time,
            end_time: Some(Utc::now()),
            success: outcome.is_ok(),
            item_count: 0,
            documents: Vec::new(),
            error_message: None,
        };

        let mut registry = self.registry.lock().await;
        let Some(stored) = registry.get_mut(agent_id) else {
            return Err(RagError::NotFound(format!("agent {agent_id}")));
        };

        match outcome {
            Ok(document_ids) => {
                run.item_count = document_ids.len();
                run.documents = document_ids;
                stored.error_count = 0;
                stored.last_run = Some(start_time);
                info!(agent_id, items = run.item_count, "agent run completed");
            }
            Err(e) => {
                stored.error_count += 1;
                run.error_message = Some(e.to_string());
                warn!(agent_id, error = %e, consecutive_failures = stored.error_count, "agent run failed");
                if stored.error_count >= MAX_CONSECUTIVE_FAILURES {
                    stored.enabled = false;
                    warn!(agent_id, "agent disabled after repeated failures");
                }
            }
        }
        let snapshot = stored.clone();
        drop(registry);
        self.persist(&snapshot)?;
        self.runs.lock().await.insert(agent_id.to_string(), run.clone());

        Ok(run)
    }
}

async fn run_pipeline(
    config: &AgentConfig,
    store: &Arc<VectorStore>,
    chunking: &ChunkingConfig,
    custom_agents: &CustomAgentRegistry,
) -> Result<Vec<String>> {
    let documents = run_agent_source(config, custom_agents).await?;

    let mut all_chunks = Vec::new();
    let mut document_ids = Vec::with_capacity(documents.len());
    for document in &documents {
        document_ids.push(document.id.clone());
        let mut chunks = chunk_text(&document.id, &document.text, chunking);
        for chunk in &mut chunks {
            chunk.metadata = document.metadata.clone();
        }
        all_chunks.extend(chunks);
    }

    store.add_batch(all_chunks).await?;
    Ok(document_ids)
}

#[async_trait::async_trait]
impl ScheduledRunner for IngestionManager {
    async fn due_agents(&self, now: chrono::DateTime<Utc>) -> Vec<String> {
        let registry = self.registry.lock().await;
        registry
            .values()
            .filter(|config| config.enabled)
            .filter_map(|config| {
                let schedule = parse_schedule(&config.schedule).ok()?;
                is_due(&schedule, config.last_run, now).then(|| config.agent_id.clone())
            })
            .collect()
    }

    async fn run_agent(&self, agent_id: &str) -> Result<()> {
        IngestionManager::run_agent(self, agent_id).await.map(|_| ())
    }
}
