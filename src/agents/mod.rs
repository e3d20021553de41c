//! Source agents (C12).
//!
//! Seven variants, all producing [`Document`]s for the ingestion
//! manager (C14) to chunk and index. Every runner respects
//! `AgentConfig::max_items` and, where the source supports it,
//! incremental mode keyed off `AgentConfig::last_run`.

pub mod api;
pub mod custom;
pub mod database;
pub mod email;
pub mod filesystem;
pub mod rss;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::models::{AgentConfig, AgentType, Document};

/// Interface for a dynamically registered custom agent (§4.12 "Custom").
/// Rather than loading a shared library at runtime — this platform has
/// no `libloading`/FFI dependency — a custom source is any type the
/// embedding application registers against a name at startup, the same
/// trait-object extension point the teacher uses for its `Connector`
/// trait.
#[async_trait]
pub trait CustomAgentHandler: Send + Sync {
    async fn run(&self, config: &AgentConfig) -> Result<Vec<Document>>;
}

/// Registry of custom handlers, keyed by the name given at
/// registration (matched against `AgentConfig.options.handler`).
#[derive(Default, Clone)]
pub struct CustomAgentRegistry {
    handlers: HashMap<String, Arc<dyn CustomAgentHandler>>,
}

impl CustomAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CustomAgentHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomAgentHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Run one agent's source-fetch step, dispatching on its configured
/// [`AgentType`]. The returned documents still need chunking (C6) and
/// indexing (C8) — that's the ingestion manager's job (C14).
pub async fn run_agent_source(config: &AgentConfig, custom: &CustomAgentRegistry) -> Result<Vec<Document>> {
    let docs = match config.agent_type {
        AgentType::WebCrawler => web::run(config).await?,
        AgentType::Rss => rss::run(config).await?,
        AgentType::Api => api::run(config).await?,
        AgentType::Filesystem => filesystem::run(config).await?,
        AgentType::Database => database::run(config).await?,
        AgentType::Email => email::run(config).await?,
        AgentType::Custom => {
            let handler_name = config
                .options
                .get("handler")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RagError::ConfigInvalid(format!("agent {} has no options.handler", config.agent_id)))?;
            let handler = custom
                .get(handler_name)
                .ok_or_else(|| RagError::ConfigInvalid(format!("no custom agent handler registered under '{handler_name}'")))?;
            handler.run(config).await?
        }
    };

    Ok(match config.max_items {
        Some(max) => docs.into_iter().take(max).collect(),
        None => docs,
    })
}
