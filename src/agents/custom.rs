//! Custom agent extension point (§4.12).
//!
//! A "custom" agent is any type the embedding application registers
//! into a [`super::CustomAgentRegistry`] under a name, looked up at run
//! time via `AgentConfig.options.handler`. This mirrors the teacher's
//! `Connector`/`Tool` trait-object registries rather than loading a
//! shared library: there's no `libloading`/FFI dependency in this
//! platform, and a statically linked handler is both safer and
//! sufficient for "bring your own source type."

use crate::error::Result;
use crate::models::{AgentConfig, Document};

use super::CustomAgentHandler;

/// A handler that always returns an empty document set. Useful as the
/// default registration for a `custom` agent that hasn't been wired up
/// to a real implementation yet — it runs cleanly rather than failing
/// with "no handler registered."
pub struct NoopAgentHandler;

#[async_trait::async_trait]
impl CustomAgentHandler for NoopAgentHandler {
    async fn run(&self, _config: &AgentConfig) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::CustomAgentRegistry;
    use crate::models::AgentType;
    use std::sync::Arc;

    #[tokio::test]
    async fn registered_handler_is_dispatched_by_name() {
        let mut registry = CustomAgentRegistry::new();
        registry.register("noop", Arc::new(NoopAgentHandler));

        let mut config = AgentConfig::new(AgentType::Custom, "noop-agent", "interval:1h");
        config.options.insert("handler".to_string(), serde_json::json!("noop"));

        let docs = super::super::run_agent_source(&config, &registry).await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn unregistered_handler_is_config_invalid() {
        let registry = CustomAgentRegistry::new();
        let mut config = AgentConfig::new(AgentType::Custom, "missing-agent", "interval:1h");
        config.options.insert("handler".to_string(), serde_json::json!("does-not-exist"));

        let result = super::super::run_agent_source(&config, &registry).await;
        assert!(result.is_err());
    }
}
