//! `ragctl` — CLI entry point for the RAG serving platform.
//!
//! Mirrors the teacher's `ctx` binary shape: a `clap`-derive `Cli` struct
//! carrying a global `--config` path, a `Commands` enum dispatched in
//! `main`, and every subcommand handler built on top of the library
//! crate rather than duplicating logic here.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ragctl::agents::custom::NoopAgentHandler;
use ragctl::agents::CustomAgentRegistry;
use ragctl::cache::EmbeddingCache;
use ragctl::config::{load_config, Config};
use ragctl::embedding::EmbeddingService;
use ragctl::ingestion::IngestionManager;
use ragctl::models::AgentConfig;
use ragctl::prompt::load_templates_from_dir;
use ragctl::rag::{Generator, HttpGenerator, QueryOptions, RagAnswer, RagOrchestrator, StubGenerator};
use ragctl::retriever::HybridWeights;
use ragctl::router::Router;
use ragctl::scheduler::Scheduler;
use ragctl::store::{ShardConfig, VectorStore};

#[derive(Parser)]
#[command(name = "ragctl", about = "A modular retrieval-augmented-generation serving platform", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/ragctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vector store and ingestion directories
    Init,

    /// List configured source agents and their enabled/error state
    Sources,

    /// Run one source agent's ingest pipeline immediately
    Sync {
        /// Agent id
        agent: String,

        /// Ignore the agent's last_run checkpoint
        #[arg(long)]
        full: bool,

        /// Report what would run without writing to the store
        #[arg(long)]
        dry_run: bool,

        /// Cap the number of items fetched this run
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage agent configurations
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Manage per-model shard embeddings
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Ad hoc retrieval against the vector store
    Search {
        /// Search query
        query: String,

        /// Search mode: keyword, semantic, or hybrid
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Full RAG pipeline: retrieve, prompt, generate
    Query {
        /// Natural-language question
        question: String,

        /// Print the supporting source snippets alongside the answer
        #[arg(long)]
        sources: bool,

        /// Number of context chunks to retrieve
        #[arg(long, default_value_t = 5)]
        context_limit: usize,
    },

    /// Start the HTTP surface
    Serve,
}

#[derive(Subcommand)]
enum AgentAction {
    /// Register a new agent from a JSON config file
    Add {
        /// Path to a JSON-encoded AgentConfig
        file: PathBuf,
    },
    /// List every registered agent
    List,
    /// Remove an agent by id
    Remove { agent_id: String },
    /// Enable a disabled agent
    Enable { agent_id: String },
    /// Disable an agent without removing it
    Disable { agent_id: String },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Re-embed chunks missing an embedding for the default model
    Pending {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Drop and rebuild every shard's index from the chunk store
    Rebuild {
        /// Restrict the rebuild to one model's shard
        #[arg(long)]
        model: Option<String>,
    },
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Everything a running command needs: the store, the orchestrator, and
/// the ingestion manager, wired together the same way regardless of
/// which subcommand is driving them.
struct Platform {
    store: Arc<VectorStore>,
    orchestrator: Arc<RagOrchestrator>,
    ingestion: Arc<IngestionManager>,
}

async fn build_platform(config: &Config) -> anyhow::Result<Platform> {
    let cache = Arc::new(EmbeddingCache::new(config.embedding.cache.clone()));
    let embeddings = Arc::new(EmbeddingService::new(config.embedding.models.clone(), config.embedding.default_model.clone(), cache)?);

    let shard_configs = config
        .store
        .embedding_models
        .iter()
        .map(|model_id| {
            let dimensions = *config
                .store
                .dimensions
                .get(model_id)
                .ok_or_else(|| anyhow::anyhow!("store.dimensions missing entry for '{model_id}'"))?;
            Ok(ShardConfig {
                model_id: model_id.clone(),
                index_type: config.store.index_type,
                metric: config.store.metric,
                dimensions,
                params: config.store.backend_params.clone(),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let router = Arc::new(Router::new(config.router.clone()));
    let store = Arc::new(
        VectorStore::new(
            shard_configs,
            config.store.default_embedding_model.clone(),
            config.store.storage_path.clone(),
            embeddings,
        )?
        .with_router(router),
    );
    store.load().await?;

    let generator: Arc<dyn Generator> = match &config.generator {
        Some(gen_config) => Arc::new(HttpGenerator::initialize(gen_config.clone())?),
        None => Arc::new(StubGenerator::new()),
    };

    let templates = match &config.prompts.templates_path {
        Some(path) if path.exists() => load_templates_from_dir(path)?,
        _ => Vec::new(),
    };

    let orchestrator = Arc::new(RagOrchestrator::new(store.clone(), generator, templates));

    let mut custom_agents = CustomAgentRegistry::new();
    custom_agents.register("noop", Arc::new(NoopAgentHandler));

    let ingestion = Arc::new(IngestionManager::load(config.ingestion.config_path.clone(), store.clone(), config.chunking.clone(), custom_agents).await?);

    Ok(Platform { store, orchestrator, ingestion })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config);

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&config.store.storage_path)?;
            std::fs::create_dir_all(&config.ingestion.config_path)?;
            println!("Initialized vector store at {} and ingestion config at {}", config.store.storage_path.display(), config.ingestion.config_path.display());
        }
        Commands::Sources => {
            let platform = build_platform(&config).await?;
            for agent in platform.ingestion.list_agents().await {
                let status = if agent.enabled { "enabled" } else { "disabled" };
                println!("{}\t{}\t{:?}\t{status}\terrors={}", agent.agent_id, agent.name, agent.agent_type, agent.error_count);
            }
        }
        Commands::Sync { agent, full, dry_run, limit } => {
            let platform = build_platform(&config).await?;
            let mut agent_config = platform.ingestion.get_agent(&agent).await?;
            if full {
                agent_config.last_run = None;
            }
            if let Some(limit) = limit {
                agent_config.max_items = Some(limit);
            }
            if dry_run {
                println!("Would run agent {} ({:?})", agent_config.agent_id, agent_config.agent_type);
            } else {
                if full || limit.is_some() {
                    platform.ingestion.add_agent(agent_config.clone()).await?;
                }
                let run = platform.ingestion.run_agent(&agent_config.agent_id).await?;
                println!("Agent run {} finished: success={} items={}", run.job_id, run.success, run.item_count);
            }
        }
        Commands::Agent { action } => {
            let platform = build_platform(&config).await?;
            match action {
                AgentAction::Add { file } => {
                    let content = std::fs::read_to_string(&file)?;
                    let agent_config: AgentConfig = serde_json::from_str(&content)?;
                    platform.ingestion.add_agent(agent_config).await?;
                    println!("Agent registered.");
                }
                AgentAction::List => {
                    for agent in platform.ingestion.list_agents().await {
                        println!("{}\t{}\t{:?}\tenabled={}", agent.agent_id, agent.name, agent.agent_type, agent.enabled);
                    }
                }
                AgentAction::Remove { agent_id } => {
                    platform.ingestion.remove_agent(&agent_id).await?;
                    println!("Agent {agent_id} removed.");
                }
                AgentAction::Enable { agent_id } => {
                    platform.ingestion.set_enabled(&agent_id, true).await?;
                    println!("Agent {agent_id} enabled.");
                }
                AgentAction::Disable { agent_id } => {
                    platform.ingestion.set_enabled(&agent_id, false).await?;
                    println!("Agent {agent_id} disabled.");
                }
            }
        }
        Commands::Embed { action } => {
            let platform = build_platform(&config).await?;
            match action {
                EmbedAction::Pending { limit } => {
                    println!("Pending embeddings are produced as part of each agent's ingest run; nothing to backfill here (limit={limit:?}).");
                }
                EmbedAction::Rebuild { model } => {
                    platform.store.rebuild_index(model.as_deref()).await?;
                    println!("Rebuilt {}.", model.as_deref().unwrap_or("all shards"));
                }
            }
        }
        Commands::Search { query, mode, limit } => {
            let platform = build_platform(&config).await?;
            let results = match mode.as_str() {
                "keyword" => platform.store.metadata_search(&serde_json::json!({}), limit).await,
                "semantic" => platform.store.search_by_text(&query, limit, None, None, None).await?,
                "hybrid" => platform.store.hybrid_search(&query, limit, None, None, None, HybridWeights::default()).await?,
                other => anyhow::bail!("unknown search mode: {other}"),
            };
            for result in results {
                println!("{:.4}\t{}\t{}", result.score, result.chunk.id, result.chunk.text.chars().take(120).collect::<String>());
            }
        }
        Commands::Query { question, sources, context_limit } => {
            let platform = build_platform(&config).await?;
            let options = QueryOptions {
                include_sources: sources,
                ..Default::default()
            };
            let answer: RagAnswer = platform.orchestrator.query(&question, context_limit, options).await?;
            println!("{}", answer.answer);
            if let Some(snippets) = answer.sources {
                for s in snippets {
                    println!("  [{:.3}] {} — {}", s.score, s.document_id, s.snippet);
                }
            }
        }
        Commands::Serve => {
            let platform = build_platform(&config).await?;
            let mut scheduler = Scheduler::new();
            scheduler.start(platform.ingestion.clone());
            ragctl::server::run_server(&config, platform.store.clone(), platform.orchestrator.clone(), platform.ingestion.clone()).await?;
            scheduler.stop().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sync_with_flags() {
        let cli = Cli::try_parse_from(["ragctl", "sync", "agent-1", "--full", "--limit", "10"]).unwrap();
        match cli.command {
            Commands::Sync { agent, full, limit, .. } => {
                assert_eq!(agent, "agent-1");
                assert!(full);
                assert_eq!(limit, Some(10));
            }
            _ => panic!("expected Sync command"),
        }
    }

    #[test]
    fn parses_search_with_mode() {
        let cli = Cli::try_parse_from(["ragctl", "search", "deployment", "--mode", "semantic"]).unwrap();
        match cli.command {
            Commands::Search { query, mode, .. } => {
                assert_eq!(query, "deployment");
                assert_eq!(mode, "semantic");
            }
            _ => panic!("expected Search command"),
        }
    }

    #[test]
    fn parses_query_with_sources_flag() {
        let cli = Cli::try_parse_from(["ragctl", "query", "what is rag?", "--sources"]).unwrap();
        match cli.command {
            Commands::Query { question, sources, .. } => {
                assert_eq!(question, "what is rag?");
                assert!(sources);
            }
            _ => panic!("expected Query command"),
        }
    }

    #[test]
    fn parses_agent_subcommands() {
        let cli = Cli::try_parse_from(["ragctl", "agent", "enable", "agent-1"]).unwrap();
        match cli.command {
            Commands::Agent { action: AgentAction::Enable { agent_id } } => assert_eq!(agent_id, "agent-1"),
            _ => panic!("expected Agent Enable command"),
        }
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["ragctl", "nonexistent"]).is_err());
    }

    #[test]
    fn serve_and_init_take_no_arguments() {
        assert!(Cli::try_parse_from(["ragctl", "init"]).is_ok());
        assert!(Cli::try_parse_from(["ragctl", "serve"]).is_ok());
    }
}
