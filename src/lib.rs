//! # ragctl
//!
//! **A modular retrieval-augmented-generation serving platform.**
//!
//! ragctl turns a collection of heterogeneous sources — web pages, RSS
//! feeds, HTTP APIs, local files, databases, mailboxes, and
//! application-specific connectors — into a hybrid-searchable,
//! embedding-indexed corpus, and answers questions against it with an
//! LLM-backed generator.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌─────────┐   ┌───────────┐
//! │  Agents   │──▶│  Chunker  │──▶│ Router  │──▶│ Embedding │
//! │ (C12)     │   │  (C6)    │   │  (C5)   │   │  (C4)     │
//! └───────────┘   └──────────┘   └─────────┘   └─────┬─────┘
//!       ▲                                             │
//!       │ Scheduler (C13)                             ▼
//! ┌───────────┐                               ┌───────────────┐
//! │ Ingestion │                               │  Vector Store  │
//! │ Manager   │◀──────────────────────────────│  (C8, sharded) │
//! │  (C14)    │                               └───────┬────────┘
//! └───────────┘                                        │
//!                                                       ▼
//!                         ┌─────────────────────────────────────┐
//!                         │  Hybrid Retriever (C9) + Prompt (C10) │
//!                         │       + RAG Orchestrator (C11)       │
//!                         └───────────────┬───────────────────────┘
//!                                         ▼
//!                          ┌──────────┐        ┌──────────┐
//!                          │   CLI    │        │   HTTP   │
//!                          │ (ragctl) │        │ (C18)   │
//!                          └──────────┘        └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. Source [`agents`] (C12) fetch raw [`models::Document`]s from a web
//!    crawl, an RSS feed, a generic HTTP API, a filesystem tree, a
//!    database query, an IMAP mailbox, or an application-registered
//!    custom handler.
//! 2. The [`ingestion`] manager (C14) drives the pipeline: fetch, split
//!    into [`models::Chunk`]s with the configurable [`chunk`] splitter
//!    (C6), embed, and index.
//! 3. The [`scheduler`] (C13) decides when each agent's configured
//!    schedule is due and triggers `ingestion` runs unattended.
//! 4. [`embedding`] (C4) turns chunk text into vectors, optionally
//!    selecting among multiple models via [`router`] (C5), with
//!    [`cache`] absorbing repeat embedding calls.
//! 5. [`store`] (C8) holds chunks across one or more shards, each
//!    backed by an [`index`] (HNSW, FAISS-family, or a remote service)
//!    and a [`metric`] for similarity.
//! 6. [`retriever`] (C9) fuses dense vector search with sparse
//!    (BM25-style) keyword search into one ranked result list.
//! 7. [`prompt`] (C10) renders retrieved context into a model-specific
//!    prompt; [`rag`] (C11) drives the generate-an-answer pipeline
//!    against a pluggable LLM [`rag::Generator`].
//! 8. Results are exposed via the **CLI** (`ragctl`) and the HTTP
//!    surface ([`server`], C18).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | The crate-wide [`error::RagError`] taxonomy and `Result` alias |
//! | [`models`] | Core data types: documents, chunks, agent configs, search results, prompts |
//! | [`config`] | TOML configuration parsing and cross-field validation |
//! | [`metric`] | Vector similarity metrics (cosine, dot, Euclidean) |
//! | [`cache`] | LRU embedding cache |
//! | [`chunk`] | Paragraph/sentence/token/character text chunker |
//! | [`router`] | Multi-model routing and embedding ensembling |
//! | [`embedding`] | Embedding provider adapters (local, HTTP, ONNX) and the embedding service |
//! | [`index`] | Vector index backends: HNSW, FAISS-family, remote |
//! | [`store`] | Sharded vector store tying chunks, embeddings, and indices together |
//! | [`retriever`] | Hybrid dense + sparse retrieval fusion |
//! | [`prompt`] | Hand-rolled prompt template renderer |
//! | [`rag`] | RAG orchestrator and LLM generator abstraction |
//! | [`agents`] | Source agents: web, RSS, API, filesystem, database, email, custom |
//! | [`scheduler`] | Schedule grammar, due-check, and background tick loop |
//! | [`ingestion`] | Agent registry and the fetch→chunk→index pipeline |
//! | [`server`] | HTTP surface (Axum) exposing search, query, and agent management |
//!
//! ## Configuration
//!
//! ragctl is configured via a TOML file (default: `config/ragctl.toml`).
//! See [`config`] for all available options and [`config::load_config`]
//! for validation rules.

pub mod agents;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingestion;
pub mod metric;
pub mod models;
pub mod prompt;
pub mod rag;
pub mod retriever;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod store;
