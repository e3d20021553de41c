//! Cross-cutting error taxonomy (C15).
//!
//! Library modules return `Result<T, RagError>` so callers can match on a
//! stable kind instead of parsing message strings. `main.rs` and the CLI
//! command handlers flatten everything to `anyhow::Result` for display,
//! the same library/binary split the rest of the pack uses.

use thiserror::Error;

/// The error taxonomy shared by every component in the platform.
///
/// Variants map 1:1 onto §7 of the specification. Keep matching on
/// `RagError` kinds in tests exact — callers outside the crate only ever
/// see the `Display` string via `anyhow`.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("embedding model not found: {0}")]
    ModelNotFound(String),

    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("collection missing: {0}")]
    CollectionMissing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent already running: {0}")]
    AlreadyRunning(String),

    #[error("invalid schedule: {0}")]
    ScheduleInvalid(String),

    #[error("invalid template: {0}")]
    TemplateInvalid(String),

    #[error("source authentication failed: {0}")]
    SourceAuth(String),

    #[error("remote source unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("cancelled")]
    Cancelled,
}

impl RagError {
    /// Stable machine-readable code, used by the HTTP surface's
    /// `{error:{code,message}}` body and by tests that want to match on
    /// kind without a big `match`.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::ConfigInvalid(_) => "config_invalid",
            RagError::ModelNotFound(_) => "model_not_found",
            RagError::ProviderAuth(_) => "provider_auth",
            RagError::RateLimited(_) => "rate_limited",
            RagError::Timeout(_) => "timeout",
            RagError::Transport(_) => "transport",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::IndexCorrupt(_) => "index_corrupt",
            RagError::CollectionMissing(_) => "collection_missing",
            RagError::NotFound(_) => "not_found",
            RagError::AlreadyRunning(_) => "already_running",
            RagError::ScheduleInvalid(_) => "schedule_invalid",
            RagError::TemplateInvalid(_) => "template_invalid",
            RagError::SourceAuth(_) => "source_auth",
            RagError::RemoteUnavailable(_) => "remote_unavailable",
            RagError::Transient(_) => "transient",
            RagError::MissingDependency(_) => "missing_dependency",
            RagError::Cancelled => "cancelled",
        }
    }

    /// Whether an adapter-level retry loop should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::RateLimited(_) | RagError::Transient(_) | RagError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
