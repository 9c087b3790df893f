//! Error types for the audit and telemetry pipeline

use thiserror::Error;

use crate::canonical::CanonicalizationError;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Ledger Errors
    // =============================

    /// Payload rejected before hashing; nothing was written.
    #[error("Canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    #[error("Ledger write error: {0}")]
    LedgerWrite(String),

    /// Durable write retries exhausted; the ledger is in degraded mode.
    #[error("Audit unavailable: {0}")]
    AuditUnavailable(String),

    #[error("Ledger corrupt: {0}")]
    LedgerCorrupt(String),

    #[error("Signing error: {0}")]
    Signing(String),

    // =============================
    // Telemetry / Streaming Errors
    // =============================

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run already in progress: {0}")]
    RunInProgress(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Stream protocol violation: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether a client may retry the operation that produced this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::AuditUnavailable(_)
                | PipelineError::LedgerWrite(_)
                | PipelineError::Cancelled(_)
                | PipelineError::DatabaseError(_)
                | PipelineError::HttpError(_)
                | PipelineError::IoError(_)
        )
    }
}
