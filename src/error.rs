//! Error taxonomy for the retrieval pipeline.
//!
//! Each variant corresponds to one failure kind the pipeline distinguishes:
//! input rejection, extraction failure, empty yield, upstream unavailability
//! (embedding, reranker, LLM, storage), and mid-stream truncation. Gateways
//! retry internally and surface exactly one categorical failure; the HTTP
//! layer maps variants to status codes.

use thiserror::Error;

/// Main error type for regstack operations.
#[derive(Error, Debug)]
pub enum RagError {
    /// Bad request input: unsupported file type, oversized upload, malformed body.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The document binary could not be parsed.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Extraction and chunking produced zero chunks; nothing was persisted.
    #[error("document yielded no indexable text")]
    IngestionYieldedNothing,

    /// Embedding service unreachable after retries.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Reranker service unreachable; retrieval falls back to vector scores.
    #[error("reranker service unavailable: {0}")]
    RerankerUnavailable(String),

    /// LLM request failed before any token was produced.
    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    /// LLM stream ended prematurely after producing some tokens.
    #[error("language model stream truncated: {0}")]
    LlmStreamTruncated(String),

    /// Database connection lost or query failed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors (file persistence, binary reads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RagError::NotFound("row not found".to_string()),
            other => RagError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Result type alias for regstack operations.
pub type Result<T> = std::result::Result<T, RagError>;
