//! Core data types flowing through the ingestion and query pipelines.
//!
//! ```text
//! upload → extract() → PageText → chunk() → PreparedChunk
//!                                               ↓
//!                                          embed() → Chunk (persisted)
//!                                               ↓
//!                            plan() → retrieve() → ScoredChunk
//!                                               ↓
//!                                      answer() → RagEvent stream
//! ```
//!
//! # Type relationships
//!
//! - A **[`Document`]** is the stored record of one uploaded binary. It is
//!   immutable after ingestion and owns its chunks.
//! - A **[`Chunk`]** is a bounded slice of a document's text with its
//!   embedding and page/section attribution. Chunk indices within a document
//!   are dense and zero-based.
//! - A **[`ScoredChunk`]** is a retrieval candidate carrying both the ANN
//!   cosine similarity and the normalized rerank score.
//! - A **[`RagEvent`]** is one element of the ordered answer stream:
//!   `text* (citations metrics)? done`, with `error` replacing text on
//!   pre-stream failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Document class, used to label corpus entries in prompt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentClass {
    Regulation,
    Policy,
    Document,
}

impl DocumentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentClass::Regulation => "regulation",
            DocumentClass::Policy => "policy",
            DocumentClass::Document => "document",
        }
    }

    pub fn parse(raw: &str) -> Option<DocumentClass> {
        match raw {
            "regulation" => Some(DocumentClass::Regulation),
            "policy" => Some(DocumentClass::Policy),
            "document" => Some(DocumentClass::Document),
            _ => None,
        }
    }
}

impl Default for DocumentClass {
    fn default() -> Self {
        DocumentClass::Document
    }
}

/// Source file kind accepted by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    Text,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Text => "text",
        }
    }

    /// Map a lowercase file extension to a kind.
    pub fn from_extension(ext: &str) -> Option<FileKind> {
        match ext {
            "pdf" => Some(FileKind::Pdf),
            "docx" | "doc" => Some(FileKind::Docx),
            "txt" | "md" | "markdown" | "text" => Some(FileKind::Text),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<FileKind> {
        match raw {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "text" => Some(FileKind::Text),
            _ => None,
        }
    }
}

/// Stored document record. Created by ingestion in a single transaction,
/// never mutated, destroyed only by explicit delete (cascading to chunks).
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    /// Original filename as uploaded.
    pub name: String,
    /// Path of the stored binary under the storage root.
    pub file_path: String,
    pub file_size: i64,
    pub file_kind: FileKind,
    pub class: DocumentClass,
    pub uploaded_at: DateTime<Utc>,
    /// Free-form metadata; currently carries chunk statistics.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Per-chunk attribution metadata, persisted as a JSON blob.
///
/// Unknown keys are accepted and round-tripped via `extra`; known keys with
/// the wrong type fail deserialization at the read boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Human-visible page number when recoverable, else the physical position.
    pub page: u32,
    /// True iff `page` was recovered from page content rather than position.
    pub page_extracted: bool,
    /// 1-based physical page index in the source file.
    pub physical_position: u32,
    /// Detected section or title heading, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Denormalized filename for prompt assembly.
    pub document_name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A chunk before embedding: produced by the chunker, consumed by ingestion.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub content: String,
    pub token_count: usize,
    pub metadata: ChunkMetadata,
}

/// Persisted chunk with its embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// One prior conversational turn, raw text only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Output of the query planner.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Hypothetical-passage expansion used as the retrieval surface.
    pub expanded_text: String,
    pub query_vector: Vec<f32>,
    /// True when expansion failed and the raw question was embedded instead.
    pub degraded: bool,
}

/// A retrieval candidate with its scores.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Normalized score in [0, 1]: min-max rerank score, or raw cosine
    /// similarity in fallback mode.
    pub score: f64,
    /// Original ANN cosine similarity, kept for deterministic tie-breaking.
    pub similarity: f64,
}

/// Wall-clock timings of the retrieval stages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub recall_ms: u64,
    pub rerank_ms: u64,
    pub select_ms: u64,
}

/// Final retrieval output, in rank order.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    /// True when any stage operated in fallback mode.
    pub degraded: bool,
    pub timings: StageTimings,
}

/// Document DTO returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDto {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub uploaded_at: String,
    #[serde(rename = "type")]
    pub doc_type: String,
}

impl DocumentDto {
    pub fn from_document(doc: &Document) -> DocumentDto {
        DocumentDto {
            id: doc.id.to_string(),
            name: doc.name.clone(),
            size: doc.file_size,
            uploaded_at: doc.uploaded_at.to_rfc3339(),
            doc_type: doc.class.as_str().to_string(),
        }
    }
}

/// Citation DTO emitted in the `citations` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationDto {
    /// Sentinel identifier referenced in the streamed text, e.g. `C3`.
    pub id: String,
    /// The cited span as produced by the model.
    pub text: String,
    /// Rendered as `"<document_name>, p.<page>"` plus `", §<section>"`.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Usage and quality metrics emitted once per response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub citations_count: usize,
    pub average_normalized_score: f64,
    pub latency_ms: u64,
    pub degraded: bool,
}

/// One element of the ordered answer stream.
///
/// A normally-terminating response emits `Text* Citations Metrics Done`;
/// a pre-stream failure emits `Error Done`. Nothing is emitted after
/// cancellation is observed.
#[derive(Debug, Clone)]
pub enum RagEvent {
    Text(String),
    Citations {
        citations: Vec<CitationDto>,
        invalid_citations: Vec<String>,
    },
    Metrics(ResponseMetrics),
    Error(String),
    Done,
}
