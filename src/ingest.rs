//! Ingestion coordination: binary in, searchable document out.
//!
//! The flow is extract → chunk → embed → persist, with the persist step
//! committing the document and every chunk in one transaction so a partially
//! ingested document is never observable to queries. Side effects before the
//! commit (the stored binary) are reverted on any failure, including
//! cancellation: the cleanup guard runs on drop.
//!
//! Re-ingesting identical content is intentionally not deduplicated; each
//! call produces an independent document.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker;
use crate::config::Config;
use crate::error::{RagError, Result};
use crate::extract;
use crate::gateway::EmbeddingClient;
use crate::models::{Chunk, Document, DocumentClass, FileKind, PreparedChunk};
use crate::store::ChunkStore;

pub struct IngestionCoordinator {
    config: Arc<Config>,
    store: Arc<ChunkStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

/// Removes the staged document directory unless defused by a successful
/// commit. Runs on error returns and on task cancellation alike.
struct StagedFile {
    dir: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), error = %e, "failed to clean staged upload");
                }
            }
        }
    }
}

impl IngestionCoordinator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<ChunkStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
        }
    }

    /// Ingest one uploaded binary. On success the returned document and all
    /// its chunks are already visible to retrieval.
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        class: DocumentClass,
    ) -> Result<Document> {
        let kind = file_kind_for(filename, &self.config.upload.allowed_extensions)?;
        let document_id = Uuid::new_v4();

        // Stage the binary at its content-addressed path.
        let dir = self.config.storage_path.join(document_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let staged = StagedFile {
            dir: dir.clone(),
            committed: false,
        };
        let file_path = dir.join(filename);
        tokio::fs::write(&file_path, &bytes).await?;
        let file_size = bytes.len() as i64;

        // Extraction and chunking are CPU-bound; keep them off the runtime.
        let chunk_cfg = self.config.chunking.clone();
        let name = filename.to_string();
        let prepared: Vec<PreparedChunk> = tokio::task::spawn_blocking(move || {
            let extraction = extract::extract(&bytes, kind)?;
            Ok::<_, RagError>(chunker::chunk_document(&extraction, &name, &chunk_cfg))
        })
        .await
        .map_err(|e| RagError::ExtractionFailed(format!("extraction task failed: {}", e)))??;

        if prepared.is_empty() {
            return Err(RagError::IngestionYieldedNothing);
        }

        let texts: Vec<String> = prepared.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != prepared.len() {
            return Err(RagError::EmbeddingUnavailable(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                prepared.len()
            )));
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("chunk_count".to_string(), prepared.len().into());

        let document = Document {
            id: document_id,
            name: filename.to_string(),
            file_path: file_path.display().to_string(),
            file_size,
            file_kind: kind,
            class,
            uploaded_at: Utc::now(),
            metadata,
        };

        let chunks: Vec<Chunk> = prepared
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (prepared, embedding))| Chunk {
                id: Uuid::new_v4(),
                document_id,
                chunk_index: i as i64,
                content: prepared.content,
                token_count: prepared.token_count as i64,
                embedding,
                metadata: prepared.metadata,
            })
            .collect();

        self.store.insert_document(&document, &chunks).await?;
        staged.commit();

        info!(
            document = %document_id,
            name = filename,
            chunks = chunks.len(),
            "document ingested"
        );
        Ok(document)
    }

    /// Delete a document, its chunks, and its stored binary.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let document = self.store.delete_document(id).await?;

        let dir = self.config.storage_path.join(id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(document = %id, error = %e, "failed to remove stored binary");
            }
        }

        info!(document = %id, name = %document.name, "document deleted");
        Ok(())
    }
}

/// Resolve the file kind from the filename extension, enforcing the upload
/// allowlist.
pub fn file_kind_for(filename: &str, allowed: &[String]) -> Result<FileKind> {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| RagError::InvalidInput(format!("{} has no file extension", filename)))?;

    if !allowed.iter().any(|a| a == &extension) {
        return Err(RagError::InvalidInput(format!(
            "file type .{} not allowed (allowed: {})",
            extension,
            allowed.join(", ")
        )));
    }

    FileKind::from_extension(&extension)
        .ok_or_else(|| RagError::InvalidInput(format!("unsupported file type .{}", extension)))
}
