//! Persistent chunk store: SQLite rows plus the in-memory ANN index.
//!
//! A document and its chunks are inserted in one transaction, and the index
//! is updated immediately after commit while the ingest call is still
//! pending, so a query started after ingestion returns sees the new corpus
//! and a query racing the commit never observes a partial document.
//! Deletion is the mirror image: one transaction removes the document and
//! every chunk, then the index drops the document's vectors.
//!
//! Chunk metadata is stored as a JSON blob and validated at the read
//! boundary: unknown keys pass through, known keys with the wrong type are
//! rejected as storage corruption.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::index::{blob_to_vec, vec_to_blob, IndexEntry, VectorIndex};
use crate::migrate;
use crate::models::{Chunk, ChunkMetadata, Document, DocumentClass, FileKind};

pub struct ChunkStore {
    pool: SqlitePool,
    index: RwLock<VectorIndex>,
    dims: usize,
}

impl ChunkStore {
    /// Open the store at the given path, run migrations, and load the ANN
    /// index from the persisted chunks.
    pub async fn open(db_path: &Path, dims: usize) -> Result<Self> {
        let pool = crate::db::connect(db_path)
            .await
            .map_err(|e| RagError::StorageUnavailable(e.to_string()))?;
        Self::from_pool(pool, dims).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(dims: usize) -> Result<Self> {
        let pool = crate::db::connect_in_memory()
            .await
            .map_err(|e| RagError::StorageUnavailable(e.to_string()))?;
        Self::from_pool(pool, dims).await
    }

    async fn from_pool(pool: SqlitePool, dims: usize) -> Result<Self> {
        migrate::run_migrations(&pool)
            .await
            .map_err(|e| RagError::StorageUnavailable(e.to_string()))?;

        let store = Self {
            pool,
            index: RwLock::new(VectorIndex::new(dims)),
            dims,
        };
        store.reload_index().await?;
        Ok(store)
    }

    /// Rebuild the ANN index from the persisted chunk embeddings.
    async fn reload_index(&self) -> Result<()> {
        let rows = sqlx::query("SELECT id, document_id, embedding FROM document_chunks")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(IndexEntry {
                chunk_id: parse_uuid(row.get("id"))?,
                document_id: parse_uuid(row.get("document_id"))?,
                vector: blob_to_vec(row.get::<Vec<u8>, _>("embedding").as_slice()),
            });
        }

        let count = entries.len();
        let mut index = self.index.write().expect("index lock poisoned");
        *index = VectorIndex::new(self.dims);
        index.insert(entries);
        drop(index);

        if count > 0 {
            info!(chunks = count, "vector index loaded");
        }
        Ok(())
    }

    /// Persist a document and its chunks atomically, then make them
    /// searchable.
    pub async fn insert_document(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, name, file_path, file_size, file_kind, class, uploaded_at, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document.id.to_string())
        .bind(&document.name)
        .bind(&document.file_path)
        .bind(document.file_size)
        .bind(document.file_kind.as_str())
        .bind(document.class.as_str())
        .bind(document.uploaded_at.to_rfc3339())
        .bind(serde_json::Value::Object(document.metadata.clone()).to_string())
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunks
                    (id, document_id, chunk_index, content, token_count, embedding, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(chunk.document_id.to_string())
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(serde_json::to_string(&chunk.metadata)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .map(|c| IndexEntry {
                chunk_id: c.id,
                document_id: c.document_id,
                vector: c.embedding.clone(),
            })
            .collect();
        self.index
            .write()
            .expect("index lock poisoned")
            .insert(entries);

        Ok(())
    }

    /// Delete a document and all its chunks in one observable instant.
    /// Returns the deleted document so the caller can remove its binary.
    pub async fn delete_document(&self, id: Uuid) -> Result<Document> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document {}", id)))?;
        let document = document_from_row(&row)?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.index
            .write()
            .expect("index lock poisoned")
            .remove_document(id);

        Ok(document)
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    /// All documents, most recently uploaded first.
    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY uploaded_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    /// K-nearest chunks by cosine similarity, descending, with full rows.
    pub async fn knn(&self, query_vector: &[f32], k: usize) -> Result<Vec<(Chunk, f64)>> {
        let hits = {
            let index = self.index.read().expect("index lock poisoned");
            index.knn(query_vector, k)
        };

        let mut out = Vec::with_capacity(hits.len());
        for (chunk_id, similarity) in hits {
            let row = sqlx::query("SELECT * FROM document_chunks WHERE id = ?")
                .bind(chunk_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            // An index entry can briefly outlive its row across a concurrent
            // delete; skip rather than fail the query.
            if let Some(row) = row {
                out.push((chunk_from_row(&row)?, similarity));
            }
        }
        Ok(out)
    }
}

fn parse_uuid(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw)
        .map_err(|e| RagError::StorageUnavailable(format!("corrupt uuid {}: {}", raw, e)))
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let uploaded_raw: String = row.get("uploaded_at");
    let uploaded_at = DateTime::parse_from_rfc3339(&uploaded_raw)
        .map_err(|e| RagError::StorageUnavailable(format!("corrupt timestamp: {}", e)))?
        .with_timezone(&Utc);

    let kind_raw: String = row.get("file_kind");
    let class_raw: String = row.get("class");
    let metadata_raw: String = row.get("metadata_json");

    Ok(Document {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        file_kind: FileKind::parse(&kind_raw)
            .ok_or_else(|| RagError::StorageUnavailable(format!("corrupt file kind {}", kind_raw)))?,
        class: DocumentClass::parse(&class_raw)
            .ok_or_else(|| RagError::StorageUnavailable(format!("corrupt class {}", class_raw)))?,
        uploaded_at,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let metadata_raw: String = row.get("metadata_json");
    let metadata: ChunkMetadata = serde_json::from_str(&metadata_raw)
        .map_err(|e| RagError::StorageUnavailable(format!("corrupt chunk metadata: {}", e)))?;

    Ok(Chunk {
        id: parse_uuid(row.get("id"))?,
        document_id: parse_uuid(row.get("document_id"))?,
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        embedding: blob_to_vec(row.get::<Vec<u8>, _>("embedding").as_slice()),
        metadata,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_metadata(name: &str, page: u32) -> ChunkMetadata {
        ChunkMetadata {
            page,
            page_extracted: false,
            physical_position: page,
            section: None,
            document_name: name.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    pub(crate) fn make_document(name: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            name: name.to_string(),
            file_path: format!("/tmp/{}", name),
            file_size: 1024,
            file_kind: FileKind::Pdf,
            class: DocumentClass::Document,
            uploaded_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub(crate) fn make_chunk(doc: &Document, index: i64, content: &str, vector: Vec<f32>) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: doc.id,
            chunk_index: index,
            content: content.to_string(),
            token_count: content.split_whitespace().count() as i64,
            embedding: vector,
            metadata: make_metadata(&doc.name, index as u32 + 1),
        }
    }

    #[tokio::test]
    async fn insert_then_counts_and_listing() {
        let store = ChunkStore::open_in_memory(2).await.unwrap();
        let doc = make_document("crr.pdf");
        let chunks = vec![
            make_chunk(&doc, 0, "own funds requirements", vec![1.0, 0.0]),
            make_chunk(&doc, 1, "liquidity coverage ratio", vec![0.0, 1.0]),
        ];
        store.insert_document(&doc, &chunks).await.unwrap();

        assert_eq!(store.count_documents().await.unwrap(), 1);
        assert_eq!(store.count_chunks().await.unwrap(), 2);

        let listed = store.list_documents().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "crr.pdf");
    }

    #[tokio::test]
    async fn knn_returns_chunk_with_metadata() {
        let store = ChunkStore::open_in_memory(2).await.unwrap();
        let doc = make_document("crd.pdf");
        let chunks = vec![
            make_chunk(&doc, 0, "capital buffers", vec![1.0, 0.0]),
            make_chunk(&doc, 1, "governance arrangements", vec![0.0, 1.0]),
        ];
        store.insert_document(&doc, &chunks).await.unwrap();

        let hits = store.knn(&[1.0, 0.1], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content, "capital buffers");
        assert_eq!(hits[0].0.metadata.document_name, "crd.pdf");
        assert!(hits[0].1 > 0.9);
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks_and_index() {
        let store = ChunkStore::open_in_memory(2).await.unwrap();
        let doc = make_document("policy.pdf");
        let chunks = vec![make_chunk(&doc, 0, "remuneration policy", vec![1.0, 0.0])];
        store.insert_document(&doc, &chunks).await.unwrap();

        let deleted = store.delete_document(doc.id).await.unwrap();
        assert_eq!(deleted.id, doc.id);
        assert_eq!(store.count_documents().await.unwrap(), 0);
        assert_eq!(store.count_chunks().await.unwrap(), 0);
        assert!(store.knn(&[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_document_is_not_found() {
        let store = ChunkStore::open_in_memory(2).await.unwrap();
        let err = store.delete_document(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_insert_leaves_no_partial_document() {
        let store = ChunkStore::open_in_memory(2).await.unwrap();
        let doc = make_document("dup.pdf");
        // Duplicate chunk_index violates the unique constraint mid-insert.
        let chunks = vec![
            make_chunk(&doc, 0, "first", vec![1.0, 0.0]),
            make_chunk(&doc, 0, "second", vec![0.0, 1.0]),
        ];
        assert!(store.insert_document(&doc, &chunks).await.is_err());
        assert_eq!(store.count_documents().await.unwrap(), 0);
        assert_eq!(store.count_chunks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reingesting_same_content_creates_independent_documents() {
        let store = ChunkStore::open_in_memory(2).await.unwrap();
        let doc_a = make_document("same.pdf");
        let doc_b = make_document("same.pdf");
        store
            .insert_document(&doc_a, &[make_chunk(&doc_a, 0, "identical text", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .insert_document(&doc_b, &[make_chunk(&doc_b, 0, "identical text", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(store.count_documents().await.unwrap(), 2);
        let hits = store.knn(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        let docs: std::collections::HashSet<Uuid> =
            hits.iter().map(|(c, _)| c.document_id).collect();
        assert_eq!(docs.len(), 2);
    }
}
