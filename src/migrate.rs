//! Database schema migrations.
//!
//! # Schema
//!
//! ```text
//! ┌───────────────┐     ┌──────────────────┐
//! │  documents    │──┐  │ document_chunks  │
//! │               │  │  │                  │
//! │ id (PK)       │  └──│ document_id (FK) │
//! │ name          │     │ id (PK)          │
//! │ file_path     │     │ chunk_index      │
//! │ file_size     │     │ content          │
//! │ file_kind     │     │ token_count      │
//! │ class         │     │ embedding (BLOB) │
//! │ uploaded_at   │     │ metadata_json    │
//! │ metadata_json │     └──────────────────┘
//! └───────────────┘
//! ```
//!
//! Embeddings are stored as little-endian `f32` BLOBs of the configured
//! dimension. Chunk deletion cascades from document deletion, so a document
//! and its chunks disappear in one transactional unit.
//!
//! All statements use `CREATE ... IF NOT EXISTS`; running migrations
//! repeatedly is safe.

use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_kind TEXT NOT NULL,
            class TEXT NOT NULL DEFAULT 'document',
            uploaded_at TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_chunks_document_id \
         ON document_chunks(document_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_uploaded_at \
         ON documents(uploaded_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = db::connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('documents', 'document_chunks')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 2);
    }
}
