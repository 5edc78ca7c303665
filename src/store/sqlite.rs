//! Embedded local backend: SQLite with BLOB vectors.
//!
//! Owns a private database file; vectors are little-endian f32 BLOBs on the
//! chunk row, and search is brute-force cosine in Rust over every stored
//! vector. Zero external services — the point of this backend is that local
//! development needs nothing running.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    Chunk, Document, DocumentStats, DocumentStatus, NewDocument, SearchHit, StoreStats,
};

use super::{check_dims, ChunkRef, StoreError, VectorStore};

pub struct SqliteStore {
    pool: SqlitePool,
    dims: usize,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and ensure the schema.
    pub async fn open(path: &Path, dims: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Config(format!("cannot create {:?}: {}", parent, e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool, dims };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                format TEXT NOT NULL,
                page_count INTEGER NOT NULL DEFAULT 0,
                paragraph_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                document_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                hash TEXT NOT NULL,
                embedding BLOB,
                PRIMARY KEY (document_id, chunk_index),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn create_document(&self, doc: &NewDocument) -> Result<i64, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO documents (filename, format, page_count, paragraph_count, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&doc.filename)
        .bind(doc.format.as_str())
        .bind(doc.page_count)
        .bind(doc.paragraph_count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DocumentNotFound(document_id));
        }
        Ok(())
    }

    async fn get_document(&self, document_id: i64) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            "SELECT id, filename, format, page_count, paragraph_count, status, created_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Document {
            id: r.get("id"),
            filename: r.get("filename"),
            format: r.get("format"),
            page_count: r.get("page_count"),
            paragraph_count: r.get("paragraph_count"),
            status: DocumentStatus::parse(r.get("status")),
            created_at: r.get("created_at"),
        }))
    }

    async fn add(&self, document_id: i64, chunks: &[Chunk]) -> Result<(), StoreError> {
        check_dims(chunks, self.dims)?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::DocumentNotFound(document_id));
        }

        let mut tx = self.pool.begin().await?;

        // Delete-then-insert inside one transaction: re-adding is
        // idempotent and a failure rolls the whole call back.
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = chunk.embedding.as_ref().map(|v| vec_to_blob(v));
            sqlx::query(
                r#"
                INSERT INTO chunks (document_id, chunk_index, content, token_count, metadata_json, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(chunk.metadata.to_string())
            .bind(&chunk.hash)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query_vec: &[f32],
        k: i64,
        document_id: Option<i64>,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if query_vec.len() != self.dims {
            return Err(StoreError::Dimension {
                expected: self.dims,
                actual: query_vec.len(),
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT document_id, chunk_index, content, embedding
            FROM chunks
            WHERE embedding IS NOT NULL
              AND (?1 IS NULL OR document_id = ?1)
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let similarity = cosine_similarity(query_vec, &vector);
                (similarity >= min_similarity).then(|| SearchHit {
                    content: row.get("content"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_index.cmp(&b.chunk_index))
                .then(a.document_id.cmp(&b.document_id))
        });
        hits.truncate(k.max(0) as usize);

        Ok(hits)
    }

    async fn delete(&self, document_id: i64) -> Result<bool, StoreError> {
        // ON DELETE CASCADE removes the chunk rows (and with them the
        // vectors) in the same statement.
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let chunks_with_embeddings: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let document_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            chunk_count,
            chunks_with_embeddings,
            document_count,
        })
    }

    async fn list_chunks(
        &self,
        missing_only: bool,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ChunkRef>, StoreError> {
        let sql = if missing_only {
            "SELECT document_id, chunk_index, content FROM chunks \
             WHERE embedding IS NULL \
             ORDER BY document_id, chunk_index LIMIT ? OFFSET ?"
        } else {
            "SELECT document_id, chunk_index, content FROM chunks \
             ORDER BY document_id, chunk_index LIMIT ? OFFSET ?"
        };

        let rows = sqlx::query(sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkRef {
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
            })
            .collect())
    }

    async fn store_embeddings(&self, batch: &[(ChunkRef, Vec<f32>)]) -> Result<(), StoreError> {
        for (_, vector) in batch {
            if vector.len() != self.dims {
                return Err(StoreError::Dimension {
                    expected: self.dims,
                    actual: vector.len(),
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in batch {
            sqlx::query(
                "UPDATE chunks SET embedding = ? WHERE document_id = ? AND chunk_index = ?",
            )
            .bind(vec_to_blob(vector))
            .bind(chunk.document_id)
            .bind(chunk.chunk_index)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn document_overview(&self) -> Result<Vec<DocumentStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.filename, d.status,
                   COUNT(c.chunk_index) AS chunk_count,
                   COUNT(c.embedding) AS embedded_count
            FROM documents d
            LEFT JOIN chunks c ON c.document_id = d.id
            GROUP BY d.id
            ORDER BY d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentStats {
                id: row.get("id"),
                filename: row.get("filename"),
                status: DocumentStatus::parse(row.get("status")),
                chunk_count: row.get("chunk_count"),
                embedded_count: row.get("embedded_count"),
            })
            .collect())
    }
}
