//! Server-side backend: PostgreSQL with the pgvector extension.
//!
//! Vectors live in a `vector(dims)` column on the chunk row, inside the same
//! transactional store as the rest of the schema — document deletion can
//! never leave orphaned vectors in a second datastore. Search runs through a
//! server-side HNSW index with the cosine operator; one round trip applies
//! the similarity threshold and limit.
//!
//! Vectors cross the wire as pgvector text literals (`[0.1,0.2,...]`) cast
//! with `::vector`, so no client-side vector type is needed.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::config::HnswConfig;
use crate::models::{
    Chunk, Document, DocumentStats, DocumentStatus, NewDocument, SearchHit, StoreStats,
};

use super::{check_dims, ChunkRef, StoreError, VectorStore};

pub struct PostgresStore {
    pool: PgPool,
    dims: usize,
    ef_search: u32,
}

/// Render a pgvector text literal.
fn vector_literal(vec: &[f32]) -> String {
    let mut out = String::with_capacity(vec.len() * 8 + 2);
    out.push('[');
    for (i, v) in vec.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{}", v));
    }
    out.push(']');
    out
}

impl PostgresStore {
    pub async fn connect(url: &str, dims: usize, hnsw: &HnswConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        let store = Self {
            pool,
            dims,
            ef_search: hnsw.ef_search,
        };
        store.migrate(hnsw).await?;
        Ok(store)
    }

    async fn migrate(&self, hnsw: &HnswConfig) -> Result<(), StoreError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id BIGSERIAL PRIMARY KEY,
                filename TEXT NOT NULL,
                format TEXT NOT NULL,
                page_count BIGINT NOT NULL DEFAULT 0,
                paragraph_count BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                document_id BIGINT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index BIGINT NOT NULL,
                content TEXT NOT NULL,
                token_count BIGINT NOT NULL,
                metadata_json JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                hash TEXT NOT NULL,
                embedding vector({}),
                PRIMARY KEY (document_id, chunk_index)
            )
            "#,
            self.dims
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_chunks_embedding ON chunks \
             USING hnsw (embedding vector_cosine_ops) \
             WITH (m = {}, ef_construction = {})",
            hnsw.m, hnsw.ef_construction
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl VectorStore for PostgresStore {
    async fn create_document(&self, doc: &NewDocument) -> Result<i64, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (filename, format, page_count, paragraph_count, status, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING id
            "#,
        )
        .bind(&doc.filename)
        .bind(doc.format.as_str())
        .bind(doc.page_count)
        .bind(doc.paragraph_count)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE documents SET status = $1 WHERE id = $2")
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
             FROM documents WHERE id = $1",
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

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::DocumentNotFound(document_id));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let literal = chunk.embedding.as_ref().map(|v| vector_literal(v));
            sqlx::query(
                r#"
                INSERT INTO chunks (document_id, chunk_index, content, token_count, metadata_json, hash, embedding)
                VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7::vector)
                "#,
            )
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .bind(chunk.metadata.to_string())
            .bind(&chunk.hash)
            .bind(literal)
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

        let literal = vector_literal(query_vec);

        // ef_search is a per-connection GUC; pin one connection so the
        // setting applies to the query that follows.
        let mut conn = self.pool.acquire().await?;
        sqlx::query(&format!("SET hnsw.ef_search = {}", self.ef_search))
            .execute(&mut *conn)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT content, document_id, chunk_index, similarity
            FROM (
                SELECT content, document_id, chunk_index,
                       GREATEST(0.0, LEAST(1.0, 1.0 - (embedding <=> $1::vector)))::float4 AS similarity
                FROM chunks
                WHERE embedding IS NOT NULL
                  AND ($2::bigint IS NULL OR document_id = $2)
                ORDER BY embedding <=> $1::vector ASC, chunk_index ASC, document_id ASC
                LIMIT $3
            ) ranked
            WHERE similarity >= $4
            ORDER BY similarity DESC, chunk_index ASC, document_id ASC
            "#,
        )
        .bind(&literal)
        .bind(document_id)
        .bind(k.max(0))
        .bind(min_similarity)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SearchHit {
                content: row.get("content"),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                similarity: row.get("similarity"),
            })
            .collect())
    }

    async fn delete(&self, document_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
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
             ORDER BY document_id, chunk_index LIMIT $1 OFFSET $2"
        } else {
            "SELECT document_id, chunk_index, content FROM chunks \
             ORDER BY document_id, chunk_index LIMIT $1 OFFSET $2"
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
                "UPDATE chunks SET embedding = $1::vector \
                 WHERE document_id = $2 AND chunk_index = $3",
            )
            .bind(vector_literal(vector))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_renders_pgvector_syntax() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
