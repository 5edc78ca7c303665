//! Storage abstraction for chunk vectors.
//!
//! One [`VectorStore`] contract, two backends: an embedded SQLite store for
//! zero-dependency local use, and a Postgres + pgvector store that keeps
//! vectors transactionally alongside the rest of the schema. Both return the
//! same result shape and the same similarity semantics (cosine, `[0, 1]`,
//! higher is better), so callers never branch on the backend.
//!
//! The backend is chosen once by [`create_store`] at startup, never per
//! call.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::models::{
    Chunk, Document, DocumentStats, DocumentStatus, NewDocument, SearchHit, StoreStats,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid store configuration: {0}")]
    Config(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("document {0} not found")]
    DocumentNotFound(i64),
}

/// A chunk reference handed to the rebuild loop.
#[derive(Debug, Clone)]
pub struct ChunkRef {
    pub document_id: i64,
    pub chunk_index: i64,
    pub content: String,
}

/// Abstract vector store backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_document`](VectorStore::create_document) | Register a document row, returning its id |
/// | [`set_document_status`](VectorStore::set_document_status) | Advance a document's ingestion status |
/// | [`add`](VectorStore::add) | Replace a document's chunk set, transactionally |
/// | [`search`](VectorStore::search) | Ranked cosine-similarity search |
/// | [`delete`](VectorStore::delete) | Remove a document and all its vectors |
/// | [`stats`](VectorStore::stats) | Aggregate counts |
/// | [`list_chunks`](VectorStore::list_chunks) | Page chunk texts for rebuilds |
/// | [`store_embeddings`](VectorStore::store_embeddings) | Commit one rebuild batch |
/// | [`document_overview`](VectorStore::document_overview) | Per-document counts |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_document(&self, doc: &NewDocument) -> Result<i64, StoreError>;

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
    ) -> Result<(), StoreError>;

    async fn get_document(&self, document_id: i64) -> Result<Option<Document>, StoreError>;

    /// Replace the document's chunk set in one transaction.
    ///
    /// Idempotent per `(document_id, chunk_index)`: re-adding the same set
    /// never creates duplicates. All-or-nothing: a failure leaves the
    /// previous chunk set intact.
    async fn add(&self, document_id: i64, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Ranked nearest-neighbor search.
    ///
    /// Results below `min_similarity` are excluded outright. Ordering is
    /// descending similarity, ties broken by ascending `chunk_index`.
    async fn search(
        &self,
        query_vec: &[f32],
        k: i64,
        document_id: Option<i64>,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Remove a document and all its chunks/vectors. Returns whether a
    /// document row was actually deleted.
    async fn delete(&self, document_id: i64) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Page through chunk texts in `(document_id, chunk_index)` order.
    /// With `missing_only`, restricts to chunks without an embedding.
    async fn list_chunks(
        &self,
        missing_only: bool,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ChunkRef>, StoreError>;

    /// Write one batch of embeddings in a single transaction — the rebuild
    /// commit unit.
    async fn store_embeddings(
        &self,
        batch: &[(ChunkRef, Vec<f32>)],
    ) -> Result<(), StoreError>;

    async fn document_overview(&self) -> Result<Vec<DocumentStats>, StoreError>;
}

/// Instantiate the backend named by the configuration.
pub async fn create_store(config: &Config) -> Result<Box<dyn VectorStore>, StoreError> {
    match config.store.backend.as_str() {
        "sqlite" => Ok(Box::new(
            sqlite::SqliteStore::open(&config.store.path, config.embedding.dims).await?,
        )),
        "postgres" => {
            let url = config.store.url.as_deref().ok_or_else(|| {
                StoreError::Config("store.url is required for the postgres backend".to_string())
            })?;
            Ok(Box::new(
                postgres::PostgresStore::connect(url, config.embedding.dims, &config.store.hnsw)
                    .await?,
            ))
        }
        other => Err(StoreError::Config(format!(
            "unknown store backend: {}",
            other
        ))),
    }
}

/// Shared precondition: every chunk must carry an embedding of the store's
/// dimension before `add` writes it.
pub(crate) fn check_dims(chunks: &[Chunk], expected: usize) -> Result<(), StoreError> {
    for chunk in chunks {
        if let Some(embedding) = &chunk.embedding {
            if embedding.len() != expected {
                return Err(StoreError::Dimension {
                    expected,
                    actual: embedding.len(),
                });
            }
        }
    }
    Ok(())
}
