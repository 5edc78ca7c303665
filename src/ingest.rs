//! Ingestion pipeline: extract → chunk → embed → store.
//!
//! Each document ingests independently; a failure aborts that document with
//! the failing stage named, and the store write is all-or-nothing. Bulk
//! re-embedding runs in fixed-size batches with a commit after each batch,
//! so a mid-run failure loses only the in-flight batch.

use thiserror::Error;

use crate::chunk::{self, ChunkError, Tokenizer};
use crate::config::Config;
use crate::embedding::{EmbedError, Embedder};
use crate::extract::{self, ExtractError};
use crate::models::{DocumentFormat, DocumentStatus, NewDocument};
use crate::store::{StoreError, VectorStore};

/// Ingestion failure, tagged with the document and the stage that failed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{filename}: extraction failed: {source}")]
    Extract {
        filename: String,
        #[source]
        source: ExtractError,
    },
    #[error("{filename}: chunking failed: {source}")]
    Chunking {
        filename: String,
        #[source]
        source: ChunkError,
    },
    #[error("{filename}: embedding failed: {source}")]
    Embedding {
        filename: String,
        #[source]
        source: EmbedError,
    },
    #[error("{filename}: store write failed: {source}")]
    Store {
        filename: String,
        #[source]
        source: StoreError,
    },
}

/// Outcome of a successful single-document ingestion.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: i64,
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub page_count: i64,
    pub paragraph_count: i64,
}

/// Outcome of a rebuild run.
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub scanned: usize,
    pub embedded: usize,
    pub batches: usize,
}

/// Ingest one document from raw bytes of the declared format.
pub async fn ingest_bytes(
    store: &dyn VectorStore,
    embedder: &Embedder,
    config: &Config,
    filename: &str,
    format: DocumentFormat,
    bytes: &[u8],
    tokenizer: Option<&dyn Tokenizer>,
) -> Result<IngestReport, IngestError> {
    let extracted = extract::extract_text(bytes, format).map_err(|source| IngestError::Extract {
        filename: filename.to_string(),
        source,
    })?;

    let metadata = serde_json::json!({
        "filename": filename,
        "format": format.as_str(),
    });

    let mut chunks = chunk::chunk_text(&extracted.text, &metadata, &config.chunking, tokenizer)
        .map_err(|source| IngestError::Chunking {
            filename: filename.to_string(),
            source,
        })?;

    let document_id = store
        .create_document(&NewDocument {
            filename: filename.to_string(),
            format,
            page_count: extracted.page_count,
            paragraph_count: extracted.paragraph_count,
        })
        .await
        .map_err(|source| IngestError::Store {
            filename: filename.to_string(),
            source,
        })?;

    tracing::info!(
        document_id,
        chunks = chunks.len(),
        pages = extracted.page_count,
        "ingesting {}",
        filename
    );

    // Embed in provider-sized batches; any batch failure aborts this
    // document before anything is written to the chunk store.
    let mut embedded = 0usize;
    let batch_size = config.embedding.batch_size.max(1);
    for start in (0..chunks.len()).step_by(batch_size) {
        let end = (start + batch_size).min(chunks.len());
        let texts: Vec<String> = chunks[start..end].iter().map(|c| c.content.clone()).collect();
        let vectors = match embedder.embed_batch(&texts).await {
            Ok(v) => v,
            Err(source) => {
                mark_failed(store, document_id).await;
                return Err(IngestError::Embedding {
                    filename: filename.to_string(),
                    source,
                });
            }
        };
        for (chunk, vector) in chunks[start..end].iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
            embedded += 1;
        }
    }

    if let Err(source) = store.add(document_id, &chunks).await {
        mark_failed(store, document_id).await;
        return Err(IngestError::Store {
            filename: filename.to_string(),
            source,
        });
    }

    store
        .set_document_status(document_id, DocumentStatus::Indexed)
        .await
        .map_err(|source| IngestError::Store {
            filename: filename.to_string(),
            source,
        })?;

    Ok(IngestReport {
        document_id,
        chunk_count: chunks.len(),
        embedded_count: embedded,
        page_count: extracted.page_count,
        paragraph_count: extracted.paragraph_count,
    })
}

async fn mark_failed(store: &dyn VectorStore, document_id: i64) {
    if let Err(e) = store
        .set_document_status(document_id, DocumentStatus::Failed)
        .await
    {
        tracing::warn!(document_id, "could not mark document failed: {}", e);
    }
}

/// Re-embed chunks in fixed-size batches, committing after each batch.
///
/// With `missing_only`, only chunks without an embedding are touched
/// (backfill); otherwise every chunk is re-embedded (model change). Either
/// way a rerun after a mid-run failure picks up where the last committed
/// batch left off.
pub async fn rebuild_embeddings(
    store: &dyn VectorStore,
    embedder: &Embedder,
    batch_size: usize,
    missing_only: bool,
) -> Result<RebuildReport, IngestError> {
    let batch_size = batch_size.max(1) as i64;
    let mut report = RebuildReport::default();
    let mut offset = 0i64;

    loop {
        // Backfilled rows leave the missing_only predicate as they commit,
        // so that mode always pages from offset zero.
        let page_offset = if missing_only { 0 } else { offset };
        let refs = store
            .list_chunks(missing_only, page_offset, batch_size)
            .await
            .map_err(|source| IngestError::Store {
                filename: "<rebuild>".to_string(),
                source,
            })?;
        if refs.is_empty() {
            break;
        }

        let texts: Vec<String> = refs.iter().map(|r| r.content.clone()).collect();
        let vectors =
            embedder
                .embed_batch(&texts)
                .await
                .map_err(|source| IngestError::Embedding {
                    filename: "<rebuild>".to_string(),
                    source,
                })?;

        let batch: Vec<_> = refs.into_iter().zip(vectors).collect();
        report.scanned += batch.len();
        store
            .store_embeddings(&batch)
            .await
            .map_err(|source| IngestError::Store {
                filename: "<rebuild>".to_string(),
                source,
            })?;
        report.embedded += batch.len();
        report.batches += 1;
        offset += batch_size;

        tracing::debug!(
            batch = report.batches,
            embedded = report.embedded,
            "rebuild batch committed"
        );
    }

    Ok(report)
}
