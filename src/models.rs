//! Core data types flowing through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Declared input format of an uploaded document.
///
/// Extraction dispatches on the declared format, never on sniffed content;
/// anything else fails closed in [`crate::extract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Doc,
    Txt,
    Md,
}

impl DocumentFormat {
    /// Map a file extension to a format. `None` means unsupported.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "doc" => Some(Self::Doc),
            "txt" => Some(Self::Txt),
            "md" => Some(Self::Md),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Txt => "txt",
            Self::Md => "md",
        }
    }
}

/// Lifecycle state of a document row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "indexed" => Self::Indexed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Metadata for a document about to be registered in the store.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub format: DocumentFormat,
    pub page_count: i64,
    pub paragraph_count: i64,
}

/// A document row as stored by a backend.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub filename: String,
    pub format: String,
    pub page_count: i64,
    pub paragraph_count: i64,
    pub status: DocumentStatus,
    pub created_at: i64,
}

/// A bounded slice of a document's text — the unit of embedding and retrieval.
///
/// Chunks are immutable once created; re-ingestion replaces a document's
/// whole chunk set rather than mutating rows in place. `chunk_index` values
/// are contiguous starting at 0 within one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    /// Present once the chunk has been embedded; fixed length per model.
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    /// SHA-256 of `content`, used for staleness detection during rebuilds.
    pub hash: String,
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub document_id: i64,
    pub chunk_index: i64,
    /// Cosine similarity clamped to `[0, 1]`; higher is better.
    pub similarity: f32,
}

/// Aggregate counts reported by a vector store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub chunk_count: i64,
    pub chunks_with_embeddings: i64,
    pub document_count: i64,
}

/// Per-document counts for the `kb stats` breakdown.
#[derive(Debug, Clone)]
pub struct DocumentStats {
    pub id: i64,
    pub filename: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub embedded_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("md"), Some(DocumentFormat::Md));
        assert_eq!(DocumentFormat::from_extension("exe"), None);
    }

    #[test]
    fn status_round_trip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Indexed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), status);
        }
    }
}
