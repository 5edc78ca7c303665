//! Retrieval service: query embedding, cached search, and enrichment.
//!
//! The [`Retriever`] owns its collaborators — embedder, vector store, and an
//! optional query cache — so limits are per-instance and tests never share
//! hidden state. Search failures propagate; an empty hit list is a normal
//! result, not an error, and the two are never conflated.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::embedding::{create_provider, EmbedError, Embedder};
use crate::entities::{self, Entity, Relation};
use crate::models::SearchHit;
use crate::store::{StoreError, VectorStore};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A search request at the external boundary.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub k: i64,
    pub document_id: Option<i64>,
    /// Defaults to the configured `retrieval.min_similarity` when `None`.
    pub min_similarity: Option<f32>,
}

/// Entity/relation enrichment computed over a result set.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

pub struct Retriever {
    embedder: Embedder,
    store: Box<dyn VectorStore>,
    query_cache: Option<Mutex<QueryCache>>,
    default_k: i64,
    default_min_similarity: f32,
}

impl Retriever {
    /// Wire a retriever from configuration and an already-created store.
    pub fn from_config(config: &Config, store: Box<dyn VectorStore>) -> Result<Self, EmbedError> {
        let provider = create_provider(&config.embedding)?;
        let embedder = Embedder::new(provider, &config.embedding);

        // The query cache fronts the local backend; the server-side backend
        // already answers in one round trip against its own index.
        let query_cache = (config.retrieval.query_cache.enabled
            && config.store.backend == "sqlite")
            .then(|| {
                Mutex::new(QueryCache::new(
                    Duration::from_secs(config.retrieval.query_cache.ttl_secs),
                    config.retrieval.query_cache.max_entries,
                ))
            });

        Ok(Self {
            embedder,
            store,
            query_cache,
            default_k: config.retrieval.k,
            default_min_similarity: config.retrieval.min_similarity,
        })
    }

    /// Construct with explicit collaborators (tests, embedding-cache reuse).
    pub fn new(
        embedder: Embedder,
        store: Box<dyn VectorStore>,
        query_cache: Option<QueryCache>,
        default_k: i64,
        default_min_similarity: f32,
    ) -> Self {
        Self {
            embedder,
            store,
            query_cache: query_cache.map(Mutex::new),
            default_k,
            default_min_similarity,
        }
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    pub fn default_k(&self) -> i64 {
        self.default_k
    }

    /// Embed the query and run a ranked nearest-neighbor search.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, SearchError> {
        let k = if request.k > 0 { request.k } else { self.default_k };
        let min_similarity = request
            .min_similarity
            .unwrap_or(self.default_min_similarity);

        // Cache entries are keyed by (query, k) only, so a filtered or
        // custom-threshold request must not be answered from the cache.
        let cacheable = request.document_id.is_none()
            && min_similarity == self.default_min_similarity
            && self.query_cache.is_some();

        if cacheable {
            if let Some(cache) = &self.query_cache {
                if let Some(hits) = cache.lock().unwrap().get(&request.query, k) {
                    tracing::debug!(query = %request.query, k, "query cache hit");
                    return Ok(hits);
                }
            }
        }

        let query_vec = self.embedder.embed(&request.query).await?;
        let hits = self
            .store
            .search(&query_vec, k, request.document_id, min_similarity)
            .await?;

        if cacheable {
            if let Some(cache) = &self.query_cache {
                cache.lock().unwrap().insert(&request.query, k, hits.clone());
            }
        }

        Ok(hits)
    }

    /// Run entity/relation extraction over the hit contents.
    ///
    /// Enrichment can only return less, never fail the search that produced
    /// the hits.
    pub fn enrich(&self, hits: &[SearchHit]) -> Enrichment {
        let text = hits
            .iter()
            .map(|h| h.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let entity_list = entities::extract_entities(&text);
        if entity_list.is_empty() {
            tracing::debug!("no repeated entities in result set");
            return Enrichment::default();
        }
        let relations = entities::extract_relations(&text, &entity_list);

        Enrichment {
            entities: entity_list,
            relations,
        }
    }
}
