//! Embedding provider abstraction, FIFO embedding cache, and vector utilities.
//!
//! Providers:
//! - **[`HashingProvider`]** — deterministic offline term-frequency feature
//!   hashing; no model download, stable across processes.
//! - **[`OpenAiProvider`]** — calls the OpenAI embeddings API with batching,
//!   retry, and exponential backoff.
//! - **`FastembedProvider`** — local ONNX inference via fastembed (feature
//!   `local-embeddings`); the model loads once on construction and is shared
//!   read-only afterwards.
//!
//! The [`Embedder`] service owns a provider plus an [`EmbeddingCache`]; the
//! cache key hashes only a truncated prefix of the input (bounded memory,
//! intentionally lossy) and eviction is strict FIFO by insertion order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("invalid embedding configuration: {0}")]
    Config(String),
    #[error("embedding model failed to load: {0}")]
    ModelLoad(String),
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("invalid embedding response: {0}")]
    Response(String),
}

/// A sentence-embedding backend with single and batch APIs.
///
/// `embed_batch` preserves input order and is all-or-nothing: a failure
/// embedding any item fails the whole batch rather than silently zeroing
/// one vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Create the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>, EmbedError> {
    match config.provider.as_str() {
        "hashing" => Ok(Box::new(HashingProvider::new(config.dims))),
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(FastembedProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(EmbedError::Config(
            "local provider requires --features local-embeddings".to_string(),
        )),
        other => Err(EmbedError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Hashing provider ============

/// Deterministic term-frequency feature hashing into a fixed-dimension
/// space, L2-normalized. Identical input always produces the identical
/// vector, across processes, with no model to download.
#[derive(Debug)]
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text.split_whitespace() {
            let token: String = token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[0..8].try_into().unwrap()) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        "feature-hashing"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI provider ============

/// Embedding provider using the OpenAI API.
///
/// Retry strategy: HTTP 429 and 5xx retry with exponential backoff
/// (1s, 2s, 4s, ... capped at 2^5); other 4xx fail immediately; network
/// errors retry.
#[derive(Debug)]
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EmbedError::Config("embedding.model required for openai".to_string()))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(EmbedError::Config(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(Self {
            model,
            dims: config.dims,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EmbedError::Config("OPENAI_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| EmbedError::Request(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EmbedError::Response(e.to_string()))?;
                        return parse_openai_response(&json, self.dims);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(EmbedError::Request(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EmbedError::Request(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EmbedError::Request(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EmbedError::Request("embedding failed after retries".to_string())))
    }
}

fn parse_openai_response(json: &serde_json::Value, dims: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Response("missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Response("missing embedding".to_string()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| EmbedError::Response("non-numeric embedding value".to_string()))
            })
            .collect::<Result<_, _>>()?;

        if vec.len() != dims {
            return Err(EmbedError::Response(format!(
                "expected {} dims, got {}",
                dims,
                vec.len()
            )));
        }

        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Fastembed provider (feature-gated) ============

/// Local ONNX inference via fastembed. The model downloads and loads once
/// at construction; a load failure surfaces immediately as
/// [`EmbedError::ModelLoad`].
#[cfg(feature = "local-embeddings")]
pub struct FastembedProvider {
    model_name: String,
    dims: usize,
    model: std::sync::Arc<Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings")]
impl std::fmt::Debug for FastembedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastembedProvider")
            .field("model_name", &self.model_name)
            .field("dims", &self.dims)
            .finish()
    }
}

#[cfg(feature = "local-embeddings")]
impl FastembedProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let fastembed_model = match model_name.as_str() {
            "all-minilm-l6-v2" => fastembed::EmbeddingModel::AllMiniLML6V2,
            "bge-small-en-v1.5" => fastembed::EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" => fastembed::EmbeddingModel::BGEBaseENV15,
            other => {
                return Err(EmbedError::Config(format!(
                    "unknown local embedding model: '{}'",
                    other
                )))
            }
        };
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| EmbedError::ModelLoad(e.to_string()))?;

        Ok(Self {
            model_name,
            dims: config.dims,
            model: std::sync::Arc::new(Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for FastembedProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let model = std::sync::Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| EmbedError::Request("embedding model mutex poisoned".to_string()))?;
            guard
                .embed(texts, None)
                .map_err(|e| EmbedError::Request(e.to_string()))
        })
        .await
        .map_err(|e| EmbedError::Request(e.to_string()))?
    }
}

// ============ FIFO embedding cache ============

/// Bounded embedding cache keyed by a hash of a truncated input prefix.
///
/// Eviction is strict FIFO by insertion order — a hit does not refresh an
/// entry's position. The truncated key is intentionally lossy: two long
/// inputs sharing a prefix collide, trading exactness for bounded memory.
pub struct EmbeddingCache {
    entries: HashMap<u64, Vec<f32>>,
    order: VecDeque<u64>,
    capacity: usize,
    key_prefix_chars: usize,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, key_prefix_chars: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            key_prefix_chars,
        }
    }

    fn key(&self, text: &str) -> u64 {
        let prefix: String = text.chars().take(self.key_prefix_chars).collect();
        let digest = Sha256::digest(prefix.as_bytes());
        u64::from_le_bytes(digest[0..8].try_into().unwrap())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.get(&self.key(text)).cloned()
    }

    pub fn insert(&mut self, text: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = self.key(text);
        if self.entries.insert(key, vector).is_some() {
            // Overwrite keeps the original insertion-order position.
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============ Embedder service ============

/// Owns a provider plus the embedding cache. Explicitly constructed and
/// injectable, so capacity and key truncation are per-instance and tests
/// never share hidden state.
pub struct Embedder {
    provider: Box<dyn EmbeddingProvider>,
    cache: Mutex<EmbeddingCache>,
}

impl Embedder {
    pub fn new(provider: Box<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            cache: Mutex::new(EmbeddingCache::new(
                config.cache_capacity,
                config.cache_key_chars,
            )),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a single text, consulting the cache first.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if let Some(hit) = self.cache.lock().unwrap().get(text) {
            return Ok(hit);
        }
        let mut vectors = self.provider.embed_batch(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbedError::Response("empty embedding response".to_string()))?;
        self.cache.lock().unwrap().insert(text, vector.clone());
        Ok(vector)
    }

    /// Embed a batch, preserving input order. Cached entries are reused and
    /// only the misses go to the provider; a provider failure fails the
    /// whole batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut uncached_texts = Vec::new();
        let mut uncached_indices = Vec::new();

        {
            let cache = self.cache.lock().unwrap();
            for (i, text) in texts.iter().enumerate() {
                if let Some(hit) = cache.get(text) {
                    results.push(Some(hit));
                } else {
                    uncached_texts.push(text.clone());
                    uncached_indices.push(i);
                    results.push(None);
                }
            }
        }

        if !uncached_texts.is_empty() {
            tracing::debug!(misses = uncached_texts.len(), "embedding cache misses");
            let vectors = self.provider.embed_batch(&uncached_texts).await?;
            if vectors.len() != uncached_texts.len() {
                return Err(EmbedError::Response(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    uncached_texts.len()
                )));
            }
            let mut cache = self.cache.lock().unwrap();
            for ((idx, text), vector) in uncached_indices
                .into_iter()
                .zip(uncached_texts.iter())
                .zip(vectors)
            {
                cache.insert(text, vector.clone());
                results[idx] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap()).collect())
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Raw cosine lives in `[-1, 1]`; retrieval treats anti-correlated vectors
/// as unrelated, so negatives clamp to zero. Returns `0.0` for empty or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingProvider {
        dims: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| HashingProvider::new(self.dims).embed_one(t))
                .collect())
        }
    }

    fn embedder_with(capacity: usize) -> (Embedder, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            dims: 16,
            calls: Arc::clone(&calls),
        };
        let config = EmbeddingConfig {
            cache_capacity: capacity,
            cache_key_chars: 32,
            ..EmbeddingConfig::default()
        };
        (Embedder::new(Box::new(provider), &config), calls)
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let provider = HashingProvider::new(64);
        let a = provider.embed_one("Rust borrow checker");
        let b = provider.embed_one("Rust borrow checker");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_self_similarity_is_one() {
        let provider = HashingProvider::new(64);
        let a = provider.embed_one("identical text twice");
        let b = provider.embed_one("identical text twice");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn vec_blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_clamps_negatives() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn fifo_cache_bound_holds() {
        let mut cache = EmbeddingCache::new(3, 32);
        for i in 0..10 {
            cache.insert(&format!("text {}", i), vec![i as f32]);
        }
        assert_eq!(cache.len(), 3);
        // Newest three survive.
        assert!(cache.get("text 9").is_some());
        assert!(cache.get("text 0").is_none());
    }

    #[test]
    fn fifo_eviction_ignores_access_recency() {
        let mut cache = EmbeddingCache::new(2, 32);
        cache.insert("first", vec![1.0]);
        cache.insert("second", vec![2.0]);
        // Touch "first"; FIFO must still evict it next.
        assert!(cache.get("first").is_some());
        cache.insert("third", vec![3.0]);
        assert!(cache.get("first").is_none());
        assert!(cache.get("second").is_some());
        assert!(cache.get("third").is_some());
    }

    #[test]
    fn truncated_prefix_key_collides_past_prefix() {
        let mut cache = EmbeddingCache::new(10, 8);
        cache.insert("abcdefgh-SUFFIX-ONE", vec![1.0]);
        // Same 8-char prefix; the lossy key maps both to one entry.
        assert!(cache.get("abcdefgh-SUFFIX-TWO").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn embedder_caches_single_embeds() {
        let (embedder, calls) = embedder_with(10);
        let a = embedder.embed("hello world").await.unwrap();
        let b = embedder.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn embedder_batch_preserves_order_and_reuses_cache() {
        let (embedder, calls) = embedder_with(10);
        embedder.embed("cached text").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let texts = vec![
            "cached text".to_string(),
            "new text".to_string(),
            "cached text".to_string(),
        ];
        let results = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], results[2]);
        // One extra provider call, covering only the miss.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(embedder.cache_len(), 2);
    }

    #[tokio::test]
    async fn unknown_provider_is_config_error() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = create_provider(&config).unwrap_err();
        assert!(matches!(err, EmbedError::Config(_)));
    }
}
