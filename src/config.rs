use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"sqlite"` (embedded local) or `"postgres"` (server-side pgvector).
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite database file path.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Postgres connection URL, required for the `postgres` backend.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub hnsw: HnswConfig,
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/kbase.sqlite")
}

/// Construction/search quality parameters for the server-side HNSW index.
#[derive(Debug, Deserialize, Clone)]
pub struct HnswConfig {
    #[serde(default = "default_hnsw_m")]
    pub m: u32,
    #[serde(default = "default_hnsw_ef_construction")]
    pub ef_construction: u32,
    #[serde(default = "default_hnsw_ef_search")]
    pub ef_search: u32,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: default_hnsw_m(),
            ef_construction: default_hnsw_ef_construction(),
            ef_search: default_hnsw_ef_search(),
        }
    }
}

fn default_hnsw_m() -> u32 {
    16
}
fn default_hnsw_ef_construction() -> u32 {
    64
}
fn default_hnsw_ef_search() -> u32 {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in tokens.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Tokens shared between consecutive windows. Must be < `chunk_size`.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// Chars-per-token heuristic for the character-window fallback.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Snap a window end back to a `". "` boundary when the boundary falls
    /// within this fraction of the nominal window.
    #[serde(default = "default_sentence_snap_ratio")]
    pub sentence_snap_ratio: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            chars_per_token: default_chars_per_token(),
            sentence_snap_ratio: default_sentence_snap_ratio(),
        }
    }
}

fn default_chunk_size() -> usize {
    400
}
fn default_overlap() -> usize {
    50
}
fn default_chars_per_token() -> usize {
    4
}
fn default_sentence_snap_ratio() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hashing"`, `"openai"`, or `"local"` (requires the
    /// `local-embeddings` feature).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum resident entries in the embedding cache (FIFO eviction).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Cache keys hash only this many leading characters of the input.
    #[serde(default = "default_cache_key_chars")]
    pub cache_key_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
            cache_key_chars: default_cache_key_chars(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_cache_key_chars() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: i64,
    /// Results below this cosine similarity are excluded outright.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default)]
    pub query_cache: QueryCacheConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            min_similarity: default_min_similarity(),
            query_cache: QueryCacheConfig::default(),
        }
    }
}

fn default_k() -> i64 {
    5
}
fn default_min_similarity() -> f32 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryCacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_max_entries() -> usize {
    128
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }

    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }

    if config.chunking.chars_per_token == 0 {
        anyhow::bail!("chunking.chars_per_token must be > 0");
    }

    if !(0.0..=1.0).contains(&config.chunking.sentence_snap_ratio) {
        anyhow::bail!("chunking.sentence_snap_ratio must be in [0.0, 1.0]");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hashing" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, or local.",
            other
        ),
    }

    if config.retrieval.k < 1 {
        anyhow::bail!("retrieval.k must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }

    match config.store.backend.as_str() {
        "sqlite" => {}
        "postgres" => {
            if config.store.url.is_none() {
                anyhow::bail!("store.url is required for the postgres backend");
            }
        }
        other => anyhow::bail!("Unknown store backend: '{}'. Must be sqlite or postgres.", other),
    }

    Ok(())
}
