//! Sliding-window text chunker.
//!
//! Splits normalized document text into ordered, overlapping windows. When a
//! tokenizer is available the window is sized in tokens; otherwise a
//! chars-per-token heuristic sizes it in characters and the window end snaps
//! back to the nearest preceding sentence boundary to avoid mid-sentence
//! cuts.
//!
//! Chunk indices are contiguous starting at 0, and each chunk carries a
//! SHA-256 hash of its content for staleness detection.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunking configuration: {0}")]
    Config(String),
}

/// Seam for token-space chunking. Implementations must guarantee that
/// `detokenize` losslessly reassembles what `tokenize` produced.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
    fn detokenize(&self, tokens: &[String]) -> String;
}

/// Whitespace word tokenizer. The default when no model tokenizer is wired
/// in; also what tests use, since it needs no vocabulary files.
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn detokenize(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }
}

/// Adapter over a HuggingFace tokenizer file.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ChunkError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ChunkError::Config(format!("failed to load tokenizer: {}", e)))?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        self.inner
            .encode(text, false)
            .map(|enc| enc.get_tokens().to_vec())
            .unwrap_or_default()
    }

    fn detokenize(&self, tokens: &[String]) -> String {
        let ids: Vec<u32> = tokens
            .iter()
            .filter_map(|t| self.inner.token_to_id(t))
            .collect();
        self.inner.decode(&ids, true).unwrap_or_default()
    }
}

/// Collapse runs of whitespace (including newlines) to single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split `text` into ordered overlapping chunks.
///
/// Empty or whitespace-only input yields an empty list. The final partial
/// window is emitted even when shorter than `chunk_size`.
pub fn chunk_text(
    text: &str,
    metadata: &serde_json::Value,
    config: &ChunkingConfig,
    tokenizer: Option<&dyn Tokenizer>,
) -> Result<Vec<Chunk>, ChunkError> {
    if config.chunk_size == 0 {
        return Err(ChunkError::Config("chunk_size must be > 0".to_string()));
    }
    if config.overlap >= config.chunk_size {
        // overlap >= chunk_size means a non-positive stride; fail fast
        // instead of looping.
        return Err(ChunkError::Config(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            config.overlap, config.chunk_size
        )));
    }

    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    match tokenizer {
        Some(tok) => Ok(chunk_by_tokens(&normalized, metadata, config, tok)),
        None => Ok(chunk_by_chars(&normalized, metadata, config)),
    }
}

fn chunk_by_tokens(
    text: &str,
    metadata: &serde_json::Value,
    config: &ChunkingConfig,
    tokenizer: &dyn Tokenizer,
) -> Vec<Chunk> {
    let tokens = tokenizer.tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let stride = config.chunk_size - config.overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let end = (start + config.chunk_size).min(tokens.len());
        let window = &tokens[start..end];
        let content = tokenizer.detokenize(window);
        chunks.push(make_chunk(index, content, window.len() as i64, metadata));
        index += 1;
        if end >= tokens.len() {
            break;
        }
        start += stride;
    }

    chunks
}

fn chunk_by_chars(text: &str, metadata: &serde_json::Value, config: &ChunkingConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let window_chars = config.chunk_size * config.chars_per_token;
    let overlap_chars = config.overlap * config.chars_per_token;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < total {
        let nominal_end = (start + window_chars).min(total);
        let end = if nominal_end < total {
            snap_to_sentence(&chars, start, nominal_end, config.sentence_snap_ratio)
        } else {
            nominal_end
        };

        let content: String = chars[start..end].iter().collect();
        let token_count = estimate_tokens(end - start, config.chars_per_token);
        chunks.push(make_chunk(index, content, token_count, metadata));
        index += 1;

        if end >= total {
            break;
        }
        // Stride is relative to the (possibly snapped) end so overlap stays
        // constant and concatenation remains lossless.
        start = (end.saturating_sub(overlap_chars)).max(start + 1);
    }

    chunks
}

/// Snap the window end back to the nearest preceding `". "` boundary, but
/// only when that boundary keeps at least `snap_ratio` of the nominal
/// window.
fn snap_to_sentence(chars: &[char], start: usize, nominal_end: usize, snap_ratio: f64) -> usize {
    let window_len = nominal_end - start;
    let min_end = start + (window_len as f64 * snap_ratio).ceil() as usize;

    let mut i = nominal_end.saturating_sub(2);
    while i > start {
        if chars[i] == '.' && chars[i + 1] == ' ' {
            let boundary = i + 2;
            if boundary >= min_end && boundary <= nominal_end {
                return boundary;
            }
            break;
        }
        i -= 1;
    }
    nominal_end
}

fn estimate_tokens(char_len: usize, chars_per_token: usize) -> i64 {
    (char_len.div_ceil(chars_per_token)) as i64
}

fn make_chunk(index: i64, content: String, token_count: i64, metadata: &serde_json::Value) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        chunk_index: index,
        content,
        token_count,
        embedding: None,
        metadata: metadata.clone(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            overlap,
            ..ChunkingConfig::default()
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let meta = serde_json::json!({});
        let chunks = chunk_text("", &meta, &config(50, 10), Some(&WhitespaceTokenizer)).unwrap();
        assert!(chunks.is_empty());
        let chunks = chunk_text("   \n\t  ", &meta, &config(50, 10), None).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn overlap_at_least_chunk_size_fails_fast() {
        let meta = serde_json::json!({});
        let err = chunk_text("some text", &meta, &config(10, 10), None).unwrap_err();
        assert!(matches!(err, ChunkError::Config(_)));
        let err = chunk_text("some text", &meta, &config(10, 12), None).unwrap_err();
        assert!(matches!(err, ChunkError::Config(_)));
    }

    #[test]
    fn token_windows_match_count_formula() {
        // ceil((total - overlap) / (chunk_size - overlap)) windows.
        let meta = serde_json::json!({});
        let total = 203;
        let text = words(total);
        let chunks =
            chunk_text(&text, &meta, &config(50, 10), Some(&WhitespaceTokenizer)).unwrap();
        let expected = (total - 10 + (50 - 10) - 1) / (50 - 10);
        assert_eq!(chunks.len(), expected);
        assert_eq!(chunks[0].token_count, 50);
    }

    #[test]
    fn indices_contiguous_from_zero() {
        let meta = serde_json::json!({});
        let text = words(500);
        let chunks =
            chunk_text(&text, &meta, &config(50, 10), Some(&WhitespaceTokenizer)).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn final_partial_window_emitted() {
        let meta = serde_json::json!({});
        let text = words(55);
        let chunks =
            chunk_text(&text, &meta, &config(50, 10), Some(&WhitespaceTokenizer)).unwrap();
        assert_eq!(chunks.len(), 2);
        // 55 tokens, second window starts at 40.
        assert_eq!(chunks[1].token_count, 15);
    }

    #[test]
    fn deoverlapped_concatenation_reconstructs_text() {
        let meta = serde_json::json!({});
        let text = "one  two\nthree\t four five six seven eight nine ten";
        let normalized = normalize_whitespace(text);
        let chunks = chunk_text(text, &meta, &config(4, 1), Some(&WhitespaceTokenizer)).unwrap();

        let mut rebuilt: Vec<String> = Vec::new();
        for (i, c) in chunks.iter().enumerate() {
            let tokens: Vec<String> = c.content.split_whitespace().map(str::to_string).collect();
            let skip = if i == 0 { 0 } else { 1 };
            rebuilt.extend(tokens.into_iter().skip(skip));
        }
        assert_eq!(rebuilt.join(" "), normalized);
    }

    #[test]
    fn char_mode_snaps_to_sentence_boundary() {
        let meta = serde_json::json!({});
        // chunk_size 10, chars_per_token 4 => 40-char windows; a period near
        // the window end should become the cut point.
        let cfg = ChunkingConfig {
            chunk_size: 10,
            overlap: 0,
            chars_per_token: 4,
            sentence_snap_ratio: 0.7,
        };
        let text = "This sentence runs thirty chars. The next one keeps going for a while longer.";
        let chunks = chunk_text(text, &meta, &cfg, None).unwrap();
        assert!(chunks.len() >= 2);
        assert!(
            chunks[0].content.ends_with(". "),
            "expected sentence cut, got: {:?}",
            chunks[0].content
        );
    }

    #[test]
    fn char_mode_ignores_early_boundary() {
        let meta = serde_json::json!({});
        let cfg = ChunkingConfig {
            chunk_size: 10,
            overlap: 0,
            chars_per_token: 4,
            sentence_snap_ratio: 0.7,
        };
        // Only boundary sits at ~25% of the window; too early to snap.
        let text = "Short one. Then an unbroken stretch of text that just keeps on going and going";
        let chunks = chunk_text(text, &meta, &cfg, None).unwrap();
        assert!(!chunks[0].content.ends_with(". "));
        assert_eq!(chunks[0].content.chars().count(), 40);
    }

    #[test]
    fn char_mode_emits_final_partial_window() {
        let meta = serde_json::json!({});
        let cfg = ChunkingConfig {
            chunk_size: 10,
            overlap: 2,
            chars_per_token: 4,
            sentence_snap_ratio: 0.7,
        };
        let text = "x".repeat(100);
        let chunks = chunk_text(&text, &meta, &cfg, None).unwrap();
        let total: usize = chunks.last().unwrap().content.len();
        assert!(total > 0 && total <= 40);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn metadata_propagates_to_every_chunk() {
        let meta = serde_json::json!({"filename": "report.txt"});
        let text = words(120);
        let chunks =
            chunk_text(&text, &meta, &config(50, 10), Some(&WhitespaceTokenizer)).unwrap();
        for c in &chunks {
            assert_eq!(c.metadata["filename"], "report.txt");
        }
    }

    #[test]
    fn identical_content_hashes_equal() {
        let meta = serde_json::json!({});
        let a = chunk_text("same text here", &meta, &config(50, 10), None).unwrap();
        let b = chunk_text("same text here", &meta, &config(50, 10), None).unwrap();
        assert_eq!(a[0].hash, b[0].hash);
    }
}
