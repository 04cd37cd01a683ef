//! Token-window chunker with overlap.
//!
//! Text is encoded with a fixed tokenizer (`cl100k_base`), then sliced
//! into windows of `chunk_size` tokens. Consecutive windows share
//! `overlap` tokens. Each window is decoded back to text and paired with
//! the exact token count of its slice.
//!
//! # Algorithm
//!
//! 1. `cursor = 0`.
//! 2. Emit tokens `[cursor, min(cursor + chunk_size, len))`.
//! 3. `next = end - overlap`; if `next <= cursor`, use `end` instead.
//! 4. Repeat while `cursor < len` and fewer than `max_chunks` were emitted.
//!
//! An overlap of `chunk_size` or more is clamped to `chunk_size - 1` with a
//! warning, so the cursor always moves forward.

use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::config::ChunkingConfig;
use crate::error::ConfigError;

/// Reversible text ↔ token mapping.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode a token slice. Byte sequences cut mid-character decode to
    /// U+FFFD instead of failing.
    fn decode(&self, tokens: &[u32]) -> String;

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// The `cl100k_base` byte-pair encoding.
pub struct Cl100kCodec {
    bpe: CoreBPE,
}

impl Cl100kCodec {
    pub fn new() -> Result<Self, ConfigError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| ConfigError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenCodec for Cl100kCodec {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        // Join bytes before UTF-8 validation so only characters cut at the
        // slice edges are replaced.
        let bytes: Vec<u8> = self
            .bpe
            ._decode_native_and_split(tokens.iter().map(|&t| t as _).collect())
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One emitted window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub token_count: usize,
}

/// Chunker parameters after validation and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_chunks: usize,
}

impl ChunkParams {
    /// Validate `chunk_size > 0` and clamp an overlap that would stall the cursor.
    pub fn new(chunk_size: usize, overlap: usize, max_chunks: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        let overlap = if overlap >= chunk_size {
            let clamped = chunk_size.saturating_sub(1);
            warn!(
                overlap,
                chunk_size, clamped, "overlap >= chunk size; clamping overlap"
            );
            clamped
        } else {
            overlap
        };
        Ok(Self {
            chunk_size,
            overlap,
            max_chunks,
        })
    }
}

/// Splits text into overlapping token windows.
#[derive(Clone)]
pub struct Chunker {
    codec: Arc<dyn TokenCodec>,
    params: ChunkParams,
}

impl Chunker {
    pub fn new(codec: Arc<dyn TokenCodec>, params: ChunkParams) -> Self {
        Self { codec, params }
    }

    pub fn from_config(
        codec: Arc<dyn TokenCodec>,
        config: &ChunkingConfig,
    ) -> Result<Self, ConfigError> {
        let params = ChunkParams::new(
            config.chunk_size_tokens,
            config.overlap_tokens,
            config.max_chunks_per_file,
        )?;
        Ok(Self::new(codec, params))
    }

    pub fn params(&self) -> ChunkParams {
        self.params
    }

    pub fn codec(&self) -> &Arc<dyn TokenCodec> {
        &self.codec
    }

    /// Chunk `text`. Empty text yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let tokens = self.codec.encode(text);
        window_bounds(tokens.len(), self.params)
            .into_iter()
            .map(|(start, end)| TextChunk {
                text: self.codec.decode(&tokens[start..end]),
                token_count: end - start,
            })
            .collect()
    }
}

/// `[start, end)` token ranges for a sequence of `len` tokens.
pub fn window_bounds(len: usize, params: ChunkParams) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut cursor = 0usize;

    while cursor < len {
        if bounds.len() >= params.max_chunks {
            warn!(
                max_chunks = params.max_chunks,
                total_tokens = len,
                "max chunks per file reached; truncating"
            );
            break;
        }
        let end = (cursor + params.chunk_size).min(len);
        bounds.push((cursor, end));

        let mut next = end.saturating_sub(params.overlap);
        if next <= cursor {
            next = end;
        }
        cursor = next;
    }

    bounds
}
