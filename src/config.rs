//! TOML configuration parsing and validation.
//!
//! Every tunable the ingestion pipeline and retriever consume lives here:
//! resource caps, chunking parameters, retrieval depth, and the embedding
//! and generation providers. Missing sections fall back to defaults so a
//! minimal file only needs `[db]` and `[data]`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Location of persisted vector indexes and stats snapshots.
#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,
    #[serde(default = "default_max_repo_size_mb")]
    pub max_repo_size_mb: u64,
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,
    /// Extra glob patterns excluded on top of the built-in ignore sets.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_size_kb: default_max_file_size_kb(),
            max_repo_size_mb: default_max_repo_size_mb(),
            clone_timeout_secs: default_clone_timeout_secs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_files() -> usize {
    5000
}
fn default_max_file_size_kb() -> u64 {
    512
}
fn default_max_repo_size_mb() -> u64 {
    200
}
fn default_clone_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: default_chunk_size(),
            overlap_tokens: default_overlap(),
            max_chunks_per_file: default_max_chunks_per_file(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}
fn default_max_chunks_per_file() -> usize {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Row limit for the lexical prefilter. Defaults to `max(200, 50 * top_k)`.
    #[serde(default)]
    pub lexical_candidate_limit: Option<usize>,
    #[serde(default = "default_max_lexical_terms")]
    pub max_lexical_terms: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            lexical_candidate_limit: None,
            max_lexical_terms: default_max_lexical_terms(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

impl RetrievalConfig {
    pub fn candidate_limit(&self) -> usize {
        self.lexical_candidate_limit
            .unwrap_or_else(|| (self.top_k * 50).max(200))
    }
}

fn default_top_k() -> usize {
    4
}
fn default_max_lexical_terms() -> usize {
    12
}
fn default_max_context_tokens() -> usize {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_provider(),
            model: default_embedding_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Enabled by configuration. The credential check happens separately.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.provider != "disabled"
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_chat_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_generation_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_true() -> bool {
    true
}
fn default_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_max_tokens() -> u32 {
    800
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_worker_count() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}

impl Config {
    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size_tokens == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.chunking.max_chunks_per_file == 0 {
            return Err(ConfigError::Invalid(
                "chunking.max_chunks_per_file must be > 0".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.top_k must be >= 1".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding.batch_size must be >= 1".to_string(),
            ));
        }
        if self.workers.count == 0 || self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers.count and workers.queue_capacity must be >= 1".to_string(),
            ));
        }
        for (section, provider) in [
            ("embedding", self.embedding.provider.as_str()),
            ("generation", self.generation.provider.as_str()),
        ] {
            match provider {
                "disabled" | "openai" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "Unknown {} provider: '{}'. Must be disabled or openai.",
                        section, other
                    )))
                }
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
