//! Core data models used throughout the ingestion and retrieval pipeline.
//!
//! These types represent the repositories, files, chunks, and retrieval
//! rows that flow between the collector, chunker, store, and retriever.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A repository record owned by a user.
#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub name: String,
    pub created_at: i64,
}

/// Derived ingestion status: a repository without files is still processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Processing,
    Indexed,
}

impl RepoStatus {
    pub fn from_file_count(file_count: i64) -> Self {
        if file_count > 0 {
            RepoStatus::Indexed
        } else {
            RepoStatus::Processing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Processing => "processing",
            RepoStatus::Indexed => "indexed",
        }
    }
}

/// Repository listing row.
#[derive(Debug, Clone, Serialize)]
pub struct RepositorySummary {
    pub repository: Repository,
    pub file_count: i64,
    pub status: RepoStatus,
}

/// File produced by the collector, before it has an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub language: String,
    pub content: String,
}

/// A persisted file.
#[derive(Debug, Clone, Serialize)]
pub struct StoredFile {
    pub id: i64,
    pub repo_id: i64,
    pub path: String,
    pub language: String,
    pub content: String,
}

/// A chunk produced by the chunker, keyed to its file by position in the
/// ingestion batch.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub file_index: usize,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
}

/// A persisted chunk.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: i64,
    pub file_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
}

/// Identifiers assigned by one persistence transaction, aligned with the
/// files and chunks that were passed in.
#[derive(Debug, Clone)]
pub struct PersistedIds {
    pub file_ids: Vec<i64>,
    pub chunk_ids: Vec<i64>,
}

/// Chunk text together with the path of the file it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHit {
    pub chunk_id: i64,
    pub content: String,
    pub file_path: String,
}

/// Metadata stored alongside each vector in a repository index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub chunk_id: i64,
    pub file_path: String,
    pub token_count: i64,
}

/// Deterministic per-ingestion aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub files: usize,
    pub chunks: usize,
    pub languages: BTreeMap<String, usize>,
    pub avg_chunk_size: usize,
    pub ingestion_time_ms: u64,
}

/// A previously produced answer.
#[derive(Debug, Clone, Serialize)]
pub struct CachedAnswer {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub referenced_files: Vec<String>,
    pub token_usage: i64,
    pub latency_ms: i64,
    pub created_at: i64,
}

/// Answer to persist in the cache.
#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub user_id: i64,
    pub repo_id: i64,
    pub question: String,
    pub cache_key: String,
    pub answer: String,
    pub referenced_files: Vec<String>,
    pub token_usage: i64,
    pub latency_ms: i64,
}

/// Per-user totals across all repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardOverview {
    pub total_repos: i64,
    pub total_files: i64,
    pub total_chunks: i64,
    /// Creation time of the user's newest repository record.
    pub last_ingestion: Option<i64>,
}

/// Per-user question-answering usage, aggregated over stored answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub queries: i64,
    pub avg_query_latency_ms: i64,
    pub token_usage: i64,
}
