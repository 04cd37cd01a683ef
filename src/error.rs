//! Error types for the ingestion and retrieval core.
//!
//! Each seam gets its own enum so callers can decide between degrading
//! (embedding, indexing) and aborting (clone, persistence).

/// Invalid configuration. Fatal at startup or first use.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunking.chunk_size_tokens must be > 0")]
    InvalidChunkSize,

    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("{0}")]
    Invalid(String),
}

/// Relational store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository not found: {0}")]
    RepositoryNotFound(i64),
}

/// Vector index failure.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{vectors} vectors but {metadata} metadata rows")]
    LengthMismatch { vectors: usize, metadata: usize },

    #[error("corrupt index file: {0}")]
    Corrupt(String),
}

/// Repository fetch (clone) failure.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("clone timed out after {0}s")]
    Timeout(u64),

    #[error("clone exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Embedding provider failure.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("missing credential: {0} is not set")]
    MissingCredential(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Text generation failure.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation provider is disabled")]
    Disabled,

    #[error("missing credential: {0} is not set")]
    MissingCredential(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Reasons an ingestion job is abandoned.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("repository {0} is missing or owned by another user")]
    RepositoryUnavailable(i64),

    #[error("failed to prepare checkout directory: {0}")]
    Workspace(std::io::Error),

    #[error("clone failed: {0}")]
    Clone(#[from] FetchError),

    #[error("repository is {size_mb:.2} MB, limit is {limit_mb} MB")]
    RepositoryTooLarge { size_mb: f64, limit_mb: u64 },

    #[error("file collection failed: {0}")]
    Collect(String),

    #[error("no readable source files")]
    NoFiles,

    #[error("no chunks produced")]
    NoChunks,

    #[error("persistence failed: {0}")]
    Persist(#[from] StoreError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// Whether the placeholder repository record should be removed.
    pub fn requires_cleanup(&self) -> bool {
        !matches!(self, IngestError::RepositoryUnavailable(_))
    }
}

/// Job submission failure.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("ingestion queue is shut down")]
    Closed,

    #[error("repository {0} belongs to another user")]
    Forbidden(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Question answering failure.
#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("question cannot be empty")]
    EmptyQuestion,

    #[error("repository not found: {0}")]
    RepositoryNotFound(i64),

    #[error("repository {0} belongs to another user")]
    Forbidden(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
}
