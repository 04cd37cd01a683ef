//! Ingestion orchestrator.
//!
//! One job takes a repository from clone to persisted, searchable chunks:
//!
//! ```text
//! Created → Cloning → ValidatingSize → ReadingFiles → Persisting
//!         → Embedding (optional) → Indexing (optional) → Complete
//! ```
//!
//! Any stage up to and including persistence can abort the job. When it
//! does, the placeholder repository record is deleted (cascading to any
//! rows) so a half-ingested repository is never visible. Embedding and
//! indexing failures are logged and swallowed; the repository then serves
//! lexical retrieval only.
//!
//! Files are chunked before the persistence transaction opens, so both
//! bulk inserts commit or roll back together.

use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::chunk::Chunker;
use crate::collector::{self, CollectLimits};
use crate::config::LimitsConfig;
use crate::embedding::{embed_in_batches, Embedder};
use crate::error::{IngestError, StoreError};
use crate::fetch::RepoFetcher;
use crate::models::{EmbeddingMetadata, NewChunk, PersistedIds, Repository, RepositoryStats, SourceFile};
use crate::stats::{self, StatsStore};
use crate::store::Store;
use crate::vector_index::VectorIndexRegistry;

/// Work descriptor handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestJob {
    pub repo_id: i64,
    pub clone_url: String,
    pub branch: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Created,
    Cloning,
    ValidatingSize,
    ReadingFiles,
    Persisting,
    Embedding,
    Indexing,
    Complete,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Created => "created",
            JobStage::Cloning => "cloning",
            JobStage::ValidatingSize => "validating_size",
            JobStage::ReadingFiles => "reading_files",
            JobStage::Persisting => "persisting",
            JobStage::Embedding => "embedding",
            JobStage::Indexing => "indexing",
            JobStage::Complete => "complete",
            JobStage::Failed => "failed",
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub stats: RepositoryStats,
    /// Vectors appended to the repository index. Zero when embeddings are
    /// off or the embedding step failed.
    pub vectors_indexed: usize,
}

/// Repository name from a clone URL: last path segment without `.git`.
pub fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

/// Chunk every file, tagging each chunk with its file's batch position and
/// a gap-free per-file sequence index.
pub fn chunk_files(chunker: &Chunker, files: &[SourceFile]) -> Vec<NewChunk> {
    let mut chunks = Vec::new();
    for (file_index, file) in files.iter().enumerate() {
        for (chunk_index, piece) in chunker.chunk(&file.content).into_iter().enumerate() {
            chunks.push(NewChunk {
                file_index,
                chunk_index: chunk_index as i64,
                content: piece.text,
                token_count: piece.token_count as i64,
            });
        }
    }
    chunks
}

/// Runs ingestion jobs against shared store and index state.
pub struct IngestPipeline {
    store: Arc<dyn Store>,
    index: Arc<VectorIndexRegistry>,
    fetcher: Arc<dyn RepoFetcher>,
    embedder: Option<Arc<dyn Embedder>>,
    chunker: Chunker,
    stats: StatsStore,
    limits: LimitsConfig,
    embed_batch_size: usize,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<VectorIndexRegistry>,
        fetcher: Arc<dyn RepoFetcher>,
        chunker: Chunker,
        stats: StatsStore,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            store,
            index,
            fetcher,
            embedder: None,
            chunker,
            stats,
            limits,
            embed_batch_size: 64,
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>, batch_size: usize) -> Self {
        self.embedder = embedder;
        self.embed_batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create the placeholder record a job will fill. The repository is
    /// visible as `processing` until persistence succeeds.
    pub async fn create_placeholder(
        &self,
        user_id: i64,
        url: &str,
    ) -> Result<Repository, StoreError> {
        self.store
            .create_repository(user_id, url, &repo_name_from_url(url))
            .await
    }

    /// Run one job to completion. Failures before persistence succeeds
    /// remove the repository record unless the record was never ours.
    pub async fn run(&self, job: &IngestJob) -> Result<IngestOutcome, IngestError> {
        let started = Instant::now();
        info!(repo_id = job.repo_id, url = %job.clone_url, branch = %job.branch, "ingestion started");

        match self.execute(job, started).await {
            Ok(outcome) => {
                info!(
                    repo_id = job.repo_id,
                    stage = JobStage::Complete.as_str(),
                    files = outcome.stats.files,
                    chunks = outcome.stats.chunks,
                    vectors = outcome.vectors_indexed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ingestion complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    repo_id = job.repo_id,
                    stage = JobStage::Failed.as_str(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ingestion aborted"
                );
                if e.requires_cleanup() {
                    self.cleanup(job.repo_id).await;
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &IngestJob, started: Instant) -> Result<IngestOutcome, IngestError> {
        let repo_id = job.repo_id;
        self.enter(repo_id, JobStage::Created);

        match self.store.get_repository(repo_id).await? {
            Some(repo) if repo.user_id == job.user_id => {}
            _ => return Err(IngestError::RepositoryUnavailable(repo_id)),
        }

        // Removed with everything in it when `workspace` drops.
        let workspace = TempDir::new().map_err(IngestError::Workspace)?;
        let checkout = workspace.path().join("repo");

        self.enter(repo_id, JobStage::Cloning);
        let clone_started = Instant::now();
        self.fetcher
            .fetch(&job.clone_url, &job.branch, &checkout)
            .await?;
        debug!(repo_id, elapsed_ms = clone_started.elapsed().as_millis() as u64, "clone finished");

        self.enter(repo_id, JobStage::ValidatingSize);
        let root = checkout.clone();
        let size_bytes = tokio::task::spawn_blocking(move || collector::tree_size_bytes(&root))
            .await?
            .map_err(|e| IngestError::Collect(e.to_string()))?;
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        if size_mb > self.limits.max_repo_size_mb as f64 {
            return Err(IngestError::RepositoryTooLarge {
                size_mb,
                limit_mb: self.limits.max_repo_size_mb,
            });
        }

        self.enter(repo_id, JobStage::ReadingFiles);
        let root = checkout.clone();
        let limits = CollectLimits::from(&self.limits);
        let files = tokio::task::spawn_blocking(move || collector::collect(&root, &limits))
            .await?
            .map_err(|e| IngestError::Collect(e.to_string()))?;
        if files.is_empty() {
            return Err(IngestError::NoFiles);
        }
        info!(repo_id, files = files.len(), size_mb, "files collected");

        self.enter(repo_id, JobStage::Persisting);
        let chunker = self.chunker.clone();
        let (files, chunks) = tokio::task::spawn_blocking(move || {
            let chunks = chunk_files(&chunker, &files);
            (files, chunks)
        })
        .await?;
        if chunks.is_empty() {
            return Err(IngestError::NoChunks);
        }

        let ids = self
            .store
            .persist_files_and_chunks(repo_id, &files, &chunks)
            .await?;
        info!(
            repo_id,
            files = ids.file_ids.len(),
            chunks = ids.chunk_ids.len(),
            "files and chunks persisted"
        );

        let stats = stats::compute(&files, &chunks, started.elapsed().as_millis() as u64);
        if let Err(e) = self.stats.write(repo_id, &stats) {
            warn!(repo_id, error = %e, "failed to write stats snapshot");
        }

        let vectors_indexed = match &self.embedder {
            Some(embedder) => self
                .embed_and_index(repo_id, embedder.as_ref(), &files, &chunks, &ids)
                .await
                .unwrap_or(0),
            None => {
                info!(repo_id, "embeddings disabled; lexical retrieval only");
                0
            }
        };

        Ok(IngestOutcome {
            stats,
            vectors_indexed,
        })
    }

    /// Optional stages. `None` means the step failed and was skipped.
    async fn embed_and_index(
        &self,
        repo_id: i64,
        embedder: &dyn Embedder,
        files: &[SourceFile],
        chunks: &[NewChunk],
        ids: &PersistedIds,
    ) -> Option<usize> {
        self.enter(repo_id, JobStage::Embedding);
        let embed_started = Instant::now();
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = match embed_in_batches(embedder, &texts, self.embed_batch_size).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(repo_id, error = %e, model = embedder.model_name(), "embedding failed; lexical retrieval only");
                return None;
            }
        };
        debug!(
            repo_id,
            vectors = vectors.len(),
            elapsed_ms = embed_started.elapsed().as_millis() as u64,
            "embedding finished"
        );

        self.enter(repo_id, JobStage::Indexing);
        let mut usable = Vec::with_capacity(vectors.len());
        let mut metadata = Vec::with_capacity(vectors.len());
        for (position, vector) in vectors.into_iter().enumerate() {
            let (Some(chunk), Some(&chunk_id)) = (chunks.get(position), ids.chunk_ids.get(position))
            else {
                continue;
            };
            let Some(file) = files.get(chunk.file_index) else {
                continue;
            };
            metadata.push(EmbeddingMetadata {
                chunk_id,
                file_path: file.path.clone(),
                token_count: chunk.token_count,
            });
            usable.push(vector);
        }
        if usable.len() < chunks.len() {
            warn!(
                repo_id,
                dropped = chunks.len() - usable.len(),
                "dropping vectors without a persisted chunk"
            );
        }

        let count = usable.len();
        match self.index.add(repo_id, &usable, metadata) {
            Ok(()) => Some(count),
            Err(e) => {
                warn!(repo_id, error = %e, "vector indexing failed; lexical retrieval only");
                None
            }
        }
    }

    fn enter(&self, repo_id: i64, stage: JobStage) {
        debug!(repo_id, stage = stage.as_str(), "stage");
    }

    async fn cleanup(&self, repo_id: i64) {
        if let Err(e) = self.store.delete_repository(repo_id).await {
            error!(repo_id, error = %e, "cleanup failed to delete repository record");
        }
        self.remove_side_state(repo_id);
    }

    fn remove_side_state(&self, repo_id: i64) {
        if let Err(e) = self.stats.delete(repo_id) {
            warn!(repo_id, error = %e, "failed to delete stats snapshot");
        }
        if let Err(e) = self.index.delete(repo_id) {
            warn!(repo_id, error = %e, "failed to delete vector index");
        }
    }

    /// Drop a repository's chunks and files in one transaction, then
    /// best-effort remove its stats snapshot and vector index. The
    /// repository record survives.
    pub async fn reset_repository(&self, repo_id: i64) -> Result<(), StoreError> {
        self.store.clear_repository_data(repo_id).await?;
        self.remove_side_state(repo_id);
        info!(repo_id, "repository data reset");
        Ok(())
    }

    /// Delete the repository record (cascading), then its side state.
    pub async fn delete_repository(&self, repo_id: i64) -> Result<(), StoreError> {
        self.store.delete_repository(repo_id).await?;
        self.remove_side_state(repo_id);
        info!(repo_id, "repository deleted");
        Ok(())
    }
}
