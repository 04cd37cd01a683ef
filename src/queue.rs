//! Background worker pool for ingestion jobs.
//!
//! Submitting a job creates (or resets) the repository record, pushes an
//! [`IngestJob`] onto a bounded channel and returns immediately. A fixed
//! number of workers pull jobs and run them through the [`IngestPipeline`]
//! to completion. Terminal status is observable through the repository
//! record and stats snapshot, not through the submit call.
//!
//! Two jobs for the same repository are not de-duplicated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, StoreError};
use crate::ingest::{IngestJob, IngestPipeline};
use crate::models::Repository;

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// Snapshot of finished-job counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub completed: usize,
    pub failed: usize,
}

pub struct IngestQueue {
    pipeline: Arc<IngestPipeline>,
    sender: mpsc::Sender<IngestJob>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl IngestQueue {
    /// Spawn `workers` workers reading from a channel of `capacity` jobs.
    /// Must be called inside a tokio runtime.
    pub fn start(pipeline: Arc<IngestPipeline>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<IngestJob>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let pipeline = Arc::clone(&pipeline);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    debug!(worker_id, "ingest worker started");
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        match pipeline.run(&job).await {
                            Ok(_) => counters.completed.fetch_add(1, Ordering::SeqCst),
                            Err(_) => counters.failed.fetch_add(1, Ordering::SeqCst),
                        };
                    }
                    debug!(worker_id, "ingest worker stopped");
                })
            })
            .collect();

        Self {
            pipeline,
            sender,
            workers: handles,
            counters,
        }
    }

    pub async fn enqueue(&self, job: IngestJob) -> Result<(), QueueError> {
        self.sender.send(job).await.map_err(|_| QueueError::Closed)
    }

    /// Create the placeholder record and enqueue its first ingestion.
    pub async fn submit_ingest(
        &self,
        user_id: i64,
        clone_url: &str,
        branch: &str,
    ) -> Result<Repository, QueueError> {
        let repo = self.pipeline.create_placeholder(user_id, clone_url).await?;
        self.enqueue(IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: branch.to_string(),
            user_id,
        })
        .await?;
        info!(repo_id = repo.id, url = %clone_url, branch, "ingestion queued");
        Ok(repo)
    }

    /// Reset an existing repository owned by `user_id` and enqueue a fresh
    /// ingestion of it. Nothing is reset when the owner does not match.
    pub async fn submit_reingest(
        &self,
        user_id: i64,
        repo_id: i64,
        branch: &str,
    ) -> Result<Repository, QueueError> {
        let repo = self
            .pipeline
            .store()
            .get_repository(repo_id)
            .await?
            .ok_or(StoreError::RepositoryNotFound(repo_id))?;
        if repo.user_id != user_id {
            warn!(repo_id, user_id, owner = repo.user_id, "re-ingestion refused");
            return Err(QueueError::Forbidden(repo_id));
        }

        self.pipeline.reset_repository(repo_id).await?;
        self.enqueue(IngestJob {
            repo_id,
            clone_url: repo.url.clone(),
            branch: branch.to_string(),
            user_id,
        })
        .await?;
        info!(repo_id, branch, "re-ingestion queued");
        Ok(repo)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting jobs, let workers drain what is queued, and wait
    /// for them to exit.
    pub async fn shutdown(self) -> QueueStats {
        let Self {
            sender,
            workers,
            counters,
            ..
        } = self;
        drop(sender);
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest worker panicked");
            }
        }
        QueueStats {
            completed: counters.completed.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
        }
    }
}
