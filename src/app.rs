//! Wiring of the shared services from a loaded [`Config`].
//!
//! The store, vector index registry and providers are created once and
//! shared by the ingestion pipeline, the retriever and the answer service.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::answer::AnswerService;
use crate::chunk::{Chunker, Cl100kCodec, TokenCodec};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::fetch::{GitFetcher, RepoFetcher};
use crate::generation::{create_generator, Generator};
use crate::ingest::IngestPipeline;
use crate::queue::IngestQueue;
use crate::retrieve::Retriever;
use crate::stats::StatsStore;
use crate::store::{SqliteStore, Store};
use crate::vector_index::VectorIndexRegistry;

/// External collaborators. Defaults come from configuration; tests swap
/// in local fakes.
pub struct Providers {
    pub fetcher: Arc<dyn RepoFetcher>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub generator: Option<Arc<dyn Generator>>,
}

impl Providers {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            fetcher: Arc::new(GitFetcher::new(Duration::from_secs(
                config.limits.clone_timeout_secs,
            ))),
            embedder: create_embedder(&config.embedding)
                .context("Failed to initialize embedding provider")?,
            generator: create_generator(&config.generation)
                .context("Failed to initialize generation provider")?,
        })
    }
}

pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub index: Arc<VectorIndexRegistry>,
    pub stats: StatsStore,
    pub pipeline: Arc<IngestPipeline>,
    pub retriever: Arc<Retriever>,
    pub answers: AnswerService,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        let providers = Providers::from_config(&config)?;
        Self::with_providers(config, providers).await
    }

    pub async fn with_providers(config: Config, providers: Providers) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SqliteStore::open(&config.db.path).await?);
        let index = Arc::new(VectorIndexRegistry::load_all(&config.data.dir));
        let stats = StatsStore::new(&config.data.dir);
        let codec: Arc<dyn TokenCodec> = Arc::new(Cl100kCodec::new()?);
        let chunker = Chunker::from_config(Arc::clone(&codec), &config.chunking)?;
        let dyn_store: Arc<dyn Store> = store.clone();

        let pipeline = IngestPipeline::new(
            Arc::clone(&dyn_store),
            Arc::clone(&index),
            providers.fetcher,
            chunker,
            stats.clone(),
            config.limits.clone(),
        )
        .with_embedder(providers.embedder.clone(), config.embedding.batch_size);

        let retriever = Arc::new(Retriever::new(
            Arc::clone(&dyn_store),
            Arc::clone(&index),
            providers.embedder,
            &config.retrieval,
        ));

        let answers = AnswerService::new(
            dyn_store,
            Arc::clone(&retriever),
            providers.generator,
            codec,
            config.retrieval.max_context_tokens,
        );

        info!(
            db = %config.db.path.display(),
            data_dir = %config.data.dir.display(),
            "services ready"
        );

        Ok(Self {
            config,
            store,
            index,
            stats,
            pipeline: Arc::new(pipeline),
            retriever,
            answers,
        })
    }

    /// Spawn the ingestion worker pool.
    pub fn start_queue(&self) -> IngestQueue {
        IngestQueue::start(
            Arc::clone(&self.pipeline),
            self.config.workers.count,
            self.config.workers.queue_capacity,
        )
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
