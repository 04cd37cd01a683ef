use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use repo_lens::answer::NO_CONTEXT_ANSWER;
use repo_lens::app::{App, Providers};
use repo_lens::config::Config;
use repo_lens::embedding::Embedder;
use repo_lens::error::{EmbeddingError, FetchError, GenerationError, IngestError, QueueError};
use repo_lens::fetch::RepoFetcher;
use repo_lens::generation::{Generation, Generator};
use repo_lens::ingest::IngestJob;
use repo_lens::retrieve::RetrievalMode;
use repo_lens::store::Store;
use repo_lens::vector_index::{index_path, metadata_path};

/// Copies whatever is currently under `source` into the clone destination.
struct DirFetcher {
    source: PathBuf,
}

#[async_trait]
impl RepoFetcher for DirFetcher {
    async fn fetch(&self, _url: &str, _branch: &str, dest: &Path) -> Result<(), FetchError> {
        for entry in walkdir::WalkDir::new(&self.source) {
            let entry = entry.map_err(|e| FetchError::Spawn(e.into()))?;
            let rel = entry.path().strip_prefix(&self.source).unwrap();
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

struct FailingFetcher;

#[async_trait]
impl RepoFetcher for FailingFetcher {
    async fn fetch(&self, _url: &str, _branch: &str, _dest: &Path) -> Result<(), FetchError> {
        Err(FetchError::Failed {
            code: Some(128),
            stderr: "fatal: repository not found".to_string(),
        })
    }
}

/// Bag-of-words hashed into 16 buckets.
struct HashEmbedder;

fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 16];
    for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let bucket = word.bytes().map(|b| b as usize).sum::<usize>() % 16;
        v[bucket] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-16"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Api {
            status: 503,
            body: "unavailable".to_string(),
        })
    }
}

#[derive(Default)]
struct RecordingGenerator {
    calls: AtomicUsize,
    last_user_prompt: Mutex<String>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn generate(&self, _system: &str, user: &str) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_user_prompt.lock().unwrap() = user.to_string();
        Ok(Generation {
            text: "The tokenizer lives in lexer.rs.".to_string(),
            token_usage: 17,
        })
    }
}

struct Env {
    _tmp: TempDir,
    source: PathBuf,
    data_dir: PathBuf,
    config: Config,
}

fn setup_env() -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    let source = root.join("source");
    fs::create_dir_all(source.join("src")).unwrap();
    fs::write(
        source.join("src/lexer.rs"),
        "pub fn tokenize(input: &str) -> Vec<Token> {\n    // the lexer splits input into tokens\n    input.split_whitespace().map(Token::from).collect()\n}\n",
    )
    .unwrap();
    fs::write(
        source.join("src/parser.rs"),
        "pub fn parse(tokens: &[Token]) -> Ast {\n    // the parser builds an ast from tokens\n    Ast::new(tokens)\n}\n",
    )
    .unwrap();
    fs::write(source.join("README.md"), "# Demo\n\nA tiny compiler used in tests.\n").unwrap();

    let data_dir = root.join("data");
    let content = format!(
        "[db]\npath = \"{}\"\n\n[data]\ndir = \"{}\"\n\n[chunking]\nchunk_size_tokens = 24\noverlap_tokens = 4\n\n[embedding]\nenabled = false\n\n[generation]\nprovider = \"disabled\"\n\n[workers]\ncount = 2\n",
        root.join("db/rlens.sqlite").display(),
        data_dir.display()
    );
    let config: Config = toml::from_str(&content).unwrap();

    Env {
        _tmp: tmp,
        source,
        data_dir,
        config,
    }
}

async fn open_app(
    env: &Env,
    fetcher: Arc<dyn RepoFetcher>,
    embedder: Option<Arc<dyn Embedder>>,
    generator: Option<Arc<dyn Generator>>,
) -> App {
    App::with_providers(
        env.config.clone(),
        Providers {
            fetcher,
            embedder,
            generator,
        },
    )
    .await
    .unwrap()
}

fn dir_fetcher(env: &Env) -> Arc<dyn RepoFetcher> {
    Arc::new(DirFetcher {
        source: env.source.clone(),
    })
}

async fn chunk_ids(app: &App, repo_id: i64) -> Vec<i64> {
    let mut ids = Vec::new();
    for file in app.store.list_files(repo_id).await.unwrap() {
        for chunk in app.store.list_chunks_by_file(file.id).await.unwrap() {
            ids.push(chunk.id);
        }
    }
    ids.sort();
    ids
}

#[tokio::test]
async fn test_queued_ingest_then_lexical_retrieval() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), None, None).await;

    let queue = app.start_queue();
    let repo = queue
        .submit_ingest(1, "https://example.com/acme/compiler.git", "main")
        .await
        .unwrap();
    assert_eq!(repo.name, "compiler");
    let stats = queue.shutdown().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);

    let repos = app.store.list_repositories(1).await.unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].status.as_str(), "indexed");
    assert_eq!(repos[0].file_count, 3);

    let snapshot = app.stats.read(repo.id).unwrap().unwrap();
    assert_eq!(snapshot.files, 3);
    assert_eq!(snapshot.chunks as i64, app.store.count_chunks(repo.id).await.unwrap());
    assert_eq!(snapshot.languages.get("rs"), Some(&2));
    assert_eq!(snapshot.languages.get("md"), Some(&1));

    assert!(!app.index.contains(repo.id));
    let retrieval = app.retriever.retrieve(repo.id, "where is the lexer?").await;
    assert_eq!(retrieval.mode, RetrievalMode::Lexical);
    assert_eq!(retrieval.files[0], "src/lexer.rs");
    assert_eq!(retrieval.contents.len(), retrieval.files.len());
}

#[tokio::test]
async fn test_lexical_sample_when_nothing_matches() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), None, None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();
    app.pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await
        .unwrap();

    let retrieval = app.retriever.retrieve(repo.id, "zzzqqq xyzzy").await;
    assert_eq!(retrieval.mode, RetrievalMode::Sample);
    assert!(!retrieval.is_empty());

    let retrieval = app.retriever.retrieve(repo.id, "a b ?").await;
    assert_eq!(retrieval.mode, RetrievalMode::Sample);
    assert!(!retrieval.is_empty());
}

#[tokio::test]
async fn test_vector_retrieval_and_reingest_replaces_everything() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), Some(Arc::new(HashEmbedder)), None).await;

    let queue = app.start_queue();
    let repo = queue.submit_ingest(1, "https://x/compiler", "main").await.unwrap();
    queue.shutdown().await;

    let first_ids = chunk_ids(&app, repo.id).await;
    assert!(!first_ids.is_empty());
    assert_eq!(app.index.len(repo.id), first_ids.len());

    let retrieval = app.retriever.retrieve(repo.id, "the parser builds an ast").await;
    assert_eq!(retrieval.mode, RetrievalMode::Vector);
    assert!(!retrieval.is_empty());

    // Change the upstream tree, then re-ingest.
    fs::remove_file(env.source.join("src/parser.rs")).unwrap();
    fs::write(env.source.join("src/codegen.rs"), "pub fn emit() {}\n").unwrap();

    let queue = app.start_queue();
    queue.submit_reingest(1, repo.id, "main").await.unwrap();
    let stats = queue.shutdown().await;
    assert_eq!(stats.completed, 1);

    let files: Vec<String> = app
        .store
        .list_files(repo.id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(files, vec!["README.md", "src/codegen.rs", "src/lexer.rs"]);

    let second_ids = chunk_ids(&app, repo.id).await;
    assert!(second_ids.iter().all(|id| !first_ids.contains(id)));
    assert_eq!(app.store.count_chunks(repo.id).await.unwrap() as usize, second_ids.len());

    let metadata = app.index.metadata(repo.id);
    assert_eq!(metadata.len(), second_ids.len());
    assert!(metadata.iter().all(|m| second_ids.contains(&m.chunk_id)));
    assert!(metadata.iter().all(|m| m.file_path != "src/parser.rs"));

    let hits = app.index.search(repo.id, &hash_embed("pub fn emit"), 10);
    let resolved = app.index.resolve(repo.id, &hits.ids);
    assert!(resolved.iter().all(|m| second_ids.contains(&m.chunk_id)));
}

#[tokio::test]
async fn test_chunk_insert_failure_leaves_nothing_behind() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), None, None).await;
    sqlx::query(
        "CREATE TRIGGER fail_chunks BEFORE INSERT ON code_chunks BEGIN SELECT RAISE(ABORT, 'boom'); END;",
    )
    .execute(app.store.pool())
    .await
    .unwrap();

    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();
    let result = app
        .pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await;

    assert!(matches!(result, Err(IngestError::Persist(_))));
    assert!(app.store.get_repository(repo.id).await.unwrap().is_none());
    assert_eq!(app.store.count_files(repo.id).await.unwrap(), 0);
    assert_eq!(app.store.count_chunks(repo.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_clone_failure_removes_placeholder() {
    let env = setup_env();
    let app = open_app(&env, Arc::new(FailingFetcher), None, None).await;

    let queue = app.start_queue();
    let repo = queue.submit_ingest(1, "https://x/missing", "main").await.unwrap();
    let stats = queue.shutdown().await;

    assert_eq!(stats.failed, 1);
    assert!(app.store.get_repository(repo.id).await.unwrap().is_none());
    assert!(app.stats.read(repo.id).unwrap().is_none());
}

#[tokio::test]
async fn test_foreign_job_aborts_without_cleanup() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), None, None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();

    let result = app
        .pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 2,
        })
        .await;

    assert!(matches!(result, Err(IngestError::RepositoryUnavailable(_))));
    assert!(app.store.get_repository(repo.id).await.unwrap().is_some());
    assert_eq!(app.store.count_files(repo.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_oversized_repository_is_rejected() {
    let mut env = setup_env();
    env.config.limits.max_repo_size_mb = 0;
    let app = open_app(&env, dir_fetcher(&env), None, None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();

    let result = app
        .pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await;

    assert!(matches!(result, Err(IngestError::RepositoryTooLarge { .. })));
    assert!(app.store.get_repository(repo.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_repository_without_usable_files_is_rejected() {
    let env = setup_env();
    fs::remove_dir_all(&env.source).unwrap();
    fs::create_dir_all(env.source.join("node_modules/dep")).unwrap();
    fs::write(env.source.join("node_modules/dep/index.js"), "x").unwrap();
    fs::write(env.source.join("logo.png"), "png").unwrap();
    fs::write(env.source.join("data.bin"), b"\0\0\0").unwrap();

    let app = open_app(&env, dir_fetcher(&env), None, None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/empty").await.unwrap();
    let result = app
        .pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await;

    assert!(matches!(result, Err(IngestError::NoFiles)));
    assert!(app.store.get_repository(repo.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_nul_byte_file_never_persisted() {
    let env = setup_env();
    fs::write(env.source.join("src/blob.rs"), b"fn x() {}\0\0").unwrap();
    let app = open_app(&env, dir_fetcher(&env), None, None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();
    app.pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await
        .unwrap();

    let files = app.store.list_files(repo.id).await.unwrap();
    assert_eq!(files.len(), 3);
    assert!(files.iter().all(|f| f.path != "src/blob.rs"));
}

#[tokio::test]
async fn test_embedding_failure_degrades_to_lexical() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), Some(Arc::new(BrokenEmbedder)), None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();

    let outcome = app
        .pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await
        .unwrap();

    assert_eq!(outcome.vectors_indexed, 0);
    assert!(outcome.stats.chunks > 0);
    assert!(!app.index.contains(repo.id));

    let retrieval = app.retriever.retrieve(repo.id, "tokenize input").await;
    assert_eq!(retrieval.mode, RetrievalMode::Lexical);
    assert_eq!(retrieval.files[0], "src/lexer.rs");
}

#[tokio::test]
async fn test_index_survives_restart() {
    let env = setup_env();
    let repo_id = {
        let app = open_app(&env, dir_fetcher(&env), Some(Arc::new(HashEmbedder)), None).await;
        let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();
        app.pipeline
            .run(&IngestJob {
                repo_id: repo.id,
                clone_url: repo.url.clone(),
                branch: "main".to_string(),
                user_id: 1,
            })
            .await
            .unwrap();
        app.close().await;
        repo.id
    };

    assert!(index_path(&env.data_dir, repo_id).exists());
    assert!(metadata_path(&env.data_dir, repo_id).exists());

    let app = open_app(&env, dir_fetcher(&env), Some(Arc::new(HashEmbedder)), None).await;
    assert!(app.index.contains(repo_id));
    let retrieval = app.retriever.retrieve(repo_id, "tokenize").await;
    assert_eq!(retrieval.mode, RetrievalMode::Vector);
}

#[tokio::test]
async fn test_delete_repository_removes_side_state() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), Some(Arc::new(HashEmbedder)), None).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();
    app.pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await
        .unwrap();

    app.pipeline.delete_repository(repo.id).await.unwrap();
    assert!(app.store.get_repository(repo.id).await.unwrap().is_none());
    assert_eq!(app.store.count_chunks(repo.id).await.unwrap(), 0);
    assert!(!app.index.contains(repo.id));
    assert!(!index_path(&env.data_dir, repo.id).exists());
    assert!(app.stats.read(repo.id).unwrap().is_none());
    assert!(app.retriever.retrieve(repo.id, "tokenize").await.is_empty());

    app.pipeline.delete_repository(repo.id).await.unwrap();
}

#[tokio::test]
async fn test_answers_are_cached_per_level() {
    let env = setup_env();
    let generator = Arc::new(RecordingGenerator::default());
    let dyn_generator: Arc<dyn Generator> = generator.clone();
    let app = open_app(&env, dir_fetcher(&env), None, Some(dyn_generator)).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();
    app.pipeline
        .run(&IngestJob {
            repo_id: repo.id,
            clone_url: repo.url.clone(),
            branch: "main".to_string(),
            user_id: 1,
        })
        .await
        .unwrap();

    let first = app
        .answers
        .ask(1, repo.id, "Where is the lexer?", Some("expert"))
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.token_usage, 17);
    assert!(first.referenced_files.contains(&"src/lexer.rs".to_string()));
    let mut sorted = first.referenced_files.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(first.referenced_files, sorted);
    assert!(generator.last_user_prompt.lock().unwrap().contains("Question: Where is the lexer?"));

    let second = app
        .answers
        .ask(1, repo.id, "  where IS the   lexer? ", Some("EXPERT"))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.answer, first.answer);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let other_level = app
        .answers
        .ask(1, repo.id, "Where is the lexer?", Some("beginner"))
        .await
        .unwrap();
    assert!(!other_level.cached);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

    assert!(app.answers.ask(2, repo.id, "Where is the lexer?", None).await.is_err());
    assert!(app.answers.ask(1, repo.id, "   ", None).await.is_err());
}

#[tokio::test]
async fn test_empty_repository_answer_skips_generator() {
    let env = setup_env();
    let generator = Arc::new(RecordingGenerator::default());
    let dyn_generator: Arc<dyn Generator> = generator.clone();
    let app = open_app(&env, dir_fetcher(&env), None, Some(dyn_generator)).await;
    let repo = app.pipeline.create_placeholder(1, "https://x/compiler").await.unwrap();

    let answer = app.answers.ask(1, repo.id, "anything?", None).await.unwrap();
    assert_eq!(answer.answer, NO_CONTEXT_ANSWER);
    assert!(answer.referenced_files.is_empty());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_foreign_reingest_is_refused_before_reset() {
    let env = setup_env();
    let app = open_app(&env, dir_fetcher(&env), None, None).await;

    let queue = app.start_queue();
    let repo = queue.submit_ingest(1, "https://x/compiler", "main").await.unwrap();
    queue.shutdown().await;
    let chunks_before = app.store.count_chunks(repo.id).await.unwrap();
    assert!(chunks_before > 0);

    let queue = app.start_queue();
    let err = queue.submit_reingest(2, repo.id, "main").await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden(id) if id == repo.id));
    let stats = queue.shutdown().await;
    assert_eq!(stats.completed + stats.failed, 0);

    assert_eq!(app.store.count_chunks(repo.id).await.unwrap(), chunks_before);
    assert_eq!(app.store.count_files(repo.id).await.unwrap(), 3);
    assert!(app.stats.read(repo.id).unwrap().is_some());
}

#[tokio::test]
async fn test_overview_and_usage_after_ingest_and_ask() {
    let env = setup_env();
    let dyn_generator: Arc<dyn Generator> = Arc::new(RecordingGenerator::default());
    let app = open_app(&env, dir_fetcher(&env), None, Some(dyn_generator)).await;

    let queue = app.start_queue();
    let repo = queue.submit_ingest(1, "https://x/compiler", "main").await.unwrap();
    queue.shutdown().await;

    let overview = app.store.overview(1).await.unwrap();
    assert_eq!(overview.total_repos, 1);
    assert_eq!(overview.total_files, 3);
    assert_eq!(overview.total_chunks, app.store.count_chunks(repo.id).await.unwrap());
    assert_eq!(overview.last_ingestion, Some(repo.created_at));
    assert_eq!(app.store.usage(1).await.unwrap().queries, 0);

    app.answers
        .ask(1, repo.id, "Where is the lexer?", None)
        .await
        .unwrap();
    // Cache hits are not new queries.
    app.answers
        .ask(1, repo.id, "where is the lexer?", None)
        .await
        .unwrap();

    let usage = app.store.usage(1).await.unwrap();
    assert_eq!(usage.queries, 1);
    assert_eq!(usage.token_usage, 17);
    assert!(usage.avg_query_latency_ms >= 0);

    assert_eq!(app.store.overview(2).await.unwrap().total_repos, 0);
    assert_eq!(app.store.usage(2).await.unwrap().queries, 0);
}
