//! Relational store contract and its SQLite implementation.
//!
//! The [`Store`] trait is the small CRUD surface the ingestion orchestrator,
//! retriever, and answer cache depend on. [`SqliteStore`] implements it on
//! top of an `sqlx` pool.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create_repository`](Store::create_repository) | Insert the placeholder record |
//! | [`delete_repository`](Store::delete_repository) | Remove a record, cascading files/chunks |
//! | [`clear_repository_data`](Store::clear_repository_data) | Transactional chunk → file delete |
//! | [`persist_files_and_chunks`](Store::persist_files_and_chunks) | Two bulk inserts in one transaction |
//! | [`chunks_by_ids`](Store::chunks_by_ids) | Point lookups for vector hits |
//! | [`lexical_candidates`](Store::lexical_candidates) | LIKE prefilter over chunk text |
//! | [`overview`](Store::overview) / [`usage`](Store::usage) | Per-user dashboard aggregates |

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use crate::error::StoreError;
use crate::models::{
    CachedAnswer, Chunk, ChunkHit, DashboardOverview, NewAnswer, NewChunk, PersistedIds, RepoStatus, Repository,
    RepositorySummary, SourceFile, StoredFile, UsageStats,
};

/// Rows per multi-row INSERT, well under SQLite's bind-parameter limit.
const INSERT_BATCH_ROWS: usize = 200;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_repository(&self, user_id: i64, url: &str, name: &str)
        -> StoreResult<Repository>;

    async fn get_repository(&self, repo_id: i64) -> StoreResult<Option<Repository>>;

    async fn list_repositories(&self, user_id: i64) -> StoreResult<Vec<RepositorySummary>>;

    /// Delete the repository record and everything that references it.
    /// Deleting a missing repository is not an error.
    async fn delete_repository(&self, repo_id: i64) -> StoreResult<()>;

    /// Delete all chunks, then all files, of a repository. All-or-nothing.
    async fn clear_repository_data(&self, repo_id: i64) -> StoreResult<()>;

    /// Insert `files` in one bulk operation, then `chunks` in a second, inside
    /// a single transaction. `NewChunk::file_index` points into `files`.
    /// Returned ids are aligned with the inputs.
    async fn persist_files_and_chunks(
        &self,
        repo_id: i64,
        files: &[SourceFile],
        chunks: &[NewChunk],
    ) -> StoreResult<PersistedIds>;

    async fn count_files(&self, repo_id: i64) -> StoreResult<i64>;

    async fn count_chunks(&self, repo_id: i64) -> StoreResult<i64>;

    async fn list_files(&self, repo_id: i64) -> StoreResult<Vec<StoredFile>>;

    async fn get_file(&self, repo_id: i64, file_id: i64) -> StoreResult<Option<StoredFile>>;

    async fn list_chunks_by_file(&self, file_id: i64) -> StoreResult<Vec<Chunk>>;

    /// Look up chunks by id. Order of the result is unspecified.
    async fn chunks_by_ids(&self, chunk_ids: &[i64]) -> StoreResult<Vec<ChunkHit>>;

    /// Chunks of a repository whose lower-cased text contains any of `terms`,
    /// in chunk creation order. With no terms, an unfiltered sample.
    async fn lexical_candidates(
        &self,
        repo_id: i64,
        terms: &[String],
        limit: usize,
    ) -> StoreResult<Vec<ChunkHit>>;

    /// Most recent answer stored under `cache_key` for this user and repository.
    async fn cached_answer(
        &self,
        user_id: i64,
        repo_id: i64,
        cache_key: &str,
    ) -> StoreResult<Option<CachedAnswer>>;

    async fn save_answer(&self, answer: &NewAnswer) -> StoreResult<i64>;

    /// Repository, file and chunk totals for a user.
    async fn overview(&self, user_id: i64) -> StoreResult<DashboardOverview>;

    /// Query count, mean latency and total tokens over the user's stored answers.
    async fn usage(&self, user_id: i64) -> StoreResult<UsageStats>;
}

/// [`Store`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = crate::db::connect_path(path).await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn repository_from_row(row: &sqlx::sqlite::SqliteRow) -> Repository {
    Repository {
        id: row.get("id"),
        user_id: row.get("user_id"),
        url: row.get("url"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

fn stored_file_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredFile {
    StoredFile {
        id: row.get("id"),
        repo_id: row.get("repo_id"),
        path: row.get("file_path"),
        language: row.get("language"),
        content: row.get("raw_content"),
    }
}

fn hit_from_row(row: &sqlx::sqlite::SqliteRow) -> ChunkHit {
    ChunkHit {
        chunk_id: row.get("id"),
        content: row.get("chunk_content"),
        file_path: row.get("file_path"),
    }
}

/// Spellings of `term` to match against `lower(chunk_content)`.
///
/// SQLite's `lower()` and `LIKE` fold ASCII only, so a non-ASCII letter
/// keeps its stored case. Matching both the lower-case form and the
/// ASCII-folded upper-case form covers all-lower and capitalised non-ASCII
/// letters; text that mixes both cases within one term is still missed.
fn fold_variants(term: &str) -> Vec<String> {
    let lower = term.to_lowercase();
    let upper = term.to_uppercase().to_ascii_lowercase();
    if upper == lower {
        vec![lower]
    } else {
        vec![lower, upper]
    }
}

/// Escape LIKE wildcards so terms match literally.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_repository(
        &self,
        user_id: i64,
        url: &str,
        name: &str,
    ) -> StoreResult<Repository> {
        let now = chrono::Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO repositories (user_id, url, name, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(url)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Repository {
            id,
            user_id,
            url: url.to_string(),
            name: name.to_string(),
            created_at: now,
        })
    }

    async fn get_repository(&self, repo_id: i64) -> StoreResult<Option<Repository>> {
        let row = sqlx::query("SELECT id, user_id, url, name, created_at FROM repositories WHERE id = ?")
            .bind(repo_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(repository_from_row))
    }

    async fn list_repositories(&self, user_id: i64) -> StoreResult<Vec<RepositorySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.user_id, r.url, r.name, r.created_at,
                   (SELECT COUNT(*) FROM code_files f WHERE f.repo_id = r.id) AS file_count
            FROM repositories r
            WHERE r.user_id = ?
            ORDER BY r.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let file_count: i64 = row.get("file_count");
                RepositorySummary {
                    repository: repository_from_row(row),
                    file_count,
                    status: RepoStatus::from_file_count(file_count),
                }
            })
            .collect())
    }

    async fn delete_repository(&self, repo_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_repository_data(&self, repo_id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        // Chunks first (FK to files), then the files themselves.
        sqlx::query(
            "DELETE FROM code_chunks WHERE file_id IN (SELECT id FROM code_files WHERE repo_id = ?)",
        )
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM code_files WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn persist_files_and_chunks(
        &self,
        repo_id: i64,
        files: &[SourceFile],
        chunks: &[NewChunk],
    ) -> StoreResult<PersistedIds> {
        let mut tx = self.pool.begin().await?;

        // Ids are assigned monotonically inside the write transaction, so
        // sorting each batch's RETURNING set restores insertion order.
        let mut file_ids = Vec::with_capacity(files.len());
        for batch in files.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO code_files (repo_id, file_path, language, raw_content) ",
            );
            builder.push_values(batch, |mut b, file| {
                b.push_bind(repo_id)
                    .push_bind(file.path.clone())
                    .push_bind(file.language.clone())
                    .push_bind(file.content.clone());
            });
            builder.push(" RETURNING id");
            let mut ids: Vec<i64> = builder.build_query_scalar::<i64>().fetch_all(&mut *tx).await?;
            ids.sort_unstable();
            file_ids.extend(ids);
        }

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO code_chunks (file_id, chunk_index, chunk_content, token_count) ",
            );
            builder.push_values(batch, |mut b, chunk| {
                b.push_bind(file_ids.get(chunk.file_index).copied())
                    .push_bind(chunk.chunk_index)
                    .push_bind(chunk.content.clone())
                    .push_bind(chunk.token_count);
            });
            builder.push(" RETURNING id");
            let mut ids: Vec<i64> = builder.build_query_scalar::<i64>().fetch_all(&mut *tx).await?;
            ids.sort_unstable();
            chunk_ids.extend(ids);
        }

        tx.commit().await?;
        Ok(PersistedIds {
            file_ids,
            chunk_ids,
        })
    }

    async fn count_files(&self, repo_id: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM code_files WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_chunks(&self, repo_id: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM code_chunks c JOIN code_files f ON c.file_id = f.id WHERE f.repo_id = ?",
        )
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_files(&self, repo_id: i64) -> StoreResult<Vec<StoredFile>> {
        let rows = sqlx::query(
            "SELECT id, repo_id, file_path, language, raw_content FROM code_files WHERE repo_id = ? ORDER BY id",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(stored_file_from_row).collect())
    }

    async fn get_file(&self, repo_id: i64, file_id: i64) -> StoreResult<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT id, repo_id, file_path, language, raw_content FROM code_files WHERE repo_id = ? AND id = ?",
        )
        .bind(repo_id)
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(stored_file_from_row))
    }

    async fn list_chunks_by_file(&self, file_id: i64) -> StoreResult<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, file_id, chunk_index, chunk_content, token_count FROM code_chunks WHERE file_id = ? ORDER BY chunk_index",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Chunk {
                id: row.get("id"),
                file_id: row.get("file_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("chunk_content"),
                token_count: row.get("token_count"),
            })
            .collect())
    }

    async fn chunks_by_ids(&self, chunk_ids: &[i64]) -> StoreResult<Vec<ChunkHit>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id, c.chunk_content, f.file_path FROM code_chunks c JOIN code_files f ON c.file_id = f.id WHERE c.id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in chunk_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(hit_from_row).collect())
    }

    async fn lexical_candidates(
        &self,
        repo_id: i64,
        terms: &[String],
        limit: usize,
    ) -> StoreResult<Vec<ChunkHit>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id, c.chunk_content, f.file_path FROM code_chunks c JOIN code_files f ON c.file_id = f.id WHERE f.repo_id = ",
        );
        builder.push_bind(repo_id);

        if !terms.is_empty() {
            builder.push(" AND (");
            let mut separated = builder.separated(" OR ");
            for variant in terms.iter().flat_map(|t| fold_variants(t)) {
                separated.push("lower(c.chunk_content) LIKE ");
                separated.push_bind_unseparated(like_pattern(&variant));
                separated.push_unseparated(" ESCAPE '\\'");
            }
            builder.push(")");
        }

        builder.push(" ORDER BY c.id LIMIT ");
        builder.push_bind(limit.max(1) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(hit_from_row).collect())
    }

    async fn cached_answer(
        &self,
        user_id: i64,
        repo_id: i64,
        cache_key: &str,
    ) -> StoreResult<Option<CachedAnswer>> {
        let row = sqlx::query(
            r#"
            SELECT id, question, answer, referenced_files_json, token_usage, latency_ms, created_at
            FROM answers
            WHERE user_id = ? AND repo_id = ? AND question_normalized = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(repo_id)
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let files_json: String = row.get("referenced_files_json");
            CachedAnswer {
                id: row.get("id"),
                question: row.get("question"),
                answer: row.get("answer"),
                referenced_files: serde_json::from_str(&files_json).unwrap_or_default(),
                token_usage: row.get("token_usage"),
                latency_ms: row.get("latency_ms"),
                created_at: row.get("created_at"),
            }
        }))
    }

    async fn save_answer(&self, answer: &NewAnswer) -> StoreResult<i64> {
        let mut files = answer.referenced_files.clone();
        files.sort();
        files.dedup();
        let files_json = serde_json::to_string(&files).unwrap_or_else(|_| "[]".to_string());

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO answers (user_id, repo_id, question, question_normalized, answer,
                                 referenced_files_json, token_usage, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(answer.user_id)
        .bind(answer.repo_id)
        .bind(&answer.question)
        .bind(&answer.cache_key)
        .bind(&answer.answer)
        .bind(files_json)
        .bind(answer.token_usage)
        .bind(answer.latency_ms)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn overview(&self, user_id: i64) -> StoreResult<DashboardOverview> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM repositories WHERE user_id = ?1) AS total_repos,
                (SELECT COUNT(*) FROM code_files f
                    JOIN repositories r ON f.repo_id = r.id
                    WHERE r.user_id = ?1) AS total_files,
                (SELECT COUNT(*) FROM code_chunks c
                    JOIN code_files f ON c.file_id = f.id
                    JOIN repositories r ON f.repo_id = r.id
                    WHERE r.user_id = ?1) AS total_chunks,
                (SELECT MAX(created_at) FROM repositories WHERE user_id = ?1) AS last_ingestion
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(DashboardOverview {
            total_repos: row.get("total_repos"),
            total_files: row.get("total_files"),
            total_chunks: row.get("total_chunks"),
            last_ingestion: row.get("last_ingestion"),
        })
    }

    async fn usage(&self, user_id: i64) -> StoreResult<UsageStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS queries,
                   COALESCE(CAST(AVG(latency_ms) AS INTEGER), 0) AS avg_latency,
                   COALESCE(SUM(token_usage), 0) AS token_usage
            FROM answers
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageStats {
            queries: row.get("queries"),
            avg_query_latency_ms: row.get("avg_latency"),
            token_usage: row.get("token_usage"),
        })
    }
}
