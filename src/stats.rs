//! Per-repository ingestion statistics.
//!
//! A snapshot is computed once per successful ingestion from the files and
//! chunks that were persisted, and written as `repo_<id>.stats.json` under
//! the data directory. It does not depend on embeddings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{NewChunk, RepositoryStats, SourceFile};

/// Aggregate counts for one ingestion run.
pub fn compute(files: &[SourceFile], chunks: &[NewChunk], ingestion_time_ms: u64) -> RepositoryStats {
    let mut languages: BTreeMap<String, usize> = BTreeMap::new();
    for file in files {
        *languages.entry(file.language.clone()).or_insert(0) += 1;
    }

    let total_tokens: i64 = chunks.iter().map(|c| c.token_count).sum();
    let avg_chunk_size = if chunks.is_empty() {
        0
    } else {
        (total_tokens / chunks.len() as i64) as usize
    };

    RepositoryStats {
        files: files.len(),
        chunks: chunks.len(),
        languages,
        avg_chunk_size,
        ingestion_time_ms,
    }
}

/// JSON snapshot files keyed by repository id.
#[derive(Debug, Clone)]
pub struct StatsStore {
    dir: PathBuf,
}

impl StatsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, repo_id: i64) -> PathBuf {
        self.dir.join(format!("repo_{}.stats.json", repo_id))
    }

    /// Write (or overwrite) the snapshot.
    pub fn write(&self, repo_id: i64, stats: &RepositoryStats) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(repo_id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(stats)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// `None` when no snapshot exists.
    pub fn read(&self, repo_id: i64) -> anyhow::Result<Option<RepositoryStats>> {
        let path = self.path(repo_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Remove the snapshot. Missing files are fine.
    pub fn delete(&self, repo_id: i64) -> anyhow::Result<()> {
        remove_if_exists(&self.path(repo_id))
    }
}

fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
