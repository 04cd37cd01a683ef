//! Dual-mode retrieval: vector k-NN first, lexical scoring as fallback.
//!
//! Retrieval never fails. Every internal error degrades to the next mode,
//! and the last mode returns an unscored sample of chunks when nothing
//! matches, so a repository with any chunks always yields some context.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::models::ChunkHit;
use crate::store::Store;
use crate::vector_index::VectorIndexRegistry;

/// Which path produced a [`Retrieval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Vector,
    Lexical,
    /// No candidate matched any term; an unscored sample was returned.
    Sample,
    Empty,
}

/// Chunk texts and their source paths, aligned and in rank order.
/// Paths are not deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub contents: Vec<String>,
    pub files: Vec<String>,
    pub mode: RetrievalMode,
}

impl Retrieval {
    fn empty() -> Self {
        Self {
            contents: Vec::new(),
            files: Vec::new(),
            mode: RetrievalMode::Empty,
        }
    }

    fn from_hits(hits: Vec<ChunkHit>, mode: RetrievalMode) -> Self {
        if hits.is_empty() {
            return Self::empty();
        }
        let (contents, files) = hits.into_iter().map(|h| (h.content, h.file_path)).unzip();
        Self {
            contents,
            files,
            mode,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// Lower-cased query terms: split on non-word characters, keep terms of at
/// least three characters. No stop words, no stemming.
pub fn extract_terms(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_string)
        .collect()
}

/// Sum of non-overlapping occurrences of every term in the lower-cased text.
pub fn score(text: &str, terms: &[String]) -> usize {
    let lowered = text.to_lowercase();
    terms.iter().map(|t| lowered.matches(t.as_str()).count()).sum()
}

/// Rank candidates by [`score`], descending. The sort is stable, so ties
/// keep candidate order.
pub fn rank_lexical(candidates: Vec<ChunkHit>, terms: &[String], top_k: usize) -> (Vec<ChunkHit>, bool) {
    let mut scored: Vec<(usize, ChunkHit)> = candidates
        .into_iter()
        .map(|hit| (score(&hit.content, terms), hit))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    let matched = scored.first().is_some_and(|(s, _)| *s > 0);
    let top = scored.into_iter().take(top_k).map(|(_, hit)| hit).collect();
    (top, matched)
}

pub struct Retriever {
    store: Arc<dyn Store>,
    index: Arc<VectorIndexRegistry>,
    embedder: Option<Arc<dyn Embedder>>,
    top_k: usize,
    candidate_limit: usize,
    max_terms: usize,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<VectorIndexRegistry>,
        embedder: Option<Arc<dyn Embedder>>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            top_k: config.top_k.max(1),
            candidate_limit: config.candidate_limit(),
            max_terms: config.max_lexical_terms.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn retrieve(&self, repo_id: i64, question: &str) -> Retrieval {
        if let Some(result) = self.retrieve_vector(repo_id, question).await {
            info!(repo_id, chunks = result.contents.len(), "retrieved via vector search");
            return result;
        }
        let result = self.retrieve_lexical(repo_id, question).await;
        info!(
            repo_id,
            chunks = result.contents.len(),
            mode = ?result.mode,
            "retrieved via lexical fallback"
        );
        result
    }

    /// `None` means "fall through to lexical".
    async fn retrieve_vector(&self, repo_id: i64, question: &str) -> Option<Retrieval> {
        let embedder = self.embedder.as_ref()?;
        if !self.index.contains(repo_id) {
            return None;
        }

        let query = match embedder.embed_one(question).await {
            Ok(query) => query,
            Err(e) => {
                warn!(repo_id, error = %e, "query embedding failed");
                return None;
            }
        };

        let hits = self.index.search(repo_id, &query, self.top_k);
        if hits.is_empty() {
            return None;
        }
        let ranked = self.index.resolve(repo_id, &hits.ids);
        let chunk_ids: Vec<i64> = ranked.iter().map(|m| m.chunk_id).collect();

        let rows = match self.store.chunks_by_ids(&chunk_ids).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(repo_id, error = %e, "chunk lookup failed");
                return None;
            }
        };

        // Restore neighbor rank; ids whose chunk no longer exists drop out.
        let ordered: Vec<ChunkHit> = chunk_ids
            .iter()
            .filter_map(|id| rows.iter().find(|row| row.chunk_id == *id).cloned())
            .collect();
        if ordered.is_empty() {
            debug!(repo_id, "vector hits resolved to no stored chunks");
            return None;
        }
        Some(Retrieval::from_hits(ordered, RetrievalMode::Vector))
    }

    async fn retrieve_lexical(&self, repo_id: i64, question: &str) -> Retrieval {
        let terms = extract_terms(question);
        let prefilter: Vec<String> = terms.iter().take(self.max_terms).cloned().collect();

        let mut candidates = match self
            .store
            .lexical_candidates(repo_id, &prefilter, self.candidate_limit)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(repo_id, error = %e, "lexical prefilter failed");
                Vec::new()
            }
        };

        if candidates.is_empty() && !prefilter.is_empty() {
            candidates = match self
                .store
                .lexical_candidates(repo_id, &[], self.candidate_limit)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(repo_id, error = %e, "chunk sample failed");
                    return Retrieval::empty();
                }
            };
        }

        let (top, matched) = rank_lexical(candidates, &terms, self.top_k);
        let mode = if matched {
            RetrievalMode::Lexical
        } else {
            RetrievalMode::Sample
        };
        Retrieval::from_hits(top, mode)
    }
}
