//! Question answering over an ingested repository.
//!
//! `ask` checks the answer cache, retrieves context, trims it to a token
//! budget, asks the generator, and stores the result under the normalized
//! cache key. Empty retrieval short-circuits with a fixed answer and never
//! reaches the generator.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::cache_key::{self, ExplainLevel};
use crate::chunk::TokenCodec;
use crate::error::{AnswerError, GenerationError};
use crate::generation::Generator;
use crate::models::NewAnswer;
use crate::retrieve::Retriever;
use crate::store::Store;

pub const NO_CONTEXT_ANSWER: &str = "I couldn't find relevant code in this repository.";

const SYSTEM_PROMPT: &str = "You are a code documentation assistant. Answer the question using only the provided repository context. If the context is insufficient, say you do not know.";

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub answer: String,
    /// Sorted and deduplicated.
    pub referenced_files: Vec<String>,
    pub token_usage: i64,
    pub latency_ms: i64,
    pub cached: bool,
}

/// Concatenate chunks with blank lines, in order, while the running token
/// count stays within `max_tokens`, then hard-truncate the result to the
/// budget.
pub fn compress_context(codec: &dyn TokenCodec, chunks: &[String], max_tokens: usize) -> String {
    let mut selected: Vec<&str> = Vec::new();
    let mut total = 0usize;
    for chunk in chunks {
        let tokens = codec.count(chunk);
        if total + tokens > max_tokens {
            break;
        }
        selected.push(chunk);
        total += tokens;
    }

    let context = selected.join("\n\n");
    let tokens = codec.encode(&context);
    if tokens.len() > max_tokens {
        codec.decode(&tokens[..max_tokens])
    } else {
        context
    }
}

fn sorted_unique(files: &[String]) -> Vec<String> {
    let mut files = files.to_vec();
    files.sort();
    files.dedup();
    files
}

pub struct AnswerService {
    store: Arc<dyn Store>,
    retriever: Arc<Retriever>,
    generator: Option<Arc<dyn Generator>>,
    codec: Arc<dyn TokenCodec>,
    max_context_tokens: usize,
}

impl AnswerService {
    pub fn new(
        store: Arc<dyn Store>,
        retriever: Arc<Retriever>,
        generator: Option<Arc<dyn Generator>>,
        codec: Arc<dyn TokenCodec>,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            store,
            retriever,
            generator,
            codec,
            max_context_tokens,
        }
    }

    pub async fn ask(
        &self,
        user_id: i64,
        repo_id: i64,
        question: &str,
        level: Option<&str>,
    ) -> Result<Answer, AnswerError> {
        if question.trim().is_empty() {
            return Err(AnswerError::EmptyQuestion);
        }
        let repo = self
            .store
            .get_repository(repo_id)
            .await?
            .ok_or(AnswerError::RepositoryNotFound(repo_id))?;
        if repo.user_id != user_id {
            return Err(AnswerError::Forbidden(repo_id));
        }

        let key = cache_key::normalize(question, level);
        if let Some(hit) = self.store.cached_answer(user_id, repo_id, &key).await? {
            info!(repo_id, answer_id = hit.id, "answer cache hit");
            return Ok(Answer {
                answer: hit.answer,
                referenced_files: hit.referenced_files,
                token_usage: hit.token_usage,
                latency_ms: hit.latency_ms,
                cached: true,
            });
        }

        let started = Instant::now();
        let retrieval = self.retriever.retrieve(repo_id, question).await;
        if retrieval.is_empty() {
            return Ok(Answer {
                answer: NO_CONTEXT_ANSWER.to_string(),
                referenced_files: Vec::new(),
                token_usage: 0,
                latency_ms: started.elapsed().as_millis() as i64,
                cached: false,
            });
        }

        let generator = self.generator.as_ref().ok_or(GenerationError::Disabled)?;
        let context = compress_context(self.codec.as_ref(), &retrieval.contents, self.max_context_tokens);
        let level = ExplainLevel::parse(level);
        let system = format!("{} {}", SYSTEM_PROMPT, level.guidance());
        let user = format!("Context:\n{}\n\nQuestion: {}", context, question.trim());

        let generation = generator.generate(&system, &user).await?;
        let latency_ms = started.elapsed().as_millis() as i64;
        let referenced_files = sorted_unique(&retrieval.files);

        self.store
            .save_answer(&NewAnswer {
                user_id,
                repo_id,
                question: question.trim().to_string(),
                cache_key: key,
                answer: generation.text.clone(),
                referenced_files: referenced_files.clone(),
                token_usage: generation.token_usage,
                latency_ms,
            })
            .await?;

        info!(
            repo_id,
            latency_ms,
            tokens = generation.token_usage,
            mode = ?retrieval.mode,
            "answered question"
        );
        Ok(Answer {
            answer: generation.text,
            referenced_files,
            token_usage: generation.token_usage,
            latency_ms,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per character.
    struct CharCodec;

    impl TokenCodec for CharCodec {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.chars().map(|c| c as u32).collect()
        }

        fn decode(&self, tokens: &[u32]) -> String {
            tokens.iter().filter_map(|&t| char::from_u32(t)).collect()
        }
    }

    fn chunks(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compress_keeps_whole_chunks_within_budget() {
        let context = compress_context(&CharCodec, &chunks(&["abcd", "efgh", "ijkl"]), 9);
        assert_eq!(context, "abcd\n\nefg");
    }

    #[test]
    fn test_compress_stops_at_first_overflow() {
        let context = compress_context(&CharCodec, &chunks(&["ab", "cdefghij", "k"]), 5);
        assert_eq!(context, "ab");
    }

    #[test]
    fn test_compress_under_budget_is_unchanged() {
        let context = compress_context(&CharCodec, &chunks(&["ab", "cd"]), 100);
        assert_eq!(context, "ab\n\ncd");
    }

    #[test]
    fn test_sorted_unique() {
        let files = chunks(&["b.rs", "a.rs", "b.rs"]);
        assert_eq!(sorted_unique(&files), vec!["a.rs", "b.rs"]);
    }
}
