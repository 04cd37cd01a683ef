//! Embedding provider abstraction and the OpenAI-compatible backend.
//!
//! Embeddings are optional. [`create_embedder`] returns `None` when the
//! provider is disabled or its credential is missing, and callers treat
//! that as "skip vector indexing" rather than an error.
//!
//! There is no retry. A failed batch surfaces as an [`EmbeddingError`] and
//! the ingestion orchestrator degrades to lexical-only retrieval.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Text → vector model.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".to_string()))
    }
}

/// Embed `texts` in request batches of at most `batch_size`.
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let embedded = embedder.embed_batch(batch).await?;
        if embedded.len() != batch.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                batch.len(),
                embedded.len()
            )));
        }
        vectors.extend(embedded);
    }
    debug!(count = vectors.len(), "embedded texts");
    Ok(vectors)
}

/// Calls `POST {base_url}/embeddings`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await?;
        parse_embeddings_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index` when present.
pub fn parse_embeddings_response(
    json: &serde_json::Value,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        let vector = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric value".to_string()))
            })
            .collect::<Result<Vec<f32>, _>>()?;
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the configured embedder, or `None` when embeddings are off.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>, EmbeddingError> {
    if !config.is_enabled() {
        info!("embeddings disabled; retrieval will be lexical only");
        return Ok(None);
    }
    let Some(api_key) = config.api_key() else {
        info!(
            env = %config.api_key_env,
            "embedding credential not set; retrieval will be lexical only"
        );
        return Ok(None);
    };
    match config.provider.as_str() {
        "openai" => {
            let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(config, api_key)?);
            Ok(Some(embedder))
        }
        _ => Err(EmbeddingError::Disabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[test]
    fn test_parse_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_missing_data() {
        let json = serde_json::json!({"error": "nope"});
        assert!(matches!(
            parse_embeddings_response(&json),
            Err(EmbeddingError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_embed_in_batches_splits_requests() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
        };
        let texts: Vec<String> = (0..5).map(|i| "x".repeat(i + 1)).collect();
        let vectors = embed_in_batches(&embedder, &texts, 2).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[4], vec![5.0]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_create_embedder_disabled() {
        let config = EmbeddingConfig {
            enabled: false,
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).unwrap().is_none());
    }

    #[test]
    fn test_create_embedder_without_credential() {
        let config = EmbeddingConfig {
            api_key_env: "RLENS_TEST_UNSET_EMBEDDING_KEY".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).unwrap().is_none());
    }
}
