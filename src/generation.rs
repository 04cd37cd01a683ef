//! Chat-completion backend used to answer questions over retrieved code.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::GenerationConfig;
use crate::error::GenerationError;

/// Completion text plus the provider-reported total token usage.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub token_usage: i64,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<Generation, GenerationError>;
}

/// Calls `POST {base_url}/chat/completions`.
pub struct OpenAiChatGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl OpenAiChatGenerator {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl Generator for OpenAiChatGenerator {
    async fn generate(&self, system: &str, user: &str) -> Result<Generation, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

pub fn parse_chat_response(json: &serde_json::Value) -> Result<Generation, GenerationError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| GenerationError::InvalidResponse("missing choices[0].message.content".to_string()))?;
    let token_usage = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_i64())
        .unwrap_or(0);
    Ok(Generation {
        text: text.trim().to_string(),
        token_usage,
    })
}

/// Build the configured generator, or `None` when generation is off or
/// the credential is missing.
pub fn create_generator(
    config: &GenerationConfig,
) -> Result<Option<Arc<dyn Generator>>, GenerationError> {
    if !config.is_enabled() {
        return Ok(None);
    }
    let Some(api_key) = std::env::var(&config.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty())
    else {
        info!(env = %config.api_key_env, "generation credential not set");
        return Ok(None);
    };
    let generator: Arc<dyn Generator> = Arc::new(OpenAiChatGenerator::new(config, api_key)?);
    Ok(Some(generator))
}
