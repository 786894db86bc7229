//! Embedding provider abstraction and the Azure OpenAI implementation.
//!
//! The orchestrator only sees the [`Embedder`] trait; tests substitute
//! in-process implementations.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::error::UpstreamError;
use crate::retry::send_with_retry;

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError>;
}

/// Embedder backed by an Azure OpenAI embeddings deployment.
///
/// Calls `POST {endpoint}/openai/deployments/{deployment}/embeddings`.
pub struct AzureOpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    deployment: String,
    api_key: String,
    max_retries: u32,
}

impl AzureOpenAiEmbedder {
    /// # Errors
    ///
    /// Returns an error if the API key variable is unset or the HTTP client
    /// cannot be built.
    pub fn new(config: &OpenAiConfig) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: deployment_url(config, &config.embedding_deployment, "embeddings"),
            deployment: config.embedding_deployment.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

/// `{endpoint}/openai/deployments/{deployment}/{operation}?api-version=...`
pub(crate) fn deployment_url(config: &OpenAiConfig, deployment: &str, operation: &str) -> String {
    format!(
        "{}/openai/deployments/{}/{}?api-version={}",
        config.endpoint.trim_end_matches('/'),
        deployment,
        operation,
        config.api_version
    )
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for AzureOpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let body = json!({
            "model": self.deployment,
            "input": text,
        });

        let response = send_with_retry("embedding", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(UpstreamError::Embed)?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("embedding response: {}", e)))?;

        let vector = parse_embedding(parsed)?;
        debug!(dims = vector.len(), "embedded query");
        Ok(vector)
    }
}

fn parse_embedding(response: EmbeddingResponse) -> Result<Vec<f32>, UpstreamError> {
    response
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UpstreamError::Decode("empty embedding response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenAiConfig {
        OpenAiConfig {
            endpoint: "https://example.openai.azure.com/".to_string(),
            api_version: "2024-06-01".to_string(),
            chat_deployment: "chat".to_string(),
            embedding_deployment: "embed".to_string(),
            api_key_env: "UNUSED".to_string(),
            temperature: 0.2,
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    #[test]
    fn test_deployment_url() {
        assert_eq!(
            deployment_url(&config(), "embed", "embeddings"),
            "https://example.openai.azure.com/openai/deployments/embed/embeddings?api-version=2024-06-01"
        );
    }

    #[test]
    fn test_parse_embedding() {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data":[{"index":0,"embedding":[0.5,-1.0]}]}"#).unwrap();
        assert_eq!(parse_embedding(parsed).unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn test_parse_empty_embedding_is_error() {
        let parsed: EmbeddingResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(matches!(
            parse_embedding(parsed),
            Err(UpstreamError::Decode(_))
        ));
    }
}
