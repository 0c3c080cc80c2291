use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::GatewayError;

/// Text embedding interface, used by vector backends that need
/// client-side query vectors.
#[async_trait]
pub trait Embed: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError>;
}

/// Client for an OpenAI-style `/embeddings` endpoint.
pub struct EmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("embedding http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embed for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let body = json!({"model": self.model, "input": text});
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::external("embedding", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::external(
                "embedding",
                format!("status {status}: {text}"),
            ));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::external("embedding", e))?;
        let vector = data["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| GatewayError::external("embedding", "no embedding in response"))?;

        Ok(vector
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }
}
