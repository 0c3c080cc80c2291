use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::GatewayError;

/// Model tier for a call. `High` routes to the stronger model (tool
/// scoring, item matching); `Low` to the cheap one (per-item ranking,
/// slot extraction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    High,
    Low,
}

/// Structured-output LLM interface. The prompt describes the task; the
/// schema constrains the JSON shape of the reply.
#[async_trait]
pub trait AskLlm: Send + Sync {
    async fn ask(&self, prompt: &str, schema: &Value, tier: Tier) -> Result<Value, GatewayError>;
}

/// Concrete client against an OpenAI-style chat-completions endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    high_model: String,
    low_model: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("llm http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            high_model: config.models.high.clone(),
            low_model: config.models.low.clone(),
        })
    }
}

#[async_trait]
impl AskLlm for LlmClient {
    async fn ask(&self, prompt: &str, schema: &Value, tier: Tier) -> Result<Value, GatewayError> {
        let model = match tier {
            Tier::High => &self.high_model,
            Tier::Low => &self.low_model,
        };
        let system = format!(
            "You are a structured analysis assistant. Respond with a single JSON object \
             matching this structure, with no surrounding text: {schema}"
        );
        let body = json!({
            "model": model,
            "temperature": 0.1,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::external("llm", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::external(
                "llm",
                format!("status {status}: {text}"),
            ));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::external("llm", e))?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GatewayError::external("llm", "no content in completion"))?;

        parse_structured(content).ok_or_else(|| {
            warn!(model = %model, "llm reply was not valid JSON");
            GatewayError::external("llm", "reply was not valid JSON")
        })
    }
}

/// Parse a model reply into JSON, salvaging fenced or prefixed output.
pub fn parse_structured(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Fenced code block
    if let Some(start) = trimmed.find("```") {
        let inner = &trimmed[start + 3..];
        let inner = inner.strip_prefix("json").unwrap_or(inner);
        if let Some(end) = inner.find("```")
            && let Ok(value) = serde_json::from_str(inner[..end].trim())
        {
            return Some(value);
        }
    }

    // First `{` to last `}`
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        debug!("salvaging JSON from partial llm reply");
        return serde_json::from_str(&trimmed[start..=end]).ok();
    }
    None
}

/// Extract a numeric `score` field, clamped to [0, 100]. Tolerates
/// numbers, numeric strings, and missing fields (0).
pub fn extract_score(value: &Value) -> u32 {
    let raw = match &value["score"] {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    raw.clamp(0.0, 100.0).round() as u32
}
