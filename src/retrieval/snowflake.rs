use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{RetrievedItem, VectorBackend, item_from_fields};
use crate::config::RetrievalEndpoint;
use crate::error::GatewayError;

/// Snowflake Cortex Search driver. The service embeds queries server-side,
/// so no embedding client is needed; `api_endpoint` is the full
/// cortex-search-services query URL. Read-only: Cortex services are
/// populated from Snowflake tables, not through this gateway.
pub struct SnowflakeBackend {
    label: String,
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl SnowflakeBackend {
    pub fn new(name: &str, endpoint: &RetrievalEndpoint) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("snowflake http client: {e}")))?;
        Ok(Self {
            label: name.to_string(),
            client,
            url: endpoint.api_endpoint.clone().unwrap_or_default(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
        })
    }

    async fn query(
        &self,
        query: &str,
        filter: Option<Value>,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        let mut body = json!({
            "query": query,
            "columns": ["url", "site", "schema_json", "name"],
            "limit": k,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::external(&self.label, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::external(
                &self.label,
                format!("status {status}: {text}"),
            ));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::external(&self.label, e))?;
        let items: Vec<RetrievedItem> = data["results"]
            .as_array()
            .map(|rows| rows.iter().filter_map(item_from_fields).collect())
            .unwrap_or_default();
        debug!(backend = %self.label, hits = items.len(), "cortex search done");
        Ok(items)
    }
}

#[async_trait]
impl VectorBackend for SnowflakeBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn search(
        &self,
        query: &str,
        sites: &[String],
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        let filter = if sites.len() == 1 {
            json!({"@eq": {"site": sites[0]}})
        } else {
            let clauses: Vec<Value> = sites.iter().map(|s| json!({"@eq": {"site": s}})).collect();
            json!({"@or": clauses})
        };
        self.query(query, Some(filter), k).await
    }

    async fn search_all_sites(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        self.query(query, None, k).await
    }

    async fn search_by_url(&self, url: &str) -> Result<Option<RetrievedItem>, GatewayError> {
        let filter = json!({"@eq": {"url": url}});
        // Cortex has no exact-match lookup; query with the URL text and a
        // hard filter instead.
        Ok(self.query(url, Some(filter), 1).await?.into_iter().next())
    }
}
