use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Document, RetrievedItem, VectorBackend, item_from_fields};
use crate::config::RetrievalEndpoint;
use crate::embedding::Embed;
use crate::error::GatewayError;

/// Qdrant driver over its REST API. Points carry the document tuple in
/// their payload; site filtering uses a payload match condition.
pub struct QdrantBackend {
    label: String,
    client: reqwest::Client,
    base: String,
    collection: String,
    api_key: Option<String>,
    embedder: Arc<dyn Embed>,
}

impl QdrantBackend {
    pub fn new(
        name: &str,
        endpoint: &RetrievalEndpoint,
        embedder: Arc<dyn Embed>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("qdrant http client: {e}")))?;
        Ok(Self {
            label: name.to_string(),
            client,
            base: endpoint
                .api_endpoint
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            collection: endpoint
                .index_name
                .clone()
                .unwrap_or_else(|| "embeddings".to_string()),
            api_key: endpoint.api_key.clone(),
            embedder,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, GatewayError> {
        let mut request = self.client.post(format!("{}{path}", self.base)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        let response = request
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
        response
            .json()
            .await
            .map_err(|e| GatewayError::external(&self.label, e))
    }

    async fn vector_search(
        &self,
        query: &str,
        filter: Option<Value>,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        let vector = self.embedder.embed(query).await?;
        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let path = format!("/collections/{}/points/search", self.collection);
        let data = self.post(&path, body).await?;
        let hits = data["result"].as_array().cloned().unwrap_or_default();
        debug!(backend = %self.label, hits = hits.len(), "qdrant search done");
        Ok(hits
            .iter()
            .filter_map(|hit| item_from_fields(&hit["payload"]))
            .collect())
    }
}

fn site_filter(sites: &[String]) -> Value {
    json!({
        "must": [{"key": "site", "match": {"any": sites}}]
    })
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn search(
        &self,
        query: &str,
        sites: &[String],
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        self.vector_search(query, Some(site_filter(sites)), k).await
    }

    async fn search_all_sites(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        self.vector_search(query, None, k).await
    }

    async fn search_by_url(&self, url: &str) -> Result<Option<RetrievedItem>, GatewayError> {
        let body = json!({
            "filter": {"must": [{"key": "url", "match": {"value": url}}]},
            "limit": 1,
            "with_payload": true,
        });
        let path = format!("/collections/{}/points/scroll", self.collection);
        let data = self.post(&path, body).await?;
        Ok(data["result"]["points"]
            .as_array()
            .and_then(|points| points.first())
            .and_then(|point| item_from_fields(&point["payload"])))
    }

    async fn upload_documents(&self, docs: &[Document]) -> Result<usize, GatewayError> {
        let points: Vec<Value> = docs
            .iter()
            .filter_map(|doc| {
                let vector = doc.embedding.as_ref()?;
                Some(json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "vector": vector,
                    "payload": {
                        "url": doc.url,
                        "schema_json": doc.schema_json,
                        "name": doc.name,
                        "site": doc.site,
                    },
                }))
            })
            .collect();
        let count = points.len();
        let path = format!("/collections/{}/points?wait=true", self.collection);
        let mut request = self
            .client
            .put(format!("{}{path}", self.base))
            .json(&json!({"points": points}));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::external(&self.label, e))?;
        if !response.status().is_success() {
            return Err(GatewayError::external(
                &self.label,
                format!("upload failed with status {}", response.status()),
            ));
        }
        Ok(count)
    }

    async fn delete_documents_by_site(&self, site: &str) -> Result<usize, GatewayError> {
        let body = json!({
            "filter": {"must": [{"key": "site", "match": {"value": site}}]}
        });
        let path = format!("/collections/{}/points/delete?wait=true", self.collection);
        self.post(&path, body).await?;
        // Qdrant's delete-by-filter does not report a count.
        Ok(0)
    }
}
