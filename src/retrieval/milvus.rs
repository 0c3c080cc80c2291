use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Document, RetrievedItem, VectorBackend, item_from_fields};
use crate::config::RetrievalEndpoint;
use crate::embedding::Embed;
use crate::error::GatewayError;

/// Milvus driver over the v2 REST API (`/v2/vectordb/...`). Entities
/// carry the document tuple as scalar fields next to the vector.
pub struct MilvusBackend {
    label: String,
    client: reqwest::Client,
    base: String,
    collection: String,
    api_key: Option<String>,
    embedder: Arc<dyn Embed>,
}

impl MilvusBackend {
    pub fn new(
        name: &str,
        endpoint: &RetrievalEndpoint,
        embedder: Arc<dyn Embed>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("milvus http client: {e}")))?;
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
            request = request.bearer_auth(key);
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
        filter: Option<String>,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        let vector = self.embedder.embed(query).await?;
        let mut body = json!({
            "collectionName": self.collection,
            "data": [vector],
            "limit": k,
            "outputFields": ["url", "site", "schema_json", "name"],
        });
        if let Some(filter) = filter {
            body["filter"] = Value::String(filter);
        }
        let data = self.post("/v2/vectordb/entities/search", body).await?;
        let items: Vec<RetrievedItem> = data["data"]
            .as_array()
            .map(|rows| rows.iter().filter_map(item_from_fields).collect())
            .unwrap_or_default();
        debug!(backend = %self.label, hits = items.len(), "milvus search done");
        Ok(items)
    }
}

/// Milvus boolean filter expression over the site field.
fn site_filter(sites: &[String]) -> String {
    let quoted: Vec<String> = sites
        .iter()
        .map(|s| format!("\"{}\"", s.replace('"', "")))
        .collect();
    format!("site in [{}]", quoted.join(", "))
}

#[async_trait]
impl VectorBackend for MilvusBackend {
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
            "collectionName": self.collection,
            "filter": format!("url == \"{}\"", url.replace('"', "")),
            "limit": 1,
            "outputFields": ["url", "site", "schema_json", "name"],
        });
        let data = self.post("/v2/vectordb/entities/query", body).await?;
        Ok(data["data"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(item_from_fields))
    }

    async fn upload_documents(&self, docs: &[Document]) -> Result<usize, GatewayError> {
        let rows: Vec<Value> = docs
            .iter()
            .filter_map(|doc| {
                let vector = doc.embedding.as_ref()?;
                Some(json!({
                    "url": doc.url,
                    "site": doc.site,
                    "name": doc.name,
                    "schema_json": doc.schema_json,
                    "embedding": vector,
                }))
            })
            .collect();
        let count = rows.len();
        let body = json!({"collectionName": self.collection, "data": rows});
        self.post("/v2/vectordb/entities/insert", body).await?;
        Ok(count)
    }

    async fn delete_documents_by_site(&self, site: &str) -> Result<usize, GatewayError> {
        let body = json!({
            "collectionName": self.collection,
            "filter": format!("site == \"{}\"", site.replace('"', "")),
        });
        self.post("/v2/vectordb/entities/delete", body).await?;
        Ok(0)
    }
}
