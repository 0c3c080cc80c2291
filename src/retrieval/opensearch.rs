use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Document, RetrievedItem, VectorBackend, item_from_fields};
use crate::config::RetrievalEndpoint;
use crate::embedding::Embed;
use crate::error::GatewayError;

/// OpenSearch driver using kNN vector queries with a bool site filter.
pub struct OpenSearchBackend {
    label: String,
    client: reqwest::Client,
    base: String,
    index: String,
    api_key: Option<String>,
    embedder: Arc<dyn Embed>,
}

impl OpenSearchBackend {
    pub fn new(
        name: &str,
        endpoint: &RetrievalEndpoint,
        embedder: Arc<dyn Embed>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("opensearch http client: {e}")))?;
        Ok(Self {
            label: name.to_string(),
            client,
            base: endpoint
                .api_endpoint
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            index: endpoint
                .index_name
                .clone()
                .unwrap_or_else(|| "embeddings".to_string()),
            api_key: endpoint.api_key.clone(),
            embedder,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Value,
    ) -> Result<Value, GatewayError> {
        let mut request = self
            .client
            .request(method, format!("{}{path}", self.base))
            .json(&body);
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

    fn hits_to_items(data: &Value) -> Vec<RetrievedItem> {
        data["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| item_from_fields(&hit["_source"]))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn knn_search(
        &self,
        query: &str,
        filter: Option<Value>,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        let embedding = self.embedder.embed(query).await?;
        let mut bool_query = json!({
            "must": [{"knn": {"embedding": {"vector": embedding, "k": k}}}]
        });
        if let Some(filter) = filter {
            bool_query["filter"] = json!([filter]);
        }
        let body = json!({
            "size": k,
            "_source": ["url", "site", "schema_json", "name"],
            "query": {"bool": bool_query},
        });
        let path = format!("/{}/_search", self.index);
        let data = self.request(reqwest::Method::POST, &path, body).await?;
        let items = Self::hits_to_items(&data);
        debug!(backend = %self.label, hits = items.len(), "opensearch search done");
        Ok(items)
    }
}

fn site_filter(sites: &[String]) -> Value {
    if sites.len() == 1 {
        json!({"term": {"site": sites[0]}})
    } else {
        json!({"terms": {"site": sites}})
    }
}

#[async_trait]
impl VectorBackend for OpenSearchBackend {
    fn name(&self) -> &str {
        &self.label
    }

    async fn search(
        &self,
        query: &str,
        sites: &[String],
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        self.knn_search(query, Some(site_filter(sites)), k).await
    }

    async fn search_all_sites(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        self.knn_search(query, None, k).await
    }

    async fn search_by_url(&self, url: &str) -> Result<Option<RetrievedItem>, GatewayError> {
        let body = json!({
            "size": 1,
            "_source": ["url", "site", "schema_json", "name"],
            "query": {"term": {"url": url}},
        });
        let path = format!("/{}/_search", self.index);
        let data = self.request(reqwest::Method::POST, &path, body).await?;
        Ok(Self::hits_to_items(&data).into_iter().next())
    }

    async fn get_sites(&self) -> Result<Option<Vec<String>>, GatewayError> {
        let body = json!({
            "size": 0,
            "aggs": {"sites": {"terms": {"field": "site", "size": 1000}}},
        });
        let path = format!("/{}/_search", self.index);
        let data = self.request(reqwest::Method::POST, &path, body).await?;
        let sites = data["aggregations"]["sites"]["buckets"]
            .as_array()
            .map(|buckets| {
                buckets
                    .iter()
                    .filter_map(|b| b["key"].as_str().map(String::from))
                    .collect()
            });
        Ok(sites)
    }

    async fn upload_documents(&self, docs: &[Document]) -> Result<usize, GatewayError> {
        // Bulk NDJSON, document id = url.
        let mut ndjson = String::new();
        for doc in docs {
            let action = json!({"index": {"_index": self.index, "_id": doc.url}});
            let source = json!({
                "url": doc.url,
                "site": doc.site,
                "name": doc.name,
                "schema_json": doc.schema_json,
                "embedding": doc.embedding.clone().unwrap_or_default(),
            });
            ndjson.push_str(&action.to_string());
            ndjson.push('\n');
            ndjson.push_str(&source.to_string());
            ndjson.push('\n');
        }
        let mut request = self
            .client
            .post(format!("{}/_bulk", self.base))
            .header("content-type", "application/x-ndjson")
            .body(ndjson);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::external(&self.label, e))?;
        if !response.status().is_success() {
            return Err(GatewayError::external(
                &self.label,
                format!("bulk upload failed with status {}", response.status()),
            ));
        }
        Ok(docs.len())
    }

    async fn delete_documents_by_site(&self, site: &str) -> Result<usize, GatewayError> {
        let body = json!({"query": {"term": {"site": site}}});
        let path = format!("/{}/_delete_by_query", self.index);
        let data = self.request(reqwest::Method::POST, &path, body).await?;
        Ok(data["deleted"].as_u64().unwrap_or(0) as usize)
    }
}
