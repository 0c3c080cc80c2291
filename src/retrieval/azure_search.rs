use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Document, RetrievedItem, VectorBackend, item_from_fields};
use crate::config::RetrievalEndpoint;
use crate::embedding::Embed;
use crate::error::GatewayError;

const API_VERSION: &str = "2024-07-01";

/// Azure AI Search driver. Vector queries against the documents index,
/// OData filters for site and URL restriction.
pub struct AzureSearchBackend {
    label: String,
    client: reqwest::Client,
    base: String,
    index: String,
    api_key: String,
    embedder: Arc<dyn Embed>,
}

impl AzureSearchBackend {
    pub fn new(
        name: &str,
        endpoint: &RetrievalEndpoint,
        embedder: Arc<dyn Embed>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("azure search http client: {e}")))?;
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
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            embedder,
        })
    }

    async fn post(&self, action: &str, body: Value) -> Result<Value, GatewayError> {
        let url = format!(
            "{}/indexes/{}/docs/{action}?api-version={API_VERSION}",
            self.base, self.index
        );
        let response = self
            .client
            .post(url)
            .header("api-key", &self.api_key)
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
        response
            .json()
            .await
            .map_err(|e| GatewayError::external(&self.label, e))
    }

    fn docs_to_items(data: &Value) -> Vec<RetrievedItem> {
        data["value"]
            .as_array()
            .map(|docs| docs.iter().filter_map(item_from_fields).collect())
            .unwrap_or_default()
    }

    async fn vector_search(
        &self,
        query: &str,
        filter: Option<String>,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        let embedding = self.embedder.embed(query).await?;
        let mut body = json!({
            "top": k,
            "select": "url,site,schema_json,name",
            "vectorQueries": [{
                "kind": "vector",
                "vector": embedding,
                "fields": "embedding",
                "k": k,
            }],
        });
        if let Some(filter) = filter {
            body["filter"] = Value::String(filter);
        }
        let data = self.post("search", body).await?;
        let items = Self::docs_to_items(&data);
        debug!(backend = %self.label, hits = items.len(), "azure search done");
        Ok(items)
    }
}

/// OData `search.in` filter over the site field. Single quotes in values
/// are doubled per OData escaping rules.
fn site_filter(sites: &[String]) -> String {
    let joined = sites
        .iter()
        .map(|s| s.replace('\'', "''"))
        .collect::<Vec<_>>()
        .join("|");
    format!("search.in(site, '{joined}', '|')")
}

#[async_trait]
impl VectorBackend for AzureSearchBackend {
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
            "top": 1,
            "select": "url,site,schema_json,name",
            "filter": format!("url eq '{}'", url.replace('\'', "''")),
        });
        let data = self.post("search", body).await?;
        Ok(Self::docs_to_items(&data).into_iter().next())
    }

    async fn get_sites(&self) -> Result<Option<Vec<String>>, GatewayError> {
        let body = json!({
            "search": "*",
            "top": 0,
            "facets": ["site,count:1000"],
        });
        let data = self.post("search", body).await?;
        let sites = data["@search.facets"]["site"].as_array().map(|facets| {
            facets
                .iter()
                .filter_map(|f| f["value"].as_str().map(String::from))
                .collect()
        });
        Ok(sites)
    }

    async fn upload_documents(&self, docs: &[Document]) -> Result<usize, GatewayError> {
        let value: Vec<Value> = docs
            .iter()
            .map(|doc| {
                json!({
                    "@search.action": "mergeOrUpload",
                    "id": uuid::Uuid::new_v4().to_string(),
                    "url": doc.url,
                    "site": doc.site,
                    "name": doc.name,
                    "schema_json": doc.schema_json,
                    "embedding": doc.embedding.clone().unwrap_or_default(),
                })
            })
            .collect();
        let count = value.len();
        self.post("index", json!({"value": value})).await?;
        Ok(count)
    }

    async fn delete_documents_by_site(&self, site: &str) -> Result<usize, GatewayError> {
        // Azure deletes by key: look the ids up first, then submit delete
        // actions.
        let body = json!({
            "top": 1000,
            "select": "id",
            "filter": format!("site eq '{}'", site.replace('\'', "''")),
        });
        let data = self.post("search", body).await?;
        let ids: Vec<&str> = data["value"]
            .as_array()
            .map(|docs| docs.iter().filter_map(|d| d["id"].as_str()).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(0);
        }
        let actions: Vec<Value> = ids
            .iter()
            .map(|id| json!({"@search.action": "delete", "id": id}))
            .collect();
        let count = actions.len();
        self.post("index", json!({"value": actions})).await?;
        Ok(count)
    }
}
