pub mod azure_search;
pub mod elasticsearch;
pub mod milvus;
pub mod opensearch;
pub mod qdrant;
pub mod snowflake;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, DbType, RetrievalEndpoint};
use crate::embedding::Embed;
use crate::error::GatewayError;
use crate::state::SiteScope;

/// One retrieved document: `(url, schema_json, name, site)`.
///
/// `schema_json` is a serialised schema.org document. When the same URL
/// comes back from several backends the aggregator replaces it with a
/// JSON array holding every source document.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedItem {
    pub url: String,
    pub schema_json: String,
    pub name: String,
    pub site: String,
}

impl RetrievedItem {
    pub fn schema_object(&self) -> Value {
        serde_json::from_str(&self.schema_json)
            .unwrap_or_else(|_| Value::String(self.schema_json.clone()))
    }
}

/// A document to be written through the write endpoint.
#[derive(Debug, Clone)]
pub struct Document {
    pub url: String,
    pub schema_json: String,
    pub name: String,
    pub site: String,
    pub embedding: Option<Vec<f32>>,
}

/// Capability-set interface over one vector store.
///
/// `get_sites` is optional: `Ok(None)` means the store cannot enumerate
/// sites and must always be considered for a search. Write operations
/// default to unsupported; stores that can ingest override them.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        sites: &[String],
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError>;

    async fn search_all_sites(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedItem>, GatewayError>;

    async fn search_by_url(&self, url: &str) -> Result<Option<RetrievedItem>, GatewayError>;

    async fn get_sites(&self) -> Result<Option<Vec<String>>, GatewayError> {
        Ok(None)
    }

    async fn upload_documents(&self, _docs: &[Document]) -> Result<usize, GatewayError> {
        Err(GatewayError::external(
            self.name(),
            "write operations not supported by this backend",
        ))
    }

    async fn delete_documents_by_site(&self, _site: &str) -> Result<usize, GatewayError> {
        Err(GatewayError::external(
            self.name(),
            "write operations not supported by this backend",
        ))
    }
}

/// Build a driver for one configured endpoint.
fn create_backend(
    name: &str,
    endpoint: &RetrievalEndpoint,
    embedder: Arc<dyn Embed>,
) -> Result<Arc<dyn VectorBackend>, GatewayError> {
    let backend: Arc<dyn VectorBackend> = match endpoint.db_type {
        DbType::AzureAiSearch => {
            Arc::new(azure_search::AzureSearchBackend::new(name, endpoint, embedder)?)
        }
        DbType::Opensearch => {
            Arc::new(opensearch::OpenSearchBackend::new(name, endpoint, embedder)?)
        }
        DbType::Elasticsearch => {
            Arc::new(elasticsearch::ElasticsearchBackend::new(name, endpoint, embedder)?)
        }
        DbType::Qdrant => Arc::new(qdrant::QdrantBackend::new(name, endpoint, embedder)?),
        DbType::SnowflakeCortexSearch => {
            Arc::new(snowflake::SnowflakeBackend::new(name, endpoint)?)
        }
        DbType::Milvus => Arc::new(milvus::MilvusBackend::new(name, endpoint, embedder)?),
        DbType::Postgres => {
            return Err(GatewayError::Configuration(format!(
                "endpoint '{name}': db_type 'postgres' is not supported"
            )));
        }
    };
    Ok(backend)
}

/// Composes all enabled endpoints behind one search interface: endpoint
/// gating on cached site sets, parallel fan-out, interleaved merge with
/// URL dedup, and a single designated write endpoint.
pub struct UnifiedRetriever {
    /// Enabled endpoints in stable (name-sorted) order.
    endpoints: Vec<(String, RetrievalEndpoint)>,
    write_endpoint: Option<String>,
    development_mode: bool,
    /// Allowed sites from config; "all" expands to this when non-empty.
    configured_sites: Vec<String>,
    embedder: Arc<dyn Embed>,
    /// One driver per endpoint, created lazily, reused for the process
    /// lifetime.
    clients: DashMap<String, Arc<dyn VectorBackend>>,
    /// endpoint name -> Some(site list) or None for "unsupported".
    site_cache: DashMap<String, Option<Vec<String>>>,
}

impl UnifiedRetriever {
    pub fn new(config: &Config, embedder: Arc<dyn Embed>) -> Self {
        let mut endpoints: Vec<(String, RetrievalEndpoint)> = config
            .retrieval
            .endpoints
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(name, e)| (name.clone(), e.clone()))
            .collect();
        endpoints.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            endpoints,
            write_endpoint: config.retrieval.write_endpoint.clone(),
            development_mode: config.gateway.development_mode,
            configured_sites: config.gateway.sites.clone(),
            embedder,
            clients: DashMap::new(),
            site_cache: DashMap::new(),
        }
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.iter().map(|(n, _)| n.clone()).collect()
    }

    async fn client(&self, name: &str) -> Result<Arc<dyn VectorBackend>, GatewayError> {
        if let Some(client) = self.clients.get(name) {
            return Ok(Arc::clone(client.value()));
        }
        let endpoint = self
            .endpoints
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| {
                GatewayError::Configuration(format!("endpoint '{name}' is not enabled"))
            })?;
        debug!(endpoint = %name, db_type = endpoint.db_type.as_str(), "creating retrieval client");
        let backend = create_backend(name, &endpoint, Arc::clone(&self.embedder))?;
        self.clients.insert(name.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Site set for an endpoint, cached on first use. `None` means the
    /// backend cannot enumerate sites and is always considered.
    async fn endpoint_sites(&self, name: &str) -> Option<Vec<String>> {
        if let Some(cached) = self.site_cache.get(name) {
            return cached.value().clone();
        }
        let sites = match self.client(name).await {
            Ok(client) => match client.get_sites().await {
                Ok(sites) => sites,
                Err(e) => {
                    debug!(endpoint = %name, error = %e, "get_sites failed, treating as unsupported");
                    None
                }
            },
            Err(e) => {
                debug!(endpoint = %name, error = %e, "client creation failed during site probe");
                None
            }
        };
        self.site_cache.insert(name.to_string(), sites.clone());
        sites
    }

    /// Endpoint gating: query an endpoint only when its site set is
    /// unknown or intersects the requested scope.
    async fn endpoint_has_site(&self, name: &str, scope: &SiteScope) -> bool {
        if scope.is_all() {
            return true;
        }
        let Some(endpoint_sites) = self.endpoint_sites(name).await else {
            return true;
        };
        if endpoint_sites.is_empty() {
            return false;
        }
        let Some(requested) = scope.sites() else {
            return true;
        };
        requested.iter().any(|s| endpoint_sites.contains(s))
    }

    /// Vector search across all selected endpoints, merged by URL.
    pub async fn search(
        &self,
        query: &str,
        scope: &SiteScope,
        k: usize,
        db_override: Option<&str>,
    ) -> Result<Vec<RetrievedItem>, GatewayError> {
        // "all" expands to the configured allow-list when one is set.
        let scope = if scope.is_all() && !self.configured_sites.is_empty() {
            SiteScope::Many(self.configured_sites.clone())
        } else {
            scope.clone()
        };

        let selected = self.select_endpoints(&scope, db_override).await;
        if selected.is_empty() {
            return Err(GatewayError::AllBackendsFailed { attempted: 0 });
        }

        let searches = selected.iter().map(|(name, endpoint)| {
            let name = name.clone();
            let timeout = Duration::from_secs(endpoint.timeout_secs);
            let scope = scope.clone();
            async move {
                let result = tokio::time::timeout(timeout, async {
                    let client = self.client(&name).await?;
                    match scope.sites() {
                        Some(sites) => client.search(query, &sites, k).await,
                        None => client.search_all_sites(query, k).await,
                    }
                })
                .await
                .unwrap_or_else(|_| Err(GatewayError::external(&name, "search timed out")));
                (name, result)
            }
        });

        let outcomes = futures::future::join_all(searches).await;
        let mut endpoint_results: Vec<(String, Vec<RetrievedItem>)> = Vec::new();
        for (name, result) in outcomes {
            match result {
                Ok(items) => {
                    debug!(endpoint = %name, results = items.len(), "endpoint search done");
                    endpoint_results.push((name, items));
                }
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "endpoint search failed, excluding from merge");
                }
            }
        }

        if endpoint_results.is_empty() {
            return Err(GatewayError::AllBackendsFailed {
                attempted: selected.len(),
            });
        }

        let merged = aggregate(&endpoint_results, k);
        info!(
            endpoints_queried = selected.len(),
            endpoints_succeeded = endpoint_results.len(),
            results = merged.len(),
            site = %scope,
            "search merged"
        );
        Ok(merged)
    }

    async fn select_endpoints(
        &self,
        scope: &SiteScope,
        db_override: Option<&str>,
    ) -> Vec<(String, RetrievalEndpoint)> {
        if self.development_mode
            && let Some(db) = db_override
        {
            return self
                .endpoints
                .iter()
                .filter(|(name, _)| name == db)
                .cloned()
                .collect();
        }

        let mut selected = Vec::new();
        for (name, endpoint) in &self.endpoints {
            if self.endpoint_has_site(name, scope).await {
                selected.push((name.clone(), endpoint.clone()));
            } else {
                debug!(endpoint = %name, site = %scope, "endpoint skipped, site not present");
            }
        }
        selected
    }

    /// Exact-URL lookup, first endpoint that has it wins.
    pub async fn search_by_url(&self, url: &str) -> Option<RetrievedItem> {
        for (name, _) in &self.endpoints {
            match self.client(name).await {
                Ok(client) => match client.search_by_url(url).await {
                    Ok(Some(item)) => return Some(item),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(endpoint = %name, error = %e, "search_by_url failed");
                    }
                },
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "client creation failed");
                }
            }
        }
        None
    }

    /// Union of the site sets of all endpoints that can enumerate them.
    pub async fn get_sites(&self) -> Vec<String> {
        let mut all: HashSet<String> = HashSet::new();
        for (name, _) in &self.endpoints {
            if let Some(sites) = self.endpoint_sites(name).await {
                all.extend(sites);
            }
        }
        let mut sites: Vec<String> = all.into_iter().collect();
        sites.sort();
        sites
    }

    async fn write_client(&self) -> Result<Arc<dyn VectorBackend>, GatewayError> {
        let name = self.write_endpoint.as_deref().ok_or_else(|| {
            GatewayError::Configuration("no write endpoint configured".into())
        })?;
        self.client(name).await
    }

    pub async fn upload_documents(&self, docs: &[Document]) -> Result<usize, GatewayError> {
        let client = self.write_client().await?;
        info!(documents = docs.len(), endpoint = %client.name(), "uploading documents");
        client.upload_documents(docs).await
    }

    pub async fn delete_documents_by_site(&self, site: &str) -> Result<usize, GatewayError> {
        let client = self.write_client().await?;
        info!(site = %site, endpoint = %client.name(), "deleting documents");
        client.delete_documents_by_site(site).await
    }
}

/// Merge per-endpoint result lists: interleave in rank order to preserve
/// per-backend relevance, dedup by URL, and coalesce duplicate documents
/// into a JSON array.
pub(crate) fn aggregate(
    endpoint_results: &[(String, Vec<RetrievedItem>)],
    k: usize,
) -> Vec<RetrievedItem> {
    use std::collections::HashMap;

    // url -> every source document, in endpoint order.
    let mut json_lists: HashMap<&str, Vec<&str>> = HashMap::new();
    for (_, items) in endpoint_results {
        for item in items {
            json_lists
                .entry(item.url.as_str())
                .or_default()
                .push(item.schema_json.as_str());
        }
    }

    let mut merged = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursors = vec![0usize; endpoint_results.len()];

    loop {
        let mut progressed = false;
        for (i, (_, items)) in endpoint_results.iter().enumerate() {
            if cursors[i] >= items.len() {
                continue;
            }
            let item = &items[cursors[i]];
            cursors[i] += 1;
            progressed = true;

            if !seen.insert(item.url.as_str()) {
                continue;
            }
            let sources = &json_lists[item.url.as_str()];
            let schema_json = if sources.len() > 1 {
                merge_json_array(sources)
            } else {
                item.schema_json.clone()
            };
            merged.push(RetrievedItem {
                url: item.url.clone(),
                schema_json,
                name: item.name.clone(),
                site: item.site.clone(),
            });
            if merged.len() == k {
                return merged;
            }
        }
        if !progressed {
            break;
        }
    }
    merged
}

/// Combine several serialised documents into one JSON array string.
fn merge_json_array(sources: &[&str]) -> String {
    let values: Vec<Value> = sources
        .iter()
        .map(|s| serde_json::from_str(s).unwrap_or_else(|_| Value::String((*s).to_string())))
        .collect();
    serde_json::to_string(&Value::Array(values)).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a backend hit whose fields carry the document tuple. The
/// `schema_json` field may arrive as a string or an embedded object.
pub(crate) fn item_from_fields(fields: &Value) -> Option<RetrievedItem> {
    let url = fields["url"].as_str()?.to_string();
    let schema_json = match &fields["schema_json"] {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    Some(RetrievedItem {
        url,
        schema_json,
        name: fields["name"].as_str().unwrap_or_default().to_string(),
        site: fields["site"].as_str().unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::config::RetrievalEndpoint;

    /// Embedder that returns a fixed vector; backends under test never
    /// reach the network.
    pub struct NoopEmbed;

    #[async_trait]
    impl Embed for NoopEmbed {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, GatewayError> {
            Ok(vec![0.0; 8])
        }
    }

    /// In-memory backend with canned items.
    pub struct FakeBackend {
        pub label: String,
        pub items: Vec<RetrievedItem>,
        /// `None` = cannot enumerate sites (always considered).
        pub sites: Option<Vec<String>>,
        pub fail: bool,
        /// Artificial latency, for tests that depend on ordering.
        pub delay: Option<Duration>,
    }

    impl FakeBackend {
        fn base() -> Self {
            Self {
                label: "fake".into(),
                items: Vec::new(),
                sites: None,
                fail: false,
                delay: None,
            }
        }

        pub fn empty() -> Arc<dyn VectorBackend> {
            Arc::new(Self::base())
        }

        pub fn with_items(items: Vec<RetrievedItem>) -> Arc<dyn VectorBackend> {
            Arc::new(Self {
                items,
                ..Self::base()
            })
        }

        pub fn with_items_delayed(
            items: Vec<RetrievedItem>,
            delay: Duration,
        ) -> Arc<dyn VectorBackend> {
            Arc::new(Self {
                items,
                delay: Some(delay),
                ..Self::base()
            })
        }

        pub fn failing() -> Arc<dyn VectorBackend> {
            Arc::new(Self {
                fail: true,
                ..Self::base()
            })
        }

        pub fn with_sites(
            items: Vec<RetrievedItem>,
            sites: Vec<&str>,
        ) -> Arc<dyn VectorBackend> {
            Arc::new(Self {
                items,
                sites: Some(sites.into_iter().map(String::from).collect()),
                ..Self::base()
            })
        }

        async fn simulate(&self) -> Result<(), GatewayError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(GatewayError::external(&self.label, "injected failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VectorBackend for FakeBackend {
        fn name(&self) -> &str {
            &self.label
        }

        async fn search(
            &self,
            _query: &str,
            sites: &[String],
            k: usize,
        ) -> Result<Vec<RetrievedItem>, GatewayError> {
            self.simulate().await?;
            Ok(self
                .items
                .iter()
                .filter(|i| sites.contains(&i.site))
                .take(k)
                .cloned()
                .collect())
        }

        async fn search_all_sites(
            &self,
            _query: &str,
            k: usize,
        ) -> Result<Vec<RetrievedItem>, GatewayError> {
            self.simulate().await?;
            Ok(self.items.iter().take(k).cloned().collect())
        }

        async fn search_by_url(&self, url: &str) -> Result<Option<RetrievedItem>, GatewayError> {
            self.simulate().await?;
            Ok(self.items.iter().find(|i| i.url == url).cloned())
        }

        async fn get_sites(&self) -> Result<Option<Vec<String>>, GatewayError> {
            Ok(self.sites.clone())
        }
    }

    pub fn item(url: &str, site: &str, name: &str) -> RetrievedItem {
        RetrievedItem {
            url: url.to_string(),
            schema_json: serde_json::json!({"@type": "Thing", "name": name}).to_string(),
            name: name.to_string(),
            site: site.to_string(),
        }
    }

    /// Retriever over pre-registered fake backends.
    pub fn retriever_with(
        backends: Vec<(&str, Arc<dyn VectorBackend>)>,
    ) -> Arc<UnifiedRetriever> {
        let endpoints = backends
            .iter()
            .map(|(name, _)| {
                (
                    name.to_string(),
                    RetrievalEndpoint {
                        db_type: crate::config::DbType::Qdrant,
                        api_endpoint: Some("http://unused".into()),
                        api_key: None,
                        index_name: None,
                        enabled: true,
                        timeout_secs: 5,
                    },
                )
            })
            .collect();

        let retriever = UnifiedRetriever {
            endpoints,
            write_endpoint: None,
            development_mode: false,
            configured_sites: Vec::new(),
            embedder: Arc::new(NoopEmbed),
            clients: DashMap::new(),
            site_cache: DashMap::new(),
        };
        for (name, backend) in backends {
            retriever.clients.insert(name.to_string(), backend);
        }
        Arc::new(retriever)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::state::SiteScope;

    #[tokio::test]
    async fn test_parallel_fanout_merges_distinct_urls() {
        let retriever = retriever_with(vec![
            (
                "a",
                FakeBackend::with_items(vec![item("u1", "s", "one"), item("u2", "s", "two")]),
            ),
            ("b", FakeBackend::with_items(vec![item("u3", "s", "three")])),
        ]);

        let results = retriever
            .search("q", &SiteScope::One("s".into()), 10, None)
            .await
            .unwrap();
        let urls: HashSet<&str> = results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, HashSet::from(["u1", "u2", "u3"]));
    }

    #[tokio::test]
    async fn test_duplicate_url_coalesces_into_json_array() {
        let retriever = retriever_with(vec![
            ("a", FakeBackend::with_items(vec![item("u1", "s", "one")])),
            ("b", FakeBackend::with_items(vec![item("u1", "s", "one")])),
        ]);

        let results = retriever
            .search("q", &SiteScope::One("s".into()), 10, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let merged: Value = serde_json::from_str(&results[0].schema_json).unwrap();
        // One sub-document per backend that returned the URL.
        assert_eq!(merged.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_failure_excluded_from_merge() {
        let retriever = retriever_with(vec![
            ("a", FakeBackend::failing()),
            ("b", FakeBackend::with_items(vec![item("u1", "s", "one")])),
        ]);

        let results = retriever
            .search("q", &SiteScope::One("s".into()), 10, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_an_error() {
        let retriever = retriever_with(vec![
            ("a", FakeBackend::failing()),
            ("b", FakeBackend::failing()),
        ]);

        let err = retriever
            .search("q", &SiteScope::One("s".into()), 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AllBackendsFailed { attempted: 2 }));
    }

    #[tokio::test]
    async fn test_endpoint_gating_skips_non_matching_sites() {
        let retriever = retriever_with(vec![
            (
                "a",
                FakeBackend::with_sites(vec![item("u1", "cooking", "one")], vec!["cooking"]),
            ),
            (
                "b",
                FakeBackend::with_sites(vec![item("u2", "movies", "two")], vec!["movies"]),
            ),
        ]);

        let results = retriever
            .search("q", &SiteScope::One("cooking".into()), 10, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "u1");
    }

    #[tokio::test]
    async fn test_all_scope_superset_of_single_site() {
        let items = vec![item("u1", "cooking", "one"), item("u2", "movies", "two")];
        let retriever = retriever_with(vec![("a", FakeBackend::with_items(items))]);

        let all = retriever.search("q", &SiteScope::All, 10, None).await.unwrap();
        let single = retriever
            .search("q", &SiteScope::One("cooking".into()), 10, None)
            .await
            .unwrap();

        let all_urls: HashSet<String> = all.iter().map(|r| r.url.clone()).collect();
        for item in single {
            assert!(all_urls.contains(&item.url));
        }
    }

    #[tokio::test]
    async fn test_search_by_url_falls_through_endpoints() {
        let retriever = retriever_with(vec![
            ("a", FakeBackend::empty()),
            ("b", FakeBackend::with_items(vec![item("u9", "s", "nine")])),
        ]);
        let found = retriever.search_by_url("u9").await.unwrap();
        assert_eq!(found.name, "nine");
        assert!(retriever.search_by_url("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_writes_require_write_endpoint() {
        let retriever = retriever_with(vec![("a", FakeBackend::empty())]);
        let err = retriever.delete_documents_by_site("s").await.unwrap_err();
        assert!(err.to_string().contains("write endpoint"));
    }

    #[test]
    fn test_aggregate_interleaves_in_rank_order() {
        let results = vec![
            (
                "a".to_string(),
                vec![item("a1", "s", ""), item("a2", "s", "")],
            ),
            (
                "b".to_string(),
                vec![item("b1", "s", ""), item("b2", "s", "")],
            ),
        ];
        let merged = aggregate(&results, 10);
        let urls: Vec<&str> = merged.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_aggregate_truncates_to_k() {
        let results = vec![(
            "a".to_string(),
            (0..20)
                .map(|i| item(&format!("u{i}"), "s", ""))
                .collect::<Vec<_>>(),
        )];
        assert_eq!(aggregate(&results, 5).len(), 5);
    }

    #[test]
    fn test_item_from_fields_tolerates_object_schema() {
        let fields = serde_json::json!({
            "url": "u",
            "schema_json": {"@type": "Recipe"},
            "name": "n",
            "site": "s",
        });
        let item = item_from_fields(&fields).unwrap();
        assert!(item.schema_json.contains("Recipe"));
    }
}
