use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Once;

use crate::error::GatewayError;

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once.
///
/// Must be called early in `main()` before spawning concurrent tasks.
/// Uses `Once` to guarantee single execution — safe to call multiple times
/// but only the first call has any effect.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: The tokio multi-thread runtime has worker threads
                    // running, but no user tasks have been spawned yet and no
                    // concurrent env var reads occur at this point. `Once` ensures
                    // this runs at most once.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Top-level gateway configuration, assembled from the config directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub gateway: GatewayConfig,
    pub server: ServerConfig,
    /// Directory the config was loaded from; the tool catalogue and
    /// statistics assets are resolved relative to it.
    pub config_dir: PathBuf,
}

/// LLM provider configuration (`llm.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// OpenAI-style chat-completions endpoint.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub models: ModelTiers,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

/// Model names per tier. `high` for routing and matching decisions that
/// need quality, `low` for cheap per-item scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTiers {
    #[serde(default = "default_high_model")]
    pub high: String,
    #[serde(default = "default_low_model")]
    pub low: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            high: default_high_model(),
            low: default_low_model(),
        }
    }
}

/// Embedding provider configuration (`embedding.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

/// Retrieval configuration (`retrieval.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalConfig {
    /// The single endpoint used for upload/delete. Writes fail when unset.
    #[serde(default)]
    pub write_endpoint: Option<String>,

    #[serde(default)]
    pub endpoints: HashMap<String, RetrievalEndpoint>,
}

/// One named vector-store endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalEndpoint {
    pub db_type: DbType,

    /// Base URL of the store's REST API.
    #[serde(default)]
    pub api_endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Index / collection holding the site documents.
    #[serde(default)]
    pub index_name: Option<String>,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

/// Supported vector-store kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    AzureAiSearch,
    Opensearch,
    Qdrant,
    Elasticsearch,
    Postgres,
    SnowflakeCortexSearch,
    Milvus,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::AzureAiSearch => "azure_ai_search",
            DbType::Opensearch => "opensearch",
            DbType::Qdrant => "qdrant",
            DbType::Elasticsearch => "elasticsearch",
            DbType::Postgres => "postgres",
            DbType::SnowflakeCortexSearch => "snowflake_cortex_search",
            DbType::Milvus => "milvus",
        }
    }
}

/// Gateway behaviour (`nlgate.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Allowed sites. Empty means any site may be queried; a search with
    /// site scope "all" expands to this list when non-empty.
    #[serde(default)]
    pub sites: Vec<String>,

    /// Site -> schema.org item type. Sites not listed fall back to
    /// `default_item_type`.
    #[serde(default)]
    pub item_types: HashMap<String, String>,

    #[serde(default = "default_item_type")]
    pub default_item_type: String,

    /// Response headers announced as `header` messages on the stream.
    /// BTreeMap keeps emission order deterministic.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// API keys announced as `api_key` messages on the stream.
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub tool_selection_enabled: bool,

    #[serde(default = "default_true")]
    pub decontextualize_enabled: bool,

    #[serde(default = "default_true")]
    pub required_info_enabled: bool,

    #[serde(default)]
    pub memory_enabled: bool,

    #[serde(default)]
    pub analyze_query_enabled: bool,

    /// When set, child-task errors propagate instead of being logged and
    /// swallowed. Used by tests.
    #[serde(default)]
    pub strict_mode: bool,

    /// Allows the `db` query parameter to pin a single retrieval endpoint.
    #[serde(default)]
    pub development_mode: bool,

    #[serde(default)]
    pub ranking: RankingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sites: Vec::new(),
            item_types: HashMap::new(),
            default_item_type: default_item_type(),
            headers: BTreeMap::new(),
            api_keys: BTreeMap::new(),
            tool_selection_enabled: true,
            decontextualize_enabled: true,
            required_info_enabled: true,
            memory_enabled: false,
            analyze_query_enabled: false,
            strict_mode: false,
            development_mode: false,
            ranking: RankingConfig::default(),
        }
    }
}

/// Ranking engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingConfig {
    /// Bounded concurrency for per-item LLM scoring.
    #[serde(default = "default_ranking_workers")]
    pub num_workers: usize,

    /// Good-answer threshold for the regular track.
    #[serde(default = "default_regular_threshold")]
    pub regular_threshold: u32,

    /// Good-answer threshold for the speculative fast track.
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u32,

    /// Maximum answers returned in a non-streaming batch.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// When streaming produced fewer than this many good answers, the
    /// fallback pass re-emits top results up to this floor.
    #[serde(default = "default_fallback_floor")]
    pub fallback_floor: usize,

    /// Threshold reduction applied during the fallback pass.
    #[serde(default = "default_fallback_delta")]
    pub fallback_delta: u32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            num_workers: default_ranking_workers(),
            regular_threshold: default_regular_threshold(),
            fast_threshold: default_fast_threshold(),
            max_results: default_max_results(),
            fallback_floor: default_fallback_floor(),
            fallback_delta: default_fallback_delta(),
        }
    }
}

/// HTTP server settings (`server.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_retrieval_timeout() -> u64 {
    10
}

fn default_high_model() -> String {
    "gpt-4.1".to_string()
}

fn default_low_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_item_type() -> String {
    "Thing".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ranking_workers() -> usize {
    10
}

fn default_regular_threshold() -> u32 {
    51
}

fn default_fast_threshold() -> u32 {
    59
}

fn default_max_results() -> usize {
    10
}

fn default_fallback_floor() -> usize {
    2
}

fn default_fallback_delta() -> u32 {
    8
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

impl Config {
    /// Load all config files from a directory. Missing files fall back to
    /// defaults; `validate()` decides what is actually required.
    pub fn load(dir: &Path) -> Result<Self> {
        let config = Self {
            llm: load_yaml(dir, "llm.yaml")?,
            embedding: load_yaml(dir, "embedding.yaml")?,
            retrieval: load_yaml(dir, "retrieval.yaml")?,
            gateway: load_yaml(dir, "nlgate.yaml")?,
            server: load_yaml(dir, "server.yaml")?,
            config_dir: dir.to_path_buf(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; any failure here is fatal.
    fn validate(&self) -> Result<(), GatewayError> {
        if self.llm.endpoint.is_empty() {
            return Err(GatewayError::Configuration(
                "llm.yaml: endpoint is required".into(),
            ));
        }

        let enabled = self
            .retrieval
            .endpoints
            .values()
            .filter(|e| e.enabled)
            .count();
        if enabled == 0 {
            return Err(GatewayError::Configuration(
                "retrieval.yaml: no enabled retrieval endpoints".into(),
            ));
        }

        for (name, endpoint) in &self.retrieval.endpoints {
            if !endpoint.enabled {
                continue;
            }
            if endpoint.db_type == DbType::Postgres {
                return Err(GatewayError::Configuration(format!(
                    "retrieval.yaml: endpoint '{name}' has unsupported db_type 'postgres'"
                )));
            }
            if endpoint.api_endpoint.as_deref().unwrap_or("").is_empty() {
                return Err(GatewayError::Configuration(format!(
                    "retrieval.yaml: endpoint '{name}' is enabled but has no api_endpoint"
                )));
            }
        }

        if let Some(write) = &self.retrieval.write_endpoint
            && !self.retrieval.endpoints.contains_key(write)
        {
            return Err(GatewayError::Configuration(format!(
                "retrieval.yaml: write_endpoint '{write}' is not a configured endpoint"
            )));
        }

        Ok(())
    }

    /// Item type for a site scope. Multi-site and "all" scopes fall back
    /// to the default type.
    pub fn item_type_for_site(&self, site: &crate::state::SiteScope) -> String {
        match site {
            crate::state::SiteScope::One(s) => self
                .gateway
                .item_types
                .get(s)
                .cloned()
                .unwrap_or_else(|| self.gateway.default_item_type.clone()),
            _ => self.gateway.default_item_type.clone(),
        }
    }

    pub fn tools_path(&self) -> PathBuf {
        self.config_dir.join("tools.xml")
    }

    pub fn statistics_templates_path(&self) -> PathBuf {
        self.config_dir.join("statistics_templates.txt")
    }

    pub fn dcid_mappings_path(&self) -> PathBuf {
        self.config_dir.join("dcid_mappings.json")
    }
}

/// Read one YAML file with `${VAR}` expansion; a missing file yields the
/// type's defaults.
fn load_yaml<T: serde::de::DeserializeOwned + Default>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.is_file() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let expanded = shellexpand::env(&raw)
        .map(|c| c.into_owned())
        .unwrap_or(raw);
    serde_yaml_ng::from_str(&expanded).with_context(|| format!("failed to parse {name}"))
}
