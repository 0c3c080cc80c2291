use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::debug;

use crate::catalogue::{ToolCatalogue, ToolDescriptor};
use crate::config::Config;
use crate::error::GatewayError;
use crate::llm::AskLlm;
use crate::messages::{AnswerItem, Message};
use crate::retrieval::{RetrievedItem, UnifiedRetriever};

/// One-shot waitable event. Consumers either poll `is_set` at suspension
/// points or park on `wait`.
pub struct Event {
    flag: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn new_set() -> Self {
        Self {
            flag: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Only `connection_alive` is ever cleared; the other events are
    /// one-shot.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Which sites a query targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteScope {
    All,
    One(String),
    Many(Vec<String>),
}

impl SiteScope {
    /// Parse the `site` request parameter: "all", a single site, or a
    /// comma-separated list.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return SiteScope::All;
        }
        if raw.contains(',') {
            let sites: Vec<String> = raw
                .trim_matches(['[', ']'])
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            return match sites.len() {
                0 => SiteScope::All,
                1 => SiteScope::One(sites.into_iter().next().unwrap()),
                _ => SiteScope::Many(sites),
            };
        }
        SiteScope::One(raw.replace(' ', "_"))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, SiteScope::All)
    }

    /// The concrete site list, or `None` for "all".
    pub fn sites(&self) -> Option<Vec<String>> {
        match self {
            SiteScope::All => None,
            SiteScope::One(s) => Some(vec![s.clone()]),
            SiteScope::Many(s) => Some(s.clone()),
        }
    }
}

impl std::fmt::Display for SiteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteScope::All => write!(f, "all"),
            SiteScope::One(s) => write!(f, "{s}"),
            SiteScope::Many(s) => write!(f, "{}", s.join(",")),
        }
    }
}

/// What to do with ranked results once streaming ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerateMode {
    #[default]
    None,
    List,
    Summarize,
    Generate,
}

impl GenerateMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "list" => GenerateMode::List,
            "summarize" => GenerateMode::Summarize,
            "generate" => GenerateMode::Generate,
            _ => GenerateMode::None,
        }
    }
}

/// Immutable per-request input.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub prev_queries: Vec<String>,
    pub site: SiteScope,
    pub context_url: String,
    pub streaming: bool,
    pub generate_mode: GenerateMode,
    pub query_id: String,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    /// Caller-supplied decontextualised query; skips the rewrite step.
    pub decontextualized_query: Option<String>,
    /// Development-mode retrieval endpoint override.
    pub db: Option<String>,
}

/// A ranked answer; `sent` flips exactly once under the answers mutex.
#[derive(Debug, Clone)]
pub struct RankedAnswer {
    pub url: String,
    pub site: String,
    pub name: String,
    pub schema_object: Value,
    pub score: u32,
    pub description: String,
    pub sent: bool,
}

impl RankedAnswer {
    pub fn to_answer_item(&self) -> AnswerItem {
        AnswerItem {
            url: self.url.clone(),
            name: self.name.clone(),
            site: self.site.clone(),
            score: self.score,
            description: self.description.clone(),
            schema_object: self.schema_object.clone(),
        }
    }
}

/// A tool candidate that survived routing.
#[derive(Clone)]
pub struct ToolMatch {
    pub tool: Arc<ToolDescriptor>,
    pub score: u32,
    /// The tool's full scoring reply, including extracted arguments.
    pub arguments: Value,
}

/// Query state derived during pre-checks, read-only afterwards.
#[derive(Debug, Default)]
pub struct DerivedState {
    pub decontextualized_query: String,
    pub item_type: String,
    pub required_info_found: bool,
    pub query_is_irrelevant: bool,
    pub query_done: bool,
    pub fast_track_worked: bool,
    pub final_retrieved_items: Vec<RetrievedItem>,
}

struct SendState {
    headers_sent: bool,
    first_result_sent: bool,
    first_result_at: Option<Instant>,
    tx: Option<mpsc::Sender<Value>>,
    return_value: serde_json::Map<String, Value>,
}

/// Per-request shared state. Created by the query handler, shared
/// read/write with its cooperative children, dropped when the handler
/// returns.
pub struct QueryContext {
    pub request: QueryRequest,
    pub config: Arc<Config>,
    pub llm: Arc<dyn AskLlm>,
    pub retriever: Arc<UnifiedRetriever>,
    pub catalogue: Arc<ToolCatalogue>,

    pub pre_checks_done: Event,
    pub retrieval_done: Event,
    pub abort_fast_track: Event,
    pub connection_alive: Event,
    /// Internal ordering point: ToolSelector and fast-track wait on the
    /// decontextualiser, not on the whole pre-check set.
    pub decontextualize_done: Event,

    pub derived: RwLock<DerivedState>,
    pub ranked_answers: Mutex<Vec<RankedAnswer>>,
    /// Routing results, written once by the ToolSelector.
    pub tool_routing_results: Mutex<Vec<ToolMatch>>,

    send: Mutex<SendState>,
    pub init_time: Instant,
}

impl QueryContext {
    pub fn new(
        request: QueryRequest,
        config: Arc<Config>,
        llm: Arc<dyn AskLlm>,
        retriever: Arc<UnifiedRetriever>,
        catalogue: Arc<ToolCatalogue>,
        tx: Option<mpsc::Sender<Value>>,
    ) -> Arc<Self> {
        let derived = DerivedState {
            decontextualized_query: request
                .decontextualized_query
                .clone()
                .unwrap_or_else(|| request.query.clone()),
            item_type: config.item_type_for_site(&request.site),
            required_info_found: true,
            ..DerivedState::default()
        };
        Arc::new(Self {
            request,
            config,
            llm,
            retriever,
            catalogue,
            pre_checks_done: Event::new(),
            retrieval_done: Event::new(),
            abort_fast_track: Event::new(),
            connection_alive: Event::new_set(),
            decontextualize_done: Event::new(),
            derived: RwLock::new(derived),
            ranked_answers: Mutex::new(Vec::new()),
            tool_routing_results: Mutex::new(Vec::new()),
            send: Mutex::new(SendState {
                headers_sent: false,
                first_result_sent: false,
                first_result_at: None,
                tx,
                return_value: serde_json::Map::new(),
            }),
            init_time: Instant::now(),
        })
    }

    pub async fn decontextualized_query(&self) -> String {
        self.derived.read().await.decontextualized_query.clone()
    }

    pub async fn item_type(&self) -> String {
        self.derived.read().await.item_type.clone()
    }

    pub async fn is_query_done(&self) -> bool {
        self.derived.read().await.query_done
    }

    pub async fn mark_query_done(&self) {
        self.derived.write().await.query_done = true;
    }

    /// Serialised emission. All messages from all concurrent components
    /// funnel through here; the first emission flushes protocol headers
    /// exactly once. A cleared `connection_alive` makes this a no-op.
    pub async fn send(&self, message: Message) -> Result<(), GatewayError> {
        let mut send = self.send.lock().await;
        if !self.connection_alive.is_set() {
            debug!(query_id = %self.request.query_id, "connection lost, dropping message");
            return Ok(());
        }

        if send.tx.is_some() {
            self.flush_headers_streaming(&mut send).await;

            if matches!(message, Message::ResultBatch { .. }) && !send.first_result_sent {
                send.first_result_sent = true;
                send.first_result_at = Some(Instant::now());
                let ttfr = self.init_time.elapsed();
                let frame = Message::Header {
                    header_name: "time-to-first-result".into(),
                    header_value: format!("{:.3}s", ttfr.as_secs_f64()),
                }
                .into_frame(&self.request.query_id);
                self.push_frame(&mut send, frame).await;
            }

            let frame = message.into_frame(&self.request.query_id);
            self.push_frame(&mut send, frame).await;
        } else {
            self.accumulate(&mut send, message);
        }
        Ok(())
    }

    async fn flush_headers_streaming(&self, send: &mut SendState) {
        if send.headers_sent {
            return;
        }
        send.headers_sent = true;

        let query_id = self.request.query_id.clone();
        let mut frames = vec![Message::api_version().into_frame(&query_id)];
        for (name, value) in &self.config.gateway.headers {
            frames.push(
                Message::Header {
                    header_name: name.clone(),
                    header_value: value.clone(),
                }
                .into_frame(&query_id),
            );
        }
        for (name, value) in &self.config.gateway.api_keys {
            if value.is_empty() {
                continue;
            }
            frames.push(
                Message::ApiKey {
                    key_name: name.clone(),
                    key_value: value.clone(),
                }
                .into_frame(&query_id),
            );
        }
        for frame in frames {
            self.push_frame(send, frame).await;
            if !self.connection_alive.is_set() {
                return;
            }
        }
    }

    async fn push_frame(&self, send: &mut SendState, frame: Value) {
        if let Some(tx) = &send.tx
            && tx.send(frame).await.is_err()
        {
            debug!(query_id = %self.request.query_id, "receiver dropped, marking connection lost");
            self.connection_alive.clear();
        }
    }

    fn accumulate(&self, send: &mut SendState, message: Message) {
        if !send.headers_sent {
            send.headers_sent = true;
            send.return_value.insert(
                "api_version".into(),
                Value::String(crate::messages::API_VERSION.into()),
            );
            if !self.config.gateway.headers.is_empty() {
                send.return_value.insert(
                    "headers".into(),
                    serde_json::to_value(&self.config.gateway.headers).unwrap_or(Value::Null),
                );
            }
        }

        match message {
            Message::ResultBatch { results } => {
                if !send.first_result_sent {
                    send.first_result_sent = true;
                    send.first_result_at = Some(Instant::now());
                }
                let entry = send
                    .return_value
                    .entry("results".to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = entry {
                    for result in results {
                        list.push(serde_json::to_value(result).unwrap_or(Value::Null));
                    }
                }
            }
            other => {
                let key = other.message_type().to_string();
                let mut value = serde_json::to_value(&other).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.remove("message_type");
                }
                send.return_value.insert(key, value);
            }
        }
    }

    /// The accumulated return value (non-streaming mode), with the final
    /// `query_id` appended.
    pub async fn return_value(&self) -> serde_json::Map<String, Value> {
        let send = self.send.lock().await;
        let mut value = send.return_value.clone();
        value.insert(
            "query_id".into(),
            Value::String(self.request.query_id.clone()),
        );
        value
    }

    /// Time from request start to the first streamed `result_batch`,
    /// when one was sent.
    pub async fn time_to_first_result(&self) -> Option<std::time::Duration> {
        self.send
            .lock()
            .await
            .first_result_at
            .map(|at| at.duration_since(self.init_time))
    }

    /// Count of answers already emitted on the stream.
    pub async fn sent_answer_count(&self) -> usize {
        self.ranked_answers
            .lock()
            .await
            .iter()
            .filter(|a| a.sent)
            .count()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::catalogue::ToolCatalogue;
    use crate::config::Config;
    use crate::retrieval::UnifiedRetriever;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Scripted LLM: returns canned replies keyed by prompt substrings
    /// (`&&`-separated needles must all match), or a default.
    pub struct ScriptedLlm {
        pub replies: Vec<(String, Value)>,
        pub fallback: Value,
    }

    impl ScriptedLlm {
        pub fn always(value: Value) -> Arc<Self> {
            Arc::new(Self {
                replies: Vec::new(),
                fallback: value,
            })
        }

        pub fn with_replies(replies: Vec<(&str, Value)>, fallback: Value) -> Arc<Self> {
            Arc::new(Self {
                replies: replies
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                fallback,
            })
        }
    }

    #[async_trait]
    impl AskLlm for ScriptedLlm {
        async fn ask(
            &self,
            prompt: &str,
            _schema: &Value,
            _tier: crate::llm::Tier,
        ) -> Result<Value, GatewayError> {
            for (needle, reply) in &self.replies {
                if needle.split("&&").all(|part| prompt.contains(part)) {
                    return Ok(reply.clone());
                }
            }
            Ok(self.fallback.clone())
        }
    }

    pub fn test_config() -> Arc<Config> {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "fake".to_string(),
            crate::config::RetrievalEndpoint {
                db_type: crate::config::DbType::Qdrant,
                api_endpoint: Some("http://localhost:6333".into()),
                api_key: None,
                index_name: Some("docs".into()),
                enabled: true,
                timeout_secs: 5,
            },
        );
        Arc::new(Config {
            llm: crate::config::LlmConfig {
                endpoint: "http://llm.test".into(),
                ..Default::default()
            },
            embedding: Default::default(),
            retrieval: crate::config::RetrievalConfig {
                write_endpoint: None,
                endpoints,
            },
            gateway: Default::default(),
            server: Default::default(),
            config_dir: std::path::PathBuf::from("."),
        })
    }

    pub fn test_request(query: &str, streaming: bool) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            prev_queries: Vec::new(),
            site: SiteScope::One("example".into()),
            context_url: String::new(),
            streaming,
            generate_mode: GenerateMode::None,
            query_id: "test-query".into(),
            thread_id: None,
            user_id: None,
            decontextualized_query: None,
            db: None,
        }
    }

    pub fn test_context(
        request: QueryRequest,
        llm: Arc<dyn AskLlm>,
        retriever: Arc<UnifiedRetriever>,
        tx: Option<mpsc::Sender<Value>>,
    ) -> Arc<QueryContext> {
        QueryContext::new(
            request,
            test_config(),
            llm,
            retriever,
            Arc::new(ToolCatalogue::empty()),
            tx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::retrieval::test_support::{FakeBackend, retriever_with};
    use serde_json::json;

    #[tokio::test]
    async fn test_event_wait_observes_prior_set() {
        let event = Event::new();
        event.set();
        // Must not hang.
        event.wait().await;
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                event.wait().await;
            })
        };
        tokio::task::yield_now().await;
        event.set();
        waiter.await.unwrap();
    }

    #[test]
    fn test_site_scope_parsing() {
        assert_eq!(SiteScope::parse("all"), SiteScope::All);
        assert_eq!(SiteScope::parse(""), SiteScope::All);
        assert_eq!(
            SiteScope::parse("seriouseats"),
            SiteScope::One("seriouseats".into())
        );
        assert_eq!(
            SiteScope::parse("a, b"),
            SiteScope::Many(vec!["a".into(), "b".into()])
        );
        assert_eq!(SiteScope::parse("[a, b]"), {
            SiteScope::Many(vec!["a".into(), "b".into()])
        });
    }

    #[test]
    fn test_generate_mode_parsing() {
        assert_eq!(GenerateMode::parse("summarize"), GenerateMode::Summarize);
        assert_eq!(GenerateMode::parse("GENERATE"), GenerateMode::Generate);
        assert_eq!(GenerateMode::parse("bogus"), GenerateMode::None);
    }

    #[tokio::test]
    async fn test_streaming_send_flushes_headers_once_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let ctx = test_context(
            test_request("q", true),
            ScriptedLlm::always(json!({})),
            retriever,
            Some(tx),
        );

        ctx.send(Message::IntermediateMessage {
            message: "working".into(),
        })
        .await
        .unwrap();
        ctx.send(Message::IntermediateMessage {
            message: "still working".into(),
        })
        .await
        .unwrap();
        drop(ctx);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames[0]["message_type"], "api_version");
        assert_eq!(frames[1]["message_type"], "intermediate_message");
        assert_eq!(frames[2]["message_type"], "intermediate_message");
        // Headers flushed exactly once.
        let version_count = frames
            .iter()
            .filter(|f| f["message_type"] == "api_version")
            .count();
        assert_eq!(version_count, 1);
        for frame in &frames {
            assert_eq!(frame["query_id"], "test-query");
        }
    }

    #[tokio::test]
    async fn test_first_result_batch_emits_ttfr_header() {
        let (tx, mut rx) = mpsc::channel(16);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let ctx = test_context(
            test_request("q", true),
            ScriptedLlm::always(json!({})),
            retriever,
            Some(tx),
        );

        ctx.send(Message::ResultBatch { results: vec![] }).await.unwrap();
        drop(ctx);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames[0]["message_type"], "api_version");
        assert_eq!(frames[1]["message_type"], "header");
        assert_eq!(frames[1]["header_name"], "time-to-first-result");
        assert_eq!(frames[2]["message_type"], "result_batch");
    }

    #[tokio::test]
    async fn test_send_after_connection_lost_is_noop() {
        let (tx, rx) = mpsc::channel(16);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let ctx = test_context(
            test_request("q", true),
            ScriptedLlm::always(json!({})),
            retriever,
            Some(tx),
        );
        drop(rx);

        // First send detects the dropped receiver and clears the event.
        ctx.send(Message::IntermediateMessage { message: "a".into() })
            .await
            .unwrap();
        assert!(!ctx.connection_alive.is_set());
        // Subsequent sends are silent no-ops.
        ctx.send(Message::Complete).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_streaming_accumulates_results() {
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let ctx = test_context(
            test_request("q", false),
            ScriptedLlm::always(json!({})),
            retriever,
            None,
        );

        ctx.send(Message::ResultBatch {
            results: vec![AnswerItem {
                url: "u1".into(),
                name: "n".into(),
                site: "s".into(),
                score: 70,
                description: String::new(),
                schema_object: json!({}),
            }],
        })
        .await
        .unwrap();
        ctx.send(Message::Summary {
            message: "two things".into(),
        })
        .await
        .unwrap();

        let value = ctx.return_value().await;
        assert_eq!(value["api_version"], "0.1");
        assert_eq!(value["results"].as_array().unwrap().len(), 1);
        assert_eq!(value["summary"]["message"], "two things");
        assert_eq!(value["query_id"], "test-query");
    }
}
