use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version announced as the first frame of every response.
pub const API_VERSION: &str = "0.1";

/// A message emitted on the response stream. Serialises with a
/// `message_type` tag; the `query_id` is stamped on at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    ApiVersion {
        api_version: String,
    },
    Header {
        header_name: String,
        header_value: String,
    },
    ApiKey {
        key_name: String,
        key_value: String,
    },
    ToolSelection {
        selected_tool: String,
        score: u32,
        parameters: Value,
        query: String,
    },
    DecontextualizedQuery {
        decontextualized_query: String,
    },
    IntermediateMessage {
        message: String,
    },
    ResultBatch {
        results: Vec<AnswerItem>,
    },
    ItemDetails {
        item_name: String,
        details: Value,
        score: u32,
        explanation: String,
        url: String,
        site: String,
        schema_object: Value,
    },
    CompareItems {
        comparison: Value,
        item1: ComparedItem,
        item2: ComparedItem,
    },
    EnsembleResult {
        recommendations: Value,
    },
    StatisticsResult {
        templates: Vec<Value>,
    },
    ChartResult {
        html: String,
    },
    Nlws {
        answer: String,
        items: Vec<Value>,
    },
    AskUser {
        message: String,
    },
    Summary {
        message: String,
    },
    Error {
        error: String,
    },
    Complete,
}

impl Message {
    pub fn api_version() -> Self {
        Message::ApiVersion {
            api_version: API_VERSION.to_string(),
        }
    }

    /// The `message_type` tag this message serialises with.
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::ApiVersion { .. } => "api_version",
            Message::Header { .. } => "header",
            Message::ApiKey { .. } => "api_key",
            Message::ToolSelection { .. } => "tool_selection",
            Message::DecontextualizedQuery { .. } => "decontextualized_query",
            Message::IntermediateMessage { .. } => "intermediate_message",
            Message::ResultBatch { .. } => "result_batch",
            Message::ItemDetails { .. } => "item_details",
            Message::CompareItems { .. } => "compare_items",
            Message::EnsembleResult { .. } => "ensemble_result",
            Message::StatisticsResult { .. } => "statistics_result",
            Message::ChartResult { .. } => "chart_result",
            Message::Nlws { .. } => "nlws",
            Message::AskUser { .. } => "ask_user",
            Message::Summary { .. } => "summary",
            Message::Error { .. } => "error",
            Message::Complete => "complete",
        }
    }

    /// Serialise to a wire frame carrying the query id.
    pub fn into_frame(self, query_id: &str) -> Value {
        let mut value = serde_json::to_value(&self).unwrap_or_else(|_| {
            serde_json::json!({"message_type": "error", "error": "unserialisable message"})
        });
        if let Value::Object(map) = &mut value {
            map.insert("query_id".into(), Value::String(query_id.to_string()));
        }
        value
    }
}

/// One ranked answer as it appears inside a `result_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerItem {
    pub url: String,
    pub name: String,
    pub site: String,
    pub score: u32,
    #[serde(default)]
    pub description: String,
    pub schema_object: Value,
}

/// One side of a `compare_items` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparedItem {
    pub name: String,
    pub url: String,
    pub schema_object: Value,
}
