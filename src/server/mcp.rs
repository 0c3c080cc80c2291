//! Model Context Protocol control surface: JSON-RPC 2.0 over one POST
//! route, exposing the gateway as the `ask_nlweb` and `list_sites`
//! tools.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use super::AppContext;
use crate::handler::QueryHandler;
use crate::state::QueryContext;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

fn ok(id: Option<Value>, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn err(id: Option<Value>, code: i32, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
        }),
    }
}

pub async fn handle(State(app): State<AppContext>, body: String) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(err(None, PARSE_ERROR, format!("parse error: {e}"))).into_response();
        }
    };
    debug!(method = %request.method, "mcp request");

    let response = match request.method.as_str() {
        "initialize" => ok(
            request.id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "nlgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        // Notification: acknowledged without a response body.
        "initialized" | "notifications/initialized" => {
            return StatusCode::NO_CONTENT.into_response();
        }
        "tools/list" => ok(request.id, json!({"tools": tool_definitions()})),
        "tools/call" => handle_tool_call(&app, request.id, request.params).await,
        other => err(
            request.id,
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        ),
    };
    Json(response).into_response()
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "ask_nlweb",
            "description": "Ask a natural-language question over the indexed sites and get ranked matching items.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The question to ask"},
                    "site": {"type": "string", "description": "Site to scope the search to, or 'all'"},
                    "prev": {"type": "array", "items": {"type": "string"}, "description": "Earlier queries in this conversation"},
                    "generate_mode": {"type": "string", "enum": ["none", "list", "summarize", "generate"]},
                },
                "required": ["query"],
            },
        },
        {
            "name": "list_sites",
            "description": "List the sites available for querying.",
            "inputSchema": {"type": "object", "properties": {}},
        },
    ])
}

async fn handle_tool_call(
    app: &AppContext,
    id: Option<Value>,
    params: Option<Value>,
) -> JsonRpcResponse {
    let params = params.unwrap_or(Value::Null);
    let name = params["name"].as_str().unwrap_or_default();
    let arguments = params["arguments"].clone();

    match name {
        "ask_nlweb" => {
            // Wrap /ask in non-streaming mode; MCP replies are one
            // JSON-RPC result, not a stream.
            let mut body = arguments;
            if let Some(map) = body.as_object_mut() {
                map.insert("streaming".into(), Value::Bool(false));
            }
            let request = match super::ask::parse_request(&[], Some(&body)) {
                Ok(request) => request,
                Err(e) => return err(id, INVALID_PARAMS, e.to_string()),
            };

            let ctx = QueryContext::new(
                request,
                Arc::clone(&app.config),
                Arc::clone(&app.llm),
                Arc::clone(&app.retriever),
                Arc::clone(&app.catalogue),
                None,
            );
            match QueryHandler::new(ctx).run().await {
                Ok(value) => {
                    let text = serde_json::to_string(&Value::Object(value)).unwrap_or_default();
                    ok(id, json!({"content": [{"type": "text", "text": text}]}))
                }
                Err(e) => {
                    warn!(error = %e, "ask_nlweb tool call failed");
                    err(id, INTERNAL_ERROR, e.to_string())
                }
            }
        }
        "list_sites" => {
            let sites = app.retriever.get_sites().await;
            let text = serde_json::to_string(&json!({"sites": sites})).unwrap_or_default();
            ok(id, json!({"content": [{"type": "text", "text": text}]}))
        }
        other => err(id, INVALID_PARAMS, format!("unknown tool: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::ToolCatalogue;
    use crate::retrieval::test_support::{FakeBackend, item, retriever_with};
    use crate::state::test_support::*;
    use crate::tracker::QueryTracker;
    use axum::body::to_bytes;
    use std::time::Instant;

    fn test_app() -> AppContext {
        AppContext {
            config: test_config(),
            llm: ScriptedLlm::with_replies(
                vec![("how well this item answers", json!({"score": 80, "description": "ok"}))],
                json!({"score": 0, "site_is_irrelevant_to_query": "false", "required_info_found": "true"}),
            ),
            retriever: retriever_with(vec![(
                "fake",
                FakeBackend::with_sites(
                    vec![item("https://e/1", "example", "one")],
                    vec!["example"],
                ),
            )]),
            catalogue: Arc::new(ToolCatalogue::empty()),
            tracker: Arc::new(QueryTracker::new()),
            start_time: Instant::now(),
        }
    }

    async fn call(app: AppContext, body: Value) -> Value {
        let response = handle(State(app), body.to_string()).await;
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn test_initialize() {
        let reply = call(
            test_app(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(reply["result"]["serverInfo"]["name"], "nlgate");
    }

    #[tokio::test]
    async fn test_tools_list_names_both_tools() {
        let reply = call(
            test_app(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await;
        let tools = reply["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["ask_nlweb", "list_sites"]);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let reply = call(
            test_app(),
            json!({"jsonrpc": "2.0", "id": 3, "method": "bogus/method"}),
        )
        .await;
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let response = handle(State(test_app()), "{not json".to_string()).await;
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_ask_nlweb_tool_call_runs_query() {
        let reply = call(
            test_app(),
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {
                    "name": "ask_nlweb",
                    "arguments": {"query": "one thing", "site": "example"},
                },
            }),
        )
        .await;
        let text = reply["result"]["content"][0]["text"].as_str().unwrap();
        let value: Value = serde_json::from_str(text).unwrap();
        assert!(value["results"].as_array().is_some());
    }

    #[tokio::test]
    async fn test_ask_nlweb_requires_query() {
        let reply = call(
            test_app(),
            json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "ask_nlweb", "arguments": {}},
            }),
        )
        .await;
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_list_sites_tool() {
        let reply = call(
            test_app(),
            json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/call",
                "params": {"name": "list_sites", "arguments": {}},
            }),
        )
        .await;
        let text = reply["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("example"));
    }
}
