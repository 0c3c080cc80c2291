//! The `/ask` endpoint: parameter parsing, the streaming (SSE) and
//! accumulated (JSON) response modes, and the bridge between the query
//! handler's send channel and the HTTP response.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

use super::AppContext;
use crate::error::GatewayError;
use crate::handler::QueryHandler;
use crate::messages::Message;
use crate::state::{GenerateMode, QueryContext, QueryRequest, SiteScope};
use crate::tracker;

/// Channel depth between the pipeline and the SSE writer.
const STREAM_BUFFER: usize = 64;

pub async fn ask_get(
    State(app): State<AppContext>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    run_ask(app, pairs, None).await
}

pub async fn ask_post(
    State(app): State<AppContext>,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Option<Json<Value>>,
) -> Response {
    run_ask(app, pairs, body.map(|Json(v)| v)).await
}

async fn run_ask(app: AppContext, pairs: Vec<(String, String)>, body: Option<Value>) -> Response {
    let request = match parse_request(&pairs, body.as_ref()) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message_type": "error", "error": e.to_string()})),
            )
                .into_response();
        }
    };

    if request.streaming {
        stream_query(app, request).await
    } else {
        accumulate_query(app, request).await
    }
}

/// Streaming mode: run the pipeline in a background task and feed its
/// frames to the caller as SSE `data:` lines, closing with a `complete`
/// frame.
async fn stream_query(app: AppContext, request: QueryRequest) -> Response {
    let (tx, rx) = mpsc::channel::<Value>(STREAM_BUFFER);
    let ctx = QueryContext::new(
        request,
        Arc::clone(&app.config),
        Arc::clone(&app.llm),
        Arc::clone(&app.retriever),
        Arc::clone(&app.catalogue),
        Some(tx),
    );

    tokio::spawn(async move {
        let handler = QueryHandler::new(Arc::clone(&ctx));
        if let Err(e) = handler.run().await {
            error!(query_id = %ctx.request.query_id, error = %e, "query failed");
            let _ = ctx
                .send(Message::Error {
                    error: e.to_string(),
                })
                .await;
        }
        if let Err(e) = ctx.send(Message::Complete).await {
            warn!(error = %e, "failed to send completion frame");
        }
        record_latency(&app.tracker, &ctx).await;
        // Dropping the context drops the sender and ends the stream.
    });

    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok::<_, Infallible>(
            Event::default()
                .json_data(&frame)
                .unwrap_or_else(|_| Event::default().data("{}")),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::new()).into_response()
}

/// Non-streaming mode: run to completion and return the accumulated
/// value keyed by message type.
async fn accumulate_query(app: AppContext, request: QueryRequest) -> Response {
    let ctx = QueryContext::new(
        request,
        Arc::clone(&app.config),
        Arc::clone(&app.llm),
        Arc::clone(&app.retriever),
        Arc::clone(&app.catalogue),
        None,
    );
    let handler = QueryHandler::new(Arc::clone(&ctx));
    let result = handler.run().await;
    record_latency(&app.tracker, &ctx).await;
    match result {
        Ok(value) => Json(Value::Object(value)).into_response(),
        Err(e) => {
            error!(query_id = %ctx.request.query_id, error = %e, "query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"message_type": "error", "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn record_latency(tracker: &Arc<crate::tracker::QueryTracker>, ctx: &Arc<QueryContext>) {
    tracker.record(tracker::QUERY_TOTAL, ctx.init_time.elapsed());
    if let Some(ttfr) = ctx.time_to_first_result().await {
        tracker.record(tracker::TIME_TO_FIRST_RESULT, ttfr);
    }
}

/// Assemble the request from query pairs with a JSON body merged over
/// them (POST). Repeated `prev` parameters accumulate.
pub fn parse_request(
    pairs: &[(String, String)],
    body: Option<&Value>,
) -> Result<QueryRequest, GatewayError> {
    let mut single: std::collections::HashMap<&str, String> = std::collections::HashMap::new();
    let mut prev_queries: Vec<String> = Vec::new();
    let mut sites: Vec<String> = Vec::new();

    for (key, value) in pairs {
        match key.as_str() {
            "prev" => prev_queries.push(value.clone()),
            "site" => sites.push(value.clone()),
            other => {
                single.insert(
                    // Normalise to owned keys below via known set.
                    match other {
                        "query" => "query",
                        "context_url" => "context_url",
                        "streaming" => "streaming",
                        "generate_mode" => "generate_mode",
                        "query_id" => "query_id",
                        "decontextualized_query" => "decontextualized_query",
                        "db" => "db",
                        "retrieval_backend" => "db",
                        "thread_id" => "thread_id",
                        "user_id" => "user_id",
                        "oauth_id" => "user_id",
                        _ => continue,
                    },
                    value.clone(),
                );
            }
        }
    }

    if let Some(Value::Object(map)) = body {
        for (key, value) in map {
            match key.as_str() {
                "prev" => {
                    if let Value::Array(list) = value {
                        prev_queries.extend(
                            list.iter().filter_map(|v| v.as_str().map(String::from)),
                        );
                    } else if let Some(s) = value.as_str() {
                        prev_queries.push(s.to_string());
                    }
                }
                "site" => {
                    if let Value::Array(list) = value {
                        sites.extend(list.iter().filter_map(|v| v.as_str().map(String::from)));
                    } else if let Some(s) = value.as_str() {
                        sites.push(s.to_string());
                    }
                }
                "query" | "context_url" | "generate_mode" | "query_id"
                | "decontextualized_query" | "db" | "thread_id" | "user_id" => {
                    if let Some(s) = value.as_str() {
                        single.insert(
                            match key.as_str() {
                                "query" => "query",
                                "context_url" => "context_url",
                                "generate_mode" => "generate_mode",
                                "query_id" => "query_id",
                                "decontextualized_query" => "decontextualized_query",
                                "db" => "db",
                                "thread_id" => "thread_id",
                                _ => "user_id",
                            },
                            s.to_string(),
                        );
                    }
                }
                "streaming" => {
                    let text = match value {
                        Value::Bool(b) => b.to_string(),
                        Value::String(s) => s.clone(),
                        _ => continue,
                    };
                    single.insert("streaming", text);
                }
                _ => {}
            }
        }
    }

    let query = single
        .get("query")
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| GatewayError::InvalidInput("missing required parameter 'query'".into()))?;

    let site = match sites.len() {
        0 => SiteScope::All,
        1 => SiteScope::parse(&sites[0]),
        _ => SiteScope::Many(sites),
    };

    let streaming = single
        .get("streaming")
        .map(|v| !matches!(v.as_str(), "False" | "false" | "0"))
        .unwrap_or(true);

    Ok(QueryRequest {
        query,
        prev_queries,
        site,
        context_url: single.get("context_url").cloned().unwrap_or_default(),
        streaming,
        generate_mode: single
            .get("generate_mode")
            .map(|m| GenerateMode::parse(m))
            .unwrap_or_default(),
        query_id: single
            .get("query_id")
            .cloned()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        thread_id: single.get("thread_id").cloned(),
        user_id: single.get("user_id").cloned(),
        decontextualized_query: single
            .get("decontextualized_query")
            .cloned()
            .filter(|q| !q.is_empty()),
        db: single.get("db").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_query_is_invalid_input() {
        let err = parse_request(&pairs(&[("site", "all")]), None).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[test]
    fn test_repeated_prev_and_site_params() {
        let request = parse_request(
            &pairs(&[
                ("query", "pasta"),
                ("prev", "first"),
                ("prev", "second"),
                ("site", "a"),
                ("site", "b"),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(request.prev_queries, vec!["first", "second"]);
        assert_eq!(request.site, SiteScope::Many(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_defaults() {
        let request = parse_request(&pairs(&[("query", "pasta")]), None).unwrap();
        assert!(request.streaming);
        assert_eq!(request.site, SiteScope::All);
        assert_eq!(request.generate_mode, GenerateMode::None);
        assert!(!request.query_id.is_empty());
        assert!(request.decontextualized_query.is_none());
    }

    #[test]
    fn test_streaming_false_variants() {
        for value in ["False", "false", "0"] {
            let request =
                parse_request(&pairs(&[("query", "q"), ("streaming", value)]), None).unwrap();
            assert!(!request.streaming, "{value} should disable streaming");
        }
    }

    #[test]
    fn test_body_merges_over_params() {
        let body = json!({
            "query": "from body",
            "site": ["x", "y"],
            "prev": ["earlier"],
            "streaming": false,
            "generate_mode": "summarize",
        });
        let request = parse_request(&pairs(&[("query", "from params")]), Some(&body)).unwrap();
        assert_eq!(request.query, "from body");
        assert_eq!(request.site, SiteScope::Many(vec!["x".into(), "y".into()]));
        assert_eq!(request.prev_queries, vec!["earlier"]);
        assert!(!request.streaming);
        assert_eq!(request.generate_mode, GenerateMode::Summarize);
    }

    #[test]
    fn test_dev_db_override_aliases() {
        let request =
            parse_request(&pairs(&[("query", "q"), ("retrieval_backend", "qdrant_local")]), None)
                .unwrap();
        assert_eq!(request.db.as_deref(), Some("qdrant_local"));
    }
}
