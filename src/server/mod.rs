pub mod ask;
pub mod mcp;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::catalogue::ToolCatalogue;
use crate::config::Config;
use crate::llm::AskLlm;
use crate::retrieval::UnifiedRetriever;
use crate::tools::who;
use crate::tracker::QueryTracker;

/// Process-wide shared state behind the HTTP surface.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub llm: Arc<dyn AskLlm>,
    pub retriever: Arc<UnifiedRetriever>,
    pub catalogue: Arc<ToolCatalogue>,
    pub tracker: Arc<QueryTracker>,
    pub start_time: Instant,
}

pub fn router(app: AppContext) -> Router {
    Router::new()
        .route("/ask", get(ask::ask_get).post(ask::ask_post))
        .route("/sites", get(sites))
        .route("/who", get(who_endpoint))
        .route("/mcp", post(mcp::handle))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(app)
}

pub async fn start(app: AppContext, listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let router = router(app);
    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listen, "http server started");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    info!("http server stopped");
    Ok(())
}

/// `GET /sites` — the union of sites known to the retrieval endpoints,
/// as JSON or a single SSE frame.
async fn sites(
    State(app): State<AppContext>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let sites = app.retriever.get_sites().await;
    let payload = json!({"message_type": "sites", "sites": sites});

    let streaming = pairs
        .iter()
        .find(|(k, _)| k == "streaming")
        .map(|(_, v)| !matches!(v.as_str(), "False" | "false" | "0"))
        .unwrap_or(false);
    if streaming {
        let frame = Event::default()
            .json_data(&payload)
            .unwrap_or_else(|_| Event::default().data("{}"));
        let stream = futures::stream::once(async move { Ok::<_, Infallible>(frame) });
        Sse::new(stream).keep_alive(KeepAlive::new()).into_response()
    } else {
        Json(payload).into_response()
    }
}

/// `GET /who` — which sites would answer this query.
async fn who_endpoint(
    State(app): State<AppContext>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let Some(query) = pairs
        .iter()
        .find(|(k, _)| k == "query")
        .map(|(_, v)| v.clone())
        .filter(|q| !q.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message_type": "error", "error": "missing query parameter"})),
        )
            .into_response();
    };

    match who::top_sites(&app.retriever, &query).await {
        Ok(sites) => Json(json!({"message_type": "who", "sites": sites})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message_type": "error", "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn health(State(app): State<AppContext>) -> Json<serde_json::Value> {
    let latency: serde_json::Map<String, serde_json::Value> = app
        .tracker
        .snapshot()
        .into_iter()
        .map(|(class, stats)| (class, serde_json::to_value(stats).unwrap_or(json!(null))))
        .collect();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": app.start_time.elapsed().as_secs(),
        "latency": latency,
    }))
}

/// Readiness: an LLM endpoint and at least one enabled retrieval
/// endpoint must be configured.
async fn ready(State(app): State<AppContext>) -> Response {
    let llm_ok = !app.config.llm.endpoint.is_empty();
    let retrieval_ok = !app.retriever.endpoint_names().is_empty();
    let all_ready = llm_ok && retrieval_ok;
    let body = json!({
        "status": if all_ready { "ready" } else { "not_ready" },
        "checks": {"llm": llm_ok, "retrieval": retrieval_ok},
    });
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
