//! "What is the rating of X?" — resolve the named item among retrieval
//! candidates and extract the requested details from the winner.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::llm::{Tier, extract_score};
use crate::messages::Message;
use crate::prompts;
use crate::retrieval::RetrievedItem;
use crate::state::QueryContext;
use crate::trim::trim_json;

/// A candidate at or above this score is emitted immediately.
const SEND_THRESHOLD: u32 = 75;

/// Candidates below this score never count as found.
const FOUND_THRESHOLD: u32 = 60;

const CANDIDATE_COUNT: usize = 20;

struct MatchState {
    sent: bool,
    found: Vec<(u32, Message)>,
}

pub async fn run(args: &Value, ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    let item_name = args["item_name"].as_str().unwrap_or_default().to_string();
    let details_requested = args["details_requested"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    if item_name.is_empty() || details_requested.is_empty() {
        warn!("item details requested without an item name or detail spec");
        return send_not_found(ctx, &item_name).await;
    }

    let candidates = match ctx
        .retriever
        .search(
            &item_name,
            &ctx.request.site,
            CANDIDATE_COUNT,
            ctx.request.db.as_deref(),
        )
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(error = %e, "candidate retrieval failed");
            return send_not_found(ctx, &item_name).await;
        }
    };
    info!(
        candidates = candidates.len(),
        item = %item_name,
        "evaluating item-details candidates"
    );

    let state = Arc::new(Mutex::new(MatchState {
        sent: false,
        found: Vec::new(),
    }));

    let mut join_set = JoinSet::new();
    for candidate in candidates {
        let ctx = Arc::clone(ctx);
        let state = Arc::clone(&state);
        let item_name = item_name.clone();
        let details_requested = details_requested.clone();
        join_set.spawn(async move {
            evaluate_candidate(&ctx, &state, &item_name, &details_requested, candidate).await;
        });
    }
    while join_set.join_next().await.is_some() {}

    let mut state = state.lock().await;
    if state.sent {
        return Ok(());
    }
    if state.found.is_empty() {
        return send_not_found(ctx, &item_name).await;
    }
    // Nothing cleared the send bar; fall back to the best partial match.
    state.found.sort_by(|a, b| b.0.cmp(&a.0));
    let (_, message) = state.found.remove(0);
    ctx.send(message).await
}

async fn evaluate_candidate(
    ctx: &Arc<QueryContext>,
    state: &Arc<Mutex<MatchState>>,
    item_name: &str,
    details_requested: &str,
    candidate: RetrievedItem,
) {
    let description = trim_json(&candidate.schema_json);
    let prompt = prompts::fill(
        prompts::ITEM_MATCHING,
        &[
            ("item.name", item_name.to_string()),
            ("request.details_requested", details_requested.to_string()),
            ("item.description", description),
        ],
    );
    let reply = match ctx
        .llm
        .ask(&prompt, &prompts::item_matching_struc(), Tier::High)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(url = %candidate.url, error = %e, "candidate evaluation failed");
            return;
        }
    };

    let score = extract_score(&reply);
    if score < FOUND_THRESHOLD {
        return;
    }

    let message = Message::ItemDetails {
        item_name: item_name.to_string(),
        details: reply["item_details"].clone(),
        score,
        explanation: reply["explanation"].as_str().unwrap_or_default().to_string(),
        url: candidate.url.clone(),
        site: candidate.site.clone(),
        schema_object: candidate.schema_object(),
    };

    let mut state = state.lock().await;
    if score >= SEND_THRESHOLD && !state.sent {
        state.sent = true;
        info!(url = %candidate.url, score, "item matched, sending details");
        if let Err(e) = ctx.send(message.clone()).await {
            warn!(error = %e, "failed to send item details");
        }
    }
    state.found.push((score, message));
}

async fn send_not_found(ctx: &Arc<QueryContext>, item_name: &str) -> Result<(), GatewayError> {
    ctx.send(Message::ItemDetails {
        item_name: item_name.to_string(),
        details: Value::String(format!(
            "Could not find any items matching '{item_name}' on {}.",
            ctx.request.site
        )),
        score: 0,
        explanation: String::new(),
        url: String::new(),
        site: ctx.request.site.to_string(),
        schema_object: Value::Null,
    })
    .await
}
