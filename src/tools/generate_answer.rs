//! The RAG path: gather every item that clears the gathering threshold,
//! synthesise a prose answer over the set, and enrich each cited item
//! with a per-item description.

use serde_json::{Value, json};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::llm::{Tier, extract_score};
use crate::messages::Message;
use crate::prompts;
use crate::retrieval::RetrievedItem;
use crate::state::QueryContext;
use crate::trim::{trim_json, trim_json_hard};

/// Items at or above this score feed the synthesis prompt.
const GATHER_ITEMS_THRESHOLD: u32 = 55;

const RETRIEVAL_COUNT: usize = 50;

/// Entry point when routing (or `generate_mode=generate`) selects the
/// RAG path: retrieve fresh items, then synthesise.
pub async fn run(ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    let query = ctx.decontextualized_query().await;
    let items = {
        let derived = ctx.derived.read().await;
        if derived.final_retrieved_items.is_empty() {
            drop(derived);
            ctx.retriever
                .search(
                    &query,
                    &ctx.request.site,
                    RETRIEVAL_COUNT,
                    ctx.request.db.as_deref(),
                )
                .await
                .map_err(|e| GatewayError::ToolHandler {
                    tool: "generate_answer".into(),
                    reason: e.to_string(),
                })?
        } else {
            derived.final_retrieved_items.clone()
        }
    };
    run_with_items(ctx, items).await
}

/// Post-ranking variant: synthesise over answers that were already
/// ranked, skipping retrieval and re-scoring.
pub async fn run_over_ranked(ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    let items: Vec<RetrievedItem> = {
        let answers = ctx.ranked_answers.lock().await;
        answers
            .iter()
            .filter(|a| a.score >= GATHER_ITEMS_THRESHOLD)
            .map(|a| RetrievedItem {
                url: a.url.clone(),
                schema_json: a.schema_object.to_string(),
                name: a.name.clone(),
                site: a.site.clone(),
            })
            .collect()
    };
    synthesize(ctx, items).await
}

async fn run_with_items(
    ctx: &Arc<QueryContext>,
    items: Vec<RetrievedItem>,
) -> Result<(), GatewayError> {
    let query = ctx.decontextualized_query().await;

    // Score everything and keep whatever clears the gathering bar; no
    // streaming emission on this path.
    let mut join_set = JoinSet::new();
    for item in items {
        let ctx = Arc::clone(ctx);
        let query = query.clone();
        join_set.spawn(async move {
            let prompt = prompts::fill(
                prompts::RANKING,
                &[
                    ("request.query", query),
                    (
                        "request.prev_queries",
                        format!("{:?}", ctx.request.prev_queries),
                    ),
                    ("item.description", trim_json(&item.schema_json)),
                ],
            );
            match ctx
                .llm
                .ask(&prompt, &prompts::ranking_struc(), Tier::Low)
                .await
            {
                Ok(reply) => Some((extract_score(&reply), item)),
                Err(e) => {
                    warn!(url = %item.url, error = %e, "gather scoring failed");
                    None
                }
            }
        });
    }
    let mut gathered = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Ok(Some((score, item))) = result
            && score >= GATHER_ITEMS_THRESHOLD
        {
            gathered.push(item);
        }
    }
    info!(gathered = gathered.len(), "items gathered for synthesis");
    synthesize(ctx, gathered).await
}

async fn synthesize(ctx: &Arc<QueryContext>, items: Vec<RetrievedItem>) -> Result<(), GatewayError> {
    let query = ctx.decontextualized_query().await;

    if items.is_empty() {
        ctx.send(Message::Nlws {
            answer: "I could not find enough relevant material to answer that.".into(),
            items: Vec::new(),
        })
        .await?;
        ctx.mark_query_done().await;
        return Ok(());
    }

    let descriptions: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "url": item.url,
                "name": item.name,
                "details": trim_json_hard(&item.schema_json),
            })
        })
        .collect();
    let prompt = prompts::fill(
        prompts::SYNTHESIZE_ANSWER,
        &[
            ("request.query", query.clone()),
            (
                "items.descriptions",
                serde_json::to_string(&descriptions).unwrap_or_default(),
            ),
        ],
    );
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::synthesize_struc(), Tier::High)
        .await
        .map_err(|e| GatewayError::ToolHandler {
            tool: "generate_answer".into(),
            reason: e.to_string(),
        })?;

    let answer = reply["answer"].as_str().unwrap_or_default().to_string();
    let cited: Vec<String> = reply["urls"]
        .as_array()
        .map(|urls| {
            urls.iter()
                .filter_map(|u| u.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    // Enrich every cited item with a one-line description, in parallel.
    let mut join_set = JoinSet::new();
    for url in cited {
        let Some(item) = items.iter().find(|i| i.url == url).cloned() else {
            continue;
        };
        let ctx = Arc::clone(ctx);
        let query = query.clone();
        let answer = answer.clone();
        join_set.spawn(async move {
            let prompt = prompts::fill(
                prompts::ITEM_DESCRIPTION,
                &[
                    ("request.query", query),
                    ("answer.text", answer),
                    ("item.description", trim_json(&item.schema_json)),
                ],
            );
            let description = match ctx
                .llm
                .ask(&prompt, &prompts::item_description_struc(), Tier::Low)
                .await
            {
                Ok(reply) => reply["description"].as_str().unwrap_or_default().to_string(),
                Err(e) => {
                    warn!(url = %item.url, error = %e, "description prompt failed");
                    String::new()
                }
            };
            json!({
                "url": item.url,
                "name": item.name,
                "site": item.site,
                "description": description,
                "schema_object": item.schema_object(),
            })
        });
    }
    let mut enriched = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Ok(entry) = result {
            enriched.push(entry);
        }
    }

    ctx.send(Message::Nlws {
        answer,
        items: enriched,
    })
    .await?;
    ctx.mark_query_done().await;
    info!("generated answer sent");
    Ok(())
}
