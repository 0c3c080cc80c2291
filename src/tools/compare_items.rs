//! "Compare Dune and Foundation" — resolve both names to their
//! best-matching indexed objects in parallel, then produce a structured
//! comparison.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::llm::{Tier, extract_score};
use crate::messages::{ComparedItem, Message};
use crate::prompts;
use crate::retrieval::RetrievedItem;
use crate::state::QueryContext;
use crate::trim::trim_json;

/// A candidate must clear this score to count as the named item.
const MATCH_THRESHOLD: u32 = 75;

const CANDIDATE_COUNT: usize = 20;

pub async fn run(args: &Value, ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    let item1_name = args["item1"].as_str().unwrap_or_default().to_string();
    let item2_name = args["item2"].as_str().unwrap_or_default().to_string();
    let details_requested = args["details_requested"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    if item1_name.is_empty() || item2_name.is_empty() {
        warn!("comparison requested without two item names");
        return send_not_found(ctx).await;
    }

    let (first, second) = tokio::join!(
        find_matching_item(ctx, &item1_name),
        find_matching_item(ctx, &item2_name),
    );

    let (Some(item1), Some(item2)) = (first, second) else {
        info!(item1 = %item1_name, item2 = %item2_name, "could not resolve both items");
        return send_not_found(ctx).await;
    };

    let template = if details_requested.is_empty() {
        prompts::COMPARE_ITEMS
    } else {
        prompts::COMPARE_ITEM_DETAILS
    };
    let prompt = prompts::fill(
        template,
        &[
            ("request.item1_description", trim_json(&item1.schema_json)),
            ("request.item2_description", trim_json(&item2.schema_json)),
            ("request.details_requested", details_requested),
        ],
    );
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::compare_items_struc(), Tier::High)
        .await
        .map_err(|e| GatewayError::ToolHandler {
            tool: "compare_items".into(),
            reason: e.to_string(),
        })?;

    ctx.send(Message::CompareItems {
        comparison: reply["comparison"].clone(),
        item1: ComparedItem {
            name: item1.name.clone(),
            url: item1.url.clone(),
            schema_object: item1.schema_object(),
        },
        item2: ComparedItem {
            name: item2.name.clone(),
            url: item2.url.clone(),
            schema_object: item2.schema_object(),
        },
    })
    .await?;
    ctx.mark_query_done().await;
    Ok(())
}

/// Candidate-then-score pass for one item name; best candidate above the
/// match threshold wins.
async fn find_matching_item(ctx: &Arc<QueryContext>, item_name: &str) -> Option<RetrievedItem> {
    let candidates = match ctx
        .retriever
        .search(
            item_name,
            &ctx.request.site,
            CANDIDATE_COUNT,
            ctx.request.db.as_deref(),
        )
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(item = %item_name, error = %e, "candidate retrieval failed");
            return None;
        }
    };

    let mut join_set = JoinSet::new();
    for candidate in candidates {
        let ctx = Arc::clone(ctx);
        let item_name = item_name.to_string();
        join_set.spawn(async move {
            let prompt = prompts::fill(
                prompts::FIND_ITEM,
                &[
                    ("item.name", item_name),
                    ("item.description", trim_json(&candidate.schema_json)),
                ],
            );
            match ctx
                .llm
                .ask(&prompt, &prompts::find_item_struc(), Tier::High)
                .await
            {
                Ok(reply) => {
                    let score = extract_score(&reply);
                    (score > MATCH_THRESHOLD).then_some((score, candidate))
                }
                Err(e) => {
                    warn!(url = %candidate.url, error = %e, "match evaluation failed");
                    None
                }
            }
        });
    }

    let mut best: Option<(u32, RetrievedItem)> = None;
    while let Some(result) = join_set.join_next().await {
        if let Ok(Some((score, candidate))) = result
            && best.as_ref().is_none_or(|(b, _)| score > *b)
        {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, item)| item)
}

async fn send_not_found(ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    ctx.send(Message::IntermediateMessage {
        message: "Could not find both items to compare on this site.".into(),
    })
    .await
}
