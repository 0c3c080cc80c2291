//! "Plan a three-course Italian dinner" — retrieve and rank candidates
//! for every sub-query in parallel, pick a budgeted selection, and ask
//! the model for one cohesive recommendation over the survivors.

use serde_json::{Value, json};
use std::collections::HashSet;
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

/// Total candidates handed to the synthesis prompt, split across
/// sub-queries.
const TOTAL_BUDGET: usize = 9;

/// Aim for roughly this many retrieved items across all sub-queries.
const RETRIEVAL_POOL: usize = 60;

/// Sub-query candidates below this score are not considered.
const CANDIDATE_THRESHOLD: u32 = 40;

pub async fn run(args: &Value, ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    let queries: Vec<String> = args["queries"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|q| q.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let ensemble_type = args["ensemble_type"]
        .as_str()
        .unwrap_or("recommendation")
        .to_string();

    if queries.is_empty() {
        return Err(GatewayError::ToolHandler {
            tool: "ensemble".into(),
            reason: "no sub-queries extracted".into(),
        });
    }
    info!(sub_queries = queries.len(), ensemble_type = %ensemble_type, "ensemble started");

    // Retrieve and rank every sub-query concurrently.
    let per_query_k = (RETRIEVAL_POOL / queries.len()).max(10);
    let mut join_set = JoinSet::new();
    for (idx, sub_query) in queries.iter().enumerate() {
        let ctx = Arc::clone(ctx);
        let sub_query = sub_query.clone();
        join_set.spawn(async move {
            let ranked = retrieve_and_rank(&ctx, &sub_query, per_query_k).await;
            (idx, ranked)
        });
    }
    let mut per_query: Vec<Vec<(u32, RetrievedItem)>> = vec![Vec::new(); queries.len()];
    while let Some(result) = join_set.join_next().await {
        if let Ok((idx, ranked)) = result {
            per_query[idx] = ranked;
        }
    }

    // Budgeted selection with global dedup across sub-queries.
    let per_query_budget = (TOTAL_BUDGET / queries.len()).max(1);
    let mut seen: HashSet<String> = HashSet::new();
    let mut selected: Vec<RetrievedItem> = Vec::new();
    for ranked in &per_query {
        let mut taken = 0;
        for (_, item) in ranked {
            if taken >= per_query_budget {
                break;
            }
            if seen.insert(item_identifier(item)) {
                selected.push(item.clone());
                taken += 1;
            }
        }
    }

    if selected.is_empty() {
        ctx.send(Message::IntermediateMessage {
            message: "Could not find suitable items for this request.".into(),
        })
        .await?;
        ctx.mark_query_done().await;
        return Ok(());
    }

    // One synthesis call over the trimmed selection.
    let candidates: Vec<Value> = selected
        .iter()
        .map(|item| {
            json!({
                "name": item.name,
                "url": item.url,
                "site": item.site,
                "details": trim_json_hard(&item.schema_json),
            })
        })
        .collect();
    let prompt = prompts::fill(
        prompts::ENSEMBLE_SYNTHESIS,
        &[
            ("request.query", ctx.decontextualized_query().await),
            ("ensemble.type", ensemble_type),
            (
                "ensemble.candidates",
                serde_json::to_string(&candidates).unwrap_or_default(),
            ),
        ],
    );
    let mut reply = ctx
        .llm
        .ask(&prompt, &prompts::ensemble_synthesis_struc(), Tier::High)
        .await
        .map_err(|e| GatewayError::ToolHandler {
            tool: "ensemble".into(),
            reason: e.to_string(),
        })?;

    attach_source_objects(&mut reply, &selected);

    ctx.send(Message::EnsembleResult {
        recommendations: reply,
    })
    .await?;
    ctx.mark_query_done().await;
    info!("ensemble finished");
    Ok(())
}

/// Retrieve candidates for one sub-query and score each with a
/// lightweight prompt; deduped by identifier, sorted by score.
async fn retrieve_and_rank(
    ctx: &Arc<QueryContext>,
    sub_query: &str,
    k: usize,
) -> Vec<(u32, RetrievedItem)> {
    let items = match ctx
        .retriever
        .search(sub_query, &ctx.request.site, k, ctx.request.db.as_deref())
        .await
    {
        Ok(items) => items,
        Err(e) => {
            warn!(sub_query = %sub_query, error = %e, "sub-query retrieval failed");
            return Vec::new();
        }
    };

    let original_query = ctx.decontextualized_query().await;
    let mut join_set = JoinSet::new();
    for item in items {
        let ctx = Arc::clone(ctx);
        let sub_query = sub_query.to_string();
        let original_query = original_query.clone();
        join_set.spawn(async move {
            let prompt = prompts::fill(
                prompts::ENSEMBLE_ITEM_RANKING,
                &[
                    ("request.query", original_query),
                    ("ensemble.sub_query", sub_query),
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
                    warn!(url = %item.url, error = %e, "sub-query item scoring failed");
                    None
                }
            }
        });
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut ranked = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Ok(Some((score, item))) = result
            && score >= CANDIDATE_THRESHOLD
            && seen.insert(item_identifier(&item))
        {
            ranked.push((score, item));
        }
    }
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked
}

/// Stable identity for deduplication: URL, then `@id`, then name+type.
fn item_identifier(item: &RetrievedItem) -> String {
    if !item.url.is_empty() {
        return item.url.clone();
    }
    let schema = item.schema_object();
    if let Some(id) = schema["@id"].as_str() {
        return id.to_string();
    }
    format!(
        "{}::{}",
        item.name,
        schema["@type"].as_str().unwrap_or_default()
    )
}

/// Re-attach full source objects to the model's picks, by URL first and
/// name-substring as the fallback.
fn attach_source_objects(reply: &mut Value, selected: &[RetrievedItem]) {
    let Some(items) = reply["items"].as_array_mut() else {
        return;
    };
    for entry in items {
        let source = entry["url"]
            .as_str()
            .and_then(|url| selected.iter().find(|s| s.url == url))
            .or_else(|| {
                entry["name"].as_str().and_then(|name| {
                    let lower = name.to_lowercase();
                    selected.iter().find(|s| {
                        let candidate = s.name.to_lowercase();
                        candidate.contains(&lower) || lower.contains(&candidate)
                    })
                })
            });
        if let Some(source) = source
            && let Some(map) = entry.as_object_mut()
        {
            map.insert("url".into(), Value::String(source.url.clone()));
            map.insert("site".into(), Value::String(source.site.clone()));
            map.insert("schema_object".into(), source.schema_object());
        }
    }
}
