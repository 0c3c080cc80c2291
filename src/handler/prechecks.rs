//! Pre-retrieval analyses. Each task runs independently, mutates derived
//! query state or emits an intermediate message, and must never poison
//! its siblings.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::llm::Tier;
use crate::messages::Message;
use crate::prompts;
use crate::state::QueryContext;
use crate::trim::trim_json;

/// Read a boolean that the model may have produced as a bool or as the
/// strings "true"/"True".
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn base_vars(ctx: &QueryContext, item_type: &str) -> Vec<(&'static str, String)> {
    vec![
        ("request.query", ctx.request.query.clone()),
        (
            "request.prev_queries",
            format!("{:?}", ctx.request.prev_queries),
        ),
        ("site.name", ctx.request.site.to_string()),
        ("site.itemType", item_type.to_string()),
    ]
}

/// Which decontextualisation strategy applies to a request. Exactly one
/// is instantiated per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecontextStrategy {
    NoOp,
    PrevQueries,
    ContextUrl,
    Full,
}

pub fn choose_strategy(ctx: &QueryContext) -> DecontextStrategy {
    if !ctx.config.gateway.decontextualize_enabled {
        return DecontextStrategy::NoOp;
    }
    if ctx.request.decontextualized_query.is_some() {
        return DecontextStrategy::NoOp;
    }
    let has_history = !ctx.request.prev_queries.is_empty();
    let has_context_url = ctx.request.context_url.len() > 4;
    match (has_history, has_context_url) {
        (false, false) => DecontextStrategy::NoOp,
        (true, false) => DecontextStrategy::PrevQueries,
        (false, true) => DecontextStrategy::ContextUrl,
        (true, true) => DecontextStrategy::Full,
    }
}

/// Run the chosen strategy and signal `decontextualize_done` regardless
/// of outcome; the tool selector and fast track wait on it.
pub async fn decontextualize(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    let strategy = choose_strategy(&ctx);
    let result = run_decontextualize(&ctx, strategy).await;
    ctx.decontextualize_done.set();
    result
}

async fn run_decontextualize(
    ctx: &Arc<QueryContext>,
    strategy: DecontextStrategy,
) -> Result<(), GatewayError> {
    let template = match strategy {
        DecontextStrategy::NoOp => {
            debug!("no decontextualisation needed");
            return Ok(());
        }
        DecontextStrategy::PrevQueries => prompts::DECONTEXTUALIZE_PREV_QUERIES,
        DecontextStrategy::ContextUrl => prompts::DECONTEXTUALIZE_CONTEXT_URL,
        DecontextStrategy::Full => prompts::DECONTEXTUALIZE_FULL,
    };

    let item_type = ctx.item_type().await;
    let mut vars = base_vars(ctx, &item_type);

    // Context-URL strategies ground the rewrite in the page the query was
    // issued from, looked up through the retriever.
    if matches!(
        strategy,
        DecontextStrategy::ContextUrl | DecontextStrategy::Full
    ) {
        let summary = match ctx.retriever.search_by_url(&ctx.request.context_url).await {
            Some(item) => trim_json(&item.schema_json),
            None => {
                debug!(url = %ctx.request.context_url, "context url not found in index");
                String::new()
            }
        };
        vars.push(("context.description", summary));
    }

    let prompt = prompts::fill(template, &vars);
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::decontextualize_struc(), Tier::High)
        .await?;

    let rewritten = reply["decontextualized_query"]
        .as_str()
        .unwrap_or_default()
        .trim()
        .to_string();
    if !rewritten.is_empty() && rewritten != ctx.request.query {
        info!(rewritten = %rewritten, "query decontextualised");
        ctx.derived.write().await.decontextualized_query = rewritten.clone();
        ctx.send(Message::DecontextualizedQuery {
            decontextualized_query: rewritten,
        })
        .await?;
    }
    Ok(())
}

/// LLM-based item-type detection; refines the config-derived type when
/// query analysis is enabled.
pub async fn detect_item_type(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    if !ctx.config.gateway.analyze_query_enabled {
        return Ok(());
    }
    let item_type = ctx.item_type().await;
    let prompt = prompts::fill(prompts::DETECT_ITEM_TYPE, &base_vars(&ctx, &item_type));
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::detect_item_type_struc(), Tier::Low)
        .await?;
    if let Some(detected) = reply["item_type"].as_str()
        && !detected.is_empty()
    {
        debug!(item_type = %detected, "item type detected");
        ctx.derived.write().await.item_type = detected.to_string();
    }
    Ok(())
}

/// Flags queries that span several item types; the result is only
/// logged — the ensemble tool handles composition when routing picks it.
pub async fn detect_multi_item_type(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    if !ctx.config.gateway.analyze_query_enabled {
        return Ok(());
    }
    let item_type = ctx.item_type().await;
    let prompt = prompts::fill(
        prompts::DETECT_MULTI_ITEM_TYPE,
        &base_vars(&ctx, &item_type),
    );
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::detect_multi_item_type_struc(), Tier::Low)
        .await?;
    if truthy(&reply["is_multi_item_type_query"]) {
        debug!(types = ?reply["item_types"], "multi item type query detected");
    }
    Ok(())
}

pub async fn detect_query_type(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    if !ctx.config.gateway.analyze_query_enabled {
        return Ok(());
    }
    let item_type = ctx.item_type().await;
    let prompt = prompts::fill(prompts::DETECT_QUERY_TYPE, &base_vars(&ctx, &item_type));
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::detect_query_type_struc(), Tier::Low)
        .await?;
    debug!(query_type = ?reply["query_type"], "query type detected");
    Ok(())
}

/// Rules out queries with no relation to the site's content. The handler
/// emits the terminal notice after pre-checks settle.
pub async fn relevance_detection(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    let item_type = ctx.item_type().await;
    let prompt = prompts::fill(prompts::RELEVANCE_DETECTION, &base_vars(&ctx, &item_type));
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::relevance_struc(), Tier::Low)
        .await?;
    if truthy(&reply["site_is_irrelevant_to_query"]) {
        info!("query ruled irrelevant to the site");
        ctx.derived.write().await.query_is_irrelevant = true;
        // Stop the speculative branch before it streams anything.
        ctx.abort_fast_track.set();
    }
    Ok(())
}

/// Extracts statements the user wants remembered (dietary restrictions
/// and the like) and acknowledges them.
pub async fn memory(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    if !ctx.config.gateway.memory_enabled {
        return Ok(());
    }
    let item_type = ctx.item_type().await;
    let prompt = prompts::fill(prompts::MEMORY, &base_vars(&ctx, &item_type));
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::memory_struc(), Tier::Low)
        .await?;
    if truthy(&reply["is_memory_request"]) {
        let statement = reply["memory_request"].as_str().unwrap_or_default();
        if !statement.is_empty() {
            info!(statement = %statement, "memorable statement detected");
            ctx.send(Message::IntermediateMessage {
                message: format!("I'll remember that: {statement}"),
            })
            .await?;
        }
    }
    Ok(())
}

/// Gate for sites that need extra user input before a query can be
/// answered. A missing-info verdict is terminal: ask the user, abort the
/// fast track, and finish the query.
pub async fn required_info(ctx: Arc<QueryContext>) -> Result<(), GatewayError> {
    if !ctx.config.gateway.required_info_enabled {
        return Ok(());
    }
    let item_type = ctx.item_type().await;
    let prompt = prompts::fill(prompts::REQUIRED_INFO, &base_vars(&ctx, &item_type));
    let reply = match ctx
        .llm
        .ask(&prompt, &prompts::required_info_struc(), Tier::Low)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            // No verdict means no gate: proceed as if the info was there.
            warn!(error = %e, "required-info check failed, assuming satisfied");
            return Ok(());
        }
    };

    if truthy(&reply["required_info_found"]) || reply["required_info_found"].is_null() {
        return Ok(());
    }

    let question = reply["user_question"]
        .as_str()
        .unwrap_or("Could you tell me more about what you are looking for?")
        .to_string();
    info!("required information missing, asking the user");
    {
        let mut derived = ctx.derived.write().await;
        derived.required_info_found = false;
        derived.query_done = true;
    }
    ctx.abort_fast_track.set();
    ctx.send(Message::AskUser { message: question }).await?;
    Ok(())
}
