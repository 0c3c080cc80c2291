//! The query handler: owns per-request state, launches the pre-check
//! fan-out and the speculative fast track, routes to the selected tool
//! handler, and closes with post-ranking.

pub mod fast_track;
pub mod post_ranking;
pub mod prechecks;

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::catalogue::ToolHandlerKind;
use crate::error::GatewayError;
use crate::messages::Message;
use crate::ranking::{Ranking, Track};
use crate::router::ToolSelector;
use crate::state::QueryContext;
use crate::tools;

pub struct QueryHandler {
    ctx: Arc<QueryContext>,
}

impl QueryHandler {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self { ctx }
    }

    /// Run one query to completion. The return value is the accumulated
    /// map for non-streaming callers; streamed messages have already
    /// gone out through the send channel.
    pub async fn run(&self) -> Result<serde_json::Map<String, Value>, GatewayError> {
        let ctx = &self.ctx;
        info!(
            query_id = %ctx.request.query_id,
            query = %ctx.request.query,
            site = %ctx.request.site,
            "query started"
        );

        self.prepare().await?;

        if ctx.is_query_done().await {
            debug!("query finished during preparation");
            return Ok(ctx.return_value().await);
        }

        // Fast track already streamed ranked answers for plain search; if
        // routing agrees the tool is search, there is nothing to re-rank.
        let fast_track_worked = ctx.derived.read().await.fast_track_worked;
        let top_is_search = {
            let routing = ctx.tool_routing_results.lock().await;
            routing
                .first()
                .is_none_or(|top| top.tool.handler == ToolHandlerKind::Search)
        };
        if !(fast_track_worked && top_is_search) {
            self.route().await;
        }

        if ctx.is_query_done().await {
            return Ok(ctx.return_value().await);
        }

        post_ranking::run(ctx).await;
        info!(query_id = %ctx.request.query_id, "query finished");
        Ok(ctx.return_value().await)
    }

    /// Launch the fast track and every pre-check concurrently, wait for
    /// the whole set, then settle the short-circuit verdicts and make
    /// sure retrieval happened.
    async fn prepare(&self) -> Result<(), GatewayError> {
        let ctx = &self.ctx;
        let strict = ctx.config.gateway.strict_mode;
        let mut join_set: JoinSet<Result<(), GatewayError>> = JoinSet::new();

        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(async move {
                fast_track::run(ctx).await;
                Ok(())
            });
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::detect_item_type(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::detect_multi_item_type(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::detect_query_type(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::decontextualize(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::relevance_detection(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::memory(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(prechecks::required_info(ctx));
        }
        {
            let ctx = Arc::clone(ctx);
            join_set.spawn(async move {
                ToolSelector::new(ctx).run().await;
                Ok(())
            });
        }

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // A failing pre-check never poisons its siblings;
                    // strict mode (tests) propagates after the drain.
                    warn!(error = %e, "preparation task failed");
                    if strict && first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "preparation task panicked");
                }
            }
        }
        ctx.pre_checks_done.set();
        if let Some(e) = first_error {
            return Err(e);
        }

        // Terminal verdicts from the pre-checks.
        if ctx.derived.read().await.query_is_irrelevant {
            info!("query ruled irrelevant, finishing early");
            ctx.abort_fast_track.set();
            ctx.send(Message::IntermediateMessage {
                message: format!(
                    "This query does not seem related to the content of {}.",
                    ctx.request.site
                ),
            })
            .await?;
            ctx.mark_query_done().await;
            return Ok(());
        }
        if ctx.is_query_done().await {
            // The required-info gate already asked the user.
            return Ok(());
        }

        // Fast track may have skipped or failed; retrieve on the regular
        // path so ranking and the handlers have items to work with.
        if !ctx.retrieval_done.is_set() {
            let query = ctx.decontextualized_query().await;
            match ctx
                .retriever
                .search(
                    &query,
                    &ctx.request.site,
                    fast_track::RETRIEVAL_COUNT,
                    ctx.request.db.as_deref(),
                )
                .await
            {
                Ok(items) => {
                    debug!(items = items.len(), "regular retrieval done");
                    ctx.derived.write().await.final_retrieved_items = items;
                    ctx.retrieval_done.set();
                }
                Err(e @ GatewayError::AllBackendsFailed { .. }) => {
                    error!(error = %e, "retrieval failed on every backend");
                    ctx.send(Message::Error {
                        error: e.to_string(),
                    })
                    .await?;
                    ctx.mark_query_done().await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Dispatch to the routed tool handler, falling back to plain search
    /// when the handler fails or nothing was routed.
    async fn route(&self) {
        let ctx = &self.ctx;
        let top = {
            let routing = ctx.tool_routing_results.lock().await;
            routing.first().cloned()
        };

        let Some(top) = top else {
            debug!("no routing results, running plain search");
            self.search_ranking().await;
            return;
        };

        info!(tool = %top.tool.name, score = top.score, "routing to tool");
        match top.tool.handler {
            ToolHandlerKind::Search => self.search_ranking().await,
            kind => {
                if let Err(e) = tools::dispatch(kind, &top.arguments, ctx).await {
                    warn!(tool = %top.tool.name, error = %e, "tool handler failed, falling back to search");
                    self.search_ranking().await;
                }
            }
        }
    }

    async fn search_ranking(&self) {
        let items = self.ctx.derived.read().await.final_retrieved_items.clone();
        Ranking::new(Arc::clone(&self.ctx), Track::Regular)
            .run(items)
            .await;
    }
}
