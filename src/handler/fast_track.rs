//! The speculative branch: retrieve and rank with the best query
//! available right now, before pre-checks settle, to cut time to first
//! result. Everything here is disposable — the abort event wins at every
//! suspension point.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ranking::{Ranking, Track};
use crate::state::QueryContext;

/// How long to wait for decontextualisation before racing ahead with the
/// raw query.
const DECONTEXTUALIZE_GRACE: Duration = Duration::from_millis(100);

/// Default number of candidates fetched for ranking.
pub const RETRIEVAL_COUNT: usize = 50;

pub async fn run(ctx: Arc<QueryContext>) {
    // Take a just-finished rewrite when it is nearly free; otherwise the
    // raw query is good enough for a speculative pass.
    let _ = tokio::time::timeout(DECONTEXTUALIZE_GRACE, ctx.decontextualize_done.wait()).await;

    if ctx.abort_fast_track.is_set() {
        debug!("fast track aborted before retrieval");
        return;
    }

    let query = ctx.decontextualized_query().await;
    let items = match ctx
        .retriever
        .search(
            &query,
            &ctx.request.site,
            RETRIEVAL_COUNT,
            ctx.request.db.as_deref(),
        )
        .await
    {
        Ok(items) => items,
        Err(e) => {
            // Speculation failed; the regular path will retrieve after
            // pre-checks.
            warn!(error = %e, "fast-track retrieval failed");
            return;
        }
    };

    if ctx.abort_fast_track.is_set() {
        debug!("fast track aborted after retrieval, discarding items");
        return;
    }

    ctx.derived.write().await.final_retrieved_items = items.clone();
    ctx.retrieval_done.set();
    info!(items = items.len(), "fast track retrieval done");

    Ranking::new(Arc::clone(&ctx), Track::Fast).run(items).await;

    if ctx.abort_fast_track.is_set() {
        debug!("fast track aborted during ranking");
        return;
    }
    ctx.derived.write().await.fast_track_worked = true;
    info!("fast track succeeded");
}
