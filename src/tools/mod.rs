pub mod compare_items;
pub mod ensemble;
pub mod generate_answer;
pub mod item_details;
pub mod statistics;
pub mod who;

use serde_json::Value;
use std::sync::Arc;

use crate::catalogue::ToolHandlerKind;
use crate::error::GatewayError;
use crate::state::QueryContext;

/// Run the handler behind a selected tool. `Search` is not dispatched
/// here — the query handler runs the ranking path for it directly.
pub async fn dispatch(
    kind: ToolHandlerKind,
    args: &Value,
    ctx: &Arc<QueryContext>,
) -> Result<(), GatewayError> {
    match kind {
        ToolHandlerKind::Search => Ok(()),
        ToolHandlerKind::ItemDetails => item_details::run(args, ctx).await,
        ToolHandlerKind::CompareItems => compare_items::run(args, ctx).await,
        ToolHandlerKind::Ensemble => ensemble::run(args, ctx).await,
        ToolHandlerKind::Statistics => statistics::run(args, ctx).await,
        ToolHandlerKind::GenerateAnswer => generate_answer::run(ctx).await,
    }
}
