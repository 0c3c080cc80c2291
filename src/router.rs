use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::catalogue::{ToolDescriptor, ToolHandlerKind};
use crate::llm::{Tier, extract_score};
use crate::messages::Message;
use crate::prompts;
use crate::state::{GenerateMode, QueryContext, ToolMatch};

/// Minimum score for a tool to be selected at all.
const MIN_TOOL_SCORE: u32 = 70;

/// Maximum number of routing results retained.
const MAX_TOOL_RESULTS: usize = 3;

/// Scores the candidate tools for the decontextualised query and selects
/// at most one to run. Runs as a pre-check, after decontextualisation.
pub struct ToolSelector {
    ctx: Arc<QueryContext>,
}

impl ToolSelector {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) {
        if !self.ctx.config.gateway.tool_selection_enabled {
            debug!("tool selection disabled in config");
            return;
        }
        // Summarise/generate requests always take the search+generate
        // path; routing would only slow them down.
        if matches!(
            self.ctx.request.generate_mode,
            GenerateMode::Summarize | GenerateMode::Generate
        ) {
            debug!("generate mode set, skipping tool selection");
            return;
        }

        self.ctx.decontextualize_done.wait().await;

        let query = self.ctx.decontextualized_query().await;
        let schema_type = normalise_type(&self.ctx.item_type().await);
        let tools = self.ctx.catalogue.tools_for_type(&schema_type);
        if tools.is_empty() {
            debug!(schema_type = %schema_type, "no tools declared, defaulting to search");
            return;
        }

        let mut scored = self.evaluate_tools(&query, tools).await;
        scored.sort_by(|a, b| b.score.cmp(&a.score));

        for candidate in &scored {
            debug!(tool = %candidate.tool.name, score = candidate.score, "tool scored");
        }

        let mut selected: Vec<ToolMatch> = scored
            .iter()
            .filter(|c| c.score >= MIN_TOOL_SCORE)
            .cloned()
            .collect();

        // Nothing passed: fall back to plain search with a synthetic
        // zero-score entry, when a search tool exists at all.
        if selected.is_empty() {
            if let Some(search) = scored.iter().find(|c| c.tool.name == "search") {
                info!(
                    threshold = MIN_TOOL_SCORE,
                    "no tool met the threshold, falling back to search"
                );
                selected = vec![ToolMatch {
                    tool: Arc::clone(&search.tool),
                    score: 0,
                    arguments: serde_json::json!({
                        "score": 0,
                        "justification": "default fallback, no tool met the threshold",
                    }),
                }];
            } else {
                info!("no tool met the threshold and no search tool is declared");
            }
        }

        // A specialised tool taking over means speculative search results
        // must not reach the caller.
        if let Some(top) = selected.first()
            && top.tool.handler != ToolHandlerKind::Search
        {
            info!(tool = %top.tool.name, "non-search tool selected, aborting fast track");
            self.ctx.abort_fast_track.set();
        }

        selected.truncate(MAX_TOOL_RESULTS);

        let message = match selected.first() {
            Some(top) => Message::ToolSelection {
                selected_tool: top.tool.name.clone(),
                score: top.score,
                parameters: top.arguments.clone(),
                query: query.clone(),
            },
            None => Message::ToolSelection {
                selected_tool: "search".into(),
                score: 0,
                parameters: serde_json::json!({"justification": "no tools declared"}),
                query: query.clone(),
            },
        };

        *self.ctx.tool_routing_results.lock().await = selected;

        if let Err(e) = self.ctx.send(message).await {
            warn!(error = %e, "failed to send tool_selection message");
        }
    }

    /// Evaluate every candidate in parallel with its own scoring prompt
    /// and declared return schema.
    async fn evaluate_tools(
        &self,
        query: &str,
        tools: Vec<Arc<ToolDescriptor>>,
    ) -> Vec<ToolMatch> {
        let mut join_set = JoinSet::new();
        for tool in tools {
            if tool.prompt.is_empty() {
                continue;
            }
            let ctx = Arc::clone(&self.ctx);
            let query = query.to_string();
            join_set.spawn(async move {
                let prompt = fill_tool_prompt(&ctx, &tool, &query).await;
                match ctx
                    .llm
                    .ask(&prompt, &tool.return_structure, Tier::High)
                    .await
                {
                    Ok(reply) => Some(ToolMatch {
                        score: extract_score(&reply),
                        arguments: reply,
                        tool,
                    }),
                    Err(e) => {
                        warn!(tool = %tool.name, error = %e, "tool evaluation failed");
                        None
                    }
                }
            });
        }

        let mut scored = Vec::new();
        while let Some(result) = join_set.join_next().await {
            if let Ok(Some(candidate)) = result {
                scored.push(candidate);
            }
        }
        scored
    }
}

/// Fill a catalogue scoring prompt with the handler's context.
async fn fill_tool_prompt(ctx: &Arc<QueryContext>, tool: &ToolDescriptor, query: &str) -> String {
    let mut prompt = prompts::fill(
        &tool.prompt,
        &[
            ("request.query", query.to_string()),
            (
                "request.prev_queries",
                format!("{:?}", ctx.request.prev_queries),
            ),
            ("site.name", ctx.request.site.to_string()),
            ("site.itemType", ctx.item_type().await),
        ],
    );
    if !tool.examples.is_empty() {
        prompt.push_str("\nExample queries for this tool: ");
        prompt.push_str(&tool.examples.join("; "));
    }
    prompt
}

/// Strip an XML-namespace prefix from a schema type name
/// (`{https://schema.org/}Recipe` -> `Recipe`).
fn normalise_type(schema_type: &str) -> String {
    match schema_type.rsplit_once('}') {
        Some((_, bare)) => bare.to_string(),
        None => schema_type.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::ToolCatalogue;
    use crate::retrieval::test_support::{FakeBackend, retriever_with};
    use crate::state::QueryContext;
    use crate::state::test_support::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    const CATALOGUE: &str = r#"
<Tools>
  <Thing>
    <Tool name="search">
      <prompt>search fit: {request.query}</prompt>
      <returnStruc>{"score": "integer"}</returnStruc>
      <handler>search</handler>
    </Tool>
    <Tool name="compare_items">
      <prompt>compare fit: {request.query}</prompt>
      <returnStruc>{"score": "integer", "item1": "string", "item2": "string"}</returnStruc>
      <handler>compare_items</handler>
    </Tool>
  </Thing>
</Tools>
"#;

    fn context_with_catalogue(
        llm: Arc<dyn crate::llm::AskLlm>,
        tx: Option<mpsc::Sender<serde_json::Value>>,
    ) -> Arc<QueryContext> {
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let ctx = QueryContext::new(
            test_request("compare Dune and Foundation", true),
            test_config(),
            llm,
            retriever,
            Arc::new(ToolCatalogue::from_xml(CATALOGUE).unwrap()),
            tx,
        );
        ctx.decontextualize_done.set();
        ctx
    }

    #[tokio::test]
    async fn test_non_search_winner_aborts_fast_track() {
        let (tx, mut rx) = mpsc::channel(16);
        let llm = ScriptedLlm::with_replies(
            vec![
                ("compare fit", json!({"score": 92, "item1": "Dune", "item2": "Foundation"})),
                ("search fit", json!({"score": 40})),
            ],
            json!({"score": 0}),
        );
        let ctx = context_with_catalogue(llm, Some(tx));

        ToolSelector::new(Arc::clone(&ctx)).run().await;

        assert!(ctx.abort_fast_track.is_set());
        let routing = ctx.tool_routing_results.lock().await;
        assert_eq!(routing[0].tool.name, "compare_items");
        assert_eq!(routing[0].score, 92);
        drop(routing);
        drop(ctx);

        let mut saw_selection = false;
        while let Some(frame) = rx.recv().await {
            if frame["message_type"] == "tool_selection" {
                saw_selection = true;
                assert_eq!(frame["selected_tool"], "compare_items");
                assert_eq!(frame["score"], 92);
            }
        }
        assert!(saw_selection);
    }

    #[tokio::test]
    async fn test_below_threshold_falls_back_to_search() {
        let llm = ScriptedLlm::always(json!({"score": 30}));
        let ctx = context_with_catalogue(llm, None);

        ToolSelector::new(Arc::clone(&ctx)).run().await;

        assert!(!ctx.abort_fast_track.is_set());
        let routing = ctx.tool_routing_results.lock().await;
        assert_eq!(routing.len(), 1);
        assert_eq!(routing[0].tool.name, "search");
        assert_eq!(routing[0].score, 0);
    }

    #[tokio::test]
    async fn test_scores_are_clamped() {
        let llm = ScriptedLlm::with_replies(
            vec![("search fit", json!({"score": 900}))],
            json!({"score": -5}),
        );
        let ctx = context_with_catalogue(llm, None);

        ToolSelector::new(Arc::clone(&ctx)).run().await;

        let routing = ctx.tool_routing_results.lock().await;
        for candidate in routing.iter() {
            assert!(candidate.score <= 100);
        }
        assert_eq!(routing[0].tool.name, "search");
        assert_eq!(routing[0].score, 100);
    }

    #[tokio::test]
    async fn test_generate_mode_skips_selection() {
        let llm = ScriptedLlm::always(json!({"score": 95}));
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let mut request = test_request("q", true);
        request.generate_mode = GenerateMode::Generate;
        let ctx = QueryContext::new(
            request,
            test_config(),
            llm,
            retriever,
            Arc::new(ToolCatalogue::from_xml(CATALOGUE).unwrap()),
            None,
        );
        ctx.decontextualize_done.set();

        ToolSelector::new(Arc::clone(&ctx)).run().await;

        assert!(ctx.tool_routing_results.lock().await.is_empty());
        assert!(!ctx.abort_fast_track.is_set());
    }

    #[test]
    fn test_normalise_type_strips_namespace() {
        assert_eq!(normalise_type("{https://schema.org/}Recipe"), "Recipe");
        assert_eq!(normalise_type("Movie"), "Movie");
    }
}
