//! End-of-query tasks over the ranked answers: summarise or generate
//! prose when the request asked for it.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::Tier;
use crate::messages::Message;
use crate::prompts;
use crate::state::{GenerateMode, QueryContext};
use crate::tools::generate_answer;

pub async fn run(ctx: &Arc<QueryContext>) {
    if ctx.is_query_done().await {
        debug!("query already finished, skipping post-ranking");
        return;
    }
    match ctx.request.generate_mode {
        GenerateMode::Summarize => {
            if let Err(e) = summarize(ctx).await {
                warn!(error = %e, "summarisation failed");
            }
        }
        GenerateMode::Generate => {
            if let Err(e) = generate_answer::run_over_ranked(ctx).await {
                warn!(error = %e, "generate-over-ranked failed");
            }
        }
        GenerateMode::None | GenerateMode::List => {}
    }
}

/// Summarise the answers that were emitted to the caller.
async fn summarize(ctx: &Arc<QueryContext>) -> Result<(), crate::error::GatewayError> {
    let descriptions: Vec<Value> = {
        let answers = ctx.ranked_answers.lock().await;
        answers
            .iter()
            .filter(|a| a.sent)
            .map(|a| {
                json!({
                    "name": a.name,
                    "url": a.url,
                    "description": a.description,
                })
            })
            .collect()
    };
    if descriptions.is_empty() {
        debug!("nothing was emitted, skipping summary");
        return Ok(());
    }

    let prompt = prompts::fill(
        prompts::SUMMARIZE_RESULTS,
        &[
            ("request.query", ctx.decontextualized_query().await),
            (
                "items.descriptions",
                serde_json::to_string(&descriptions).unwrap_or_default(),
            ),
        ],
    );
    let reply = ctx
        .llm
        .ask(&prompt, &prompts::summarize_struc(), Tier::High)
        .await?;
    let message = reply["message"].as_str().unwrap_or_default().to_string();
    if !message.is_empty() {
        ctx.send(Message::Summary { message }).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::test_support::{FakeBackend, retriever_with};
    use crate::state::test_support::*;
    use tokio::sync::mpsc;

    fn answer(url: &str, sent: bool) -> crate::state::RankedAnswer {
        crate::state::RankedAnswer {
            url: url.into(),
            site: "example".into(),
            name: "thing".into(),
            schema_object: json!({}),
            score: 80,
            description: "fits".into(),
            sent,
        }
    }

    #[tokio::test]
    async fn test_summarize_covers_only_sent_answers() {
        let (tx, mut rx) = mpsc::channel(16);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"message": "two results stood out"}));
        let mut request = test_request("q", true);
        request.generate_mode = GenerateMode::Summarize;
        let ctx = test_context(request, llm, retriever, Some(tx));
        {
            let mut answers = ctx.ranked_answers.lock().await;
            answers.push(answer("u1", true));
            answers.push(answer("u2", false));
        }

        run(&ctx).await;
        drop(ctx);

        let mut summary = None;
        while let Some(frame) = rx.recv().await {
            if frame["message_type"] == "summary" {
                summary = Some(frame);
            }
        }
        assert_eq!(summary.unwrap()["message"], "two results stood out");
    }

    #[tokio::test]
    async fn test_skipped_when_query_done() {
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"message": "should not appear"}));
        let mut request = test_request("q", false);
        request.generate_mode = GenerateMode::Summarize;
        let ctx = test_context(request, llm, retriever, None);
        ctx.ranked_answers.lock().await.push(answer("u1", true));
        ctx.mark_query_done().await;

        run(&ctx).await;

        let value = ctx.return_value().await;
        assert!(value.get("summary").is_none());
    }

    #[tokio::test]
    async fn test_none_mode_is_a_noop() {
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"message": "should not appear"}));
        let ctx = test_context(test_request("q", false), llm, retriever, None);
        ctx.ranked_answers.lock().await.push(answer("u1", true));

        run(&ctx).await;

        let value = ctx.return_value().await;
        assert!(value.get("summary").is_none());
    }
}
