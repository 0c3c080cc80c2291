use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::llm::{Tier, extract_score};
use crate::messages::Message;
use crate::prompts;
use crate::retrieval::RetrievedItem;
use crate::state::{GenerateMode, QueryContext, RankedAnswer};
use crate::trim::trim_json;

/// Threshold/emission policy for a ranking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Regular,
    Fast,
}

/// Per-item LLM scoring with bounded parallelism and streaming emission
/// of good matches.
pub struct Ranking {
    ctx: Arc<QueryContext>,
    track: Track,
}

impl Ranking {
    pub fn new(ctx: Arc<QueryContext>, track: Track) -> Self {
        Self { ctx, track }
    }

    fn threshold(&self) -> u32 {
        let ranking = &self.ctx.config.gateway.ranking;
        match self.track {
            Track::Regular => ranking.regular_threshold,
            // The speculative track is stricter in generate modes: those
            // answers feed synthesis, not the user directly.
            Track::Fast => match self.ctx.request.generate_mode {
                GenerateMode::Summarize | GenerateMode::Generate => {
                    ranking.fast_threshold.max(70)
                }
                _ => ranking.fast_threshold,
            },
        }
    }

    /// Score the fast-track abort only on the speculative instance; a
    /// regular-track run may legitimately follow an aborted fast track
    /// (e.g. tool-handler fallback to plain search).
    fn aborted(&self) -> bool {
        self.track == Track::Fast && self.ctx.abort_fast_track.is_set()
    }

    /// Score every item concurrently, emit good answers as they arrive,
    /// then apply the end-of-batch policy.
    pub async fn run(&self, items: Vec<RetrievedItem>) {
        let threshold = self.threshold();
        let total = items.len();
        info!(
            items = total,
            threshold,
            track = ?self.track,
            "ranking started"
        );

        let workers = self.ctx.config.gateway.ranking.num_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set = JoinSet::new();

        for item in items {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            let track = self.track;
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                rank_item(&ctx, track, threshold, item).await;
            });
        }
        while join_set.join_next().await.is_some() {}

        if self.aborted() {
            debug!("ranking aborted, skipping end-of-batch emission");
            return;
        }

        if self.ctx.request.streaming {
            self.emit_fallback_floor(threshold).await;
        } else {
            self.emit_final_batch(threshold).await;
        }
        info!(track = ?self.track, "ranking finished");
    }

    /// Non-streaming: one batch with the top good answers by score.
    async fn emit_final_batch(&self, threshold: u32) {
        let max_results = self.ctx.config.gateway.ranking.max_results;
        let batch = {
            let mut answers = self.ctx.ranked_answers.lock().await;
            let mut indices: Vec<usize> = (0..answers.len())
                .filter(|&i| answers[i].score >= threshold && !answers[i].sent)
                .collect();
            indices.sort_by(|&a, &b| answers[b].score.cmp(&answers[a].score));
            indices.truncate(max_results);

            let mut batch = Vec::with_capacity(indices.len());
            for i in indices {
                answers[i].sent = true;
                batch.push(answers[i].to_answer_item());
            }
            batch
        };
        if !batch.is_empty()
            && let Err(e) = self.ctx.send(Message::ResultBatch { results: batch }).await
        {
            warn!(error = %e, "failed to emit final batch");
        }
    }

    /// Streaming produced too few good answers: lower the bar by the
    /// configured delta and top the stream up to the floor.
    async fn emit_fallback_floor(&self, threshold: u32) {
        let ranking = &self.ctx.config.gateway.ranking;
        let floor = ranking.fallback_floor;
        let sent = self.ctx.sent_answer_count().await;
        if sent >= floor {
            return;
        }
        let lowered = threshold.saturating_sub(ranking.fallback_delta);
        debug!(sent, floor, lowered, "few good answers, re-emitting with lowered threshold");

        let mut to_send = Vec::new();
        {
            let mut answers = self.ctx.ranked_answers.lock().await;
            if self.aborted() {
                return;
            }
            let mut indices: Vec<usize> = (0..answers.len())
                .filter(|&i| !answers[i].sent && answers[i].score >= lowered)
                .collect();
            indices.sort_by(|&a, &b| answers[b].score.cmp(&answers[a].score));

            let mut have = sent;
            for i in indices {
                if have >= floor {
                    break;
                }
                answers[i].sent = true;
                to_send.push(answers[i].to_answer_item());
                have += 1;
            }
        }
        for item in to_send {
            if let Err(e) = self
                .ctx
                .send(Message::ResultBatch {
                    results: vec![item],
                })
                .await
            {
                warn!(error = %e, "failed to emit fallback answer");
            }
        }
    }
}

/// Score one item and record it. A failure drops the item and never
/// aborts the batch.
async fn rank_item(ctx: &Arc<QueryContext>, track: Track, threshold: u32, item: RetrievedItem) {
    if track == Track::Fast && ctx.abort_fast_track.is_set() {
        return;
    }

    let query = ctx.decontextualized_query().await;
    let description = trim_json(&item.schema_json);
    let prompt = prompts::fill(
        prompts::RANKING,
        &[
            ("request.query", query),
            (
                "request.prev_queries",
                format!("{:?}", ctx.request.prev_queries),
            ),
            ("item.description", description),
        ],
    );

    let reply = match ctx.llm.ask(&prompt, &prompts::ranking_struc(), Tier::Low).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(url = %item.url, error = %e, "item scoring failed, dropping item");
            return;
        }
    };

    let score = extract_score(&reply);
    let description = reply["description"].as_str().unwrap_or_default().to_string();
    let schema_object = crate::trim::flatten_payload(item.schema_object());
    let answer = RankedAnswer {
        url: item.url,
        site: item.site,
        name: item.name,
        schema_object,
        score,
        description,
        sent: false,
    };

    // Append, and emit while still holding the lock: the `sent` flip and
    // the emission must be atomic with respect to other scoring tasks.
    let mut answers = ctx.ranked_answers.lock().await;
    answers.push(answer);
    let idx = answers.len() - 1;

    let good = score >= threshold;
    let abort = track == Track::Fast && ctx.abort_fast_track.is_set();
    if good && ctx.request.streaming && !abort {
        answers[idx].sent = true;
        let payload = answers[idx].to_answer_item();
        if let Err(e) = ctx
            .send(Message::ResultBatch {
                results: vec![payload],
            })
            .await
        {
            warn!(error = %e, "failed to stream ranked answer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::test_support::{FakeBackend, item, retriever_with};
    use crate::state::test_support::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn items(n: usize) -> Vec<RetrievedItem> {
        (0..n)
            .map(|i| item(&format!("https://example.com/{i}"), "example", &format!("item {i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_streaming_emits_good_answers_once() {
        let (tx, mut rx) = mpsc::channel(64);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"score": 80, "description": "good"}));
        let ctx = test_context(test_request("q", true), llm, retriever, Some(tx));

        Ranking::new(Arc::clone(&ctx), Track::Regular).run(items(3)).await;
        drop(ctx);

        let mut urls = Vec::new();
        while let Some(frame) = rx.recv().await {
            if frame["message_type"] == "result_batch" {
                for result in frame["results"].as_array().unwrap() {
                    urls.push(result["url"].as_str().unwrap().to_string());
                }
            }
        }
        assert_eq!(urls.len(), 3);
        let unique: std::collections::HashSet<_> = urls.iter().collect();
        assert_eq!(unique.len(), 3, "no URL may be emitted twice");
    }

    #[tokio::test]
    async fn test_low_scores_are_recorded_but_not_emitted() {
        let (tx, mut rx) = mpsc::channel(64);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"score": 10, "description": "poor"}));
        let ctx = test_context(test_request("q", true), llm, retriever, Some(tx));

        Ranking::new(Arc::clone(&ctx), Track::Regular).run(items(2)).await;

        assert_eq!(ctx.ranked_answers.lock().await.len(), 2);
        assert_eq!(ctx.sent_answer_count().await, 0);
        drop(ctx);
        while let Some(frame) = rx.recv().await {
            assert_ne!(frame["message_type"], "result_batch");
        }
    }

    #[tokio::test]
    async fn test_abort_suppresses_fast_track_emission() {
        let (tx, mut rx) = mpsc::channel(64);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"score": 95, "description": "great"}));
        let ctx = test_context(test_request("q", true), llm, retriever, Some(tx));
        ctx.abort_fast_track.set();

        Ranking::new(Arc::clone(&ctx), Track::Fast).run(items(3)).await;
        drop(ctx);

        while let Some(frame) = rx.recv().await {
            assert_ne!(frame["message_type"], "result_batch");
        }
    }

    #[tokio::test]
    async fn test_abort_does_not_silence_regular_track() {
        let (tx, mut rx) = mpsc::channel(64);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::always(json!({"score": 95, "description": "great"}));
        let ctx = test_context(test_request("q", true), llm, retriever, Some(tx));
        ctx.abort_fast_track.set();

        Ranking::new(Arc::clone(&ctx), Track::Regular).run(items(1)).await;
        drop(ctx);

        let mut batches = 0;
        while let Some(frame) = rx.recv().await {
            if frame["message_type"] == "result_batch" {
                batches += 1;
            }
        }
        assert_eq!(batches, 1);
    }

    #[tokio::test]
    async fn test_non_streaming_emits_single_sorted_batch() {
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        let llm = ScriptedLlm::with_replies(
            vec![
                ("item 0", json!({"score": 60, "description": ""})),
                ("item 1", json!({"score": 90, "description": ""})),
                ("item 2", json!({"score": 75, "description": ""})),
            ],
            json!({"score": 0}),
        );
        let ctx = test_context(test_request("q", false), llm, retriever, None);

        Ranking::new(Arc::clone(&ctx), Track::Regular).run(items(3)).await;

        let value = ctx.return_value().await;
        let results = value["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        let scores: Vec<u64> = results
            .iter()
            .map(|r| r["score"].as_u64().unwrap())
            .collect();
        assert_eq!(scores, vec![90, 75, 60]);
    }

    #[tokio::test]
    async fn test_fallback_floor_reemits_near_misses() {
        let (tx, mut rx) = mpsc::channel(64);
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        // Scores sit just under the regular threshold (51) but within the
        // fallback delta (8).
        let llm = ScriptedLlm::always(json!({"score": 47, "description": "close"}));
        let ctx = test_context(test_request("q", true), llm, retriever, Some(tx));

        Ranking::new(Arc::clone(&ctx), Track::Regular).run(items(5)).await;
        drop(ctx);

        let mut emitted = 0;
        while let Some(frame) = rx.recv().await {
            if frame["message_type"] == "result_batch" {
                emitted += frame["results"].as_array().unwrap().len();
            }
        }
        // Topped up to the configured floor of 2, not the full five.
        assert_eq!(emitted, 2);
    }

    #[tokio::test]
    async fn test_single_item_failure_drops_item_only() {
        let retriever = retriever_with(vec![("fake", FakeBackend::empty())]);
        // The fallback reply is not JSON-shaped; ScriptedLlm still returns
        // a value, so emulate failure with a zero-score non-object.
        let llm = ScriptedLlm::with_replies(
            vec![
                ("item 0", json!({"score": 80, "description": "fine"})),
                ("item 1", json!("not an object")),
            ],
            json!({"score": 70, "description": ""}),
        );
        let ctx = test_context(test_request("q", false), llm, retriever, None);

        Ranking::new(Arc::clone(&ctx), Track::Regular).run(items(2)).await;

        // Both items recorded; the malformed reply scored 0.
        let answers = ctx.ranked_answers.lock().await;
        assert_eq!(answers.len(), 2);
        assert!(answers.iter().any(|a| a.score == 80));
        assert!(answers.iter().any(|a| a.score == 0));
    }
}
