//! `check-connectivity`: probe every configured dependency (LLM,
//! embedding provider, retrieval endpoints) and report what responds.
//! Meant for deployment debugging, not liveness checks — see `/ready`
//! for those.

use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::embedding::{Embed, EmbeddingClient};
use crate::llm::{AskLlm, LlmClient, Tier};
use crate::retrieval::UnifiedRetriever;
use crate::state::SiteScope;

struct ProbeReport {
    target: String,
    ok: bool,
    detail: String,
    elapsed_ms: u128,
}

async fn probe<F, Fut>(target: &str, run: F) -> ProbeReport
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let (ok, detail) = match run().await {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    };
    ProbeReport {
        target: target.to_string(),
        ok,
        detail,
        elapsed_ms: start.elapsed().as_millis(),
    }
}

/// Run all probes and print a report. Returns an error when anything
/// failed so scripts can gate on the exit code.
pub async fn run(config: &Arc<Config>) -> anyhow::Result<()> {
    let mut reports = Vec::new();

    // LLM: a trivial structured question against the low tier.
    match LlmClient::new(&config.llm) {
        Ok(client) => {
            reports.push(
                probe("llm", || async move {
                    let reply = client
                        .ask(
                            "Reply with the JSON object {\"ok\": true}.",
                            &json!({"ok": "boolean"}),
                            Tier::Low,
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(format!("reply: {reply}"))
                })
                .await,
            );
        }
        Err(e) => reports.push(ProbeReport {
            target: "llm".into(),
            ok: false,
            detail: e.to_string(),
            elapsed_ms: 0,
        }),
    }

    // Embedding: embed a short string, report the dimension.
    match EmbeddingClient::new(&config.embedding) {
        Ok(client) => {
            reports.push(
                probe("embedding", || async move {
                    let vector = client
                        .embed("connectivity probe")
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(format!("dimension: {}", vector.len()))
                })
                .await,
            );
        }
        Err(e) => reports.push(ProbeReport {
            target: "embedding".into(),
            ok: false,
            detail: e.to_string(),
            elapsed_ms: 0,
        }),
    }

    // Retrieval: one tiny search per enabled endpoint, each pinned via
    // the endpoint override so failures are attributable.
    let embedder: Arc<dyn Embed> = Arc::new(EmbeddingClient::new(&config.embedding)?);
    let mut dev_config = (**config).clone();
    dev_config.gateway.development_mode = true;
    let retriever = UnifiedRetriever::new(&dev_config, embedder);
    for name in retriever.endpoint_names() {
        let retriever = &retriever;
        let endpoint_name = name.clone();
        reports.push(
            probe(&format!("retrieval/{name}"), || async move {
                let items = retriever
                    .search("connectivity probe", &SiteScope::All, 1, Some(&endpoint_name))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("returned {} item(s)", items.len()))
            })
            .await,
        );
    }

    let mut failures = 0;
    println!("connectivity report:");
    for report in &reports {
        let status = if report.ok { "ok  " } else { "FAIL" };
        if !report.ok {
            failures += 1;
        }
        println!(
            "  [{status}] {:<24} {:>6}ms  {}",
            report.target, report.elapsed_ms, report.detail
        );
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} probes failed", reports.len());
    }
    println!("all {} probes passed", reports.len());
    Ok(())
}
