//! End-to-end pipeline scenarios over in-process fakes: the full query
//! handler with fake backends and a scripted LLM, asserting the
//! cross-component invariants that unit tests cannot see.

use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::catalogue::ToolCatalogue;
use crate::error::GatewayError;
use crate::handler::QueryHandler;
use crate::retrieval::test_support::{FakeBackend, item, retriever_with};
use crate::state::test_support::*;
use crate::state::{QueryContext, SiteScope};

async fn drain(mut rx: mpsc::Receiver<Value>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

fn ranking_llm() -> Arc<dyn crate::llm::AskLlm> {
    ScriptedLlm::with_replies(
        vec![("how well this item answers", json!({"score": 80, "description": "fits"}))],
        json!({"score": 0, "site_is_irrelevant_to_query": "false", "required_info_found": "true"}),
    )
}

#[tokio::test]
async fn test_same_request_twice_yields_same_urls() {
    let items = vec![
        item("https://example.com/a", "example", "a"),
        item("https://example.com/b", "example", "b"),
        item("https://example.com/c", "example", "c"),
    ];

    let mut url_sets = Vec::new();
    for _ in 0..2 {
        let retriever = retriever_with(vec![("fake", FakeBackend::with_items(items.clone()))]);
        let ctx = test_context(test_request("stable query", false), ranking_llm(), retriever, None);
        let value = QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap();
        let urls: HashSet<String> = value["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["url"].as_str().unwrap().to_string())
            .collect();
        url_sets.push(urls);
    }
    assert_eq!(url_sets[0], url_sets[1]);
}

#[tokio::test]
async fn test_emitted_results_match_sent_ranked_answers() {
    let (tx, rx) = mpsc::channel(64);
    let retriever = retriever_with(vec![(
        "fake",
        FakeBackend::with_items(vec![
            item("https://example.com/a", "example", "a"),
            item("https://example.com/b", "example", "b"),
        ]),
    )]);
    let ctx = test_context(test_request("q", true), ranking_llm(), retriever, Some(tx));

    QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap();

    let sent_urls: HashSet<String> = ctx
        .ranked_answers
        .lock()
        .await
        .iter()
        .filter(|a| a.sent)
        .map(|a| a.url.clone())
        .collect();
    drop(ctx);

    let mut emitted_urls = HashSet::new();
    for frame in drain(rx).await {
        if frame["message_type"] == "result_batch" {
            for result in frame["results"].as_array().unwrap() {
                // Every emitted URL appears exactly once across the
                // whole stream.
                assert!(emitted_urls.insert(result["url"].as_str().unwrap().to_string()));
            }
        }
    }
    assert_eq!(emitted_urls, sent_urls);
}

#[tokio::test]
async fn test_headers_once_and_first_across_full_run() {
    let (tx, rx) = mpsc::channel(64);
    let retriever = retriever_with(vec![(
        "fake",
        FakeBackend::with_items(vec![item("https://example.com/a", "example", "a")]),
    )]);
    let ctx = test_context(test_request("q", true), ranking_llm(), retriever, Some(tx));

    QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap();
    drop(ctx);
    let frames = drain(rx).await;

    assert_eq!(frames[0]["message_type"], "api_version");
    let version_frames = frames
        .iter()
        .filter(|f| f["message_type"] == "api_version")
        .count();
    assert_eq!(version_frames, 1);
}

#[tokio::test]
async fn test_duplicate_url_across_backends_emitted_once_with_merged_sources() {
    let (tx, rx) = mpsc::channel(64);
    // Both backends return the same URL; a third URL is unique.
    let retriever = retriever_with(vec![
        (
            "alpha",
            FakeBackend::with_items(vec![item("https://example.com/shared", "example", "shared")]),
        ),
        (
            "beta",
            FakeBackend::with_items(vec![
                item("https://example.com/shared", "example", "shared"),
                item("https://example.com/only-beta", "example", "beta only"),
            ]),
        ),
    ]);
    let ctx = test_context(test_request("q", true), ranking_llm(), retriever, Some(tx));

    QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap();
    drop(ctx);

    let mut shared_count = 0;
    for frame in drain(rx).await {
        if frame["message_type"] == "result_batch" {
            for result in frame["results"].as_array().unwrap() {
                if result["url"] == "https://example.com/shared" {
                    shared_count += 1;
                    // Coalesced into one object carrying both source
                    // documents' keys (the ranking path flattens the
                    // merged array for prompt tolerance).
                    assert!(result["schema_object"].is_object());
                }
            }
        }
    }
    assert_eq!(shared_count, 1);
}

#[tokio::test]
async fn test_ensemble_routed_end_to_end() {
    const CATALOGUE: &str = r#"
<Tools>
  <Thing>
    <Tool name="search">
      <prompt>search fit: {request.query}</prompt>
      <returnStruc>{"score": "integer"}</returnStruc>
      <handler>search</handler>
    </Tool>
    <Tool name="ensemble">
      <prompt>ensemble fit: {request.query}</prompt>
      <returnStruc>{"score": "integer", "queries": "array", "ensemble_type": "string"}</returnStruc>
      <handler>ensemble</handler>
    </Tool>
  </Thing>
</Tools>
"#;
    let (tx, rx) = mpsc::channel(256);
    let retriever = retriever_with(vec![(
        "fake",
        FakeBackend::with_items_delayed(
            vec![
                item("https://food.example/bruschetta", "food", "Bruschetta"),
                item("https://food.example/carbonara", "food", "Carbonara"),
                item("https://food.example/tiramisu", "food", "Tiramisu"),
            ],
            std::time::Duration::from_millis(100),
        ),
    )]);
    let llm = ScriptedLlm::with_replies(
        vec![
            (
                "ensemble fit",
                json!({
                    "score": 96,
                    "queries": ["Italian appetiser", "Italian main", "Italian dessert"],
                    "ensemble_type": "meal_planning",
                }),
            ),
            ("search fit", json!({"score": 35})),
            ("One aspect of it is", json!({"score": 85, "description": "fits"})),
            (
                "Build a cohesive",
                json!({
                    "theme": "a classic Italian dinner",
                    "items": [
                        {"category": "appetiser", "name": "Bruschetta", "url": "https://food.example/bruschetta", "description": "starter", "why_recommended": "light"},
                        {"category": "main", "name": "Carbonara", "url": "https://food.example/carbonara", "description": "main", "why_recommended": "hearty"},
                        {"category": "dessert", "name": "Tiramisu", "url": "https://food.example/tiramisu", "description": "dessert", "why_recommended": "sweet"},
                    ],
                }),
            ),
        ],
        json!({"score": 0, "site_is_irrelevant_to_query": "false", "required_info_found": "true"}),
    );
    let mut request = test_request("plan a three-course Italian dinner", true);
    request.site = SiteScope::One("food".into());
    let ctx = QueryContext::new(
        request,
        test_config(),
        llm,
        retriever,
        Arc::new(ToolCatalogue::from_xml(CATALOGUE).unwrap()),
        Some(tx),
    );

    QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap();
    assert!(ctx.is_query_done().await);
    assert!(ctx.abort_fast_track.is_set());
    drop(ctx);
    let frames = drain(rx).await;

    let ensembles: Vec<&Value> = frames
        .iter()
        .filter(|f| f["message_type"] == "ensemble_result")
        .collect();
    assert_eq!(ensembles.len(), 1);
    let items = ensembles[0]["recommendations"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    for entry in items {
        assert!(!entry["name"].as_str().unwrap().is_empty());
        assert!(entry["schema_object"].is_object());
    }
    // The speculative search results never reached the stream.
    assert!(!frames.iter().any(|f| f["message_type"] == "result_batch"));
}

#[tokio::test]
async fn test_strict_mode_propagates_precheck_failures() {
    struct FailingLlm;

    #[async_trait::async_trait]
    impl crate::llm::AskLlm for FailingLlm {
        async fn ask(
            &self,
            _prompt: &str,
            _schema: &Value,
            _tier: crate::llm::Tier,
        ) -> Result<Value, GatewayError> {
            Err(GatewayError::external("llm", "scripted outage"))
        }
    }

    let retriever = retriever_with(vec![(
        "fake",
        FakeBackend::with_items(vec![item("https://example.com/a", "example", "a")]),
    )]);

    let mut config = (*test_config()).clone();
    config.gateway.strict_mode = true;
    // Give the strict run a pre-check that actually calls the LLM.
    let mut request = test_request("what about spicier ones?", false);
    request.prev_queries = vec!["vegetarian snacks".into()];

    let ctx = QueryContext::new(
        request,
        Arc::new(config),
        Arc::new(FailingLlm),
        retriever,
        Arc::new(ToolCatalogue::empty()),
        None,
    );

    let err = QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap_err();
    assert!(matches!(err, GatewayError::ExternalCall { .. }));
}

#[tokio::test]
async fn test_lenient_mode_swallows_the_same_failure() {
    struct FailingDecontextLlm;

    #[async_trait::async_trait]
    impl crate::llm::AskLlm for FailingDecontextLlm {
        async fn ask(
            &self,
            prompt: &str,
            _schema: &Value,
            _tier: crate::llm::Tier,
        ) -> Result<Value, GatewayError> {
            if prompt.contains("Rewrite the latest query") {
                return Err(GatewayError::external("llm", "scripted outage"));
            }
            if prompt.contains("how well this item answers") {
                return Ok(json!({"score": 80, "description": "fits"}));
            }
            Ok(json!({"score": 0, "site_is_irrelevant_to_query": "false", "required_info_found": "true"}))
        }
    }

    let retriever = retriever_with(vec![(
        "fake",
        FakeBackend::with_items(vec![item("https://example.com/a", "example", "a")]),
    )]);
    let mut request = test_request("what about spicier ones?", false);
    request.prev_queries = vec!["vegetarian snacks".into()];

    let ctx = QueryContext::new(
        request,
        test_config(),
        Arc::new(FailingDecontextLlm),
        retriever,
        Arc::new(ToolCatalogue::empty()),
        None,
    );

    // The decontextualiser fails, siblings proceed, the raw query is
    // used, and results still come back.
    let value = QueryHandler::new(Arc::clone(&ctx)).run().await.unwrap();
    assert_eq!(value["results"].as_array().unwrap().len(), 1);
}
