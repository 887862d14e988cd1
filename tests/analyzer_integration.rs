//! Analyzer dialects and stage retry behaviour against a mock server.

use std::sync::Arc;
use std::time::Duration;

use mediarelay_core::enrich::{AnalyzerError, StageOutcome};
use mediarelay_core::{
    Analyzer, AnalyzerDialect, AnalyzerStage, EnrichInput, EnrichmentRules, HttpAnalyzer,
    RetryPolicy, Stage,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPLY: &str = r#"{"title": "Newton's Laws Revision", "description": "Recap of the three laws", "category": "Mechanics", "tags": ["physics", "revision"]}"#;

fn analyzer(server: &MockServer, dialect: AnalyzerDialect, key: Option<&str>) -> HttpAnalyzer {
    HttpAnalyzer::new(
        "test",
        dialect,
        server.uri(),
        "test-model",
        key.map(ToString::to_string),
        Duration::from_secs(5),
    )
    .expect("analyzer")
}

fn stage(analyzer: HttpAnalyzer, attempts: u32) -> AnalyzerStage {
    AnalyzerStage::new(
        Stage::Primary,
        Arc::new(analyzer),
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_secs(1), 2.0)
            .with_jitter(Duration::ZERO),
    )
}

fn input() -> EnrichInput<'static> {
    EnrichInput {
        locator: "chan/9",
        raw_text: Some("Physics: Newton revision class"),
    }
}

fn generate_content_body(text: &str) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{ "content": { "parts": [{ "text": text }] } }]
    })
}

#[tokio::test]
async fn test_generate_content_dialect_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/test-model:generateContent"))
        .and(header("x-goog-api-key", "k-primary"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_content_body(REPLY)))
        .expect(1)
        .mount(&server)
        .await;

    let reply = analyzer(&server, AnalyzerDialect::GenerateContent, Some("k-primary"))
        .analyze("prompt")
        .await
        .expect("reply");

    assert_eq!(reply, REPLY);
}

#[tokio::test]
async fn test_chat_completions_dialect_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer k-secondary"))
        .and(body_partial_json(serde_json::json!({ "model": "test-model" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": REPLY } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = analyzer(&server, AnalyzerDialect::ChatCompletions, Some("k-secondary"))
        .analyze("prompt")
        .await
        .expect("reply");

    assert_eq!(reply, REPLY);
}

#[tokio::test]
async fn test_fenced_reply_is_accepted() {
    let server = MockServer::start().await;
    let fenced = format!("```json\n{REPLY}\n```");
    Mock::given(method("POST"))
        .and(path("/models/test-model:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_content_body(&fenced)))
        .mount(&server)
        .await;

    let outcome = stage(
        analyzer(&server, AnalyzerDialect::GenerateContent, Some("k")),
        1,
    )
    .attempt(&input(), &EnrichmentRules::default())
    .await;

    match outcome {
        StageOutcome::Accepted(metadata) => {
            assert_eq!(metadata.title, "Newton's Laws Revision");
            assert_eq!(metadata.category, "Mechanics");
            assert_eq!(metadata.tags, ["physics", "revision"]);
        }
        other => panic!("expected accepted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limit_with_zero_retry_after_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/test-model:generateContent"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/test-model:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_content_body(REPLY)))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = stage(
        analyzer(&server, AnalyzerDialect::GenerateContent, Some("k")),
        2,
    )
    .attempt(&input(), &EnrichmentRules::default())
    .await;

    assert!(matches!(outcome, StageOutcome::Accepted(_)), "got {outcome:?}");
}

#[tokio::test]
async fn test_long_retry_after_abstains_without_waiting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3600"))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        stage(
            analyzer(&server, AnalyzerDialect::ChatCompletions, Some("k")),
            3,
        )
        .attempt(&input(), &EnrichmentRules::default()),
    )
    .await
    .expect("stage should not sleep for the advertised hour");

    assert!(matches!(outcome, StageOutcome::Abstain { .. }), "got {outcome:?}");
}

#[tokio::test]
async fn test_missing_key_abstains_without_calling_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let analyzer = analyzer(&server, AnalyzerDialect::GenerateContent, None);
    assert!(matches!(
        analyzer.analyze("prompt").await,
        Err(AnalyzerError::MissingCredentials { .. })
    ));

    let outcome = stage(analyzer, 3)
        .attempt(&input(), &EnrichmentRules::default())
        .await;
    assert!(matches!(outcome, StageOutcome::Abstain { .. }), "got {outcome:?}");
}

#[tokio::test]
async fn test_reply_without_title_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "{\"category\": \"Mechanics\"}" } }]
        })))
        .mount(&server)
        .await;

    let outcome = stage(
        analyzer(&server, AnalyzerDialect::ChatCompletions, Some("k")),
        1,
    )
    .attempt(&input(), &EnrichmentRules::default())
    .await;

    assert!(matches!(outcome, StageOutcome::Invalid { .. }), "got {outcome:?}");
}

#[tokio::test]
async fn test_server_error_exhausts_budget_then_abstains() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let outcome = stage(
        analyzer(&server, AnalyzerDialect::ChatCompletions, Some("k")),
        2,
    )
    .attempt(&input(), &EnrichmentRules::default())
    .await;

    assert!(matches!(outcome, StageOutcome::Abstain { .. }), "got {outcome:?}");
}
