//! HTTP contract tests for the gateway surface, driven through axum-test
//! with wiremock provider doubles behind the manager.

use axum::http::StatusCode;
use axum_test::TestServer;
use dreamweave_gateway::config::Config;
use dreamweave_gateway::server::create_server;
use dreamweave_providers::providers::ProviderSettings;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dream_body() -> Value {
    let content = json!({
        "id": "d-1",
        "title": "Dragon Flight",
        "description": "A dragon soars over mist-wrapped mountain peaks.",
        "scenes": [
            {"id": "s-1", "description": "A dragon banks over the peaks.", "objects": ["dragon"]}
        ]
    });
    json!({
        "model": "gpt-4o-mini",
        "choices": [{"message": {"role": "assistant", "content": content.to_string()}}],
        "usage": {"prompt_tokens": 30, "completion_tokens": 80}
    })
}

async fn mock_provider() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(dream_body()))
        .mount(&server)
        .await;
    server
}

async fn test_server(config: Config) -> TestServer {
    let app = create_server(config).await.expect("server");
    TestServer::new(app).expect("test server")
}

fn config_with_provider(base: &str) -> Config {
    let mut config = Config::default();
    config.providers.insert(
        "primary".to_string(),
        ProviderSettings::new("openai", "test-key").with_base_url(base.to_string()),
    );
    config
}

fn config_with_disabled_provider() -> Config {
    let mut config = Config::default();
    let mut settings = ProviderSettings::new("openai", "test-key");
    settings.enabled = false;
    config.providers.insert("primary".to_string(), settings);
    config.selection.default_budget = Duration::from_secs(1);
    config
}

#[tokio::test]
async fn parse_dream_returns_validated_artifact() {
    let provider = mock_provider().await;
    let server = test_server(config_with_provider(&provider.uri())).await;

    let response = server
        .post("/api/parse-dream")
        .json(&json!({ "text": "a dragon over mountains", "style": "ethereal" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["source"], "primary");
    assert_eq!(body["data"]["content"]["title"], "Dragon Flight");
    assert_eq!(body["data"]["content"]["metadata"]["source"], "primary");
}

#[tokio::test]
async fn parse_dream_rejects_empty_text() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server
        .post("/api/parse-dream")
        .json(&json!({ "text": "   " }))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert!(body["error"]["kind"].is_string());
}

#[tokio::test]
async fn parse_dream_serves_fallback_with_200() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server
        .post("/api/parse-dream")
        .json(&json!({ "text": "a dragon over mountains" }))
        .await;

    // Fallback output is still a success; `source` is the discriminator.
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["source"], "emergency_fallback");
}

#[tokio::test]
async fn liveness_is_always_ok() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn detailed_health_reports_partial_content_before_observations() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server.get("/health/detailed").await;
    // Unknown health is neither all-healthy nor all-unhealthy.
    assert_eq!(response.status_code(), StatusCode::PARTIAL_CONTENT);
    let body: Value = response.json();
    assert_eq!(body["providers"][0]["circuit"], "closed");
}

#[tokio::test]
async fn unknown_provider_detail_is_404() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server.get("/health/provider/nope").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn known_provider_detail_reports_state() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server.get("/health/provider/primary").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "unknown");
    assert_eq!(body["consecutiveFailures"], 0);
}

#[tokio::test]
async fn dashboard_combines_providers_metrics_and_alerts() {
    let provider = mock_provider().await;
    let server = test_server(config_with_provider(&provider.uri())).await;

    server
        .post("/api/parse-dream")
        .json(&json!({ "text": "a dragon over mountains" }))
        .await;

    let response = server.get("/monitoring/dashboard").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert!(body["system"]["uptimeSeconds"].is_u64());
    assert!(body["providers"].as_array().is_some_and(|p| !p.is_empty()));
    assert!(body["alerts"].is_array());
}

#[tokio::test]
async fn performance_endpoint_parses_time_range() {
    let server = test_server(config_with_disabled_provider()).await;

    let response = server.get("/monitoring/performance?timeRange=1h").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["timeRangeSeconds"], 3600);

    let response = server.get("/monitoring/performance?timeRange=bogus").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn alerts_endpoint_validates_severity() {
    let server = test_server(config_with_disabled_provider()).await;

    let response = server.get("/monitoring/alerts?severity=critical").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server.get("/monitoring/alerts?severity=apocalyptic").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_patch_toggles_a_provider() {
    let provider = mock_provider().await;
    let server = test_server(config_with_provider(&provider.uri())).await;

    let response = server
        .patch("/admin/providers/primary")
        .json(&json!({ "enabled": false, "priority": 9 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["enabled"], false);
    assert_eq!(body["priority"], 9);

    // A disabled provider is skipped: generation now falls back.
    let response = server
        .post("/api/parse-dream")
        .json(&json!({ "text": "a dragon over mountains", "options": {"timeoutMs": 500} }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["data"]["source"], "emergency_fallback");
}

#[tokio::test]
async fn admin_config_redacts_credentials() {
    let server = test_server(config_with_disabled_provider()).await;
    let response = server.get("/admin/config").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["providers"]["primary"]["apiKey"], "redacted");
    assert!(!body.to_string().contains("test-key"));
}

#[tokio::test]
async fn health_check_probes_on_demand() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&provider)
        .await;

    let server = test_server(config_with_provider(&provider.uri())).await;
    let response = server
        .post("/health/check")
        .json(&json!({ "providers": ["primary"] }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["results"][0]["provider"], "primary");
    assert_eq!(body["results"][0]["ok"], true);
}
