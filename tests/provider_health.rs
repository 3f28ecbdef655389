//! Registry health probes against mock endpoints.

use std::sync::Arc;
use std::time::Duration;
use voicemode::config::{EndpointConfig, ProvidersConfig};
use voicemode::events::SystemClock;
use voicemode::providers::registry::ProviderRegistry;
use voicemode::providers::{HealthState, ProviderKind};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(id: &str, kind: &str, base_url: &str) -> EndpointConfig {
    EndpointConfig {
        id: id.to_owned(),
        kind: kind.to_owned(),
        base_url: base_url.to_owned(),
        priority: 10,
        ..EndpointConfig::default()
    }
}

fn registry(endpoints: Vec<EndpointConfig>) -> ProviderRegistry {
    let providers = ProvidersConfig {
        endpoints,
        ..ProvidersConfig::default()
    };
    ProviderRegistry::new(&providers, Arc::new(SystemClock))
}

#[tokio::test]
async fn refresh_marks_tts_endpoint_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tiny".to_vec()))
        .mount(&server)
        .await;

    let registry = registry(vec![endpoint("kokoro", "tts", &server.uri())]);
    let client = reqwest::Client::new();
    let results = registry
        .refresh(&client, Some("kokoro"), Duration::from_secs(2))
        .await;

    assert_eq!(results, vec![("kokoro".to_owned(), HealthState::Healthy)]);
    let snapshot = registry.list(ProviderKind::Tts);
    assert_eq!(snapshot[0].health.state, HealthState::Healthy);
    assert!(snapshot[0].health.last_latency_ms.is_some());
}

#[tokio::test]
async fn refresh_counts_wellformed_stt_rejection_as_alive() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({"error": "audio too short"})),
        )
        .mount(&server)
        .await;

    let registry = registry(vec![endpoint("whisper", "stt", &server.uri())]);
    let client = reqwest::Client::new();
    let results = registry
        .refresh(&client, None, Duration::from_secs(2))
        .await;

    assert_eq!(results, vec![("whisper".to_owned(), HealthState::Healthy)]);
}

#[tokio::test]
async fn refresh_degrades_unreachable_endpoint() {
    // Nothing listens on port 1.
    let registry = registry(vec![endpoint("ghost", "tts", "http://127.0.0.1:1")]);
    let client = reqwest::Client::new();
    let results = registry
        .refresh(&client, None, Duration::from_secs(2))
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, HealthState::Degraded);
}

#[tokio::test]
async fn down_endpoint_waits_out_the_cooldown() {
    let registry = registry(vec![endpoint("flaky", "tts", "http://127.0.0.1:1")]);
    for _ in 0..3 {
        registry.report_failure("flaky", "connect refused");
    }
    assert_eq!(
        registry.list(ProviderKind::Tts)[0].health.state,
        HealthState::Down
    );

    // Freshly failed: the 60s cooldown suppresses the probe entirely.
    let client = reqwest::Client::new();
    let results = registry
        .refresh(&client, Some("flaky"), Duration::from_secs(1))
        .await;
    assert!(results.is_empty());
}
