//! End-to-end converse scenarios against mock providers and transports.
//!
//! The HTTP side is wiremock speaking the OpenAI-compatible shapes; the
//! audio side is a scripted transport. Event sequences are asserted
//! against the in-memory sink.

mod util;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use util::{HomeGuard, MemorySink, MockTransport, reply_script};
use voicemode::audio::codec::{self, AudioBuffer, AudioFormat};
use voicemode::config::{EndpointConfig, ProvidersConfig, VoiceConfig};
use voicemode::converse::ConverseRequest;
use voicemode::converse::engine::ConversationEngine;
use voicemode::events::{EventType, SystemClock};
use voicemode::pronounce::PronounceManager;
use voicemode::providers::ProviderKind;
use voicemode::providers::registry::ProviderRegistry;
use voicemode::transport::TransportKind;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// One second of 440 Hz tone as a wav body for TTS mocks.
fn tts_wav() -> Vec<u8> {
    let rate = AudioBuffer::CANONICAL_RATE;
    let samples: Vec<i16> = (0..rate)
        .map(|i| {
            let t = i as f32 / rate as f32;
            ((0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) * i16::MAX as f32) as i16
        })
        .collect();
    codec::encode(&AudioBuffer::canonical(samples), AudioFormat::Wav).expect("encode wav")
}

fn endpoint(id: &str, kind: &str, base_url: &str, priority: i32) -> EndpointConfig {
    EndpointConfig {
        id: id.to_owned(),
        kind: kind.to_owned(),
        base_url: base_url.to_owned(),
        priority,
        ..EndpointConfig::default()
    }
}

/// Build an engine over wav-format providers, a scripted transport, and a
/// memory sink.
fn build_engine(
    sink: Arc<MemorySink>,
    transport: Arc<MockTransport>,
    endpoints: Vec<EndpointConfig>,
) -> (Arc<ConversationEngine>, Arc<ProviderRegistry>) {
    let mut config = VoiceConfig::default();
    config.tts.format = "wav".to_owned();
    config.stt.upload_format = "wav".to_owned();

    let providers = ProvidersConfig {
        endpoints,
        ..ProvidersConfig::default()
    };
    let registry = Arc::new(ProviderRegistry::new(&providers, Arc::new(SystemClock)));
    let pronounce = Arc::new(std::sync::RwLock::new(PronounceManager::load(
        &config.pronunciation,
    )));
    let engine = Arc::new(ConversationEngine::new(
        config,
        Arc::clone(&registry),
        sink,
        pronounce,
        transport,
        None,
        Arc::new(AtomicBool::new(false)),
    ));
    (engine, registry)
}

async fn mock_tts(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tts_wav()))
        .mount(server)
        .await;
}

async fn mock_stt(server: &MockServer, reply: &str) {
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": reply})))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_local_transport() {
    let _home = HomeGuard::new();
    let server = MockServer::start().await;
    mock_tts(&server).await;
    mock_stt(&server, "Goodbye.").await;

    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(reply_script()));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![
            endpoint("tts-main", "tts", &server.uri(), 10),
            endpoint("stt-main", "stt", &server.uri(), 10),
        ],
    );

    let response = engine
        .converse(ConverseRequest {
            message: "Hello, world.".to_owned(),
            wait_for_response: true,
            listen_duration_s: 5.0,
            transport: TransportKind::Local,
            ..ConverseRequest::default()
        })
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.transcript, "Goodbye.");
    assert_eq!(response.provider_used.tts.as_deref(), Some("tts-main"));
    assert_eq!(response.provider_used.stt.as_deref(), Some("stt-main"));
    assert!(response.timing.ttfa.is_some());
    assert!(response.timing.record.unwrap_or(0.0) > 0.0);
    assert!(response.timing.stt.is_some());

    assert_eq!(
        sink.types(),
        vec![
            EventType::ToolRequestStart,
            EventType::TtsStart,
            EventType::TtsFirstAudio,
            EventType::TtsPlaybackStart,
            EventType::TtsPlaybackEnd,
            EventType::RecordingStart,
            EventType::RecordingEnd,
            EventType::SttStart,
            EventType::SttComplete,
            EventType::ToolRequestEnd,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn speak_only_skips_recording() {
    let _home = HomeGuard::new();
    let server = MockServer::start().await;
    mock_tts(&server).await;

    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![endpoint("tts-main", "tts", &server.uri(), 10)],
    );

    let response = engine
        .converse(ConverseRequest {
            message: "Announcing build complete.".to_owned(),
            wait_for_response: false,
            ..ConverseRequest::default()
        })
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.transcript, "");
    assert!(!sink.contains(EventType::RecordingStart));
    assert!(!sink.contains(EventType::SttStart));
    assert!(sink.contains(EventType::TtsPlaybackEnd));
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_user_is_no_speech_detected() {
    let _home = HomeGuard::new();
    let server = MockServer::start().await;
    mock_tts(&server).await;
    mock_stt(&server, "never used").await;

    let sink = Arc::new(MemorySink::new());
    // Script is empty: the transport emits pure silence until cancelled.
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![
            endpoint("tts-main", "tts", &server.uri(), 10),
            endpoint("stt-main", "stt", &server.uri(), 10),
        ],
    );

    let response = engine
        .converse(ConverseRequest {
            message: "Hello, world.".to_owned(),
            wait_for_response: true,
            listen_duration_s: 5.0,
            transport: TransportKind::Local,
            ..ConverseRequest::default()
        })
        .await;

    assert!(!response.success);
    assert_eq!(
        response.error.as_ref().map(|e| e.kind.as_str()),
        Some("no_speech_detected")
    );
    assert!(sink.contains(EventType::RecordingStart));
    assert!(sink.contains(EventType::RecordingEnd));
    assert!(!sink.contains(EventType::SttStart));
}

#[tokio::test(flavor = "multi_thread")]
async fn tts_failover_uses_second_candidate() {
    let _home = HomeGuard::new();
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&primary)
        .await;
    let secondary = MockServer::start().await;
    mock_tts(&secondary).await;
    mock_stt(&secondary, "Goodbye.").await;

    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(reply_script()));
    let (engine, registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![
            endpoint("tts-primary", "tts", &primary.uri(), 10),
            endpoint("tts-secondary", "tts", &secondary.uri(), 20),
            endpoint("stt-main", "stt", &secondary.uri(), 10),
        ],
    );

    let response = engine
        .converse(ConverseRequest {
            message: "Hello, world.".to_owned(),
            ..ConverseRequest::default()
        })
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.provider_used.tts.as_deref(), Some("tts-secondary"));

    let snapshot = registry.list(ProviderKind::Tts);
    let primary_state = snapshot
        .iter()
        .find(|s| s.endpoint.id == "tts-primary")
        .map(|s| s.health.state);
    assert_eq!(
        primary_state,
        Some(voicemode::providers::HealthState::Degraded)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn all_providers_failing_is_provider_exhausted() {
    let _home = HomeGuard::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![endpoint("tts-only", "tts", &server.uri(), 10)],
    );

    let response = engine
        .converse(ConverseRequest {
            message: "Hello.".to_owned(),
            wait_for_response: false,
            ..ConverseRequest::default()
        })
        .await;

    assert!(!response.success);
    assert_eq!(
        response.error.as_ref().map(|e| e.kind.as_str()),
        Some("provider_exhausted")
    );
    assert!(sink.contains(EventType::Error));
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_mismatch_is_no_matching_provider() {
    let _home = HomeGuard::new();
    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(Vec::new()));

    let mut restricted = endpoint("tts-kokoro", "tts", "http://127.0.0.1:1", 10);
    restricted.voices = vec!["af_sky".to_owned()];
    let (engine, _registry) = build_engine(Arc::clone(&sink), transport, vec![restricted]);

    let response = engine
        .converse(ConverseRequest {
            message: "Hello.".to_owned(),
            wait_for_response: false,
            voice: Some("nova".to_owned()),
            ..ConverseRequest::default()
        })
        .await;

    assert!(!response.success);
    assert_eq!(
        response.error.as_ref().map(|e| e.kind.as_str()),
        Some("no_matching_provider")
    );
    // No endpoint was attempted, so no TTS events at all.
    assert!(!sink.contains(EventType::TtsStart));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_mid_playback() {
    let _home = HomeGuard::new();
    let server = MockServer::start().await;
    mock_tts(&server).await;
    mock_stt(&server, "never used").await;

    let sink = Arc::new(MemorySink::new());
    let transport =
        Arc::new(MockTransport::new(Vec::new()).with_play_delay(Duration::from_millis(500)));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![
            endpoint("tts-main", "tts", &server.uri(), 10),
            endpoint("stt-main", "stt", &server.uri(), 10),
        ],
    );

    let engine_for_task = Arc::clone(&engine);
    let task = tokio::spawn(async move {
        engine_for_task
            .converse(ConverseRequest {
                message: "Hello, world.".to_owned(),
                wait_for_response: true,
                listen_duration_s: 5.0,
                ..ConverseRequest::default()
            })
            .await
    });

    // Wait for playback to begin, then cancel the active session.
    let mut cancelled = false;
    for _ in 0..100 {
        if sink.contains(EventType::TtsPlaybackStart) {
            let active = engine.status().active_sessions;
            if let Some(id) = active.first() {
                assert!(engine.cancel(id));
                cancelled = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cancelled, "never saw playback start");

    let response = task.await.expect("task");
    assert!(!response.success);
    assert_eq!(
        response.error.as_ref().map(|e| e.kind.as_str()),
        Some("cancelled")
    );
    assert!(sink.contains(EventType::Cancel));
    assert!(!sink.contains(EventType::SttStart));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_converse_from_same_caller_is_busy() {
    let _home = HomeGuard::new();
    let server = MockServer::start().await;
    mock_tts(&server).await;

    let sink = Arc::new(MemorySink::new());
    let transport =
        Arc::new(MockTransport::new(Vec::new()).with_play_delay(Duration::from_millis(500)));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![endpoint("tts-main", "tts", &server.uri(), 10)],
    );

    let engine_for_task = Arc::clone(&engine);
    let first = tokio::spawn(async move {
        engine_for_task
            .converse(ConverseRequest {
                message: "Hello, world.".to_owned(),
                wait_for_response: false,
                ..ConverseRequest::default()
            })
            .await
    });

    // Wait until the first session is active.
    for _ in 0..100 {
        if !engine.status().active_sessions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let second = engine
        .converse(ConverseRequest {
            message: "Me too.".to_owned(),
            wait_for_response: false,
            ..ConverseRequest::default()
        })
        .await;
    assert!(!second.success);
    assert_eq!(
        second.error.as_ref().map(|e| e.kind.as_str()),
        Some("busy")
    );

    let first = first.await.expect("task");
    assert!(first.success, "error: {:?}", first.error);
}

#[tokio::test(flavor = "multi_thread")]
async fn pronunciation_rewrites_tts_input() {
    let _home = HomeGuard::new();

    // User rule layer: expand "3M" before synthesis.
    let rules = voicemode::voice_dirs::pronunciation_file();
    std::fs::create_dir_all(rules.parent().unwrap()).unwrap();
    std::fs::write(
        &rules,
        "version: 1\ntts_rules:\n  - {name: threem, pattern: '\\b3M\\b', replacement: three em, order: 10}\n",
    )
    .unwrap();

    let server = MockServer::start().await;
    // Only the substituted input matches a successful synthesis.
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .and(body_partial_json(
            serde_json::json!({"input": "Working at three em today."}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tts_wav()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(500).set_body_string("unsubstituted input"))
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![endpoint("tts-main", "tts", &server.uri(), 10)],
    );

    let response = engine
        .converse(ConverseRequest {
            message: "Working at 3M today.".to_owned(),
            wait_for_response: false,
            ..ConverseRequest::default()
        })
        .await;
    assert!(response.success, "error: {:?}", response.error);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_message_with_no_wait_touches_nothing() {
    let _home = HomeGuard::new();
    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let (engine, _registry) = build_engine(
        Arc::clone(&sink),
        transport,
        vec![endpoint("tts-main", "tts", "http://127.0.0.1:1", 10)],
    );

    let response = engine
        .converse(ConverseRequest {
            message: String::new(),
            wait_for_response: false,
            ..ConverseRequest::default()
        })
        .await;

    assert!(response.success);
    assert_eq!(response.transcript, "");
    assert!(response.timing.ttfa.is_none());
    assert!(response.timing.record.is_none());
    assert_eq!(
        sink.types(),
        vec![EventType::ToolRequestStart, EventType::ToolRequestEnd]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_listen_duration_is_rejected_without_events() {
    let _home = HomeGuard::new();
    let sink = Arc::new(MemorySink::new());
    let transport = Arc::new(MockTransport::new(Vec::new()));
    let (engine, _registry) = build_engine(Arc::clone(&sink), transport, vec![]);

    let response = engine
        .converse(ConverseRequest {
            listen_duration_s: -2.0,
            ..ConverseRequest::default()
        })
        .await;

    assert!(!response.success);
    assert_eq!(
        response.error.as_ref().map(|e| e.kind.as_str()),
        Some("invalid_request")
    );
    assert!(sink.types().is_empty());
}
