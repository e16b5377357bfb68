//! Remote voice backend against a mock synthesis API.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use kuchipaku::backend::{
    BackendEvent, BackendKind, BackendSignal, RemoteVoiceBackend, SessionId, SpeechBackend,
    TimedSink,
};
use kuchipaku::config::RemoteVoiceConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION: SessionId = SessionId::new(7);

fn wav_bytes(sample_rate: u32, samples: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..samples {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn backend(server: &MockServer) -> RemoteVoiceBackend {
    let config = RemoteVoiceConfig {
        base_url: server.uri(),
        speaker: 3,
        api_key: None,
        poll_interval_ms: 10,
        max_polls: 3,
        request_timeout_secs: 5,
    };
    RemoteVoiceBackend::new(config, Arc::new(TimedSink)).unwrap()
}

async fn mount_synthesis(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v3/voicevox/synthesis"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "audioStatusUrl": format!("{}/status", server.uri()),
            "wavDownloadUrl": format!("{}/audio.wav", server.uri()),
        })))
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer, ready: bool, error: bool) {
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "isAudioReady": ready,
            "isAudioError": error,
        })))
        .mount(server)
        .await;
}

async fn mount_audio(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/audio.wav"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/wav")
                .set_body_bytes(wav_bytes(24_000, 2_400)),
        )
        .mount(server)
        .await;
}

/// Start one session and collect every signal until the task finishes.
async fn run(backend: &mut RemoteVoiceBackend, text: &str) -> Vec<BackendSignal> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend.start(SESSION, text, tx).unwrap();
    collect(&mut rx).await
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<BackendEvent>) -> Vec<BackendSignal> {
    let mut signals = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            assert_eq!(event.session, SESSION);
            assert_eq!(event.backend, BackendKind::Remote);
            signals.push(event.signal);
        }
    })
    .await
    .expect("remote session did not finish");
    signals
}

fn only_error(signals: &[BackendSignal]) -> &str {
    match signals {
        [BackendSignal::Error(message)] => message,
        other => panic!("expected a single error, got {other:?}"),
    }
}

#[tokio::test]
async fn successful_synthesis_plays_with_estimated_boundaries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/voicevox/synthesis"))
        .and(query_param("speaker", "3"))
        .and(query_param("text", "おは よう"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "audioStatusUrl": format!("{}/status", server.uri()),
            "wavDownloadUrl": format!("{}/audio.wav", server.uri()),
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_status(&server, true, false).await;
    mount_audio(&server).await;

    let signals = run(&mut backend(&server), "おは よう").await;

    assert_eq!(signals.first(), Some(&BackendSignal::Ready));
    assert_eq!(signals.last(), Some(&BackendSignal::Ended));
    let offsets: Vec<usize> = signals
        .iter()
        .filter_map(|s| match s {
            BackendSignal::Boundary { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![0, 1, 3, 4]);
}

#[tokio::test]
async fn rejected_synthesis_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/voicevox/synthesis"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "errorMessage": "quota exceeded",
        })))
        .mount(&server)
        .await;

    let signals = run(&mut backend(&server), "こんにちは").await;
    assert!(only_error(&signals).contains("quota exceeded"));
}

#[tokio::test]
async fn audio_generation_failure_is_an_error() {
    let server = MockServer::start().await;
    mount_synthesis(&server).await;
    mount_status(&server, false, true).await;

    let signals = run(&mut backend(&server), "こんにちは").await;
    assert!(only_error(&signals).contains("generation failed"));
}

#[tokio::test]
async fn http_failure_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/voicevox/synthesis"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let signals = run(&mut backend(&server), "こんにちは").await;
    assert!(only_error(&signals).contains("failed"));
}

#[tokio::test]
async fn audio_that_never_becomes_ready_gives_up() {
    let server = MockServer::start().await;
    mount_synthesis(&server).await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "isAudioReady": false,
        })))
        .expect(3)
        .mount(&server)
        .await;

    let signals = run(&mut backend(&server), "こんにちは").await;
    assert!(only_error(&signals).contains("not ready after 3 polls"));
}

#[tokio::test]
async fn undecodable_audio_is_an_error() {
    let server = MockServer::start().await;
    mount_synthesis(&server).await;
    mount_status(&server, true, false).await;
    Mock::given(method("GET"))
        .and(path("/audio.wav"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a wav".to_vec()))
        .mount(&server)
        .await;

    let signals = run(&mut backend(&server), "こんにちは").await;
    assert!(only_error(&signals).contains("invalid WAV"));
}

#[tokio::test]
async fn cancelled_session_emits_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/voicevox/synthesis"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(300))
                .set_body_json(json!({
                    "success": true,
                    "audioStatusUrl": format!("{}/status", server.uri()),
                    "wavDownloadUrl": format!("{}/audio.wav", server.uri()),
                })),
        )
        .mount(&server)
        .await;
    mount_status(&server, true, false).await;
    mount_audio(&server).await;

    let mut remote = backend(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    remote.start(SESSION, "こんにちは", tx).unwrap();
    remote.cancel(SESSION);

    assert!(collect(&mut rx).await.is_empty());
    // Cancelling twice, or an unknown session, is harmless.
    remote.cancel(SESSION);
    remote.cancel(SessionId::new(99));
}
