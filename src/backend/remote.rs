//! Remote voice synthesis over HTTP.
//!
//! Talks to a TTS Quest style VOICEVOX endpoint:
//!
//! 1. `GET {base}/v3/voicevox/synthesis?text=..&speaker=..` returns URLs for
//!    an audio status document and the WAV download.
//! 2. The status document is polled until `isAudioReady`.
//! 3. The WAV is downloaded, measured and handed to an [`AudioSink`].
//!
//! The remote voice reports no word boundaries, so boundaries are estimated
//! by spreading word starts proportionally over the audio duration.
//! Every failure becomes an `Error` signal, which the dispatcher answers
//! with a local fallback.

use super::{
    AudioSink, BackendKind, BackendSignal, EventSink, SessionId, SpeechBackend, emit,
    play_with_boundaries,
};
use crate::audio::wav_duration;
use crate::config::RemoteVoiceConfig;
use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisResponse {
    success: bool,
    #[serde(default)]
    audio_status_url: Option<String>,
    #[serde(default)]
    wav_download_url: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioStatus {
    #[serde(default)]
    is_audio_ready: bool,
    #[serde(default)]
    is_audio_error: bool,
}

/// Remote voice backend.
pub struct RemoteVoiceBackend {
    client: reqwest::Client,
    config: Arc<RemoteVoiceConfig>,
    sink: Arc<dyn AudioSink>,
    sessions: HashMap<SessionId, (CancellationToken, JoinHandle<()>)>,
}

impl std::fmt::Debug for RemoteVoiceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteVoiceBackend")
            .field("base_url", &self.config.base_url)
            .field("speaker", &self.config.speaker)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl RemoteVoiceBackend {
    /// Create a backend.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the HTTP client cannot be built or
    /// the base URL is invalid.
    pub fn new(config: RemoteVoiceConfig, sink: Arc<dyn AudioSink>) -> Result<Self> {
        synthesis_url(&config, "")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: Arc::new(config),
            sink,
            sessions: HashMap::new(),
        })
    }
}

impl SpeechBackend for RemoteVoiceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn start(&mut self, session: SessionId, text: &str, events: EventSink) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::BackendTransient(format!("no async runtime: {e}")))?;

        self.sessions.retain(|_, (_, handle)| !handle.is_finished());

        let token = CancellationToken::new();
        let task_token = token.clone();
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let sink = Arc::clone(&self.sink);
        let text = text.to_owned();
        info!(%session, speaker = config.speaker, "remote speech starting");

        let handle = runtime.spawn(async move {
            let outcome = tokio::select! {
                () = task_token.cancelled() => return,
                outcome = speak(&client, &config, sink.as_ref(), session, &text, &events) => outcome,
            };
            if task_token.is_cancelled() {
                return;
            }
            let signal = match outcome {
                Ok(()) => BackendSignal::Ended,
                Err(e) => {
                    warn!(%session, error = %e, "remote speech failed");
                    BackendSignal::Error(e.to_string())
                }
            };
            emit(&events, session, BackendKind::Remote, signal);
        });

        self.sessions.insert(session, (token, handle));
        Ok(())
    }

    fn cancel(&mut self, session: SessionId) {
        if let Some((token, _handle)) = self.sessions.remove(&session) {
            debug!(%session, "cancelling remote speech");
            token.cancel();
        }
    }
}

async fn speak(
    client: &reqwest::Client,
    config: &RemoteVoiceConfig,
    sink: &dyn AudioSink,
    session: SessionId,
    text: &str,
    events: &EventSink,
) -> Result<()> {
    let url = synthesis_url(config, text)?;
    let synthesis: SynthesisResponse = get_json(client, url.as_str()).await?;
    if !synthesis.success {
        return Err(SyncError::BackendTransient(format!(
            "synthesis rejected: {}",
            synthesis
                .error_message
                .as_deref()
                .unwrap_or("no reason given")
        )));
    }
    let status_url = synthesis
        .audio_status_url
        .ok_or_else(|| SyncError::BackendTransient("missing audioStatusUrl".into()))?;
    let wav_url = synthesis
        .wav_download_url
        .ok_or_else(|| SyncError::BackendTransient("missing wavDownloadUrl".into()))?;

    wait_until_ready(client, config, &status_url).await?;

    let wav = client
        .get(&wav_url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| SyncError::BackendTransient(format!("audio download failed: {e}")))?
        .bytes()
        .await
        .map_err(|e| SyncError::BackendTransient(format!("audio download failed: {e}")))?;
    let duration = wav_duration(&wav)?;
    debug!(%session, ?duration, bytes = wav.len(), "remote audio loaded");

    if !emit(events, session, BackendKind::Remote, BackendSignal::Ready) {
        return Ok(());
    }

    play_with_boundaries(sink, wav, duration, text, session, BackendKind::Remote, events).await
}

async fn wait_until_ready(
    client: &reqwest::Client,
    config: &RemoteVoiceConfig,
    status_url: &str,
) -> Result<()> {
    let interval = Duration::from_millis(config.poll_interval_ms);
    for attempt in 0..config.max_polls.max(1) {
        let status: AudioStatus = get_json(client, status_url).await?;
        if status.is_audio_error {
            return Err(SyncError::BackendTransient(
                "remote audio generation failed".into(),
            ));
        }
        if status.is_audio_ready {
            return Ok(());
        }
        debug!(attempt, "remote audio not ready yet");
        tokio::time::sleep(interval).await;
    }
    Err(SyncError::BackendTransient(format!(
        "audio not ready after {} polls",
        config.max_polls.max(1)
    )))
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T> {
    client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| SyncError::BackendTransient(format!("request to {url} failed: {e}")))?
        .json::<T>()
        .await
        .map_err(|e| SyncError::BackendTransient(format!("invalid response from {url}: {e}")))
}

fn synthesis_url(config: &RemoteVoiceConfig, text: &str) -> Result<url::Url> {
    let base = url::Url::parse(&config.base_url)
        .map_err(|e| SyncError::Config(format!("invalid remote base_url: {e}")))?;
    let mut url = base
        .join("v3/voicevox/synthesis")
        .map_err(|e| SyncError::Config(format!("invalid remote base_url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("text", text);
        query.append_pair("speaker", &config.speaker.to_string());
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            query.append_pair("key", key);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::TimedSink;

    #[test]
    fn synthesis_url_encodes_text_and_key() {
        let config = RemoteVoiceConfig {
            base_url: "https://api.example.test".to_owned(),
            api_key: Some("k1".to_owned()),
            ..RemoteVoiceConfig::default()
        };
        let url = synthesis_url(&config, "こんにちは 世界").unwrap();
        assert_eq!(url.path(), "/v3/voicevox/synthesis");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["text"], "こんにちは 世界");
        assert_eq!(pairs["speaker"], "20");
        assert_eq!(pairs["key"], "k1");
    }

    #[test]
    fn empty_api_key_is_omitted() {
        let config = RemoteVoiceConfig {
            api_key: Some(String::new()),
            ..RemoteVoiceConfig::default()
        };
        let url = synthesis_url(&config, "hi").unwrap();
        assert!(!url.query_pairs().any(|(k, _)| k == "key"));
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = RemoteVoiceConfig {
            base_url: "not a url".to_owned(),
            ..RemoteVoiceConfig::default()
        };
        let err = RemoteVoiceBackend::new(config, Arc::new(TimedSink)).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
