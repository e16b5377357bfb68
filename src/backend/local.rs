//! Always-available local speech backend.
//!
//! With a synthesizer program (`espeak-ng` by default) the text is rendered
//! to a WAV file, played through the [`AudioSink`], and word boundaries are
//! spread over the audio like the remote voice does. Without one the
//! backend stays silent and paces a boundary at every word start at the
//! configured speaking rate; the host then voices the captions itself.

use super::{
    AudioSink, BackendKind, BackendSignal, EventSink, SessionId, SpeechBackend, emit,
    play_with_boundaries, word_boundaries,
};
use crate::audio::wav_duration;
use crate::config::LocalVoiceConfig;
use crate::error::{Result, SyncError};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

/// External synthesizer plus the sink its audio goes to.
#[derive(Clone)]
struct Synthesizer {
    program: PathBuf,
    words_per_minute: u32,
    voice: Option<String>,
    sink: Arc<dyn AudioSink>,
}

impl std::fmt::Debug for Synthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synthesizer")
            .field("program", &self.program)
            .field("words_per_minute", &self.words_per_minute)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

/// Local backend: voiced when a synthesizer is available, paced otherwise.
#[derive(Debug)]
pub struct PacedLocalBackend {
    word_interval: Duration,
    synthesizer: Option<Synthesizer>,
    sessions: HashMap<SessionId, (CancellationToken, JoinHandle<()>)>,
}

impl PacedLocalBackend {
    /// Create a silent backend that only paces boundaries.
    #[must_use]
    pub fn new(config: &LocalVoiceConfig) -> Self {
        Self::with_word_interval(word_interval(config.words_per_minute))
    }

    /// Create a backend that speaks through the configured synthesizer.
    ///
    /// Falls back to silent pacing when the synthesizer is empty or cannot
    /// be found.
    #[must_use]
    pub fn with_audio(config: &LocalVoiceConfig, sink: Arc<dyn AudioSink>) -> Self {
        let mut backend = Self::new(config);
        match resolve_program(&config.synthesizer) {
            Some(program) => {
                info!(program = %program.display(), "local speech synthesizer found");
                backend.synthesizer = Some(Synthesizer {
                    program,
                    words_per_minute: config.words_per_minute.round().clamp(80.0, 450.0) as u32,
                    voice: config.voice.clone().filter(|v| !v.trim().is_empty()),
                    sink,
                });
            }
            None if config.synthesizer.trim().is_empty() => {
                info!("no local synthesizer configured; local speech is paced only");
            }
            None => {
                warn!(
                    synthesizer = %config.synthesizer,
                    "local speech synthesizer not found; local speech is paced only"
                );
            }
        }
        backend
    }

    /// Create a silent backend with an explicit per-word delay.
    #[must_use]
    pub fn with_word_interval(word_interval: Duration) -> Self {
        Self {
            word_interval,
            synthesizer: None,
            sessions: HashMap::new(),
        }
    }

    /// Delay between word boundaries when paced.
    #[must_use]
    pub fn word_interval(&self) -> Duration {
        self.word_interval
    }

    /// Whether speech produces audio.
    #[must_use]
    pub fn is_voiced(&self) -> bool {
        self.synthesizer.is_some()
    }
}

/// Seconds per word at the given rate, floored at 30 wpm.
fn word_interval(words_per_minute: f32) -> Duration {
    Duration::from_secs_f32(60.0 / words_per_minute.max(30.0))
}

/// A path is used as given; a bare name is searched on `PATH`.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

impl SpeechBackend for PacedLocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn start(&mut self, session: SessionId, text: &str, events: EventSink) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::BackendUnavailable(format!("no async runtime: {e}")))?;

        self.sessions.retain(|_, (_, handle)| !handle.is_finished());

        let token = CancellationToken::new();
        let handle = match self.synthesizer.clone() {
            Some(synthesizer) => {
                info!(%session, "local speech starting");
                runtime.spawn(voiced(
                    synthesizer,
                    session,
                    text.to_owned(),
                    events,
                    token.clone(),
                ))
            }
            None => {
                let words = word_boundaries(text);
                info!(%session, words = words.len(), "local speech starting (paced)");
                runtime.spawn(paced(
                    self.word_interval,
                    words,
                    session,
                    events,
                    token.clone(),
                ))
            }
        };

        self.sessions.insert(session, (token, handle));
        Ok(())
    }

    fn cancel(&mut self, session: SessionId) {
        if let Some((token, _handle)) = self.sessions.remove(&session) {
            debug!(%session, "cancelling local speech");
            token.cancel();
        }
    }
}

async fn paced(
    interval: Duration,
    words: Vec<(usize, usize)>,
    session: SessionId,
    events: EventSink,
    token: CancellationToken,
) {
    let kind = BackendKind::Local;
    if token.is_cancelled() || !emit(&events, session, kind, BackendSignal::Started) {
        return;
    }
    for (offset, length) in words {
        if token.is_cancelled()
            || !emit(&events, session, kind, BackendSignal::Boundary { offset, length })
        {
            return;
        }
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
    if !token.is_cancelled() {
        emit(&events, session, kind, BackendSignal::Ended);
    }
}

async fn voiced(
    synthesizer: Synthesizer,
    session: SessionId,
    text: String,
    events: EventSink,
    token: CancellationToken,
) {
    let outcome = tokio::select! {
        () = token.cancelled() => return,
        outcome = synthesizer.speak(session, &text, &events) => outcome,
    };
    if token.is_cancelled() {
        return;
    }
    let signal = match outcome {
        Ok(()) => BackendSignal::Ended,
        Err(e) => {
            warn!(%session, error = %e, "local speech failed");
            BackendSignal::Error(e.to_string())
        }
    };
    emit(&events, session, BackendKind::Local, signal);
}

/// Temporary WAV path, removed on drop.
struct TempWav(PathBuf);

impl TempWav {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("kuchipaku-{}.wav", uuid::Uuid::new_v4())))
    }
}

impl Drop for TempWav {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

impl Synthesizer {
    async fn speak(&self, session: SessionId, text: &str, events: &EventSink) -> Result<()> {
        let wav = self.synthesize(text).await?;
        let duration = wav_duration(&wav)?;
        debug!(%session, ?duration, bytes = wav.len(), "local audio synthesized");

        if !emit(events, session, BackendKind::Local, BackendSignal::Started) {
            return Ok(());
        }
        play_with_boundaries(
            self.sink.as_ref(),
            wav,
            duration,
            text,
            session,
            BackendKind::Local,
            events,
        )
        .await
    }

    /// Run `<program> -s <wpm> [-v <voice>] -w <out.wav> --stdin`.
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let out = TempWav::new();
        let program = self.program.display();

        let mut command = tokio::process::Command::new(&self.program);
        command.arg("-s").arg(self.words_per_minute.to_string());
        if let Some(voice) = self.voice.as_deref() {
            command.arg("-v").arg(voice);
        }
        command
            .arg("-w")
            .arg(&out.0)
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SyncError::BackendUnavailable(format!("cannot run {program}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(text.as_bytes()).await
        {
            debug!(error = %e, "synthesizer closed stdin early");
        }

        let output = tokio::time::timeout(SYNTHESIS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| SyncError::BackendUnavailable(format!("{program} timed out")))?
            .map_err(|e| SyncError::BackendUnavailable(format!("{program} failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::BackendUnavailable(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let wav = tokio::fs::read(&out.0).await.map_err(|e| {
            SyncError::BackendUnavailable(format!("{program} produced no audio: {e}"))
        })?;
        Ok(Bytes::from(wav))
    }
}
