//! Speech synthesis backends.
//!
//! A backend is fire-and-forget: [`SpeechBackend::start`] returns as soon as
//! work is scheduled and everything afterwards arrives as session-tagged
//! [`BackendEvent`]s on an unbounded channel. The dispatcher drops events
//! whose session is no longer current, so a backend never needs to know
//! whether it was superseded.
//!
//! Two variants exist:
//! - [`PacedLocalBackend`]: always available, emits word boundaries.
//! - [`RemoteVoiceBackend`]: higher-quality voice over HTTP, may fail.

mod local;
mod remote;

pub use crate::audio::{AudioSink, TimedSink, wav_duration};
pub use local::PacedLocalBackend;
pub use remote::RemoteVoiceBackend;

use crate::dispatch::language::is_cjk;
use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Identity of one backend attempt.
///
/// A fallback retry gets a fresh session, so late events from the failed
/// attempt are recognisably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw session number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw session number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Which backend variant produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Always-available local synthesis.
    Local,
    /// Remote voice-quality synthesis.
    Remote,
}

impl BackendKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Lifecycle signal from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSignal {
    /// Audio is loaded and playback is beginning (remote).
    Ready,
    /// Playback started (local).
    Started,
    /// Playback reached a character offset.
    Boundary {
        /// Character offset of the word start.
        offset: usize,
        /// Word length in characters.
        length: usize,
    },
    /// Playback completed naturally.
    Ended,
    /// Load, network or playback failure.
    Error(String),
}

/// A session-tagged backend signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub session: SessionId,
    pub backend: BackendKind,
    pub signal: BackendSignal,
}

impl BackendEvent {
    #[must_use]
    pub fn new(session: SessionId, backend: BackendKind, signal: BackendSignal) -> Self {
        Self {
            session,
            backend,
            signal,
        }
    }
}

/// Channel on which backends deliver events.
pub type EventSink = mpsc::UnboundedSender<BackendEvent>;

/// A speech synthesis and playback capability.
pub trait SpeechBackend: Send {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Begin speaking `text` under `session`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot even schedule the work; the
    /// caller treats this exactly like an asynchronous `Error` signal.
    fn start(&mut self, session: SessionId, text: &str, events: EventSink) -> Result<()>;

    /// Stop `session`. Safe to call at any point after `start`, including
    /// after the session already finished.
    fn cancel(&mut self, session: SessionId);
}

/// Word start offsets and lengths, in characters.
///
/// Whitespace separates words. CJK characters are written without spaces,
/// so each one counts as its own word.
#[must_use]
pub fn word_boundaries(text: &str) -> Vec<(usize, usize)> {
    let mut words = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (index, ch) in text.chars().enumerate() {
        if ch.is_whitespace() {
            words.extend(current.take());
        } else if is_cjk(ch) {
            words.extend(current.take());
            words.push((index, 1));
        } else if let Some((_, len)) = current.as_mut() {
            *len += 1;
        } else {
            current = Some((index, 1));
        }
    }
    words.extend(current);
    words
}

/// Deliver a signal; returns `false` when the receiver is gone.
pub(crate) fn emit(
    events: &EventSink,
    session: SessionId,
    backend: BackendKind,
    signal: BackendSignal,
) -> bool {
    events
        .send(BackendEvent::new(session, backend, signal))
        .is_ok()
}

/// Word starts placed proportionally to their character offset.
fn estimated_boundaries(text: &str, duration: Duration) -> Vec<(Duration, usize, usize)> {
    let total = text.chars().count().max(1) as f64;
    word_boundaries(text)
        .into_iter()
        .map(|(offset, length)| (duration.mul_f64(offset as f64 / total), offset, length))
        .collect()
}

/// Play synthesized audio while emitting estimated word boundaries.
///
/// Neither voice reports real word timing for rendered audio, so word
/// starts are spread over `duration`. Returns once playback ends.
pub(crate) async fn play_with_boundaries(
    sink: &dyn AudioSink,
    wav: Bytes,
    duration: Duration,
    text: &str,
    session: SessionId,
    backend: BackendKind,
    events: &EventSink,
) -> Result<()> {
    let boundaries = estimated_boundaries(text, duration);
    let pace = async {
        let mut elapsed = Duration::ZERO;
        for (at, offset, length) in boundaries {
            tokio::time::sleep(at.saturating_sub(elapsed)).await;
            elapsed = at;
            if !emit(
                events,
                session,
                backend,
                BackendSignal::Boundary { offset, length },
            ) {
                return;
            }
        }
    };
    let (played, ()) = tokio::join!(sink.play(wav, duration), pace);
    played
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn words_split_on_whitespace() {
        assert_eq!(word_boundaries("hi there"), vec![(0, 2), (3, 5)]);
        assert_eq!(word_boundaries("  a  bc "), vec![(2, 1), (5, 2)]);
        assert!(word_boundaries("   ").is_empty());
    }

    #[test]
    fn cjk_characters_are_individual_words() {
        assert_eq!(
            word_boundaries("こんにちは ok"),
            vec![(0, 1), (1, 1), (2, 1), (3, 1), (4, 1), (6, 2)]
        );
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        assert_eq!(word_boundaries("café au"), vec![(0, 4), (5, 2)]);
    }

    #[test]
    fn boundaries_spread_over_duration() {
        let bounds = estimated_boundaries("ab cd", Duration::from_secs(1));
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[0], (Duration::ZERO, 0, 2));
        let (at, offset, length) = bounds[1];
        assert_eq!((offset, length), (3, 2));
        assert!(at.abs_diff(Duration::from_millis(600)) < Duration::from_micros(1));
    }

    #[tokio::test(start_paused = true)]
    async fn playback_emits_boundaries_for_its_backend() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = SessionId::new(4);
        play_with_boundaries(
            &TimedSink,
            Bytes::new(),
            Duration::from_secs(1),
            "one two",
            session,
            BackendKind::Local,
            &tx,
        )
        .await
        .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            assert_eq!(event.session, session);
            assert_eq!(event.backend, BackendKind::Local);
            seen.push(event.signal);
        }
        assert_eq!(
            seen,
            vec![
                BackendSignal::Boundary {
                    offset: 0,
                    length: 3
                },
                BackendSignal::Boundary {
                    offset: 4,
                    length: 3
                },
            ]
        );
    }

    #[test]
    fn session_display() {
        assert_eq!(SessionId::new(7).to_string(), "session-7");
    }
}
