//! Events describing what the avatar is doing "right now".
//!
//! Published on a `tokio::sync::broadcast` channel. Subscribers that lag
//! lose old events rather than slowing the frame step.

use crate::backend::BackendKind;
use crate::dispatch::UtteranceId;
use serde::Serialize;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable avatar state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AvatarEvent {
    /// Speech became audible.
    SpeakStart {
        utterance: UtteranceId,
        backend: BackendKind,
    },
    /// Speech is over for this utterance.
    SpeakEnd {
        utterance: UtteranceId,
        /// `completed`, `cancelled` or `failed`.
        reason: String,
    },
    /// The remote voice failed and local speech took over.
    Fallback {
        utterance: UtteranceId,
        reason: String,
    },
    /// The local backend failed; the utterance could not be spoken.
    Error {
        utterance: UtteranceId,
        message: String,
    },
    /// The driven mouth shape changed.
    VisemeChanged { viseme: Option<String> },
    /// The showing emotion changed.
    EmotionChanged { emotion: String },
    /// Text spoken so far.
    Caption {
        utterance: UtteranceId,
        text: String,
    },
}

impl AvatarEvent {
    /// Host protocol event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SpeakStart { .. } => "speech.start",
            Self::SpeakEnd { .. } => "speech.end",
            Self::Fallback { .. } => "speech.fallback",
            Self::Error { .. } => "speech.error",
            Self::VisemeChanged { .. } => "viseme.changed",
            Self::EmotionChanged { .. } => "emotion.changed",
            Self::Caption { .. } => "caption",
        }
    }
}
