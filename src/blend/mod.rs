//! Expression blending for the mouth and emotion channels.
//!
//! Each channel is a mutually exclusive group of shape intensities: after
//! any update at most one label in a channel is non-zero. The mouth channel
//! is recomputed from scratch every frame. The emotion channel is latched
//! and only changes on an explicit [`BlendEngine::set_emotion`].

use crate::config::BlendConfig;
use crate::model::ShapeSet;
use crate::timing::PlaybackState;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// A mutually exclusive group of shape intensities.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExpressionChannel {
    values: BTreeMap<String, f32>,
}

impl ExpressionChannel {
    /// Create a channel over `labels`, all at zero.
    pub fn new<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            values: labels.into_iter().map(|l| (l.to_owned(), 0.0)).collect(),
        }
    }

    /// Whether `label` belongs to this channel.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.values.contains_key(label)
    }

    /// Intensity of `label` (zero for unknown labels).
    #[must_use]
    pub fn value(&self, label: &str) -> f32 {
        self.values.get(label).copied().unwrap_or(0.0)
    }

    /// Set every label to zero.
    pub fn zero_all(&mut self) {
        self.values.values_mut().for_each(|v| *v = 0.0);
    }

    /// Zero all siblings and set `label` to `value` in the same update.
    ///
    /// Labels outside the channel are ignored (all labels end up zero).
    /// Returns whether `label` was applied.
    pub fn set_exclusive(&mut self, label: &str, value: f32) -> bool {
        self.zero_all();
        match self.values.get_mut(label) {
            Some(slot) => {
                *slot = value.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    /// The non-zero label, if any.
    #[must_use]
    pub fn active(&self) -> Option<(&str, f32)> {
        self.values
            .iter()
            .find(|(_, v)| **v > 0.0)
            .map(|(k, v)| (k.as_str(), *v))
    }

    /// All label intensities in label order.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, f32> {
        &self.values
    }
}

/// What the mouth should do on this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouthCue<'a> {
    /// Not speaking, or timing says no viseme is active yet.
    Silent,
    /// Speaking with a resolved viseme label.
    Viseme(&'a str),
    /// Speaking without any fine-grained timing data.
    Untimed,
}

impl<'a> MouthCue<'a> {
    /// Derive the cue from playback state.
    ///
    /// `has_timing` is whether the utterance carries timed units;
    /// `resolved` is the label picked by the viseme resolver.
    #[must_use]
    pub fn for_playback(playback: &PlaybackState, has_timing: bool, resolved: Option<&'a str>) -> Self {
        if !playback.is_active {
            return Self::Silent;
        }
        match (has_timing, resolved) {
            (_, Some(label)) => Self::Viseme(label),
            (true, None) => Self::Silent,
            (false, None) => Self::Untimed,
        }
    }
}

/// Current intensities of both channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub mouth: BTreeMap<String, f32>,
    pub emotion: BTreeMap<String, f32>,
}

/// Computes mouth and emotion intensities.
#[derive(Debug, Clone)]
pub struct BlendEngine {
    config: BlendConfig,
    mouth: ExpressionChannel,
    emotion: ExpressionChannel,
    /// Emotion requested by the caller, re-applied when a model is bound.
    requested_emotion: String,
    /// Emotion actually showing (neutral when unsupported).
    applied_emotion: String,
    /// Last mouth label driven; observational only.
    last_viseme: Option<String>,
}

impl BlendEngine {
    /// Create an engine with no model bound (all writes are no-ops).
    #[must_use]
    pub fn new(config: BlendConfig) -> Self {
        let neutral = config.neutral_label.clone();
        Self {
            config,
            mouth: ExpressionChannel::default(),
            emotion: ExpressionChannel::default(),
            requested_emotion: neutral.clone(),
            applied_emotion: neutral,
            last_viseme: None,
        }
    }

    /// Partition a model's shapes into channels.
    ///
    /// Mouth labels from the config go to the mouth channel. Every other
    /// available label except `reserved` (shapes owned by idle motion, such
    /// as blink) goes to the emotion channel. The latched emotion is
    /// re-applied.
    pub fn bind(&mut self, shapes: &ShapeSet, reserved: &[&str]) {
        let is_mouth = |label: &str| self.config.mouth_labels.iter().any(|m| m == label);
        self.mouth = ExpressionChannel::new(shapes.iter().filter(|l| is_mouth(l)));
        self.emotion = ExpressionChannel::new(
            shapes
                .iter()
                .filter(|l| !is_mouth(l) && !reserved.contains(l)),
        );
        self.last_viseme = None;
        let requested = self.requested_emotion.clone();
        self.set_emotion(&requested);
    }

    /// Speaking envelope at animation time `t`, in `0.0..=1.0`.
    #[must_use]
    pub fn envelope(&self, t: f64) -> f32 {
        let amplitude = self.config.amplitude;
        let wave = (t * f64::from(self.config.speaking_rate)).sin() as f32;
        (wave * amplitude + amplitude).clamp(0.0, 1.0)
    }

    /// Per-frame mouth update.
    ///
    /// Overwrites the whole mouth channel, so calling it twice with the same
    /// inputs leaves identical state. Returns `true` when the driven mouth
    /// label changed since the previous frame.
    pub fn evaluate(&mut self, t: f64, cue: MouthCue<'_>) -> bool {
        let driven = match cue {
            MouthCue::Silent => {
                self.mouth.zero_all();
                None
            }
            MouthCue::Viseme(label) if self.mouth.contains(label) => {
                self.mouth.set_exclusive(label, self.envelope(t));
                Some(label)
            }
            MouthCue::Viseme(_) | MouthCue::Untimed => {
                let fallback = self.envelope(t) * self.config.fallback_scale;
                if self.mouth.set_exclusive(&self.config.default_viseme, fallback) {
                    Some(self.config.default_viseme.as_str())
                } else {
                    None
                }
            }
        };

        if self.last_viseme.as_deref() == driven {
            return false;
        }
        debug!(from = ?self.last_viseme, to = ?driven, "mouth viseme changed");
        self.last_viseme = driven.map(str::to_owned);
        true
    }

    /// Zero the mouth channel immediately.
    pub fn silence_mouth(&mut self) {
        self.mouth.zero_all();
        self.last_viseme = None;
    }

    /// Latch an emotion.
    ///
    /// Labels are matched lowercase. All emotion labels are zeroed; then
    /// `label` is set to 1 unless it is neutral or unavailable. Returns
    /// `true` when the showing emotion changed.
    pub fn set_emotion(&mut self, label: &str) -> bool {
        let label = label.trim().to_lowercase();
        let label = if label.is_empty() {
            self.config.neutral_label.as_str()
        } else {
            label.as_str()
        };
        self.requested_emotion = label.to_owned();

        let applied = if label == self.config.neutral_label {
            self.emotion.zero_all();
            false
        } else {
            let applied = self.emotion.set_exclusive(label, 1.0);
            if !applied {
                debug!(label, "emotion unsupported by model; showing neutral");
            }
            applied
        };

        let showing = if applied {
            label.to_owned()
        } else {
            self.config.neutral_label.clone()
        };
        let changed = showing != self.applied_emotion;
        self.applied_emotion = showing;
        changed
    }

    /// Return the emotion channel to neutral.
    pub fn reset_emotion(&mut self) -> bool {
        let neutral = self.config.neutral_label.clone();
        self.set_emotion(&neutral)
    }

    /// Emotion currently showing.
    #[must_use]
    pub fn emotion(&self) -> &str {
        &self.applied_emotion
    }

    /// Whether the showing emotion is neutral.
    #[must_use]
    pub fn is_neutral(&self) -> bool {
        self.applied_emotion == self.config.neutral_label
    }

    /// Mouth label driven on the last frame.
    #[must_use]
    pub fn current_viseme(&self) -> Option<&str> {
        self.last_viseme.as_deref()
    }

    /// Mouth channel.
    #[must_use]
    pub fn mouth(&self) -> &ExpressionChannel {
        &self.mouth
    }

    /// Emotion channel.
    #[must_use]
    pub fn emotion_channel(&self) -> &ExpressionChannel {
        &self.emotion
    }

    /// Copy both channels.
    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            mouth: self.mouth.values().clone(),
            emotion: self.emotion.values().clone(),
        }
    }
}
