//! Timing source normalization.
//!
//! Playback timing arrives in one of two shapes: coarse word boundaries
//! carrying a character offset, or a precomputed [`TimingTrack`] of
//! [`TimedUnit`]s. [`TimingAdapter`] folds both into one [`PlaybackState`]
//! that the frame step queries through [`TimingAdapter::resolve`].

use crate::error::{Result, SyncError};
use crate::viseme::{self, ResolvedViseme};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{trace, warn};

/// A text fragment with its starting character offset and viseme sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedUnit {
    /// Source text of this unit.
    #[serde(alias = "sourceText")]
    pub text: String,
    /// Character index of the unit start within the full utterance.
    #[serde(alias = "startOffset")]
    pub start_offset: usize,
    /// Ordered viseme labels, never empty.
    pub visemes: Vec<String>,
}

impl TimedUnit {
    /// Build a unit.
    pub fn new(
        text: impl Into<String>,
        start_offset: usize,
        visemes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            text: text.into(),
            start_offset,
            visemes: visemes.into_iter().map(Into::into).collect(),
        }
    }

    /// Length of the source text in characters.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Immutable, validated sequence of timed units for one utterance.
///
/// Cloning is cheap; the units are shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingTrack {
    units: Arc<[TimedUnit]>,
}

impl TimingTrack {
    /// A track with no units (boundary-only timing).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate and freeze a unit sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedTiming`] if a unit has no visemes or
    /// offsets are not strictly increasing.
    pub fn new(units: Vec<TimedUnit>) -> Result<Self> {
        for (index, unit) in units.iter().enumerate() {
            if unit.visemes.is_empty() {
                return Err(SyncError::MalformedTiming(format!(
                    "unit {index} ({:?}) has no visemes",
                    unit.text
                )));
            }
        }
        if let Some(index) = units
            .windows(2)
            .position(|pair| pair[1].start_offset <= pair[0].start_offset)
        {
            return Err(SyncError::MalformedTiming(format!(
                "unit {} starts at {} which does not follow {}",
                index + 1,
                units[index + 1].start_offset,
                units[index].start_offset
            )));
        }
        Ok(Self {
            units: units.into(),
        })
    }

    /// Like [`TimingTrack::new`] but degrades malformed input to an empty
    /// track instead of failing.
    #[must_use]
    pub fn lenient(units: Vec<TimedUnit>) -> Self {
        match Self::new(units) {
            Ok(track) => track,
            Err(e) => {
                warn!(error = %e, "discarding timing units");
                Self::empty()
            }
        }
    }

    /// The units in offset order.
    #[must_use]
    pub fn units(&self) -> &[TimedUnit] {
        &self.units
    }

    /// Whether the track carries no fine-grained timing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Where playback currently is within the utterance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackState {
    /// Whether speech is audibly playing.
    pub is_active: bool,
    /// Latest character offset reported by the backend.
    pub current_offset: usize,
    /// Index of the timed unit containing `current_offset`, if any.
    pub active_unit: Option<usize>,
}

/// Normalizes boundary events and timed units into a [`PlaybackState`].
#[derive(Debug, Clone, Default)]
pub struct TimingAdapter {
    track: TimingTrack,
    state: PlaybackState,
}

impl TimingAdapter {
    /// Create an adapter with an empty track.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the unit track for the next utterance and reset playback.
    pub fn load_track(&mut self, track: TimingTrack) {
        self.track = track;
        self.state = PlaybackState::default();
    }

    /// Current unit track.
    #[must_use]
    pub fn track(&self) -> &TimingTrack {
        &self.track
    }

    /// Current playback state.
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Speech started: active from offset zero.
    pub fn on_utterance_start(&mut self) {
        self.state = PlaybackState {
            is_active: true,
            current_offset: 0,
            active_unit: None,
        };
        self.refresh_active_unit();
    }

    /// Record a new playback offset.
    ///
    /// Offsets are best-effort: they may skip or regress, and negative
    /// values clamp to zero.
    pub fn advance(&mut self, offset: i64) {
        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        if offset < self.state.current_offset {
            trace!(
                from = self.state.current_offset,
                to = offset,
                "boundary offset regressed"
            );
        }
        self.state.current_offset = offset;
        self.refresh_active_unit();
    }

    /// Speech finished, failed or was cancelled.
    pub fn on_utterance_end(&mut self) {
        self.state = PlaybackState::default();
    }

    /// Resolve the active viseme for the current offset.
    ///
    /// Side-effect free: repeated calls return the same result until the
    /// state changes.
    #[must_use]
    pub fn resolve(&self) -> Option<ResolvedViseme<'_>> {
        viseme::resolve(self.track.units(), self.state.current_offset)
    }

    fn refresh_active_unit(&mut self) {
        self.state.active_unit = self.resolve().map(|r| r.unit_index);
    }
}
