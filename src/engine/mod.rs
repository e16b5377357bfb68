//! The synchronization engine facade.
//!
//! [`AvatarSync`] owns every piece of per-character state: the timing
//! adapter, blend engine, idle corrector and dispatcher. Inputs arrive
//! through a handful of calls (`submit`, `on_backend_event`, `cancel`,
//! `set_emotion`, `frame`) that all run on one thread, so channel state is
//! only mutated at well-defined transition points and never torn within a
//! frame.
//!
//! Backend work is not performed here. Calls that change dispatch state
//! return the [`Effect`]s the caller must execute; see
//! [`crate::conductor::SpeechConductor`] for the usual driver.

use crate::backend::{BackendEvent, BackendKind, SessionId};
use crate::blend::{BlendEngine, ChannelSnapshot, MouthCue};
use crate::config::SyncConfig;
use crate::dispatch::{DispatchPhase, Dispatcher, EndReason, Effect, Notification, UtteranceId};
use crate::error::{Result, SyncError};
use crate::idle::IdleCorrector;
use crate::model::{CharacterModel, Joint, ShapeSet};
use crate::reply::Reply;
use crate::runtime::{AvatarEvent, EVENT_CHANNEL_CAPACITY};
use crate::timing::{PlaybackState, TimingAdapter, TimingTrack};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameOutput {
    /// Animation time the frame was computed for.
    pub elapsed: f64,
    /// Shape label to intensity, covering mouth, emotion and blink.
    pub shapes: BTreeMap<String, f32>,
    /// Corrected joint pose.
    pub joints: BTreeMap<String, Joint>,
}

/// Speech-to-expression synchronization for one character.
#[derive(Debug)]
pub struct AvatarSync {
    adapter: TimingAdapter,
    blend: BlendEngine,
    idle: IdleCorrector,
    dispatcher: Dispatcher,
    model: Option<CharacterModel>,
    /// Text of the utterance in flight, for captions.
    spoken_text: String,
    infer_emotion: bool,
    events: broadcast::Sender<AvatarEvent>,
}

impl AvatarSync {
    /// Create an engine with no model loaded.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            adapter: TimingAdapter::new(),
            blend: BlendEngine::new(config.blend.clone()),
            idle: IdleCorrector::new(config.idle.clone()),
            dispatcher: Dispatcher::new(&config.dispatch),
            model: None,
            spoken_text: String::new(),
            infer_emotion: config.blend.infer_emotion,
            events,
        }
    }

    /// Subscribe to avatar events.
    pub fn subscribe(&self) -> broadcast::Receiver<AvatarEvent> {
        self.events.subscribe()
    }

    /// Bind a freshly loaded character at animation time `now`.
    ///
    /// Discovers the available shapes once and starts the blink timer when
    /// the model can blink.
    pub fn load_model(&mut self, model: CharacterModel, now: f64) {
        self.idle.bind(&model, now);
        let blink = self.idle.blink_label().to_owned();
        self.blend.bind(&model.shapes, &[blink.as_str()]);
        info!(
            shapes = model.shapes.len(),
            joints = model.joints.len(),
            "character model loaded"
        );
        self.model = Some(model);
    }

    /// Forget the character and stop its timers.
    pub fn unload_model(&mut self) {
        if self.model.take().is_some() {
            self.idle.teardown();
            self.blend.bind(&ShapeSet::new(), &[]);
            info!("character model unloaded");
        }
    }

    /// The loaded character, if any.
    #[must_use]
    pub fn model(&self) -> Option<&CharacterModel> {
        self.model.as_ref()
    }

    /// Start speaking a reply.
    ///
    /// Any utterance still in flight is terminated first. The reply's timing
    /// units replace the previous track; malformed units degrade to
    /// boundary-only timing. Returns the backend effects to execute.
    pub fn submit(&mut self, reply: Reply) -> (UtteranceId, Vec<Effect>) {
        let reply = reply.normalized(self.infer_emotion);
        let (utterance, effects) = self.dispatcher.speak(&reply.text);
        let (effects, _) = self.apply(effects);

        self.adapter.load_track(TimingTrack::lenient(reply.units));
        self.spoken_text = reply.text;
        if let Some(emotion) = reply.emotion.as_deref() {
            self.set_emotion(emotion);
        }
        (utterance, effects)
    }

    /// Apply a backend event.
    ///
    /// Stale events from superseded sessions are dropped without touching
    /// any state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BackendUnavailable`] when the local backend
    /// failed and the utterance could not be spoken.
    pub fn on_backend_event(&mut self, event: &BackendEvent) -> Result<Vec<Effect>> {
        let effects = self.dispatcher.handle(event);
        self.finish(effects)
    }

    /// A backend refused to start `session`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BackendUnavailable`] when no fallback remains.
    pub fn on_start_failed(&mut self, session: SessionId, reason: &str) -> Result<Vec<Effect>> {
        let effects = self.dispatcher.start_failed(session, reason);
        self.finish(effects)
    }

    /// Cancel the utterance in flight.
    ///
    /// Takes effect immediately: the mouth is silenced before this returns
    /// and later events from the cancelled session are ignored. Emotion is
    /// left as it is.
    pub fn cancel(&mut self) -> Vec<Effect> {
        let effects = self.dispatcher.cancel();
        self.apply(effects).0
    }

    /// Latch an emotion, `neutral` to clear. Returns whether it changed.
    pub fn set_emotion(&mut self, label: &str) -> bool {
        let changed = self.blend.set_emotion(label);
        if changed {
            self.publish(AvatarEvent::EmotionChanged {
                emotion: self.blend.emotion().to_owned(),
            });
        }
        changed
    }

    /// Compute the frame at animation time `elapsed`.
    ///
    /// Every pass is a function of `elapsed` and the latest playback state,
    /// so evaluating the same instant twice gives the same output.
    pub fn frame(&mut self, elapsed: f64) -> FrameOutput {
        let playback = self.adapter.state();
        let has_timing = !self.adapter.track().is_empty();
        let resolved = self.adapter.resolve();
        let cue = MouthCue::for_playback(&playback, has_timing, resolved.as_ref().map(|r| r.label()));
        if self.blend.evaluate(elapsed, cue) {
            let viseme = self.blend.current_viseme().map(str::to_owned);
            self.publish(AvatarEvent::VisemeChanged { viseme });
        }

        let mut shapes = BTreeMap::new();
        let snapshot = self.blend.snapshot();
        shapes.extend(snapshot.mouth);
        shapes.extend(snapshot.emotion);

        let mut joints = BTreeMap::new();
        if let Some(model) = self.model.as_mut() {
            if let Some(blink) = self.idle.apply(elapsed, &mut model.joints) {
                shapes.insert(self.idle.blink_label().to_owned(), blink);
            }
            joints.clone_from(&model.joints);
        }

        FrameOutput {
            elapsed,
            shapes,
            joints,
        }
    }

    /// Current playback state.
    #[must_use]
    pub fn playback(&self) -> PlaybackState {
        self.adapter.state()
    }

    /// Current dispatcher phase.
    #[must_use]
    pub fn phase(&self) -> DispatchPhase {
        self.dispatcher.phase()
    }

    /// Utterance in flight, if any.
    #[must_use]
    pub fn active_utterance(&self) -> Option<UtteranceId> {
        self.dispatcher.active_utterance()
    }

    /// Emotion currently showing.
    #[must_use]
    pub fn emotion(&self) -> &str {
        self.blend.emotion()
    }

    /// Copy of both expression channels.
    #[must_use]
    pub fn channels(&self) -> ChannelSnapshot {
        self.blend.snapshot()
    }

    /// Backend the dispatcher would choose for `text`.
    #[must_use]
    pub fn select_backend(&self, text: &str) -> BackendKind {
        self.dispatcher.select_backend(text)
    }

    fn finish(&mut self, effects: Vec<Effect>) -> Result<Vec<Effect>> {
        let (effects, failure) = self.apply(effects);
        match failure {
            Some(reason) => Err(SyncError::BackendUnavailable(reason)),
            None => Ok(effects),
        }
    }

    /// Apply notifications to local state and publish them.
    ///
    /// Returns the backend effects left for the caller, plus the failure
    /// reason when the utterance failed.
    fn apply(&mut self, effects: Vec<Effect>) -> (Vec<Effect>, Option<String>) {
        let mut backend_effects = Vec::with_capacity(effects.len());
        let mut failure = None;
        for effect in effects {
            match effect {
                Effect::Notify(notification) => {
                    if let Some(reason) = self.on_notification(notification) {
                        failure = Some(reason);
                    }
                }
                other => backend_effects.push(other),
            }
        }
        (backend_effects, failure)
    }

    fn on_notification(&mut self, notification: Notification) -> Option<String> {
        match notification {
            Notification::SpeakStart { utterance, backend } => {
                self.adapter.on_utterance_start();
                self.publish(AvatarEvent::SpeakStart { utterance, backend });
                if backend == BackendKind::Remote {
                    self.publish(AvatarEvent::Caption {
                        utterance,
                        text: self.spoken_text.clone(),
                    });
                }
                None
            }
            Notification::Boundary {
                utterance,
                offset,
                length,
            } => {
                self.adapter
                    .advance(i64::try_from(offset).unwrap_or(i64::MAX));
                let captions_follow_words = self
                    .dispatcher
                    .active_session()
                    .is_some_and(|(_, backend)| backend == BackendKind::Local);
                if captions_follow_words {
                    let text = self
                        .spoken_text
                        .chars()
                        .take(offset.saturating_add(length))
                        .collect();
                    self.publish(AvatarEvent::Caption { utterance, text });
                }
                None
            }
            Notification::Fallback {
                utterance,
                from,
                reason,
            } => {
                warn!(%utterance, from = from.as_str(), reason, "speech fell back to local voice");
                self.adapter.advance(0);
                self.publish(AvatarEvent::Fallback { utterance, reason });
                None
            }
            Notification::SpeakEnd { utterance, reason } => {
                self.adapter.on_utterance_end();
                self.silence_mouth();
                let failure = match &reason {
                    EndReason::Completed => {
                        self.reset_emotion();
                        None
                    }
                    EndReason::Cancelled => None,
                    EndReason::Failed(message) => {
                        self.reset_emotion();
                        self.publish(AvatarEvent::Error {
                            utterance,
                            message: message.clone(),
                        });
                        Some(message.clone())
                    }
                };
                debug!(%utterance, reason = reason.as_str(), "utterance ended");
                self.publish(AvatarEvent::SpeakEnd {
                    utterance,
                    reason: reason.as_str().to_owned(),
                });
                failure
            }
        }
    }

    fn silence_mouth(&mut self) {
        let was_speaking = self.blend.current_viseme().is_some();
        self.blend.silence_mouth();
        if was_speaking {
            self.publish(AvatarEvent::VisemeChanged { viseme: None });
        }
    }

    fn reset_emotion(&mut self) {
        if !self.blend.is_neutral() && self.blend.reset_emotion() {
            self.publish(AvatarEvent::EmotionChanged {
                emotion: self.blend.emotion().to_owned(),
            });
        }
    }

    fn publish(&self, event: AvatarEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::backend::BackendSignal;
    use crate::timing::TimedUnit;

    fn model() -> CharacterModel {
        CharacterModel::new(
            ["aa", "ih", "oh", "ee", "ou", "happy", "sad", "blink"],
            [
                ("leftUpperArm".to_owned(), Joint::default()),
                ("rightUpperArm".to_owned(), Joint::default()),
                (
                    "chest".to_owned(),
                    Joint {
                        position: [0.0, 1.2, 0.0],
                        ..Joint::default()
                    },
                ),
            ],
        )
    }

    fn engine() -> AvatarSync {
        let mut sync = AvatarSync::new(&SyncConfig::default());
        sync.load_model(model(), 0.0);
        sync
    }

    fn start_of(effects: &[Effect]) -> (BackendKind, SessionId) {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Start {
                    backend, session, ..
                } => Some((*backend, *session)),
                _ => None,
            })
            .expect("start effect")
    }

    fn drain(rx: &mut broadcast::Receiver<AvatarEvent>) -> Vec<AvatarEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn mouth_total(out: &FrameOutput) -> f32 {
        ["aa", "ih", "oh", "ee", "ou"]
            .iter()
            .map(|l| out.shapes.get(*l).copied().unwrap_or(0.0))
            .sum()
    }

    #[test]
    fn untimed_speech_moves_the_default_viseme() {
        let mut sync = engine();
        let (_, effects) = sync.submit(Reply::new("hello world"));
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Started))
            .unwrap();

        let out = sync.frame(0.3);
        assert!(out.shapes["aa"] > 0.0);
        assert_eq!(out.shapes["ih"], 0.0);
    }

    #[test]
    fn timed_units_drive_the_resolved_viseme() {
        let mut sync = engine();
        let reply = Reply::new("hi there").with_units(vec![
            TimedUnit::new("hi", 0, ["ih"]),
            TimedUnit::new(" there", 2, ["ee", "oh"]),
        ]);
        let (_, effects) = sync.submit(reply);
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(
            session,
            backend,
            BackendSignal::Boundary {
                offset: 5,
                length: 3,
            },
        ))
        .unwrap();

        let out = sync.frame(0.2);
        assert!(out.shapes["oh"] > 0.0);
        assert_eq!(mouth_total(&out), out.shapes["oh"]);
    }

    #[test]
    fn completion_resets_emotion_and_mouth() {
        let mut sync = engine();
        let mut rx = sync.subscribe();
        let (_, effects) = sync.submit(Reply::new("hello").with_emotion("happy"));
        assert_eq!(sync.emotion(), "happy");
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Started))
            .unwrap();
        assert!(mouth_total(&sync.frame(0.1)) > 0.0);

        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Ended))
            .unwrap();
        assert_eq!(sync.emotion(), "neutral");
        let out = sync.frame(0.2);
        assert_eq!(mouth_total(&out), 0.0);
        assert_eq!(out.shapes["happy"], 0.0);

        let events = drain(&mut rx);
        assert!(events.contains(&AvatarEvent::EmotionChanged {
            emotion: "neutral".into()
        }));
    }

    #[test]
    fn cancel_keeps_emotion_and_ignores_late_events() {
        let mut sync = engine();
        let (_, effects) = sync.submit(Reply::new("hello").with_emotion("sad"));
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Started))
            .unwrap();
        sync.frame(0.1);

        let effects = sync.cancel();
        assert!(matches!(effects.as_slice(), [Effect::Cancel { .. }]));
        assert_eq!(sync.phase(), DispatchPhase::Idle);
        let before = sync.frame(0.4);

        sync.on_backend_event(&BackendEvent::new(
            session,
            backend,
            BackendSignal::Boundary {
                offset: 2,
                length: 1,
            },
        ))
        .unwrap();
        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Ended))
            .unwrap();
        assert_eq!(sync.frame(0.4), before);
        assert_eq!(sync.emotion(), "sad");
        assert!(!sync.playback().is_active);
    }

    #[test]
    fn local_failure_is_user_visible() {
        let mut sync = engine();
        let (_, effects) = sync.submit(Reply::new("hello").with_emotion("happy"));
        let (backend, session) = start_of(&effects);
        let err = sync
            .on_backend_event(&BackendEvent::new(
                session,
                backend,
                BackendSignal::Error("no voice".into()),
            ))
            .unwrap_err();
        assert!(err.is_user_visible());
        assert_eq!(sync.emotion(), "neutral");
        assert_eq!(sync.phase(), DispatchPhase::Failed);
    }

    #[test]
    fn remote_failure_is_absorbed() {
        let mut sync = engine();
        let mut rx = sync.subscribe();
        let (utterance, effects) = sync.submit(Reply::new("こんにちは"));
        let (backend, session) = start_of(&effects);
        assert_eq!(backend, BackendKind::Remote);

        let effects = sync
            .on_backend_event(&BackendEvent::new(
                session,
                backend,
                BackendSignal::Error("timeout".into()),
            ))
            .unwrap();
        let (backend, _) = start_of(&effects);
        assert_eq!(backend, BackendKind::Local);
        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, AvatarEvent::Fallback { utterance: u, .. } if *u == utterance))
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, AvatarEvent::SpeakEnd { .. } | AvatarEvent::Error { .. }))
        );
    }

    #[test]
    fn captions_follow_local_boundaries() {
        let mut sync = engine();
        let mut rx = sync.subscribe();
        let (_, effects) = sync.submit(Reply::new("hi there friend"));
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(
            session,
            backend,
            BackendSignal::Boundary {
                offset: 3,
                length: 5,
            },
        ))
        .unwrap();
        let captions: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AvatarEvent::Caption { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(captions, vec!["hi there".to_owned()]);
    }

    #[test]
    fn remote_start_captions_the_whole_text() {
        let mut sync = engine();
        let mut rx = sync.subscribe();
        let (_, effects) = sync.submit(Reply::new("[emotion:happy] やったね"));
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Ready))
            .unwrap();
        assert!(drain(&mut rx).into_iter().any(
            |e| matches!(e, AvatarEvent::Caption { text, .. } if text == "やったね")
        ));
        assert_eq!(sync.emotion(), "happy");
    }

    #[test]
    fn reply_emotion_field_is_case_insensitive() {
        let mut sync = engine();
        let reply = Reply::from_json(&serde_json::json!({"text": "hi", "emotion": "Happy"}));
        sync.submit(reply);
        assert_eq!(sync.emotion(), "happy");
        assert_eq!(sync.frame(0.0).shapes["happy"], 1.0);
    }

    #[test]
    fn frame_is_idempotent_and_applies_idle_pose() {
        let mut sync = engine();
        let a = sync.frame(2.5);
        let b = sync.frame(2.5);
        assert_eq!(a, b);
        assert!((a.joints["leftUpperArm"].rotation[2] - 70f32.to_radians()).abs() < 1e-6);
        assert!(a.shapes.contains_key("blink"));
    }

    #[test]
    fn blink_is_not_an_emotion() {
        let mut sync = engine();
        assert!(!sync.set_emotion("blink"));
        assert_eq!(sync.emotion(), "neutral");
    }

    #[test]
    fn unloaded_engine_still_runs() {
        let mut sync = AvatarSync::new(&SyncConfig::default());
        let (_, effects) = sync.submit(Reply::new("hello"));
        let (backend, session) = start_of(&effects);
        sync.on_backend_event(&BackendEvent::new(session, backend, BackendSignal::Started))
            .unwrap();
        let out = sync.frame(1.0);
        assert!(out.shapes.is_empty());
        assert!(out.joints.is_empty());

        sync.load_model(model(), 1.0);
        sync.unload_model();
        assert!(sync.model().is_none());
    }
}
