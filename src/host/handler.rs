//! Host command handler for the avatar engine.

use crate::conductor::SpeechConductor;
use crate::config::HostConfig;
use crate::engine::FrameOutput;
use crate::error::{Result, SyncError};
use crate::host::contract::{CommandEnvelope, CommandName, CONTRACT_VERSION, EventEnvelope, ResponseEnvelope};
use crate::model::CharacterModel;
use crate::reply::Reply;
use crate::runtime::AvatarEvent;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info};

/// Routes host commands to a [`SpeechConductor`] and keeps the animation
/// clock.
#[derive(Debug)]
pub struct HostHandler {
    conductor: SpeechConductor,
    started_at: Instant,
    frame_rate_hz: u32,
    stream_frames: bool,
}

impl HostHandler {
    /// Create a handler; the animation clock starts now.
    #[must_use]
    pub fn new(conductor: SpeechConductor, config: &HostConfig) -> Self {
        Self {
            conductor,
            started_at: Instant::now(),
            frame_rate_hz: config.frame_rate_hz,
            stream_frames: config.stream_frames,
        }
    }

    /// The conductor.
    #[must_use]
    pub fn conductor(&self) -> &SpeechConductor {
        &self.conductor
    }

    /// The conductor, mutably.
    pub fn conductor_mut(&mut self) -> &mut SpeechConductor {
        &mut self.conductor
    }

    /// Subscribe to avatar events.
    pub fn subscribe(&self) -> broadcast::Receiver<AvatarEvent> {
        self.conductor.sync().subscribe()
    }

    /// Seconds since the handler was created.
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Frame clock period, or `None` when frames are not clocked.
    #[must_use]
    pub fn frame_period(&self) -> Option<Duration> {
        (self.frame_rate_hz > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(self.frame_rate_hz)))
    }

    /// Whether every clocked frame is sent to the host.
    #[must_use]
    pub fn streams_frames(&self) -> bool {
        self.stream_frames
    }

    /// Compute the frame for the current clock.
    pub fn frame(&mut self) -> FrameOutput {
        let elapsed = self.elapsed();
        self.conductor.sync_mut().frame(elapsed)
    }

    /// Validate and route a command; failures become error responses.
    pub fn handle(&mut self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        if let Err(e) = envelope.validate() {
            return ResponseEnvelope::error(envelope.request_id.clone(), e.to_string());
        }
        match self.route(envelope) {
            Ok(response) => response,
            Err(e) => {
                error!(command = envelope.command.as_str(), error = %e, "host command failed");
                ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
            }
        }
    }

    /// Route a command envelope to the appropriate handler.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Protocol`] for bad payloads and
    /// [`SyncError::BackendUnavailable`] when speech cannot start.
    pub fn route(&mut self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let id = envelope.request_id.clone();
        match envelope.command {
            CommandName::HostPing => Ok(ResponseEnvelope::ok(id, serde_json::json!({"pong": true}))),
            CommandName::HostVersion => Ok(ResponseEnvelope::ok(
                id,
                serde_json::json!({
                    "contract_version": CONTRACT_VERSION,
                    "engine_version": env!("CARGO_PKG_VERSION"),
                }),
            )),
            CommandName::ModelLoad => self.handle_model_load(envelope),
            CommandName::ModelUnload => {
                let loaded = self.conductor.sync().model().is_some();
                self.conductor.sync_mut().unload_model();
                Ok(ResponseEnvelope::ok(id, serde_json::json!({"unloaded": loaded})))
            }
            CommandName::ReplySpeak => self.handle_reply_speak(envelope),
            CommandName::SpeechCancel => {
                let active = self.conductor.sync().active_utterance();
                self.conductor.cancel();
                Ok(ResponseEnvelope::ok(
                    id,
                    serde_json::json!({"cancelled": active.is_some()}),
                ))
            }
            CommandName::EmotionSet => self.handle_emotion_set(envelope),
            CommandName::FrameSnapshot => {
                let elapsed = envelope
                    .payload
                    .get("elapsed")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or_else(|| self.elapsed());
                let frame = self.conductor.sync_mut().frame(elapsed);
                Ok(ResponseEnvelope::ok(id, to_json(&frame)?))
            }
            CommandName::RuntimeStop => {
                self.conductor.cancel();
                info!("runtime stop requested");
                Ok(ResponseEnvelope::ok(id, serde_json::json!({"stopping": true})))
            }
        }
    }

    fn handle_model_load(&mut self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let manifest = envelope
            .payload
            .get("model")
            .cloned()
            .unwrap_or_else(|| envelope.payload.clone());
        let model = CharacterModel::from_manifest(manifest)?;
        let (shapes, joints) = (model.shapes.len(), model.joints.len());
        let now = self.elapsed();
        self.conductor.sync_mut().load_model(model, now);
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"shapes": shapes, "joints": joints}),
        ))
    }

    fn handle_reply_speak(&mut self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        if !envelope.payload.is_object() {
            return Err(SyncError::Protocol(
                "reply.speak requires an object payload".to_owned(),
            ));
        }
        let reply = Reply::from_json(&envelope.payload);
        let utterance = self.conductor.speak(reply)?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"utterance": utterance.get()}),
        ))
    }

    fn handle_emotion_set(&mut self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let Some(label) = envelope
            .payload
            .get("emotion")
            .and_then(serde_json::Value::as_str)
        else {
            return Err(SyncError::Protocol(
                "emotion.set requires payload.emotion".to_owned(),
            ));
        };
        let sync = self.conductor.sync_mut();
        let changed = sync.set_emotion(label);
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"emotion": sync.emotion(), "changed": changed}),
        ))
    }
}

/// Wrap an avatar event for the host.
#[must_use]
pub fn event_envelope(event: &AvatarEvent) -> EventEnvelope {
    let payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
    EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event.name(), payload)
}

/// Wrap a computed frame for the host.
#[must_use]
pub fn frame_envelope(frame: &FrameOutput) -> EventEnvelope {
    let payload = serde_json::to_value(frame).unwrap_or(serde_json::Value::Null);
    EventEnvelope::new(uuid::Uuid::new_v4().to_string(), "frame", payload)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| SyncError::Protocol(format!("failed to serialize payload: {e}")))
}
