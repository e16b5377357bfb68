//! Idle motion correction.
//!
//! The rendering side resets skeletal pose on every scene update, so the
//! arm rest pose is overwritten every frame rather than animated once.
//! Blinking and breathing ride on top. Everything here is skipped for
//! joints and shapes the loaded model does not have.

use crate::config::IdleConfig;
use crate::model::{CharacterModel, Joint};
use std::collections::BTreeMap;
use tracing::debug;

/// Periodic blink pulse.
///
/// Started on model load and stopped on teardown. Driven by the frame
/// clock, so it never fires while no frames are being rendered.
#[derive(Debug, Clone)]
pub struct BlinkTimer {
    interval: f64,
    duration: f64,
    next_at: Option<f64>,
    until: Option<f64>,
}

impl BlinkTimer {
    /// Create a stopped timer.
    #[must_use]
    pub fn new(interval_secs: f64, duration_ms: u64) -> Self {
        Self {
            interval: interval_secs.max(0.001),
            duration: duration_ms as f64 / 1000.0,
            next_at: None,
            until: None,
        }
    }

    /// Schedule the first blink one interval after `now`.
    pub fn start(&mut self, now: f64) {
        self.next_at = Some(now + self.interval);
        self.until = None;
    }

    /// Cancel all pending blinks.
    pub fn stop(&mut self) {
        self.next_at = None;
        self.until = None;
    }

    /// Whether the timer is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.next_at.is_some()
    }

    /// Blink intensity at `now`: 1 during a pulse, 0 otherwise.
    pub fn sample(&mut self, now: f64) -> f32 {
        let Some(next_at) = self.next_at else {
            return 0.0;
        };
        if let Some(until) = self.until {
            if now < until {
                return 1.0;
            }
            self.until = None;
        }
        if now >= next_at {
            self.until = Some(now + self.duration);
            let mut next = next_at + self.interval;
            if next <= now {
                next = now + self.interval;
            }
            self.next_at = Some(next);
            return 1.0;
        }
        0.0
    }
}

/// Reapplies rest pose, blink and breathing every frame.
#[derive(Debug, Clone)]
pub struct IdleCorrector {
    config: IdleConfig,
    blink: BlinkTimer,
    blink_available: bool,
    chest_origin: Option<[f32; 3]>,
}

impl IdleCorrector {
    /// Create a corrector with no model bound.
    #[must_use]
    pub fn new(config: IdleConfig) -> Self {
        let blink = BlinkTimer::new(config.blink_interval_secs, config.blink_duration_ms);
        Self {
            config,
            blink,
            blink_available: false,
            chest_origin: None,
        }
    }

    /// Bind to a freshly loaded model at time `now`.
    ///
    /// Records the chest's initial position and starts the blink timer when
    /// the model has a blink shape.
    pub fn bind(&mut self, model: &CharacterModel, now: f64) {
        self.chest_origin = model.joint(&self.config.chest_joint).map(|j| j.position);
        self.blink_available = model.shapes.contains(&self.config.blink_label);
        if self.blink_available {
            self.blink.start(now);
        } else {
            self.blink.stop();
        }
        debug!(
            blink = self.blink_available,
            breathing = self.chest_origin.is_some(),
            "idle motion bound to model"
        );
    }

    /// Stop timers and forget the model.
    pub fn teardown(&mut self) {
        self.blink.stop();
        self.blink_available = false;
        self.chest_origin = None;
    }

    /// Shape label owned by the blink timer.
    #[must_use]
    pub fn blink_label(&self) -> &str {
        &self.config.blink_label
    }

    /// Whether the blink timer is scheduled.
    #[must_use]
    pub fn blink_running(&self) -> bool {
        self.blink.is_running()
    }

    /// Apply the corrective pass for the frame at `elapsed`.
    ///
    /// Must run after anything else that writes the same joints. Returns
    /// the blink intensity when the model has a blink shape.
    pub fn apply(&mut self, elapsed: f64, joints: &mut BTreeMap<String, Joint>) -> Option<f32> {
        if let Some(arm) = joints.get_mut(&self.config.left_arm_joint) {
            arm.rotation = to_radians(self.config.left_arm_rest_deg);
        }
        if let Some(arm) = joints.get_mut(&self.config.right_arm_joint) {
            arm.rotation = to_radians(self.config.right_arm_rest_deg);
        }

        if let Some(origin) = self.chest_origin
            && let Some(chest) = joints.get_mut(&self.config.chest_joint)
        {
            chest.position = origin;
            chest.position[1] += self.breath_offset(elapsed);
        }

        self.blink_available.then(|| self.blink.sample(elapsed))
    }

    /// Vertical breathing offset at `elapsed`.
    #[must_use]
    pub fn breath_offset(&self, elapsed: f64) -> f32 {
        let period = self.config.breath_period_secs.max(0.001);
        let phase = std::f64::consts::TAU * elapsed / period;
        phase.sin() as f32 * self.config.breath_amplitude
    }
}

fn to_radians(degrees: [f32; 3]) -> [f32; 3] {
    degrees.map(f32::to_radians)
}
