//! Configuration types for the synchronization core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Mouth and emotion channel blending.
    pub blend: BlendConfig,
    /// Idle pose, blink and breathing correction.
    pub idle: IdleConfig,
    /// Backend selection.
    pub dispatch: DispatchConfig,
    /// Paced local speech backend.
    pub local: LocalVoiceConfig,
    /// Remote voice synthesis backend.
    pub remote: RemoteVoiceConfig,
    /// Speech audio output.
    pub audio: AudioConfig,
    /// Headless host bridge.
    pub host: HostConfig,
}

/// Expression blend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    /// Angular rate (radians per time unit) of the speaking envelope.
    ///
    /// 12.0 completes one open/close cycle roughly every 0.52 time units.
    pub speaking_rate: f32,
    /// Envelope amplitude. The envelope is centred on this value, so the
    /// mouth never fully closes while speaking unless amplitude is 0.5.
    pub amplitude: f32,
    /// Viseme used when the resolved viseme is unavailable or no timing
    /// data exists.
    pub default_viseme: String,
    /// Scale applied to the envelope for the default-viseme fallback.
    pub fallback_scale: f32,
    /// Emotion label that means "no emotion".
    pub neutral_label: String,
    /// Labels that belong to the mouth channel.
    pub mouth_labels: Vec<String>,
    /// Infer an emotion from reply text when none is supplied.
    pub infer_emotion: bool,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            speaking_rate: 12.0,
            amplitude: 0.4,
            default_viseme: "aa".to_owned(),
            fallback_scale: 0.7,
            neutral_label: "neutral".to_owned(),
            mouth_labels: ["aa", "ih", "ou", "ee", "oh"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            infer_emotion: false,
        }
    }
}

/// Idle motion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Joint name of the left upper arm.
    pub left_arm_joint: String,
    /// Joint name of the right upper arm.
    pub right_arm_joint: String,
    /// Joint name whose vertical position breathes.
    pub chest_joint: String,
    /// Left arm rest rotation in degrees (x, y, z).
    pub left_arm_rest_deg: [f32; 3],
    /// Right arm rest rotation in degrees (x, y, z).
    pub right_arm_rest_deg: [f32; 3],
    /// Shape label pulsed by the blink timer.
    pub blink_label: String,
    /// Seconds between blinks.
    pub blink_interval_secs: f64,
    /// Duration of a blink pulse in milliseconds.
    pub blink_duration_ms: u64,
    /// Breathing period in seconds.
    pub breath_period_secs: f64,
    /// Breathing vertical amplitude in model units.
    pub breath_amplitude: f32,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            left_arm_joint: "leftUpperArm".to_owned(),
            right_arm_joint: "rightUpperArm".to_owned(),
            chest_joint: "chest".to_owned(),
            left_arm_rest_deg: [10.0, 0.0, 70.0],
            right_arm_rest_deg: [10.0, 0.0, -70.0],
            blink_label: "blink".to_owned(),
            blink_interval_secs: 5.0,
            blink_duration_ms: 150,
            breath_period_secs: 4.0,
            breath_amplitude: 0.005,
        }
    }
}

/// Backend selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// ISO 639-3 code of the language routed to the remote voice.
    pub remote_language: String,
    /// Whether the remote voice is used at all.
    pub remote_enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            remote_language: "jpn".to_owned(),
            remote_enabled: true,
        }
    }
}

/// Local backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalVoiceConfig {
    /// Speaking pace used to space word boundaries.
    pub words_per_minute: f32,
    /// Speech synthesizer program, looked up on `PATH` unless it is a path.
    ///
    /// Called as `<program> -s <wpm> [-v <voice>] -w <out.wav> --stdin` with
    /// the text on stdin (`espeak-ng` compatible). Empty keeps the local
    /// voice silent: boundaries are still paced and the host voices the
    /// captions itself.
    pub synthesizer: String,
    /// Synthesizer voice name (None = synthesizer default).
    pub voice: Option<String>,
}

impl Default for LocalVoiceConfig {
    fn default() -> Self {
        Self {
            words_per_minute: 160.0,
            synthesizer: "espeak-ng".to_owned(),
            voice: None,
        }
    }
}

/// Where synthesized speech audio goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioOutput {
    /// Play through an output device.
    #[default]
    Speaker,
    /// Play nothing; only wait out the audio duration.
    Timed,
}

/// Audio output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output mode.
    pub output: AudioOutput,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Output sample rate in Hz; decoded audio is resampled to it.
    pub output_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output: AudioOutput::Speaker,
            output_device: None,
            output_sample_rate: 48_000,
        }
    }
}

/// Remote voice synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteVoiceConfig {
    /// API base URL.
    pub base_url: String,
    /// Speaker ID passed to the synthesis endpoint.
    pub speaker: u32,
    /// Optional API key.
    pub api_key: Option<String>,
    /// Delay between audio status polls.
    pub poll_interval_ms: u64,
    /// Maximum number of status polls before giving up.
    pub max_polls: u32,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for RemoteVoiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.tts.quest".to_owned(),
            speaker: 20,
            api_key: None,
            poll_interval_ms: 500,
            max_polls: 20,
            request_timeout_secs: 15,
        }
    }
}

/// Host bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Frame clock rate in Hz.
    pub frame_rate_hz: u32,
    /// Emit a `frame` event on every frame tick.
    pub stream_frames: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 60,
            stream_frames: false,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SyncError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/kuchipaku/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.blend.amplitude > 0.0 && config.blend.amplitude <= 0.5);
        assert!(config.blend.speaking_rate > 0.0);
        assert_eq!(config.blend.default_viseme, "aa");
        assert!(
            config
                .blend
                .mouth_labels
                .contains(&config.blend.default_viseme)
        );
        assert_eq!(config.dispatch.remote_language, "jpn");
        assert_eq!(config.remote.speaker, 20);
        assert_eq!(config.host.frame_rate_hz, 60);
        assert_eq!(config.audio.output, AudioOutput::Speaker);
        assert_eq!(config.local.synthesizer, "espeak-ng");
    }

    #[test]
    fn default_cycle_is_about_half_a_time_unit() {
        let config = BlendConfig::default();
        let period = std::f32::consts::TAU / config.speaking_rate;
        assert!((0.5..=0.6).contains(&period), "period {period}");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SyncConfig::default();
        config.blend.amplitude = 0.45;
        config.remote.api_key = Some("secret".to_owned());
        config.save_to_file(&path).unwrap();

        let loaded = SyncConfig::from_file(&path).unwrap();
        assert!((loaded.blend.amplitude - 0.45).abs() < f32::EPSILON);
        assert_eq!(loaded.remote.api_key.as_deref(), Some("secret"));
        assert_eq!(loaded.idle.blink_label, "blink");
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = SyncConfig::from_file(std::path::Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[blend\namplitude = ").unwrap();
        let err = SyncConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, crate::error::SyncError::Config(_)));
    }

    #[test]
    fn partial_section_uses_defaults() {
        let toml_str = r#"
[idle]
blink_interval_secs = 3.0

[dispatch]
remote_enabled = false
"#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert!((config.idle.blink_interval_secs - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.idle.blink_duration_ms, 150);
        assert!(!config.dispatch.remote_enabled);
        assert_eq!(config.dispatch.remote_language, "jpn");
    }

    #[test]
    fn audio_output_parses_lowercase() {
        let toml_str = r#"
[audio]
output = "timed"

[local]
synthesizer = ""
"#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.audio.output, AudioOutput::Timed);
        assert_eq!(config.audio.output_sample_rate, 48_000);
        assert!(config.local.synthesizer.is_empty());
        assert!(toml::from_str::<SyncConfig>("[audio]\noutput = \"Speaker\"").is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = SyncConfig::default_config_path();
        assert!(path.ends_with("config.toml"));
    }
}
