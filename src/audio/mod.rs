//! Speech audio output.
//!
//! Both voices produce WAV audio and hand it to an [`AudioSink`], which
//! returns once playback is over. [`SpeakerSink`] plays through an output
//! device; [`TimedSink`] only waits out the duration, for headless runs and
//! hosts that play nothing.

mod playback;

pub use playback::SpeakerSink;

use crate::config::{AudioConfig, AudioOutput};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Plays synthesized audio.
#[async_trait]
pub trait AudioSink: Send + Sync + 'static {
    /// Play `wav` and return once playback has finished.
    ///
    /// Dropping the future stops playback.
    ///
    /// # Errors
    ///
    /// Returns an error when playback fails.
    async fn play(&self, wav: Bytes, duration: Duration) -> Result<()>;
}

/// Sink that only waits out the audio duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimedSink;

#[async_trait]
impl AudioSink for TimedSink {
    async fn play(&self, _wav: Bytes, duration: Duration) -> Result<()> {
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

/// Build the sink selected by config.
///
/// A speaker sink whose device cannot be opened degrades to [`TimedSink`],
/// so speech timing keeps working on machines without audio hardware.
#[must_use]
pub fn sink_from_config(config: &AudioConfig) -> Arc<dyn AudioSink> {
    match config.output {
        AudioOutput::Timed => {
            info!("audio output disabled; speech is timed only");
            Arc::new(TimedSink)
        }
        AudioOutput::Speaker => {
            let speaker = SpeakerSink::new(config);
            match speaker.device_name() {
                Ok(name) => {
                    info!(device = %name, "speech audio output ready");
                    Arc::new(speaker)
                }
                Err(e) => {
                    warn!(error = %e, "no usable output device; speech is timed only");
                    Arc::new(TimedSink)
                }
            }
        }
    }
}

/// Mono PCM decoded from a WAV payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmClip {
    /// Playback length.
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

fn open_wav(wav: &[u8]) -> Result<hound::WavReader<std::io::Cursor<&[u8]>>> {
    let reader = hound::WavReader::new(std::io::Cursor::new(wav))
        .map_err(|e| SyncError::Audio(format!("invalid WAV audio: {e}")))?;
    if reader.spec().sample_rate == 0 {
        return Err(SyncError::Audio("WAV sample rate is zero".into()));
    }
    Ok(reader)
}

/// Duration of a WAV payload, read from its header.
///
/// # Errors
///
/// Returns [`SyncError::Audio`] if the bytes are not a readable WAV file.
pub fn wav_duration(wav: &[u8]) -> Result<Duration> {
    let reader = open_wav(wav)?;
    Ok(Duration::from_secs_f64(
        f64::from(reader.duration()) / f64::from(reader.spec().sample_rate),
    ))
}

/// Decode a WAV payload to mono `f32` samples in `[-1, 1]`.
///
/// Integer samples are scaled by their bit depth; channels are averaged.
///
/// # Errors
///
/// Returns [`SyncError::Audio`] if the bytes are not a readable WAV file.
pub fn decode_wav(wav: &[u8]) -> Result<PcmClip> {
    let mut reader = open_wav(wav)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << spec.bits_per_sample.saturating_sub(1).min(31)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect()
        }
    };
    let interleaved =
        interleaved.map_err(|e| SyncError::Audio(format!("invalid WAV audio: {e}")))?;

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok(PcmClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Linear resampling from `from` Hz to `to` Hz.
#[must_use]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let step = f64::from(from) / f64::from(to);
    let len = (samples.len() as f64 / step).round() as usize;
    let last = samples.len() - 1;
    (0..len)
        .map(|i| {
            let pos = i as f64 * step;
            let index = (pos.floor() as usize).min(last);
            let frac = (pos - index as f64) as f32;
            let a = samples[index];
            let b = samples[(index + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
