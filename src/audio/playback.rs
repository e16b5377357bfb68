//! Speech playback to system speakers via cpal.

use super::{AudioSink, decode_wav, resample};
use crate::config::AudioConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// Plays speech through an output device.
///
/// The device is opened per utterance on a blocking thread, since cpal
/// streams cannot move between threads.
#[derive(Debug, Clone)]
pub struct SpeakerSink {
    output_device: Option<String>,
    sample_rate: u32,
}

impl SpeakerSink {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            output_device: config.output_device.clone(),
            sample_rate: config.output_sample_rate.max(1),
        }
    }

    /// Name of the device playback would use.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Audio`] if the device cannot be found.
    pub fn device_name(&self) -> Result<String> {
        let device = open_device(self.output_device.as_deref())?;
        Ok(describe(&device))
    }
}

fn open_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| SyncError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .is_some_and(|desc| desc.name() == name)
            })
            .ok_or_else(|| SyncError::Audio(format!("output device '{name}' not found"))),
        None => host
            .default_output_device()
            .ok_or_else(|| SyncError::Audio("no default output device".into())),
    }
}

fn describe(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

/// Sets the flag when the owning future is dropped.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn play(&self, wav: Bytes, duration: Duration) -> Result<()> {
        let clip = decode_wav(&wav)?;
        let samples = resample(&clip.samples, clip.sample_rate, self.sample_rate);
        debug!(?duration, samples = samples.len(), "playing speech audio");

        let stop = Arc::new(AtomicBool::new(false));
        let _stop_guard = StopOnDrop(Arc::clone(&stop));
        let device = self.output_device.clone();
        let sample_rate = self.sample_rate;
        tokio::task::spawn_blocking(move || {
            play_blocking(device.as_deref(), sample_rate, samples, &stop)
        })
        .await
        .map_err(|e| SyncError::Audio(format!("playback task failed: {e}")))?
    }
}

struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Play `samples` and block until they are drained or `stop` is set.
fn play_blocking(
    device_name: Option<&str>,
    sample_rate: u32,
    samples: Vec<f32>,
    stop: &AtomicBool,
) -> Result<()> {
    let device = open_device(device_name)?;
    let config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let feed = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut buf) = feed.lock() else {
                    return;
                };
                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SyncError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SyncError::Audio(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(Duration::from_millis(10));
        if stop.load(Ordering::Relaxed) {
            debug!("speech playback stopped early");
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| SyncError::Audio(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}
