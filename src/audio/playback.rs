//! Audio playback to system speakers via cpal.
//!
//! Playback is fed from a channel of PCM frames so synthesis can stream in
//! while earlier audio is already playing. Buffered-but-unplayed audio is
//! bounded by `playback_buffer_ms`; the feeder waits for space instead of
//! growing the queue. From the caller's view [`CpalPlayback::play_stream`]
//! blocks until the last sample drains.

use crate::audio::codec::resample;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Audio playback to system speakers.
pub struct CpalPlayback {
    device: cpal::Device,
    stream_config: StreamConfig,
    max_buffered_samples: usize,
}

impl CpalPlayback {
    /// Create a new playback instance.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| VoiceError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| VoiceError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let default_config = device
            .default_output_config()
            .map_err(|e| VoiceError::Audio(format!("no default output config: {e}")))?;
        let device_rate = default_config.sample_rate();

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: device_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let max_buffered_samples =
            (device_rate as u64 * config.playback_buffer_ms as u64 / 1_000) as usize;

        Ok(Self {
            device,
            stream_config,
            max_buffered_samples: max_buffered_samples.max(1),
        })
    }

    /// Play PCM frames arriving on `rx` (mono f32 at `source_rate`) until
    /// the channel closes, then wait for the buffer to drain.
    ///
    /// Cancellation stops playback immediately and discards the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream cannot be created or started.
    pub async fn play_stream(
        &mut self,
        mut rx: mpsc::Receiver<Vec<f32>>,
        source_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let device_rate = self.stream_config.sample_rate;
        let buffer: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let buffer_for_callback = Arc::clone(&buffer);

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_for_callback.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        *sample = buf.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;

        // Feed frames, honoring the buffer bound.
        'feed: while let Some(frame) = tokio::select! {
            frame = rx.recv() => frame,
            () = cancel.cancelled() => None,
        } {
            let resampled = if source_rate != device_rate {
                resample(&frame, source_rate, device_rate)
            } else {
                frame
            };

            let mut offset = 0;
            while offset < resampled.len() {
                if cancel.is_cancelled() {
                    break 'feed;
                }
                let space = {
                    let buf = buffer
                        .lock()
                        .map_err(|e| VoiceError::Audio(format!("playback lock poisoned: {e}")))?;
                    self.max_buffered_samples.saturating_sub(buf.len())
                };
                if space == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
                let take = space.min(resampled.len() - offset);
                let mut buf = buffer
                    .lock()
                    .map_err(|e| VoiceError::Audio(format!("playback lock poisoned: {e}")))?;
                buf.extend(resampled[offset..offset + take].iter().copied());
                offset += take;
            }
        }

        if cancel.is_cancelled() {
            if let Ok(mut buf) = buffer.lock() {
                buf.clear();
            }
            drop(stream);
            debug!("playback cancelled");
            return Ok(());
        }

        // Wait until the device has consumed everything.
        loop {
            let remaining = buffer
                .lock()
                .map_err(|e| VoiceError::Audio(format!("playback lock poisoned: {e}")))?
                .len();
            if remaining == 0 {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
                () = cancel.cancelled() => break,
            }
        }

        drop(stream);
        debug!("playback drained");
        Ok(())
    }

    /// List available output device names.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}
