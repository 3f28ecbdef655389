//! Microphone capture.
//!
//! The cpal callback runs on a real-time audio thread and must not block
//! or do real work, so it only forwards blocks of native-rate samples.
//! An async stage downmixes, resamples to the pipeline rate, and re-frames
//! the flow into VAD-sized chunks. A stream failure mid-capture surfaces
//! as `device_changed`, so the recording loop can tell a vanished device
//! from a normal stop.

use crate::audio::AudioChunk;
use crate::audio::codec::{resample, to_mono};
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Depth of the raw-block channel between the audio callback and the
/// resampling stage. At typical callback sizes this is a few hundred
/// milliseconds of slack.
const RAW_CHANNEL_SIZE: usize = 32;

/// How often the capture loop checks for a failed stream while no audio
/// is arriving.
const FAILURE_POLL: Duration = Duration::from_millis(250);

/// Accumulates an arbitrary sample flow and cuts it into fixed-size
/// frames, carrying the remainder across pushes.
struct FrameChunker {
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    fn new(frame_len: usize) -> Self {
        Self {
            frame_len: frame_len.max(1),
            pending: Vec::new(),
        }
    }

    /// Absorb `samples` and return every complete frame now available.
    fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

/// Audio capture from the system microphone.
pub struct CpalCapture {
    device: cpal::Device,
    native_rate: u32,
    native_channels: u16,
    target_rate: u32,
    frame_len: usize,
}

impl CpalCapture {
    /// Open the configured input device (or the system default) at its
    /// native configuration; conversion to the pipeline rate happens in
    /// software.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = pick_input_device(&host, config.input_device.as_deref())?;

        let native = device
            .default_input_config()
            .map_err(|e| VoiceError::Audio(format!("no default input config: {e}")))?;
        let native_rate = native.sample_rate();
        let native_channels = native.channels();

        info!(
            "input device open: {} ({native_rate}Hz, {native_channels}ch -> {}Hz mono)",
            device_name(&device),
            config.sample_rate
        );

        Ok(Self {
            device,
            native_rate,
            native_channels,
            target_rate: config.sample_rate,
            frame_len: config.chunk_frames.max(1) as usize,
        })
    }

    /// Capture until cancelled, sending frame-sized chunks to `tx`.
    ///
    /// Returns normally when cancelled or when the receiver is dropped;
    /// returns `device_changed` when the stream itself fails mid-capture.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be created or started, or if
    /// the device disappears while recording.
    pub async fn run(&self, tx: mpsc::Sender<AudioChunk>, cancel: CancellationToken) -> Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<f32>>(RAW_CHANNEL_SIZE);
        let failed = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let stream_config = cpal::StreamConfig {
            channels: self.native_channels,
            sample_rate: self.native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let failed_cb = Arc::clone(&failed);
        let dropped_cb = Arc::clone(&dropped);
        let stream = self
            .device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    // Forward only; resampling and framing stay off the
                    // audio thread.
                    if let Err(mpsc::error::TrySendError::Full(_)) =
                        raw_tx.try_send(data.to_vec())
                    {
                        dropped_cb.fetch_add(1, Ordering::Relaxed);
                    }
                },
                move |err| {
                    warn!("input stream failed: {err}");
                    failed_cb.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("cannot build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("cannot start input stream: {e}")))?;
        debug!("capture running at {}Hz native", self.native_rate);

        let mut chunker = FrameChunker::new(self.frame_len);
        loop {
            if failed.load(Ordering::Relaxed) {
                return Err(VoiceError::DeviceChanged(
                    "input stream failed mid-capture".into(),
                ));
            }
            let block = tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(FAILURE_POLL) => continue,
                block = raw_rx.recv() => match block {
                    Some(block) => block,
                    None => break,
                },
            };

            let mono = if self.native_channels > 1 {
                to_mono(&block, self.native_channels)
            } else {
                block
            };
            let samples = if self.native_rate != self.target_rate {
                resample(&mono, self.native_rate, self.target_rate)
            } else {
                mono
            };

            for frame in chunker.push(&samples) {
                let chunk = AudioChunk {
                    samples: frame,
                    sample_rate: self.target_rate,
                    captured_at: Instant::now(),
                };
                if tx.send(chunk).await.is_err() {
                    // Recording loop stopped listening; a normal stop.
                    debug!("capture receiver closed");
                    return Ok(());
                }
            }
        }

        let lost = dropped.load(Ordering::Relaxed);
        if lost > 0 {
            debug!("capture stopped; {lost} raw blocks dropped under backpressure");
        } else {
            debug!("capture stopped");
        }
        Ok(())
    }

    /// List available input device names.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .input_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
            .filter_map(|d| d.description().ok())
            .map(|d| d.name().to_owned())
            .collect())
    }
}

/// Find the named input device, falling back to the system default when
/// the name is unset or no longer present.
fn pick_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    if let Some(name) = name {
        let found = host
            .input_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .is_ok_and(|desc| desc.name() == name)
            });
        match found {
            Some(device) => return Ok(device),
            None => warn!("input device '{name}' not found, using default"),
        }
    }
    host.default_input_device()
        .ok_or_else(|| VoiceError::Audio("no default input device".into()))
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_emits_exact_frames() {
        let mut chunker = FrameChunker::new(320);
        assert!(chunker.push(&[0.1; 200]).is_empty());

        // 200 pending + 500 = 700 -> two frames of 320, 60 left over.
        let frames = chunker.push(&[0.2; 500]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 320));
        assert_eq!(chunker.pending.len(), 60);
    }

    #[test]
    fn chunker_carries_remainder_across_pushes() {
        let mut chunker = FrameChunker::new(4);
        let first = chunker.push(&[1.0, 2.0, 3.0]);
        assert!(first.is_empty());
        let second = chunker.push(&[4.0, 5.0]);
        assert_eq!(second, vec![vec![1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(chunker.pending, vec![5.0]);
    }

    #[test]
    fn chunker_handles_block_larger_than_many_frames() {
        let mut chunker = FrameChunker::new(10);
        let frames = chunker.push(&[0.0; 95]);
        assert_eq!(frames.len(), 9);
        assert_eq!(chunker.pending.len(), 5);
    }

    #[test]
    fn chunker_frame_len_is_never_zero() {
        let mut chunker = FrameChunker::new(0);
        let frames = chunker.push(&[0.5, 0.5]);
        assert_eq!(frames.len(), 2);
    }
}
