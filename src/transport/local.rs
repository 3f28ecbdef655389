//! Local transport: system microphone and speakers.
//!
//! Devices are opened per operation rather than held across sessions, so
//! a device that changed between converse calls is picked up on the next
//! one without explicit reinitialization.

use super::Transport;
use crate::audio::AudioChunk;
use crate::audio::capture::CpalCapture;
use crate::audio::playback::CpalPlayback;
use crate::config::AudioConfig;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Capture channel depth: about two seconds of 20 ms chunks.
const CAPTURE_CHANNEL_SIZE: usize = 100;

/// Transport backed by the machine's audio devices.
pub struct LocalTransport {
    audio: AudioConfig,
}

impl LocalTransport {
    pub fn new(audio: AudioConfig) -> Self {
        Self { audio }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn play(
        &self,
        rx: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut playback = CpalPlayback::new(&self.audio)?;
        playback.play_stream(rx, sample_rate, cancel).await
    }

    async fn start_capture(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<AudioChunk>> {
        let capture = CpalCapture::new(&self.audio)?;
        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);
        tokio::spawn(async move {
            if let Err(e) = capture.run(tx, cancel).await {
                warn!("capture stopped with error: {e}");
            }
        });
        Ok(rx)
    }
}
