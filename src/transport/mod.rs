//! Audio transports: the concrete medium carrying played and captured
//! audio. Local uses the machine's devices; Room joins a LiveKit room.
//!
//! The conversation engine depends only on the [`Transport`] trait, so
//! tests drive it with scripted mock transports.

pub mod local;
pub mod room;

use crate::audio::AudioChunk;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transport selection in a converse request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Microphone and speakers on this machine.
    Local,
    /// A LiveKit room.
    Room,
    /// Room when a live room session is joined, otherwise local.
    #[default]
    Auto,
}

impl std::str::FromStr for TransportKind {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "room" => Ok(Self::Room),
            "auto" => Ok(Self::Auto),
            other => Err(VoiceError::InvalidRequest(format!(
                "transport must be local, room, or auto; got '{other}'"
            ))),
        }
    }
}

/// One concrete audio medium.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable name for event data ("local" / "room").
    fn name(&self) -> &'static str;

    /// Play mono f32 PCM frames arriving on `rx` at `sample_rate`.
    /// Returns once the final frame has drained, or early on cancel.
    async fn play(
        &self,
        rx: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Begin capturing; chunks arrive on the returned channel until the
    /// token is cancelled.
    async fn start_capture(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<AudioChunk>>;
}
