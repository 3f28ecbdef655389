//! Voicemode: a voice conversation server.
//!
//! Mediates in real time between a text-oriented assistant client and a
//! pair of speech services. One `converse` request synthesizes speech,
//! plays it, records the spoken reply, transcribes it, and returns the
//! transcript.
//!
//! # Architecture
//!
//! - **Providers**: ordered, health-checked OpenAI-compatible TTS/STT
//!   endpoints with failover
//! - **Audio**: cpal capture/playback, opus/mp3/wav codecs, 16 kHz mono
//!   canonical PCM
//! - **Engine**: the speak → listen → transcribe state machine with
//!   cancellation and timeouts
//! - **Events**: append-only JSONL log; statistics are derived, never
//!   stored
//! - **Supervisor**: lifecycle of the whisper/kokoro/livekit/frontend
//!   services
//! - **RPC**: line-delimited JSON-RPC 2.0 over stdio

pub mod audio;
pub mod config;
pub mod converse;
pub mod error;
pub mod events;
pub mod pronounce;
pub mod providers;
pub mod rpc;
pub mod services;
pub mod transport;
pub mod vad;
pub mod voice_dirs;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::VoiceConfig;
pub use converse::engine::ConversationEngine;
pub use converse::{ConverseRequest, ConverseResponse};
pub use error::{ErrorKind, Result, VoiceError};
