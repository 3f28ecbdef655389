//! Error types for the voicemode server.
//!
//! Every error maps to a stable kind string that is identical across the
//! RPC binding and the event log, so clients can match on `error.kind`
//! without parsing prose.

use serde::{Deserialize, Serialize};

/// Stable error taxonomy exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed arguments or out-of-range values.
    InvalidRequest,
    /// A converse is already active for this caller.
    Busy,
    /// The capability filter excluded every endpoint.
    NoMatchingProvider,
    /// All candidate endpoints failed for this request.
    ProviderExhausted,
    /// Listening ended without any above-threshold frames.
    NoSpeechDetected,
    /// An audio device disappeared mid-operation.
    DeviceChanged,
    /// A per-attempt or overall timeout elapsed.
    DeadlineExceeded,
    /// The client requested cancellation.
    Cancelled,
    /// A managed service is required but not running or unhealthy.
    ServiceUnavailable,
    /// Unexpected invariant violation.
    Internal,
}

impl ErrorKind {
    /// The wire representation used in RPC errors and event data.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Busy => "busy",
            Self::NoMatchingProvider => "no_matching_provider",
            Self::ProviderExhausted => "provider_exhausted",
            Self::NoSpeechDetected => "no_speech_detected",
            Self::DeviceChanged => "device_changed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Internal => "internal",
        }
    }

    /// JSON-RPC error code for this kind.
    pub fn rpc_code(self) -> i64 {
        match self {
            Self::InvalidRequest => -32602,
            Self::Busy => -32001,
            Self::NoMatchingProvider => -32002,
            Self::ProviderExhausted => -32003,
            Self::NoSpeechDetected => -32004,
            Self::DeviceChanged => -32005,
            Self::DeadlineExceeded => -32006,
            Self::Cancelled => -32007,
            Self::ServiceUnavailable => -32008,
            Self::Internal => -32603,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the voice conversation server.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Malformed arguments or out-of-range values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A converse is already in flight for this caller.
    #[error("busy: {0}")]
    Busy(String),

    /// The voice/model/format filter excluded every endpoint.
    #[error("no matching provider: {0}")]
    NoMatchingProvider(String),

    /// Every candidate endpoint failed for this request.
    #[error("provider exhausted: {0}")]
    ProviderExhausted(String),

    /// Listening ended without detecting speech.
    #[error("no speech detected")]
    NoSpeechDetected,

    /// An audio device disappeared and the operation cannot continue.
    #[error("audio device changed: {0}")]
    DeviceChanged(String),

    /// A timeout elapsed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The session was cancelled by the client.
    #[error("cancelled")]
    Cancelled,

    /// A managed service is required but unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Encode/decode or resampling error.
    #[error("codec error: {0}")]
    Codec(String),

    /// A single provider attempt failed (recovered by failover).
    #[error("provider error: {0}")]
    Provider(String),

    /// Transport (local or room) error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Pronunciation rule loading error.
    #[error("pronunciation error: {0}")]
    Pronounce(String),

    /// Service lifecycle error.
    #[error("service error: {0}")]
    Service(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VoiceError {
    /// Map this error to its stable taxonomy kind.
    ///
    /// Carrier variants that never cross the RPC boundary directly
    /// (audio, codec, provider, ...) collapse to `internal`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Busy(_) => ErrorKind::Busy,
            Self::NoMatchingProvider(_) => ErrorKind::NoMatchingProvider,
            Self::ProviderExhausted(_) => ErrorKind::ProviderExhausted,
            Self::NoSpeechDetected => ErrorKind::NoSpeechDetected,
            Self::DeviceChanged(_) => ErrorKind::DeviceChanged,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Audio(_)
            | Self::Codec(_)
            | Self::Provider(_)
            | Self::Transport(_)
            | Self::Pronounce(_)
            | Self::Service(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
