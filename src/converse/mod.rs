//! The conversation engine: request/response types and the state machine
//! sequencing speak → listen → transcribe.

pub mod engine;

use crate::error::VoiceError;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};

/// Default listen window when the request does not set one.
const DEFAULT_LISTEN_DURATION_S: f32 = 30.0;

/// One converse invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConverseRequest {
    /// Text to speak. Empty is legal (pure listen).
    pub message: String,
    /// Record and transcribe a reply after speaking.
    pub wait_for_response: bool,
    /// Listen window in seconds; ignored when not waiting.
    pub listen_duration_s: f32,
    /// Which audio medium to use.
    pub transport: TransportKind,
    /// Explicit voice; filters TTS candidates.
    pub voice: Option<String>,
    /// Explicit TTS model; filters TTS candidates.
    pub model: Option<String>,
    /// Pin the TTS endpoint by id.
    pub tts_provider: Option<String>,
    /// Pin the STT endpoint by id.
    pub stt_provider: Option<String>,
    /// Caller identity for busy detection; one converse per caller.
    pub caller_id: Option<String>,
}

impl Default for ConverseRequest {
    fn default() -> Self {
        Self {
            message: String::new(),
            wait_for_response: true,
            listen_duration_s: DEFAULT_LISTEN_DURATION_S,
            transport: TransportKind::Auto,
            voice: None,
            model: None,
            tts_provider: None,
            stt_provider: None,
            caller_id: None,
        }
    }
}

impl ConverseRequest {
    /// Validate argument ranges.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for out-of-range values.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.listen_duration_s.is_finite() || self.listen_duration_s < 0.0 {
            return Err(VoiceError::InvalidRequest(format!(
                "listen_duration_s must be >= 0, got {}",
                self.listen_duration_s
            )));
        }
        Ok(())
    }
}

/// Phase timings, seconds. Phases that never ran stay `None`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfa: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_gen: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_play: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<f64>,
}

/// Which endpoints actually served the request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvidersUsed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<String>,
}

/// Error payload in a failed response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub detail: String,
}

/// Result of one converse invocation. Partial results are preserved:
/// a failure after TTS still reports the TTS timings.
#[derive(Debug, Clone, Serialize)]
pub struct ConverseResponse {
    pub session_id: String,
    /// Transcript of the reply; empty when not waiting.
    pub transcript: String,
    pub timing: Timing,
    pub provider_used: ProvidersUsed,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Engine status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active_sessions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
}
