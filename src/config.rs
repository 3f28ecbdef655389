//! Configuration types for the voicemode server.
//!
//! Loaded from `$VOICEMODE_HOME/config.toml` when present, then overlaid
//! with the recognized `VOICEMODE_*` / `OPENAI_*` / `LIVEKIT_*` environment
//! variables. Every section defaults sensibly so a missing file is legal.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Conversation engine settings (timeouts, concurrency).
    pub converse: ConverseConfig,
    /// Text-to-speech defaults.
    pub tts: TtsConfig,
    /// Speech-to-text defaults.
    pub stt: SttConfig,
    /// Provider endpoints and health policy.
    pub providers: ProvidersConfig,
    /// Managed service settings.
    pub services: ServicesConfig,
    /// Pronunciation rule settings.
    pub pronunciation: PronunciationConfig,
    /// Room (LiveKit) transport settings.
    pub room: RoomConfig,
    /// Request surface settings.
    pub rpc: RpcConfig,
    /// Save per-session TTS/STT audio under `~/.voicemode/audio/`.
    pub save_audio: bool,
    /// Verbose logging default.
    pub debug: bool,
}

impl VoiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VoiceError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| VoiceError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Load from the default location, falling back to defaults when the
    /// file is absent, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = crate::voice_dirs::config_file();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay the recognized environment variables onto this config.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VOICEMODE_DEBUG") {
            self.debug = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("VOICEMODE_SAVE_AUDIO") {
            self.save_audio = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("VOICEMODE_AUDIO_FORMAT") {
            match v.as_str() {
                "opus" | "mp3" | "wav" => self.tts.format = v,
                other => tracing::warn!("ignoring unknown VOICEMODE_AUDIO_FORMAT '{other}'"),
            }
        }
        if let Ok(v) = std::env::var("VOICEMODE_AUTO_START_KOKORO") {
            self.services.auto_start_kokoro = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("VOICEMODE_PRONUNCIATION_ENABLED") {
            self.pronunciation.enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("VOICEMODE_PRONUNCIATION_LOG_SUBSTITUTIONS") {
            self.pronunciation.log_substitutions = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("VOICEMODE_PRONUNCIATION_CONFIG") {
            self.pronunciation.extra_paths = v
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(v) = std::env::var("VOICEMODE_TOOLS_ENABLED") {
            self.rpc.tools_enabled = split_list(&v);
        }
        if let Ok(v) = std::env::var("VOICEMODE_TOOLS_DISABLED") {
            self.rpc.tools_disabled = split_list(&v);
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            self.providers.openai_base_url = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.providers.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("LIVEKIT_URL") {
            self.room.url = v;
        }
        if let Ok(v) = std::env::var("LIVEKIT_API_KEY") {
            self.room.api_key = v;
        }
        if let Ok(v) = std::env::var("LIVEKIT_API_SECRET") {
            self.room.api_secret = v;
        }
    }
}

/// Parse the boolean shapes accepted in env vars.
fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Split a comma-separated method list.
fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Canonical pipeline sample rate in Hz.
    pub sample_rate: u32,
    /// Capture chunk size in frames at the pipeline rate.
    pub chunk_frames: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Bound on buffered, not-yet-played audio in milliseconds.
    pub playback_buffer_ms: u32,
    /// Device topology poll interval in seconds.
    pub device_poll_s: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_frames: 320, // 20ms at 16kHz, matches the VAD frame
            input_device: None,
            output_device: None,
            playback_buffer_ms: 1_500,
            device_poll_s: 2,
        }
    }
}

/// Voice activity detection configuration.
///
/// The thresholds here are provisional defaults; every deployment is
/// expected to tune them via config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Analysis frame length in milliseconds.
    pub frame_ms: u32,
    /// High-pass cutoff applied before the energy test, in Hz.
    pub highpass_hz: f32,
    /// RMS energy threshold separating speech from silence.
    pub threshold: f32,
    /// Continuous sub-threshold tail that ends a recording, in ms.
    pub silence_tail_ms: u32,
    /// Minimum above-threshold audio before the tail can trigger, in ms.
    pub min_speech_ms: u32,
    /// Hard cap on a single listen, in seconds.
    pub max_listen_s: f32,
    /// Extra time granted when silence triggers before any speech, in seconds.
    pub initial_grace_s: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            highpass_hz: 80.0,
            threshold: 0.01,
            silence_tail_ms: 800,
            min_speech_ms: 300,
            max_listen_s: 60.0,
            initial_grace_s: 3.0,
        }
    }
}

/// Conversation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverseConfig {
    /// Playback starts once this much decoded audio is buffered, in ms.
    pub min_prebuffer_ms: u32,
    /// Timeout for a single provider attempt, in seconds.
    pub per_attempt_timeout_s: f32,
    /// Timeout for the first TTS byte, in seconds.
    pub tts_first_byte_timeout_s: f32,
    /// Total STT timeout, in seconds.
    pub stt_total_timeout_s: f32,
    /// TTFA allowance folded into the overall session deadline, in seconds.
    pub ttfa_budget_s: f32,
    /// Global cap on concurrent converse sessions.
    pub max_concurrent_sessions: usize,
}

impl Default for ConverseConfig {
    fn default() -> Self {
        Self {
            min_prebuffer_ms: 150,
            per_attempt_timeout_s: 15.0,
            tts_first_byte_timeout_s: 8.0,
            stt_total_timeout_s: 30.0,
            ttfa_budget_s: 8.0,
            max_concurrent_sessions: 4,
        }
    }
}

/// Text-to-speech defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Default voice name when the request does not specify one.
    pub voice: String,
    /// Default TTS model.
    pub model: String,
    /// Wire format requested from providers: opus, mp3, or wav.
    pub format: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_owned(),
            model: "tts-1".to_owned(),
            format: "opus".to_owned(),
        }
    }
}

/// Speech-to-text defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Default STT model.
    pub model: String,
    /// Optional language hint (ISO-639-1).
    pub language: Option<String>,
    /// Upload format for captured audio: opus, mp3, or wav.
    pub upload_format: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_owned(),
            language: None,
            upload_format: "opus".to_owned(),
        }
    }
}

/// A configured provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Stable identifier (used in tie-breaks and RPC output).
    pub id: String,
    /// "tts" or "stt".
    pub kind: String,
    /// OpenAI-compatible base URL, e.g. `http://127.0.0.1:8880/v1`.
    pub base_url: String,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Lower tries first.
    pub priority: i32,
    /// Advertised voices (empty = accept any request).
    pub voices: Vec<String>,
    /// Advertised models (empty = accept any request).
    pub models: Vec<String>,
    /// Supported wire formats (empty = all of opus/mp3/wav).
    pub formats: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: "tts".to_owned(),
            base_url: String::new(),
            auth_token: None,
            priority: 100,
            voices: Vec::new(),
            models: Vec::new(),
            formats: Vec::new(),
        }
    }
}

/// Provider registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Explicitly configured endpoints. When empty, the default set is
    /// derived from the local services plus the OpenAI credentials.
    pub endpoints: Vec<EndpointConfig>,
    /// Minimum interval between probes of a `down` endpoint, in seconds.
    pub cooldown_s: u64,
    /// Base URL used for the derived OpenAI endpoints.
    pub openai_base_url: String,
    /// API key used for the derived OpenAI endpoints.
    pub openai_api_key: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            cooldown_s: 60,
            openai_base_url: "https://api.openai.com/v1".to_owned(),
            openai_api_key: None,
        }
    }
}

/// Per-service supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntryConfig {
    /// TCP port the service listens on.
    pub port: u16,
    /// Restart automatically after three failed health checks.
    pub auto_restart: bool,
}

/// Service supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Whisper STT server.
    pub whisper: ServiceEntryConfig,
    /// Kokoro TTS server.
    pub kokoro: ServiceEntryConfig,
    /// LiveKit server.
    pub livekit: ServiceEntryConfig,
    /// Static web frontend.
    pub frontend: ServiceEntryConfig,
    /// Health probe interval, in seconds.
    pub health_interval_s: u64,
    /// Grace period between SIGTERM and hard kill, in seconds.
    pub stop_grace_s: u64,
    /// Start Kokoro eagerly at engine boot.
    pub auto_start_kokoro: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            whisper: ServiceEntryConfig {
                port: 2022,
                auto_restart: false,
            },
            kokoro: ServiceEntryConfig {
                port: 8880,
                auto_restart: false,
            },
            livekit: ServiceEntryConfig {
                port: 7880,
                auto_restart: false,
            },
            frontend: ServiceEntryConfig {
                port: 3000,
                auto_restart: false,
            },
            health_interval_s: 5,
            stop_grace_s: 10,
            auto_start_kokoro: false,
        }
    }
}

impl Default for ServiceEntryConfig {
    fn default() -> Self {
        Self {
            port: 0,
            auto_restart: false,
        }
    }
}

/// Pronunciation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PronunciationConfig {
    /// Master switch for pre-TTS / post-STT substitutions.
    pub enabled: bool,
    /// Log each applied rule with before/after text.
    pub log_substitutions: bool,
    /// Additional rule files layered after the user file.
    pub extra_paths: Vec<PathBuf>,
}

impl Default for PronunciationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_substitutions: false,
            extra_paths: Vec::new(),
        }
    }
}

/// Room (LiveKit) transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// LiveKit server URL (`ws://` or `wss://`).
    pub url: String,
    /// API key for token minting.
    pub api_key: String,
    /// API secret for token minting.
    pub api_secret: String,
    /// Room name joined by the server participant.
    pub room_name: String,
    /// Token validity in seconds.
    pub token_ttl_s: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7880".to_owned(),
            api_key: String::new(),
            api_secret: String::new(),
            room_name: "voicemode".to_owned(),
            token_ttl_s: 3_600,
        }
    }
}

/// Request surface configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Allow-list of method names; empty allows everything not denied.
    pub tools_enabled: Vec<String>,
    /// Deny-list of method names, applied after the allow-list.
    pub tools_disabled: Vec<String>,
}
