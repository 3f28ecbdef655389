//! Centralized filesystem paths for the voicemode server.
//!
//! Single source of truth for every path under the voicemode home
//! directory. All persisted state lives under `~/.voicemode/`:
//!
//! | Purpose | Path |
//! |---------|------|
//! | Event log | `~/.voicemode/logs/events-YYYYMMDD.jsonl` |
//! | Service state | `~/.voicemode/services/<name>/` |
//! | Whisper models | `~/.voicemode/services/whisper/models/` |
//! | Pronunciation rules | `~/.voicemode/config/pronunciation.yaml` |
//! | Debug audio | `~/.voicemode/audio/` |
//!
//! The root is overridable with the `VOICEMODE_HOME` environment variable,
//! which tests use to point at a temp directory.

use std::path::PathBuf;

/// Voicemode home directory (`~/.voicemode` or `$VOICEMODE_HOME`).
#[must_use]
pub fn home_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VOICEMODE_HOME") {
        return PathBuf::from(override_dir);
    }
    dirs::home_dir()
        .map(|d| d.join(".voicemode"))
        .unwrap_or_else(|| PathBuf::from("/tmp/voicemode"))
}

/// Event log and tracing log directory (`home_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    home_dir().join("logs")
}

/// Config directory (`home_dir()/config/`).
#[must_use]
pub fn config_dir() -> PathBuf {
    home_dir().join("config")
}

/// Main config file path (`home_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    home_dir().join("config.toml")
}

/// User pronunciation rules (`config_dir()/pronunciation.yaml`).
#[must_use]
pub fn pronunciation_file() -> PathBuf {
    config_dir().join("pronunciation.yaml")
}

/// Root for all managed services (`home_dir()/services/`).
#[must_use]
pub fn services_dir() -> PathBuf {
    home_dir().join("services")
}

/// Per-service directory (`services_dir()/<name>/`).
#[must_use]
pub fn service_dir(name: &str) -> PathBuf {
    services_dir().join(name)
}

/// Per-service log directory (`service_dir(name)/logs/`).
#[must_use]
pub fn service_logs_dir(name: &str) -> PathBuf {
    service_dir(name).join("logs")
}

/// Whisper model storage (`services/whisper/models/`).
#[must_use]
pub fn whisper_models_dir() -> PathBuf {
    service_dir("whisper").join("models")
}

/// Sentinel file holding the active whisper model name.
#[must_use]
pub fn whisper_active_model_file() -> PathBuf {
    whisper_models_dir().join("active")
}

/// Debug audio directory (`home_dir()/audio/`), used when audio saving
/// is enabled.
#[must_use]
pub fn audio_dir() -> PathBuf {
    home_dir().join("audio")
}
