//! Managed local services: whisper, kokoro, livekit, and the static
//! frontend. The supervisor owns their lifecycle; everyone else reads
//! snapshots.

pub mod install;
pub mod supervisor;
pub mod templates;
pub mod whisper_models;

use crate::error::{Result, VoiceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four managed services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Whisper,
    Kokoro,
    Livekit,
    Frontend,
}

impl ServiceName {
    pub const ALL: [Self; 4] = [Self::Whisper, Self::Kokoro, Self::Livekit, Self::Frontend];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whisper => "whisper",
            Self::Kokoro => "kokoro",
            Self::Livekit => "livekit",
            Self::Frontend => "frontend",
        }
    }

    /// Binary looked up when no installed copy exists under the service
    /// directory.
    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Whisper => "whisper-server",
            Self::Kokoro => "kokoro",
            Self::Livekit => "livekit-server",
            Self::Frontend => "voicemode-frontend",
        }
    }

    /// Health endpoint path on the service's port.
    pub fn health_path(self) -> &'static str {
        match self {
            Self::Whisper | Self::Kokoro => "/health",
            Self::Livekit | Self::Frontend => "/",
        }
    }
}

impl std::str::FromStr for ServiceName {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "whisper" => Ok(Self::Whisper),
            "kokoro" => Ok(Self::Kokoro),
            "livekit" => Ok(Self::Livekit),
            "frontend" => Ok(Self::Frontend),
            other => Err(VoiceError::InvalidRequest(format!(
                "unknown service '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-owned state for one service. At most one record exists per
/// name at any instant.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub name: ServiceName,
    pub pid: Option<u32>,
    pub port: u16,
    pub binary_path: Option<String>,
    pub config_path: Option<String>,
    pub enabled: bool,
    pub last_start: Option<DateTime<Utc>>,
    pub last_exit: Option<DateTime<Utc>>,
    pub installed_version: Option<String>,
    pub service_file_version: Option<String>,
    /// Consecutive failed health probes.
    pub failed_probes: u32,
}

impl ServiceRecord {
    pub fn new(name: ServiceName, port: u16) -> Self {
        Self {
            name,
            pid: None,
            port,
            binary_path: None,
            config_path: None,
            enabled: false,
            last_start: None,
            last_exit: None,
            installed_version: None,
            service_file_version: None,
            failed_probes: 0,
        }
    }
}

/// Health classification reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Stopped,
}

/// Point-in-time status for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: ServiceName,
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub health: ServiceHealth,
}
