//! Speech provider endpoints: types, registry, and HTTP clients.
//!
//! Providers are OpenAI-compatible HTTP endpoints, local (Kokoro, the
//! whisper server) or remote. The registry owns the ordered endpoint set
//! and its live health; the clients speak the `/audio/speech` and
//! `/audio/transcriptions` shapes.

pub mod registry;
pub mod stt;
pub mod tts;

use crate::config::EndpointConfig;
use crate::error::{Result, VoiceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Endpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Tts,
    Stt,
}

impl std::str::FromStr for ProviderKind {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tts" => Ok(Self::Tts),
            "stt" => Ok(Self::Stt),
            other => Err(VoiceError::InvalidRequest(format!(
                "provider kind must be 'tts' or 'stt', got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tts => "tts",
            Self::Stt => "stt",
        })
    }
}

/// Live health classification of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Down,
}

impl HealthState {
    /// Sort rank within equal configured priority: healthy endpoints
    /// first, then untried, then degraded, then down.
    pub fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Down => 3,
        }
    }
}

/// Advertised endpoint capabilities. Empty sets accept any request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub voices: Vec<String>,
    pub models: Vec<String>,
    pub formats: Vec<String>,
}

impl Capabilities {
    /// Whether an explicit requested value passes this capability set.
    fn admits(set: &[String], requested: Option<&str>) -> bool {
        match requested {
            None => true,
            Some(value) => set.is_empty() || set.iter().any(|v| v == value),
        }
    }
}

/// A provider endpoint as configured plus its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub priority: i32,
    pub capabilities: Capabilities,
}

impl ProviderEndpoint {
    /// Build from a config entry.
    ///
    /// # Errors
    ///
    /// Returns an error when the kind string or id is invalid.
    pub fn from_config(config: &EndpointConfig) -> Result<Self> {
        if config.id.is_empty() {
            return Err(VoiceError::Config("endpoint id required".into()));
        }
        Ok(Self {
            id: config.id.clone(),
            kind: config.kind.parse()?,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth_token: config.auth_token.clone(),
            priority: config.priority,
            capabilities: Capabilities {
                voices: config.voices.clone(),
                models: config.models.clone(),
                formats: config.formats.clone(),
            },
        })
    }

    /// Whether this endpoint can serve a request with the given explicit
    /// voice/model/format constraints.
    pub fn matches(&self, filter: &CandidateFilter) -> bool {
        Capabilities::admits(&self.capabilities.voices, filter.voice.as_deref())
            && Capabilities::admits(&self.capabilities.models, filter.model.as_deref())
            && Capabilities::admits(&self.capabilities.formats, filter.format.as_deref())
    }
}

/// Capability constraints taken from a converse request.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    /// Restrict to a named provider id.
    pub provider_id: Option<String>,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub format: Option<String>,
}

/// Health bookkeeping for one endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub state: HealthState,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Most recent successful request latency, milliseconds.
    pub last_latency_ms: Option<u64>,
}

/// Read-only view of an endpoint and its health, as returned over RPC.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    #[serde(flatten)]
    pub endpoint: ProviderEndpoint,
    pub health: EndpointHealth,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(voices: &[&str]) -> ProviderEndpoint {
        ProviderEndpoint {
            id: "test".into(),
            kind: ProviderKind::Tts,
            base_url: "http://127.0.0.1:1/v1".into(),
            auth_token: None,
            priority: 10,
            capabilities: Capabilities {
                voices: voices.iter().map(|s| (*s).to_owned()).collect(),
                models: Vec::new(),
                formats: Vec::new(),
            },
        }
    }

    #[test]
    fn empty_capability_set_admits_anything() {
        let ep = endpoint(&[]);
        let filter = CandidateFilter {
            voice: Some("nova".into()),
            ..CandidateFilter::default()
        };
        assert!(ep.matches(&filter));
    }

    #[test]
    fn explicit_voice_filters_capabilities() {
        let ep = endpoint(&["af_sky", "af_bella"]);
        let ok = CandidateFilter {
            voice: Some("af_sky".into()),
            ..CandidateFilter::default()
        };
        let missing = CandidateFilter {
            voice: Some("nova".into()),
            ..CandidateFilter::default()
        };
        assert!(ep.matches(&ok));
        assert!(!ep.matches(&missing));
    }

    #[test]
    fn no_constraints_always_match() {
        let ep = endpoint(&["af_sky"]);
        assert!(ep.matches(&CandidateFilter::default()));
    }

    #[test]
    fn health_rank_orders_states() {
        assert!(HealthState::Healthy.rank() < HealthState::Unknown.rank());
        assert!(HealthState::Unknown.rank() < HealthState::Degraded.rank());
        assert!(HealthState::Degraded.rank() < HealthState::Down.rank());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = EndpointConfig {
            id: "x".into(),
            kind: "stt".into(),
            base_url: "http://127.0.0.1:2022/v1/".into(),
            ..EndpointConfig::default()
        };
        let ep = ProviderEndpoint::from_config(&config).unwrap();
        assert_eq!(ep.base_url, "http://127.0.0.1:2022/v1");
        assert_eq!(ep.kind, ProviderKind::Stt);
    }
}
