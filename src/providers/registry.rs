//! Ordered, health-tracked provider registry.
//!
//! Effective priority is (configured priority, health rank, id); the id
//! tiebreak keeps ordering stable when two endpoints are otherwise equal.
//! Health transitions: any success makes an endpoint healthy and clears
//! its failure count; one failure degrades it, three mark it down. Down
//! endpoints are probed at most once per cooldown.

use super::{
    CandidateFilter, EndpointHealth, EndpointSnapshot, HealthState, ProviderEndpoint, ProviderKind,
};
use crate::config::ProvidersConfig;
use crate::error::{Result, VoiceError};
use crate::events::Clock;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failures before an endpoint is marked degraded / down.
const DEGRADED_AFTER: u32 = 1;
const DOWN_AFTER: u32 = 3;

struct Entry {
    endpoint: ProviderEndpoint,
    health: EndpointHealth,
}

/// The registry. Cheap to share; all mutation goes through interior locks
/// and readers get consistent snapshots.
pub struct ProviderRegistry {
    entries: RwLock<Vec<Entry>>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl ProviderRegistry {
    /// Build the registry from configuration. When no endpoints are
    /// configured, a default set is derived: the local Kokoro and whisper
    /// services, plus OpenAI when credentials are present.
    pub fn new(config: &ProvidersConfig, clock: Arc<dyn Clock>) -> Self {
        let mut endpoints = Vec::new();
        for entry in &config.endpoints {
            match ProviderEndpoint::from_config(entry) {
                Ok(ep) => endpoints.push(ep),
                Err(e) => warn!("skipping endpoint '{}': {e}", entry.id),
            }
        }

        if endpoints.is_empty() {
            endpoints = default_endpoints(config);
        }

        for ep in &endpoints {
            info!(
                id = %ep.id,
                kind = %ep.kind,
                base_url = %ep.base_url,
                priority = ep.priority,
                "registered provider endpoint"
            );
        }

        Self {
            entries: RwLock::new(
                endpoints
                    .into_iter()
                    .map(|endpoint| Entry {
                        endpoint,
                        health: EndpointHealth::default(),
                    })
                    .collect(),
            ),
            cooldown: Duration::from_secs(config.cooldown_s),
            clock,
        }
    }

    /// Ordered snapshot of all endpoints of a kind.
    pub fn list(&self, kind: ProviderKind) -> Vec<EndpointSnapshot> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<EndpointSnapshot> = entries
            .iter()
            .filter(|e| e.endpoint.kind == kind)
            .map(|e| EndpointSnapshot {
                endpoint: e.endpoint.clone(),
                health: e.health.clone(),
            })
            .collect();
        out.sort_by(|a, b| effective_key(&a.endpoint, a.health.state).cmp(&effective_key(&b.endpoint, b.health.state)));
        out
    }

    /// Candidates for a request, in effective priority order.
    ///
    /// # Errors
    ///
    /// Returns `no_matching_provider` when the filter (or the registry)
    /// leaves nothing to try.
    pub fn pick(&self, kind: ProviderKind, filter: &CandidateFilter) -> Result<Vec<ProviderEndpoint>> {
        let candidates: Vec<ProviderEndpoint> = self
            .list(kind)
            .into_iter()
            .filter(|s| match &filter.provider_id {
                Some(id) => s.endpoint.id == *id,
                None => true,
            })
            .filter(|s| s.endpoint.matches(filter))
            .map(|s| s.endpoint)
            .collect();

        if candidates.is_empty() {
            return Err(VoiceError::NoMatchingProvider(format!(
                "no {kind} endpoint matches voice={:?} model={:?} provider={:?}",
                filter.voice, filter.model, filter.provider_id
            )));
        }
        Ok(candidates)
    }

    /// Record a successful request against an endpoint.
    pub fn report_success(&self, id: &str, latency: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.iter_mut().find(|e| e.endpoint.id == id) {
            entry.health.state = HealthState::Healthy;
            entry.health.consecutive_failures = 0;
            entry.health.last_checked = Some(self.clock.now());
            entry.health.last_latency_ms = Some(latency.as_millis() as u64);
        }
    }

    /// Record a failed request against an endpoint.
    pub fn report_failure(&self, id: &str, detail: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.iter_mut().find(|e| e.endpoint.id == id) {
            entry.health.consecutive_failures += 1;
            entry.health.last_checked = Some(self.clock.now());
            entry.health.state = if entry.health.consecutive_failures >= DOWN_AFTER {
                HealthState::Down
            } else if entry.health.consecutive_failures >= DEGRADED_AFTER {
                HealthState::Degraded
            } else {
                entry.health.state
            };
            debug!(
                id,
                failures = entry.health.consecutive_failures,
                state = ?entry.health.state,
                "provider failure: {detail}"
            );
        }
    }

    /// Whether a down endpoint is due for a probe. Non-down endpoints are
    /// always probeable.
    pub fn due_for_probe(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.iter().find(|e| e.endpoint.id == id) else {
            return false;
        };
        if entry.health.state != HealthState::Down {
            return true;
        }
        match entry.health.last_checked {
            Some(checked) => {
                let elapsed = self.clock.now().signed_duration_since(checked);
                elapsed.to_std().map(|d| d >= self.cooldown).unwrap_or(true)
            }
            None => true,
        }
    }

    /// Add an endpoint at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already registered.
    pub fn register(&self, endpoint: ProviderEndpoint) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|e| e.endpoint.id == endpoint.id) {
            return Err(VoiceError::InvalidRequest(format!(
                "endpoint '{}' already registered",
                endpoint.id
            )));
        }
        info!(id = %endpoint.id, kind = %endpoint.kind, "endpoint registered at runtime");
        entries.push(Entry {
            endpoint,
            health: EndpointHealth::default(),
        });
        Ok(())
    }

    /// Remove an endpoint. Returns whether anything was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.endpoint.id != id);
        entries.len() < before
    }

    /// Force a health probe of one endpoint (or all when `id` is `None`).
    ///
    /// The probe is the cheapest request the endpoint kind supports: a
    /// one-character synthesis for TTS, an empty-audio transcription for
    /// STT (where a well-formed error counts as alive).
    pub async fn refresh(
        &self,
        client: &reqwest::Client,
        id: Option<&str>,
        timeout: Duration,
    ) -> Vec<(String, HealthState)> {
        let targets: Vec<ProviderEndpoint> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .filter(|e| id.is_none_or(|want| e.endpoint.id == want))
                .map(|e| e.endpoint.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(targets.len());
        for endpoint in targets {
            if !self.due_for_probe(&endpoint.id) {
                debug!(id = %endpoint.id, "skipping probe: cooldown");
                continue;
            }
            let started = std::time::Instant::now();
            let outcome = match endpoint.kind {
                ProviderKind::Tts => super::tts::probe(client, &endpoint, timeout).await,
                ProviderKind::Stt => super::stt::probe(client, &endpoint, timeout).await,
            };
            match outcome {
                Ok(()) => self.report_success(&endpoint.id, started.elapsed()),
                Err(e) => self.report_failure(&endpoint.id, &e.to_string()),
            }
            let state = {
                let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
                entries
                    .iter()
                    .find(|e| e.endpoint.id == endpoint.id)
                    .map(|e| e.health.state)
                    .unwrap_or_default()
            };
            results.push((endpoint.id, state));
        }
        results
    }
}

/// Composite sort key implementing effective priority.
fn effective_key(endpoint: &ProviderEndpoint, state: HealthState) -> (i32, u8, String) {
    (endpoint.priority, state.rank(), endpoint.id.clone())
}

/// Default endpoint set: local services first, OpenAI as fallback when
/// credentials exist.
fn default_endpoints(config: &ProvidersConfig) -> Vec<ProviderEndpoint> {
    let mut endpoints = vec![
        ProviderEndpoint {
            id: "kokoro-local".into(),
            kind: ProviderKind::Tts,
            base_url: "http://127.0.0.1:8880/v1".into(),
            auth_token: None,
            priority: 10,
            capabilities: Default::default(),
        },
        ProviderEndpoint {
            id: "whisper-local".into(),
            kind: ProviderKind::Stt,
            base_url: "http://127.0.0.1:2022/v1".into(),
            auth_token: None,
            priority: 10,
            capabilities: Default::default(),
        },
    ];

    if let Some(key) = &config.openai_api_key {
        let base = config.openai_base_url.trim_end_matches('/').to_owned();
        endpoints.push(ProviderEndpoint {
            id: "openai-tts".into(),
            kind: ProviderKind::Tts,
            base_url: base.clone(),
            auth_token: Some(key.clone()),
            priority: 20,
            capabilities: Default::default(),
        });
        endpoints.push(ProviderEndpoint {
            id: "openai-stt".into(),
            kind: ProviderKind::Stt,
            base_url: base,
            auth_token: Some(key.clone()),
            priority: 20,
            capabilities: Default::default(),
        });
    }

    endpoints
}
