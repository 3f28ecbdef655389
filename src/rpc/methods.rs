//! The RPC method table.
//!
//! Every method name maps to a typed handler here; the allow/deny lists
//! from configuration are applied before dispatch. Anything not in the
//! table is `method not found`.

use super::{METHOD_NOT_FOUND, RpcError};
use crate::config::{EndpointConfig, RpcConfig};
use crate::converse::ConverseRequest;
use crate::converse::engine::ConversationEngine;
use crate::error::{Result, VoiceError};
use crate::events::{self, Clock};
use crate::pronounce::{Direction, PronounceManager, RuleSpec};
use crate::providers::registry::ProviderRegistry;
use crate::providers::{ProviderEndpoint, ProviderKind};
use crate::services::supervisor::ServiceSupervisor;
use crate::services::{ServiceName, install, whisper_models};
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Probe timeout used by `registry.refresh`.
const REFRESH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// All dispatchable method names, used to validate allow/deny lists.
const METHODS: &[&str] = &[
    "converse",
    "cancel",
    "status",
    "service.status",
    "service.start",
    "service.stop",
    "service.restart",
    "service.enable",
    "service.disable",
    "service.logs",
    "service.install",
    "service.uninstall",
    "registry.list",
    "registry.refresh",
    "registry.register",
    "registry.unregister",
    "statistics.summary",
    "pronounce.list",
    "pronounce.add",
    "pronounce.remove",
    "pronounce.enable",
    "pronounce.disable",
    "pronounce.test",
    "pronounce.reload",
    "whisper.model.list",
    "whisper.model.active",
    "whisper.model.set",
];

/// Shared handler behind the stdio server.
pub struct RpcHandler {
    engine: Arc<ConversationEngine>,
    registry: Arc<ProviderRegistry>,
    supervisor: Arc<ServiceSupervisor>,
    pronounce: Arc<RwLock<PronounceManager>>,
    clock: Arc<dyn Clock>,
    rpc_config: RpcConfig,
    client: reqwest::Client,
}

impl RpcHandler {
    pub fn new(
        engine: Arc<ConversationEngine>,
        registry: Arc<ProviderRegistry>,
        supervisor: Arc<ServiceSupervisor>,
        pronounce: Arc<RwLock<PronounceManager>>,
        clock: Arc<dyn Clock>,
        rpc_config: RpcConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            supervisor,
            pronounce,
            clock,
            rpc_config,
            client: reqwest::Client::new(),
        }
    }

    /// Apply the allow-list, then the deny-list.
    pub fn method_allowed(&self, method: &str) -> bool {
        if !METHODS.contains(&method) {
            return false;
        }
        if !self.rpc_config.tools_enabled.is_empty()
            && !self.rpc_config.tools_enabled.iter().any(|m| m == method)
        {
            return false;
        }
        !self.rpc_config.tools_disabled.iter().any(|m| m == method)
    }

    /// Dispatch one method call.
    ///
    /// # Errors
    ///
    /// Returns a JSON-RPC error for unknown/denied methods or failed
    /// handlers.
    pub async fn dispatch(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        if !self.method_allowed(method) {
            return Err(RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("method '{method}' not available"),
                data: None,
            });
        }
        self.dispatch_inner(method, params)
            .await
            .map_err(|e| RpcError::from(&e))
    }

    async fn dispatch_inner(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "converse" => {
                let request: ConverseRequest = parse(params)?;
                let response = self.engine.converse(request).await;
                to_value(&response)
            }
            "cancel" => {
                #[derive(Deserialize)]
                struct Params {
                    session_id: String,
                }
                let p: Params = parse(params)?;
                Ok(json!({"cancelled": self.engine.cancel(&p.session_id)}))
            }
            "status" => to_value(&self.engine.status()),

            "service.status" => {
                let name = service_name(params)?;
                to_value(&self.supervisor.status(name).await)
            }
            "service.start" => {
                let name = service_name(params)?;
                to_value(&self.supervisor.start(name).await?)
            }
            "service.stop" => {
                let name = service_name(params)?;
                Ok(json!({"stopped": self.supervisor.stop(name).await?}))
            }
            "service.restart" => {
                let name = service_name(params)?;
                to_value(&self.supervisor.restart(name).await?)
            }
            "service.enable" => {
                let name = service_name(params)?;
                self.supervisor.enable(name)?;
                Ok(json!({"enabled": true}))
            }
            "service.disable" => {
                let name = service_name(params)?;
                Ok(json!({"disabled": self.supervisor.disable(name)?}))
            }
            "service.logs" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                    #[serde(default = "default_log_lines")]
                    lines: usize,
                }
                let p: Params = parse(params)?;
                let name = ServiceName::from_str(&p.name)?;
                Ok(json!({"lines": self.supervisor.logs(name, p.lines)?}))
            }
            "service.install" => {
                let name = service_name(params)?;
                install::install(name, &self.client, &install::PathProbe).await?;
                Ok(json!({"installed": true}))
            }
            "service.uninstall" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                    #[serde(default)]
                    purge: bool,
                }
                let p: Params = parse(params)?;
                let name = ServiceName::from_str(&p.name)?;
                install::uninstall(name, p.purge)?;
                Ok(json!({"uninstalled": true}))
            }

            "registry.list" => {
                #[derive(Deserialize)]
                struct Params {
                    kind: String,
                }
                let p: Params = parse(params)?;
                let kind = ProviderKind::from_str(&p.kind)?;
                to_value(&self.registry.list(kind))
            }
            "registry.refresh" => {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Params {
                    id: Option<String>,
                }
                let p: Params = parse_or_default(params)?;
                let results = self
                    .registry
                    .refresh(&self.client, p.id.as_deref(), REFRESH_PROBE_TIMEOUT)
                    .await;
                let map: serde_json::Map<String, Value> = results
                    .into_iter()
                    .map(|(id, state)| (id, json!(state)))
                    .collect();
                Ok(Value::Object(map))
            }
            "registry.register" => {
                let config: EndpointConfig = parse(params)?;
                let endpoint = ProviderEndpoint::from_config(&config)?;
                self.registry.register(endpoint)?;
                Ok(json!({"registered": config.id}))
            }
            "registry.unregister" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = parse(params)?;
                Ok(json!({"unregistered": self.registry.unregister(&p.id)}))
            }

            "statistics.summary" => {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Params {
                    date: Option<String>,
                }
                let p: Params = parse_or_default(params)?;
                let date = match p.date {
                    Some(text) => chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                        .map_err(|e| {
                            VoiceError::InvalidRequest(format!("date must be YYYY-MM-DD: {e}"))
                        })?,
                    None => self.clock.now().date_naive(),
                };
                let events = events::read_events(date)?;
                to_value(&events::stats::summarize(&events))
            }

            "pronounce.list" => {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Params {
                    direction: Option<String>,
                }
                let p: Params = parse_or_default(params)?;
                let direction = match p.direction {
                    Some(d) => Some(Direction::from_str(&d)?),
                    None => None,
                };
                let pronounce = self.pronounce.read().unwrap_or_else(|e| e.into_inner());
                // Private rules are never exposed over the request surface.
                to_value(&pronounce.list(direction, false))
            }
            "pronounce.add" => {
                #[derive(Deserialize)]
                struct Params {
                    direction: String,
                    name: String,
                    pattern: String,
                    replacement: String,
                    #[serde(default = "default_rule_order")]
                    order: i32,
                    #[serde(default = "default_true")]
                    enabled: bool,
                    #[serde(default)]
                    description: String,
                }
                let p: Params = parse(params)?;
                let direction = Direction::from_str(&p.direction)?;
                let spec = RuleSpec {
                    name: p.name,
                    pattern: p.pattern,
                    replacement: p.replacement,
                    order: p.order,
                    enabled: p.enabled,
                    description: p.description,
                    // Rules created over RPC stay visible over RPC.
                    private: false,
                };
                let mut pronounce = self.pronounce.write().unwrap_or_else(|e| e.into_inner());
                pronounce.add_rule(direction, spec)?;
                Ok(json!({"added": true}))
            }
            "pronounce.remove" => {
                let (direction, name) = direction_and_name(params)?;
                let mut pronounce = self.pronounce.write().unwrap_or_else(|e| e.into_inner());
                Ok(json!({"removed": pronounce.remove_rule(direction, &name)?}))
            }
            "pronounce.enable" => {
                let (direction, name) = direction_and_name(params)?;
                let mut pronounce = self.pronounce.write().unwrap_or_else(|e| e.into_inner());
                Ok(json!({"enabled": pronounce.set_enabled(direction, &name, true)?}))
            }
            "pronounce.disable" => {
                let (direction, name) = direction_and_name(params)?;
                let mut pronounce = self.pronounce.write().unwrap_or_else(|e| e.into_inner());
                Ok(json!({"disabled": pronounce.set_enabled(direction, &name, false)?}))
            }
            "pronounce.test" => {
                #[derive(Deserialize)]
                struct Params {
                    direction: String,
                    text: String,
                }
                let p: Params = parse(params)?;
                let direction = Direction::from_str(&p.direction)?;
                let pronounce = self.pronounce.read().unwrap_or_else(|e| e.into_inner());
                Ok(json!({"text": pronounce.test_rule(direction, &p.text)}))
            }
            "pronounce.reload" => {
                let mut pronounce = self.pronounce.write().unwrap_or_else(|e| e.into_inner());
                pronounce.reload();
                Ok(json!({"reloaded": true}))
            }

            "whisper.model.list" => {
                let active = whisper_models::active_model();
                let models: Vec<Value> = whisper_models::WHISPER_MODEL_REGISTRY
                    .iter()
                    .map(|m| {
                        json!({
                            "name": m.name,
                            "size_mb": m.size_mb,
                            "languages": m.languages,
                            "installed": whisper_models::is_installed(m.name),
                            "active": m.name == active,
                        })
                    })
                    .collect();
                Ok(json!({"models": models}))
            }
            "whisper.model.active" => {
                let active = whisper_models::active_model();
                Ok(json!({
                    "name": active,
                    "installed": whisper_models::is_installed(&active),
                }))
            }
            "whisper.model.set" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                    #[serde(default = "default_true")]
                    restart: bool,
                }
                let p: Params = parse(params)?;
                let previous = whisper_models::active_model();
                whisper_models::set_active_model(&p.name)?;
                info!("active whisper model: {} (was {previous})", p.name);

                let mut restarted = false;
                if p.restart
                    && self.supervisor.status(ServiceName::Whisper).await.running
                {
                    self.supervisor.restart(ServiceName::Whisper).await?;
                    restarted = true;
                }
                Ok(json!({"active": p.name, "previous": previous, "restarted": restarted}))
            }

            // method_allowed filters first, so this is unreachable for
            // anything in METHODS.
            other => Err(VoiceError::InvalidRequest(format!(
                "unknown method '{other}'"
            ))),
        }
    }
}

fn default_log_lines() -> usize {
    50
}

fn default_rule_order() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| VoiceError::InvalidRequest(format!("bad params: {e}")))
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse(params)
}

fn service_name(params: Value) -> Result<ServiceName> {
    #[derive(Deserialize)]
    struct Params {
        name: String,
    }
    let p: Params = parse(params)?;
    ServiceName::from_str(&p.name)
}

fn direction_and_name(params: Value) -> Result<(Direction, String)> {
    #[derive(Deserialize)]
    struct Params {
        direction: String,
        name: String,
    }
    let p: Params = parse(params)?;
    Ok((Direction::from_str(&p.direction)?, p.name))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| VoiceError::Internal(format!("serialize: {e}")))
}
