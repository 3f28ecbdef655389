//! Lifecycle supervisor for the managed services.
//!
//! Owns the `ServiceRecord` table exclusively; everything else reads
//! snapshots. Children are spawned with stdout/stderr redirected into the
//! per-service log directory, stopped with SIGTERM and escalated to a hard
//! kill after the grace period, and health-polled in the background.

use super::install::{self, PackageManager};
use super::{ServiceHealth, ServiceName, ServiceRecord, ServiceStatus, templates, whisper_models};
use crate::config::{ServiceEntryConfig, ServicesConfig};
use crate::error::{Result, VoiceError};
use crate::voice_dirs;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between stop and start during a restart.
const RESTART_PAUSE: Duration = Duration::from_millis(500);
/// Probe timeout for individual health checks.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Failed probes before a service is considered unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

/// The supervisor.
pub struct ServiceSupervisor {
    config: ServicesConfig,
    records: RwLock<HashMap<ServiceName, ServiceRecord>>,
    children: Mutex<HashMap<ServiceName, tokio::process::Child>>,
    client: reqwest::Client,
    packages: Arc<dyn PackageManager>,
}

impl ServiceSupervisor {
    pub fn new(config: ServicesConfig, packages: Arc<dyn PackageManager>) -> Self {
        let mut records = HashMap::new();
        for name in ServiceName::ALL {
            records.insert(name, ServiceRecord::new(name, entry(&config, name).port));
        }
        Self {
            config,
            records: RwLock::new(records),
            children: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            packages,
        }
    }

    /// Copy-on-read snapshot of one service record.
    pub fn snapshot(&self, name: ServiceName) -> ServiceRecord {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .cloned()
            .unwrap_or_else(|| ServiceRecord::new(name, entry(&self.config, name).port))
    }

    fn update<F: FnOnce(&mut ServiceRecord)>(&self, name: ServiceName, f: F) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(&name) {
            f(record);
        }
    }

    fn health_url(&self, name: ServiceName) -> String {
        format!(
            "http://127.0.0.1:{}{}",
            entry(&self.config, name).port,
            name.health_path()
        )
    }

    /// One HTTP probe of the service's health endpoint.
    pub async fn probe_health(&self, name: ServiceName) -> bool {
        let url = self.health_url(name);
        match tokio::time::timeout(PROBE_TIMEOUT, self.client.get(&url).send()).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }

    /// Whether the supervisor currently holds a live child for this service.
    async fn child_alive(&self, name: ServiceName) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&name) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!("service {name} exited: {status}");
                    children.remove(&name);
                    self.update(name, |r| {
                        r.pid = None;
                        r.last_exit = Some(Utc::now());
                    });
                    false
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Current status for one service.
    pub async fn status(&self, name: ServiceName) -> ServiceStatus {
        let record = self.snapshot(name);
        let child_running = self.child_alive(name).await;
        let healthy = self.probe_health(name).await;
        let running = child_running || healthy;

        let uptime_s = if running {
            record
                .last_start
                .map(|t| Utc::now().signed_duration_since(t).num_seconds().max(0) as u64)
        } else {
            None
        };
        let (cpu_seconds, memory_bytes) = match record.pid.filter(|_| child_running) {
            Some(pid) => process_usage(pid),
            None => (None, None),
        };
        // Average CPU share over the process lifetime.
        let cpu_percent = match (cpu_seconds, uptime_s) {
            (Some(cpu), Some(up)) if up > 0 => Some(100.0 * cpu / up as f32),
            _ => None,
        };

        ServiceStatus {
            name,
            running,
            pid: record.pid.filter(|_| child_running),
            port: record.port,
            uptime_s,
            cpu_percent,
            memory_bytes,
            version: record.installed_version.clone(),
            health: if healthy {
                ServiceHealth::Healthy
            } else if running {
                ServiceHealth::Unhealthy
            } else {
                ServiceHealth::Stopped
            },
        }
    }

    /// Command line for a service.
    fn command_for(&self, name: ServiceName, binary: &PathBuf) -> (String, Vec<String>) {
        let port = entry(&self.config, name).port.to_string();
        let args = match name {
            ServiceName::Whisper => vec![
                "--host".into(),
                "127.0.0.1".into(),
                "--port".into(),
                port,
                "--model".into(),
                whisper_models::active_model_path().to_string_lossy().into_owned(),
            ],
            ServiceName::Kokoro => vec!["--port".into(), port],
            ServiceName::Livekit => vec!["--dev".into(), "--bind".into(), "127.0.0.1".into()],
            ServiceName::Frontend => vec!["--port".into(), port],
        };
        (binary.to_string_lossy().into_owned(), args)
    }

    /// Start a service. Idempotent: a live child or a healthy port means
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns `service_unavailable` when the binary cannot be found, or
    /// an I/O error from spawning.
    pub async fn start(&self, name: ServiceName) -> Result<ServiceStatus> {
        if self.child_alive(name).await {
            info!("service {name} already running (supervised child)");
            return Ok(self.status(name).await);
        }
        if self.probe_health(name).await {
            info!("service {name} already running (healthy port)");
            return Ok(self.status(name).await);
        }

        let binary = install::resolve_binary(name, self.packages.as_ref()).ok_or_else(|| {
            VoiceError::ServiceUnavailable(format!(
                "binary '{}' not found; install the {name} service first",
                name.binary_name()
            ))
        })?;
        let (program, args) = self.command_for(name, &binary);

        let log_dir = voice_dirs::service_logs_dir(name.as_str());
        std::fs::create_dir_all(&log_dir)?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(name))?;
        let log_for_stderr = log_file.try_clone()?;

        info!("starting {name}: {program} {}", args.join(" "));
        let child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_for_stderr))
            .spawn()
            .map_err(|e| VoiceError::Service(format!("spawn {name}: {e}")))?;

        let pid = child.id();
        self.update(name, |r| {
            r.pid = pid;
            r.binary_path = Some(program.clone());
            r.last_start = Some(Utc::now());
            r.failed_probes = 0;
        });
        self.children.lock().await.insert(name, child);

        Ok(self.status(name).await)
    }

    /// Stop a service: graceful signal, then hard kill after the grace
    /// period. Returns whether a supervised child was stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill escalation itself fails.
    pub async fn stop(&self, name: ServiceName) -> Result<bool> {
        let Some(mut child) = self.children.lock().await.remove(&name) else {
            debug!("stop {name}: no supervised child");
            return Ok(false);
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SIGTERM first; the grace period below covers cleanup.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let grace = Duration::from_secs(self.config.stop_grace_s);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!("service {name} stopped: {status}"),
            Ok(Err(e)) => warn!("service {name} wait failed: {e}"),
            Err(_) => {
                warn!("service {name} did not stop within {}s, killing", grace.as_secs());
                child
                    .kill()
                    .await
                    .map_err(|e| VoiceError::Service(format!("kill {name}: {e}")))?;
            }
        }

        self.update(name, |r| {
            r.pid = None;
            r.last_exit = Some(Utc::now());
        });
        Ok(true)
    }

    /// Stop then start with a short pause between.
    ///
    /// # Errors
    ///
    /// Propagates errors from `start`.
    pub async fn restart(&self, name: ServiceName) -> Result<ServiceStatus> {
        self.stop(name).await?;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(name).await
    }

    /// Install the autostart entry, reconciling template versions.
    ///
    /// # Errors
    ///
    /// Returns an error when the binary is missing or the entry cannot be
    /// written.
    pub fn enable(&self, name: ServiceName) -> Result<()> {
        let binary = install::resolve_binary(name, self.packages.as_ref()).ok_or_else(|| {
            VoiceError::ServiceUnavailable(format!(
                "binary '{}' not found; install the {name} service first",
                name.binary_name()
            ))
        })?;
        let (program, args) = self.command_for(name, &binary);
        let version = templates::install(name, &program, &args)?;
        self.update(name, |r| {
            r.enabled = true;
            r.service_file_version = Some(version.clone());
        });
        Ok(())
    }

    /// Remove the autostart entry.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn disable(&self, name: ServiceName) -> Result<bool> {
        let removed = templates::remove(name)?;
        self.update(name, |r| r.enabled = false);
        Ok(removed)
    }

    /// Path of the service's own log file.
    pub fn log_path(&self, name: ServiceName) -> PathBuf {
        voice_dirs::service_logs_dir(name.as_str()).join(format!("{name}.log"))
    }

    /// Tail the service's log file.
    ///
    /// # Errors
    ///
    /// Returns an error when the log cannot be read. A missing file yields
    /// an empty tail.
    pub fn logs(&self, name: ServiceName, lines: usize) -> Result<Vec<String>> {
        let path = self.log_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|s| (*s).to_owned()).collect())
    }

    /// Eagerly start Kokoro when configured. Failure is logged, never
    /// fatal for the engine.
    pub async fn autostart(&self) {
        if !self.config.auto_start_kokoro {
            return;
        }
        match self.start(ServiceName::Kokoro).await {
            Ok(status) => info!("kokoro auto-start: running={} pid={:?}", status.running, status.pid),
            Err(e) => warn!("kokoro auto-start failed: {e}"),
        }
    }

    /// Background health monitor: probe each supervised service on the
    /// configured interval, mark unhealthy after three consecutive
    /// failures, and restart when the service opted into auto-restart.
    pub async fn run_health_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.health_interval_s.max(1));
        info!("service health monitor started ({}s interval)", interval.as_secs());
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("service health monitor stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }

            for name in ServiceName::ALL {
                if !self.child_alive(name).await {
                    continue;
                }
                if self.probe_health(name).await {
                    self.update(name, |r| r.failed_probes = 0);
                    continue;
                }
                let failures = {
                    self.update(name, |r| r.failed_probes += 1);
                    self.snapshot(name).failed_probes
                };
                if failures < UNHEALTHY_AFTER {
                    continue;
                }
                warn!("service {name} unhealthy after {failures} failed probes");
                if entry(&self.config, name).auto_restart {
                    info!("auto-restarting {name}");
                    if let Err(e) = self.restart(name).await {
                        error!("auto-restart of {name} failed: {e}");
                    }
                }
            }
        }
    }
}

fn entry(config: &ServicesConfig, name: ServiceName) -> &ServiceEntryConfig {
    match name {
        ServiceName::Whisper => &config.whisper,
        ServiceName::Kokoro => &config.kokoro,
        ServiceName::Livekit => &config.livekit,
        ServiceName::Frontend => &config.frontend,
    }
}

/// Best-effort cumulative CPU seconds and resident memory from procfs;
/// `(None, None)` elsewhere.
#[cfg(target_os = "linux")]
fn process_usage(pid: u32) -> (Option<f32>, Option<u64>) {
    let resident = std::fs::read_to_string(format!("/proc/{pid}/statm"))
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4_096);

    let cpu_seconds = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| {
            // utime and stime are stat fields 14 and 15, counted after the
            // parenthesized comm, which may itself contain spaces.
            let rest = s.rsplit(')').next()?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let utime: u64 = fields.get(11)?.parse().ok()?;
            let stime: u64 = fields.get(12)?.parse().ok()?;
            Some((utime + stime) as f32 / 100.0)
        });

    (cpu_seconds, resident)
}

#[cfg(not(target_os = "linux"))]
fn process_usage(_pid: u32) -> (Option<f32>, Option<u64>) {
    (None, None)
}
