//! Service installation: directory layout, binary discovery, and
//! checksum-verified downloads.
//!
//! The supervisor never shells out to a package manager itself; it
//! consumes the [`PackageManager`] capability and makes no assumptions
//! about what implements it.

use super::{ServiceName, whisper_models};
use crate::error::{Result, VoiceError};
use crate::voice_dirs;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Capability for checking and installing system packages.
pub trait PackageManager: Send + Sync {
    /// Whether a binary is available.
    fn check(&self, binary: &str) -> bool;

    /// Install the named packages.
    ///
    /// # Errors
    ///
    /// Returns an error when installation is unsupported or fails.
    fn install(&self, packages: &[&str]) -> Result<()>;
}

/// Default implementation: probes `PATH` and refuses to install anything.
pub struct PathProbe;

impl PackageManager for PathProbe {
    fn check(&self, binary: &str) -> bool {
        which::which(binary).is_ok()
    }

    fn install(&self, packages: &[&str]) -> Result<()> {
        Err(VoiceError::ServiceUnavailable(format!(
            "no package manager configured; install manually: {}",
            packages.join(", ")
        )))
    }
}

/// Resolve the binary a service should run: an installed copy under the
/// service directory wins, otherwise `PATH`.
pub fn resolve_binary(name: ServiceName, packages: &dyn PackageManager) -> Option<PathBuf> {
    let installed = voice_dirs::service_dir(name.as_str())
        .join("bin")
        .join(name.binary_name());
    if installed.exists() {
        return Some(installed);
    }
    if packages.check(name.binary_name()) {
        return which::which(name.binary_name()).ok();
    }
    None
}

/// Download a file to `dest`, streaming through a temp file and verifying
/// the SHA-256 when one is expected. The rename at the end makes the
/// install atomic.
///
/// # Errors
///
/// Returns an error on network failure, checksum mismatch, or I/O error.
pub async fn download_verified(
    client: &reqwest::Client,
    url: &str,
    dest: &std::path::Path,
    expected_sha256: Option<&str>,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("download");

    info!("downloading {url}");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| VoiceError::Service(format!("download {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(VoiceError::Service(format!(
            "download {url}: status {}",
            response.status()
        )));
    }

    let mut hasher = Sha256::new();
    let mut file = std::fs::File::create(&tmp)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VoiceError::Service(format!("download {url}: {e}")))?;
        hasher.update(&chunk);
        file.write_all(&chunk)?;
    }
    file.flush()?;
    drop(file);

    if let Some(expected) = expected_sha256 {
        let actual = format!("{:x}", hasher.finalize());
        if actual != expected {
            let _ = std::fs::remove_file(&tmp);
            return Err(VoiceError::Service(format!(
                "checksum mismatch for {url}: expected {expected}, got {actual}"
            )));
        }
    }

    std::fs::rename(&tmp, dest)?;
    Ok(())
}

/// Create the stable on-disk layout and fetch what the service needs.
/// For whisper that is the active model; the other services only need
/// their binaries discoverable.
///
/// # Errors
///
/// Returns an error when a required binary is missing or a download fails.
pub async fn install(
    name: ServiceName,
    client: &reqwest::Client,
    packages: &dyn PackageManager,
) -> Result<()> {
    let root = voice_dirs::service_dir(name.as_str());
    for sub in ["bin", "logs"] {
        std::fs::create_dir_all(root.join(sub))?;
    }

    if name == ServiceName::Whisper {
        std::fs::create_dir_all(voice_dirs::whisper_models_dir())?;
        let active = whisper_models::active_model();
        if !whisper_models::is_installed(&active) {
            let model = whisper_models::find(&active).ok_or_else(|| {
                VoiceError::Service(format!("active model '{active}' not in catalog"))
            })?;
            let dest =
                voice_dirs::whisper_models_dir().join(whisper_models::model_file_name(&active));
            download_verified(client, model.url, &dest, model.sha256).await?;
            info!("installed whisper model '{active}' ({} MB)", model.size_mb);
        }
    }

    if resolve_binary(name, packages).is_none() {
        return Err(VoiceError::ServiceUnavailable(format!(
            "binary '{}' not found for service {name}",
            name.binary_name()
        )));
    }

    info!("service {name} installed under {}", root.display());
    Ok(())
}

/// Remove an installed service. Configuration and models survive unless
/// `purge` is set.
///
/// # Errors
///
/// Returns an error if removal fails.
pub fn uninstall(name: ServiceName, purge: bool) -> Result<()> {
    let root = voice_dirs::service_dir(name.as_str());
    if purge {
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        info!("service {name} purged");
        return Ok(());
    }
    for sub in ["bin", "logs"] {
        let dir = root.join(sub);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
    }
    info!("service {name} uninstalled (config and models kept)");
    Ok(())
}
