//! Versioned autostart entries for managed services.
//!
//! `enable` writes a rendered unit file under the user service directory;
//! `disable` removes it. Rendered files carry a version header so enable
//! can reconcile upgrades, and any line tagged `# USER:` survives an
//! upgrade untouched.

use super::ServiceName;
use crate::error::{Result, VoiceError};
use std::path::PathBuf;
use tracing::info;

/// Version stamped into rendered service files. Bump when the template
/// body changes.
pub const TEMPLATE_VERSION: &str = "3";

/// Where the autostart entry for a service lives.
pub fn autostart_path(name: ServiceName) -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("systemd")
        .join("user")
        .join(format!("voicemode-{}.service", name.as_str()))
}

/// Render the unit file body for a service.
pub fn render(name: ServiceName, binary: &str, args: &[String]) -> String {
    let exec = if args.is_empty() {
        binary.to_owned()
    } else {
        format!("{binary} {}", args.join(" "))
    };
    format!(
        "# VERSION: {TEMPLATE_VERSION}\n\
         [Unit]\n\
         Description=voicemode {name} service\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec=2\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        name = name.as_str(),
    )
}

/// Parse the version header from a rendered file.
pub fn read_version(content: &str) -> Option<String> {
    content
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("# VERSION: "))
        .map(|v| v.trim().to_owned())
}

/// Merge `# USER:`-tagged lines from an existing file into new content.
///
/// A tagged line replaces the rendered line with the same `Key=` prefix;
/// tagged lines with no matching key are appended to the `[Service]`
/// section.
pub fn preserve_user_lines(existing: &str, rendered: &str) -> String {
    let user_lines: Vec<&str> = existing
        .lines()
        .filter(|line| line.contains("# USER:"))
        .collect();
    if user_lines.is_empty() {
        return rendered.to_owned();
    }

    let key_of = |line: &str| -> Option<String> {
        line.split('=').next().map(|k| k.trim().to_owned())
    };

    let mut out: Vec<String> = Vec::new();
    let mut replaced: Vec<&str> = Vec::new();
    for line in rendered.lines() {
        let mut emitted = false;
        if let Some(key) = key_of(line) {
            if let Some(user) = user_lines
                .iter()
                .find(|u| key_of(u).as_deref() == Some(key.as_str()))
            {
                out.push((*user).to_owned());
                replaced.push(user);
                emitted = true;
            }
        }
        if !emitted {
            out.push(line.to_owned());
        }
    }
    for user in user_lines {
        if !replaced.contains(&user) {
            out.push(user.to_owned());
        }
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Write (or reconcile) the autostart entry. Returns the installed
/// template version.
///
/// # Errors
///
/// Returns an error if the entry cannot be written.
pub fn install(name: ServiceName, binary: &str, args: &[String]) -> Result<String> {
    let path = autostart_path(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let rendered = render(name, binary, args);
    let content = match std::fs::read_to_string(&path) {
        Ok(existing) => {
            if read_version(&existing).as_deref() == Some(TEMPLATE_VERSION) {
                info!("autostart entry for {name} already at version {TEMPLATE_VERSION}");
                return Ok(TEMPLATE_VERSION.to_owned());
            }
            info!(
                "upgrading autostart entry for {name}: {:?} -> {TEMPLATE_VERSION}",
                read_version(&existing)
            );
            preserve_user_lines(&existing, &rendered)
        }
        Err(_) => rendered,
    };

    std::fs::write(&path, content)?;
    Ok(TEMPLATE_VERSION.to_owned())
}

/// Remove the autostart entry. Returns whether one existed.
///
/// # Errors
///
/// Returns an error if removal fails for a reason other than absence.
pub fn remove(name: ServiceName) -> Result<bool> {
    let path = autostart_path(name);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(VoiceError::Service(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_file_carries_version() {
        let body = render(ServiceName::Kokoro, "/usr/bin/kokoro", &["--port".into(), "8880".into()]);
        assert_eq!(read_version(&body).as_deref(), Some(TEMPLATE_VERSION));
        assert!(body.contains("ExecStart=/usr/bin/kokoro --port 8880"));
    }

    #[test]
    fn user_tagged_lines_survive_upgrade() {
        let old = "# VERSION: 2\n[Service]\nExecStart=/old/kokoro # USER: pinned build\nRestart=on-failure\n";
        let new = render(ServiceName::Kokoro, "/usr/bin/kokoro", &[]);
        let merged = preserve_user_lines(old, &new);
        assert!(merged.contains("ExecStart=/old/kokoro # USER: pinned build"));
        assert!(!merged.contains("ExecStart=/usr/bin/kokoro\n"));
        // Non-tagged old lines are not carried.
        assert_eq!(read_version(&merged).as_deref(), Some(TEMPLATE_VERSION));
    }

    #[test]
    fn unmatched_user_lines_are_appended() {
        let old = "# VERSION: 1\n[Service]\nEnvironment=KOKORO_THREADS=8 # USER: tuned\n";
        let new = render(ServiceName::Kokoro, "/usr/bin/kokoro", &[]);
        let merged = preserve_user_lines(old, &new);
        assert!(merged.contains("Environment=KOKORO_THREADS=8 # USER: tuned"));
    }

    #[test]
    fn untouched_content_passes_through() {
        let new = render(ServiceName::Whisper, "/usr/bin/whisper-server", &[]);
        assert_eq!(preserve_user_lines("# VERSION: 1\n", &new), new);
    }
}
