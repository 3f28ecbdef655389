//! Whisper model catalog for the local STT service.
//!
//! Models are whisper.cpp GGML files stored under
//! `~/.voicemode/services/whisper/models/`. Exactly one model is active at
//! a time; the `active` sentinel file holds its name and is replaced
//! atomically when switching.

use crate::error::{Result, VoiceError};
use crate::voice_dirs;
use serde::Serialize;

/// One catalog entry.
#[derive(Debug, Clone, Serialize)]
pub struct WhisperModel {
    pub name: &'static str,
    pub size_mb: u32,
    pub languages: &'static str,
    pub url: &'static str,
    /// Upstream SHA-256, when published; downloads verify it if present.
    pub sha256: Option<&'static str>,
}

/// The model the service uses when nothing was ever activated.
pub const DEFAULT_MODEL: &str = "base";

/// Known whisper.cpp models, smallest first.
pub const WHISPER_MODEL_REGISTRY: &[WhisperModel] = &[
    WhisperModel {
        name: "tiny",
        size_mb: 75,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
        sha256: None,
    },
    WhisperModel {
        name: "tiny.en",
        size_mb: 75,
        languages: "english",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.en.bin",
        sha256: None,
    },
    WhisperModel {
        name: "base",
        size_mb: 142,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
        sha256: None,
    },
    WhisperModel {
        name: "base.en",
        size_mb: 142,
        languages: "english",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.en.bin",
        sha256: None,
    },
    WhisperModel {
        name: "small",
        size_mb: 466,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
        sha256: None,
    },
    WhisperModel {
        name: "small.en",
        size_mb: 466,
        languages: "english",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.en.bin",
        sha256: None,
    },
    WhisperModel {
        name: "medium",
        size_mb: 1_500,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
        sha256: None,
    },
    WhisperModel {
        name: "large-v2",
        size_mb: 2_900,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v2.bin",
        sha256: None,
    },
    WhisperModel {
        name: "large-v3",
        size_mb: 2_900,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3.bin",
        sha256: None,
    },
    WhisperModel {
        name: "large-v3-turbo",
        size_mb: 1_600,
        languages: "multilingual",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3-turbo.bin",
        sha256: None,
    },
];

/// Look up a registry entry by name.
pub fn find(name: &str) -> Option<&'static WhisperModel> {
    WHISPER_MODEL_REGISTRY.iter().find(|m| m.name == name)
}

/// On-disk filename for a model.
pub fn model_file_name(name: &str) -> String {
    format!("ggml-{name}.bin")
}

/// Path the active model binary should be loaded from.
pub fn active_model_path() -> std::path::PathBuf {
    voice_dirs::whisper_models_dir().join(model_file_name(&active_model()))
}

/// Name of the currently active model.
pub fn active_model() -> String {
    match std::fs::read_to_string(voice_dirs::whisper_active_model_file()) {
        Ok(contents) => {
            let name = contents.trim().to_owned();
            if name.is_empty() {
                DEFAULT_MODEL.to_owned()
            } else {
                name
            }
        }
        Err(_) => DEFAULT_MODEL.to_owned(),
    }
}

/// Atomically switch the active model: written to a temp file first, then
/// renamed over the sentinel.
///
/// # Errors
///
/// Returns `invalid_request` for unknown models, or an I/O error.
pub fn set_active_model(name: &str) -> Result<()> {
    if find(name).is_none() {
        return Err(VoiceError::InvalidRequest(format!(
            "unknown whisper model '{name}'"
        )));
    }
    let dir = voice_dirs::whisper_models_dir();
    std::fs::create_dir_all(&dir)?;
    let sentinel = voice_dirs::whisper_active_model_file();
    let tmp = dir.join(".active.tmp");
    std::fs::write(&tmp, name)?;
    std::fs::rename(&tmp, &sentinel)?;
    Ok(())
}

/// Whether a model's GGML file is present on disk.
pub fn is_installed(name: &str) -> bool {
    voice_dirs::whisper_models_dir()
        .join(model_file_name(name))
        .exists()
}

/// Names of all models present on disk, in registry order.
pub fn installed_models() -> Vec<&'static str> {
    WHISPER_MODEL_REGISTRY
        .iter()
        .filter(|m| is_installed(m.name))
        .map(|m| m.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::HomeGuard;

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<&str> = WHISPER_MODEL_REGISTRY.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), WHISPER_MODEL_REGISTRY.len());
    }

    #[test]
    fn default_model_exists_in_registry() {
        assert!(find(DEFAULT_MODEL).is_some());
    }

    #[test]
    fn active_model_defaults_without_sentinel() {
        let _home = HomeGuard::new();
        assert_eq!(active_model(), DEFAULT_MODEL);
    }

    #[test]
    fn set_active_model_round_trips() {
        let _home = HomeGuard::new();
        set_active_model("small").unwrap();
        assert_eq!(active_model(), "small");
        // Switching again replaces the sentinel.
        set_active_model("tiny.en").unwrap();
        assert_eq!(active_model(), "tiny.en");
    }

    #[test]
    fn set_active_model_rejects_unknown() {
        let _home = HomeGuard::new();
        assert!(set_active_model("huge-v9").is_err());
        assert_eq!(active_model(), DEFAULT_MODEL);
    }

    #[test]
    fn installed_models_reflects_files_on_disk() {
        let _home = HomeGuard::new();
        assert!(installed_models().is_empty());
        let dir = voice_dirs::whisper_models_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ggml-base.bin"), b"stub").unwrap();
        assert_eq!(installed_models(), vec!["base"]);
    }
}
