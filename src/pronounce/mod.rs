//! Pronunciation middleware for TTS and STT text processing.
//!
//! Ordered regex substitutions applied to text before speech generation
//! (improving pronunciation) and after transcription (correcting common
//! mis-hearings). Rules load from layered YAML sources; later layers
//! override earlier ones by rule name. A rule whose pattern fails to
//! compile is disabled with a warning; it never fails the engine.

use crate::config::PronunciationConfig;
use crate::error::{Result, VoiceError};
use crate::voice_dirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Which direction a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Applied to text before TTS synthesis.
    Tts,
    /// Applied to transcripts after STT.
    Stt,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tts => "tts",
            Self::Stt => "stt",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tts" => Ok(Self::Tts),
            "stt" => Ok(Self::Stt),
            other => Err(VoiceError::InvalidRequest(format!(
                "direction must be 'tts' or 'stt', got '{other}'"
            ))),
        }
    }
}

/// One pronunciation rule as it appears in YAML and over RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    /// Unique name within a direction.
    pub name: String,
    /// Regex pattern to match.
    pub pattern: String,
    /// Replacement template (`$1` style captures).
    pub replacement: String,
    /// Rules apply in ascending order; ties keep insertion order.
    pub order: i32,
    /// Whether the rule is active.
    pub enabled: bool,
    /// Human-readable description.
    pub description: String,
    /// Private rules are hidden from and immutable over the RPC surface.
    pub private: bool,
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            pattern: String::new(),
            replacement: String::new(),
            order: 100,
            enabled: true,
            description: String::new(),
            private: true,
        }
    }
}

/// A rule plus its compiled pattern. `regex` is `None` when compilation
/// failed; such rules never apply.
#[derive(Debug, Clone)]
struct Rule {
    spec: RuleSpec,
    regex: Option<Regex>,
}

impl Rule {
    fn compile(spec: RuleSpec) -> Self {
        let regex = match Regex::new(&spec.pattern) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("invalid pattern in pronunciation rule '{}': {e}", spec.name);
                None
            }
        };
        Self { spec, regex }
    }

    fn apply(&self, text: &str) -> Option<String> {
        if !self.spec.enabled {
            return None;
        }
        let regex = self.regex.as_ref()?;
        let replaced = regex.replace_all(text, self.spec.replacement.as_str());
        if replaced == text {
            None
        } else {
            Some(replaced.into_owned())
        }
    }
}

/// On-disk rule file shape.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RuleFile {
    version: u32,
    tts_rules: Vec<RuleSpec>,
    stt_rules: Vec<RuleSpec>,
}

/// Manages the two ordered rule lists.
pub struct PronounceManager {
    tts: Vec<Rule>,
    stt: Vec<Rule>,
    enabled: bool,
    log_substitutions: bool,
    extra_paths: Vec<PathBuf>,
}

impl PronounceManager {
    /// Load rules from the layered config sources. Never fails; unloadable
    /// layers are skipped with a warning.
    pub fn load(config: &PronunciationConfig) -> Self {
        let mut manager = Self {
            tts: Vec::new(),
            stt: Vec::new(),
            enabled: config.enabled,
            log_substitutions: config.log_substitutions,
            extra_paths: config.extra_paths.clone(),
        };
        manager.reload();
        manager
    }

    /// Layered source paths, in override order: user file, project file,
    /// then any environment-provided extras.
    fn layer_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![voice_dirs::pronunciation_file()];
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".pronunciation.yaml"));
        }
        paths.extend(self.extra_paths.iter().cloned());
        paths
    }

    /// Re-read every layer from disk.
    pub fn reload(&mut self) {
        let mut tts: Vec<RuleSpec> = Vec::new();
        let mut stt: Vec<RuleSpec> = Vec::new();

        for path in self.layer_paths() {
            if !path.exists() {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!("cannot read pronunciation rules {}: {e}", path.display());
                    continue;
                }
            };
            let file: RuleFile = match serde_yaml::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    warn!("cannot parse pronunciation rules {}: {e}", path.display());
                    continue;
                }
            };
            info!("loaded pronunciation rules from {}", path.display());
            for rule in file.tts_rules {
                tts.retain(|r| r.name != rule.name);
                tts.push(rule);
            }
            for rule in file.stt_rules {
                stt.retain(|r| r.name != rule.name);
                stt.push(rule);
            }
        }

        // Stable sort keeps insertion order for equal `order` values.
        tts.sort_by_key(|r| r.order);
        stt.sort_by_key(|r| r.order);

        self.tts = tts.into_iter().map(Rule::compile).collect();
        self.stt = stt.into_iter().map(Rule::compile).collect();
    }

    fn process(&self, rules: &[Rule], direction: Direction, text: &str) -> String {
        if !self.enabled {
            return text.to_owned();
        }
        let mut current = text.to_owned();
        for rule in rules {
            if let Some(next) = rule.apply(&current) {
                if self.log_substitutions {
                    info!(
                        "pronunciation {}: rule '{}': \"{current}\" -> \"{next}\"",
                        direction.as_str(),
                        rule.spec.name
                    );
                }
                current = next;
            }
        }
        current
    }

    /// Apply TTS substitutions before speech generation.
    pub fn process_tts(&self, text: &str) -> String {
        self.process(&self.tts, Direction::Tts, text)
    }

    /// Apply STT corrections after transcription.
    pub fn process_stt(&self, text: &str) -> String {
        self.process(&self.stt, Direction::Stt, text)
    }

    fn rules(&self, direction: Direction) -> &Vec<Rule> {
        match direction {
            Direction::Tts => &self.tts,
            Direction::Stt => &self.stt,
        }
    }

    fn rules_mut(&mut self, direction: Direction) -> &mut Vec<Rule> {
        match direction {
            Direction::Tts => &mut self.tts,
            Direction::Stt => &mut self.stt,
        }
    }

    /// List rules, hiding private ones unless `include_private`.
    pub fn list(&self, direction: Option<Direction>, include_private: bool) -> Vec<RuleSpec> {
        let directions = match direction {
            Some(d) => vec![d],
            None => vec![Direction::Tts, Direction::Stt],
        };
        let mut out = Vec::new();
        for d in directions {
            for rule in self.rules(d) {
                if rule.spec.private && !include_private {
                    continue;
                }
                out.push(rule.spec.clone());
            }
        }
        out
    }

    /// Add a rule and persist the user layer.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate name, invalid pattern, or save failure.
    pub fn add_rule(&mut self, direction: Direction, spec: RuleSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(VoiceError::InvalidRequest("rule name required".into()));
        }
        if self.rules(direction).iter().any(|r| r.spec.name == spec.name) {
            return Err(VoiceError::InvalidRequest(format!(
                "rule '{}' already exists",
                spec.name
            )));
        }
        let rule = Rule::compile(spec);
        if rule.regex.is_none() {
            return Err(VoiceError::Pronounce(format!(
                "invalid pattern in rule '{}'",
                rule.spec.name
            )));
        }
        let list = self.rules_mut(direction);
        list.push(rule);
        list.sort_by_key(|r| r.spec.order);
        self.save_user_rules()
    }

    /// Remove a rule by name. Returns whether a rule was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the user layer cannot be saved.
    pub fn remove_rule(&mut self, direction: Direction, name: &str) -> Result<bool> {
        let list = self.rules_mut(direction);
        let before = list.len();
        list.retain(|r| r.spec.name != name);
        let removed = list.len() < before;
        if removed {
            self.save_user_rules()?;
        }
        Ok(removed)
    }

    /// Enable or disable a rule by name. Private rules cannot be toggled
    /// through this path.
    ///
    /// # Errors
    ///
    /// Returns an error for private rules or save failures.
    pub fn set_enabled(&mut self, direction: Direction, name: &str, enabled: bool) -> Result<bool> {
        let list = self.rules_mut(direction);
        let Some(rule) = list.iter_mut().find(|r| r.spec.name == name) else {
            return Ok(false);
        };
        if rule.spec.private {
            return Err(VoiceError::InvalidRequest(format!(
                "rule '{name}' is private"
            )));
        }
        rule.spec.enabled = enabled;
        self.save_user_rules()?;
        Ok(true)
    }

    /// Preview what `text` becomes in the given direction.
    pub fn test_rule(&self, direction: Direction, text: &str) -> String {
        match direction {
            Direction::Tts => self.process_tts(text),
            Direction::Stt => self.process_stt(text),
        }
    }

    /// Write the current merged rule set to the user config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_user_rules(&self) -> Result<()> {
        let path = voice_dirs::pronunciation_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = RuleFile {
            version: 1,
            tts_rules: self.tts.iter().map(|r| r.spec.clone()).collect(),
            stt_rules: self.stt.iter().map(|r| r.spec.clone()).collect(),
        };
        let text = serde_yaml::to_string(&file)
            .map_err(|e| VoiceError::Pronounce(format!("serialize rules: {e}")))?;
        std::fs::write(&path, text)?;
        info!("saved pronunciation rules to {}", path.display());
        Ok(())
    }
}
