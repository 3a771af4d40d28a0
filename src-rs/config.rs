//! Session configuration: defaults, optional JSON file, then `TASK_GUIDE_*` overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::actions::{ActionVocabulary, DEFAULT_ACTIONS, DEFAULT_PICKUP, DEFAULT_PLACE};
use crate::error::{GuideError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserBackendKind {
    Chat,
    Codex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 60_000,
            max_tokens: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodexSettings {
    pub bin: Option<String>,
    pub model: Option<String>,
    pub timeout_sec: u64,
    pub scratch_dir: PathBuf,
}

impl Default for CodexSettings {
    fn default() -> Self {
        Self {
            bin: None,
            model: None,
            timeout_sec: 300,
            scratch_dir: PathBuf::from(".task-guide").join("codex"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSettings {
    pub backend: ParserBackendKind,
    pub chat: ChatSettings,
    pub codex: CodexSettings,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            backend: ParserBackendKind::Chat,
            chat: ChatSettings::default(),
            codex: CodexSettings::default(),
        }
    }
}

/// External detection program, invoked once per detection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_sec: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            program: "groundingdino-detect".to_string(),
            args: Vec::new(),
            timeout_sec: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideConfig {
    pub actions: Vec<String>,
    pub pickup_pair: Option<(String, String)>,
    pub crop_threshold: f64,
    pub final_threshold: f64,
    pub parse_attempts: u32,
    pub crop_rounds: u32,
    pub instructions_path: PathBuf,
    pub store_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub overlay_dir: Option<PathBuf>,
    pub detector: DetectorSettings,
    pub parser: ParserSettings,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            actions: DEFAULT_ACTIONS.iter().map(ToString::to_string).collect(),
            pickup_pair: Some((DEFAULT_PICKUP.to_string(), DEFAULT_PLACE.to_string())),
            crop_threshold: 0.25,
            final_threshold: 0.35,
            parse_attempts: 3,
            crop_rounds: 3,
            instructions_path: PathBuf::from("instructions.txt"),
            store_path: PathBuf::from("instruction_store.json"),
            artifact_dir: PathBuf::from(".task-guide").join("crops"),
            overlay_dir: None,
            detector: DetectorSettings::default(),
            parser: ParserSettings::default(),
        }
    }
}

impl GuideConfig {
    /// Defaults, then the JSON file (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            GuideError::config(format!("config not readable: {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            GuideError::config(format!("invalid config JSON: {}: {err}", path.display()))
        })
    }

    /// Applies `TASK_GUIDE_*` overrides; a malformed action list is a configuration error.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("TASK_GUIDE_INSTRUCTIONS") {
            self.instructions_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("TASK_GUIDE_STORE") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("TASK_GUIDE_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty("TASK_GUIDE_OVERLAY_DIR") {
            self.overlay_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("TASK_GUIDE_ACTIONS") {
            let vocabulary = ActionVocabulary::from_comma_list(&v, self.pickup_pair.take())?;
            self.actions = vocabulary.tokens().to_vec();
            self.pickup_pair = vocabulary
                .pickup_pair()
                .map(|(a, b)| (a.to_string(), b.to_string()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.vocabulary()?;
        for (name, value) in [
            ("crop_threshold", self.crop_threshold),
            ("final_threshold", self.final_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuideError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.parse_attempts == 0 || self.crop_rounds == 0 {
            return Err(GuideError::config(
                "parse_attempts and crop_rounds must be at least 1",
            ));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(GuideError::config("store_path is empty"));
        }
        if self.instructions_path.as_os_str().is_empty() {
            return Err(GuideError::config("instructions_path is empty"));
        }
        Ok(())
    }

    pub fn vocabulary(&self) -> Result<ActionVocabulary> {
        ActionVocabulary::new(self.actions.clone(), self.pickup_pair.clone())
    }
}
