mod model_spec;

pub use model_spec::{validate_model_id, ModelSpec, ModelSpecError, Provider, MAX_MODEL_ID_LENGTH};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::gateway::ModelParameters;
use crate::stage::Stage;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    600
}

fn default_model() -> String {
    "ollama:llama3".to_string()
}

fn default_chapters() -> u32 {
    6
}

fn default_target_words() -> u32 {
    18_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_analysis_retries() -> u32 {
    3
}

fn default_outline_regenerations() -> u32 {
    3
}

fn default_fact_cap() -> usize {
    30
}

fn default_candidates() -> u32 {
    1
}

fn default_gateway_retries() -> u32 {
    3
}

fn default_revision() -> bool {
    true
}

fn default_log_dir() -> String {
    "Logs".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("stage {stage} selects `{selection}`, which is neither a profile nor a valid model spec: {source}")]
    InvalidSelection {
        stage: Stage,
        selection: String,
        #[source]
        source: ModelSpecError,
    },
}

/// Connection details for one named backend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }
}

/// Which model each stage runs on. Values are either the name of an
/// entry in `llm_profiles` or a model spec (`provider:model`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StageModels {
    #[serde(default = "default_model")]
    pub default: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outliner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drafter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
}

impl Default for StageModels {
    fn default() -> Self {
        Self {
            default: default_model(),
            analyzer: None,
            outliner: None,
            drafter: None,
            extractor: None,
        }
    }
}

impl StageModels {
    pub fn uniform(selection: impl Into<String>) -> Self {
        Self {
            default: selection.into(),
            ..Self::default()
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &str {
        let specific = match stage {
            Stage::Analysis => self.analyzer.as_deref(),
            Stage::Outline => self.outliner.as_deref(),
            Stage::Drafting => self.drafter.as_deref(),
            Stage::Extraction => self.extractor.as_deref(),
            Stage::Assembly => None,
        };
        specific
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(self.default.as_str())
    }

    pub fn set(&mut self, stage: Stage, selection: impl Into<String>) {
        let value = Some(selection.into());
        match stage {
            Stage::Analysis => self.analyzer = value,
            Stage::Outline => self.outliner = value,
            Stage::Drafting => self.drafter = value,
            Stage::Extraction => self.extractor = value,
            Stage::Assembly => {}
        }
    }

    /// Distinct selections in use, for building one backend per selection.
    pub fn selections(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for stage in Stage::MODEL_STAGES {
            let selection = self.for_stage(stage).to_string();
            if !seen.contains(&selection) {
                seen.push(selection);
            }
        }
        seen
    }
}

/// Knobs for one generation run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationSettings {
    #[serde(default = "default_chapters")]
    pub chapters: u32,
    #[serde(default = "default_target_words")]
    pub target_words: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_analysis_retries")]
    pub analysis_retries: u32,
    #[serde(default = "default_outline_regenerations")]
    pub outline_regenerations: u32,
    #[serde(default = "default_fact_cap")]
    pub fact_cap: usize,
    #[serde(default = "default_candidates")]
    pub candidates: u32,
    #[serde(default = "default_gateway_retries")]
    pub gateway_retries: u32,
    #[serde(default = "default_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_budget_secs: Option<u64>,
    #[serde(default = "default_revision")]
    pub revision: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            chapters: default_chapters(),
            target_words: default_target_words(),
            max_attempts: default_max_attempts(),
            analysis_retries: default_analysis_retries(),
            outline_regenerations: default_outline_regenerations(),
            fact_cap: default_fact_cap(),
            candidates: default_candidates(),
            gateway_retries: default_gateway_retries(),
            call_timeout_secs: default_timeout(),
            run_budget_secs: None,
            revision: default_revision(),
            log_dir: default_log_dir(),
        }
    }
}

impl GenerationSettings {
    /// Attempts per chapter; disabling revision leaves a single attempt.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.revision {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    pub fn run_budget(&self) -> Option<Duration> {
        self.run_budget_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_interface: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub stages: StageModels,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&LlmConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    /// Call parameters for `stage`. A profile name contributes its own
    /// temperature and token limit; a bare model spec gets stage defaults.
    pub fn stage_parameters(&self, stage: Stage) -> Result<ModelParameters, ConfigError> {
        let selection = self.stages.for_stage(stage);
        if let Some(profile) = self.get_llm_profile(selection) {
            return Ok(ModelParameters {
                model: selection.to_string(),
                max_tokens: profile.max_tokens,
                temperature: profile.temperature,
            });
        }

        ModelSpec::parse(selection).map_err(|source| ConfigError::InvalidSelection {
            stage,
            selection: selection.to_string(),
            source,
        })?;
        Ok(ModelParameters {
            model: selection.to_string(),
            max_tokens: default_max_tokens(),
            temperature: stage.default_temperature(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };

        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config = if self.path.exists() {
            Config::from_path(&self.path)?
        } else {
            Config::default()
        };
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_llm_interface<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_llm_interface = Some(name.into());
    }

    pub fn last_llm_interface(&self) -> Option<&str> {
        self.config
            .recent
            .last_llm_interface
            .as_deref()
            .filter(|name| self.config.llm_profiles.contains_key(*name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_profiles_and_stage_models() {
        let json = r#"{
            "llm_profiles": {
                "writer": {
                    "interface_format": "OpenAI",
                    "base_url": "https://api.openai.com/v1",
                    "model_name": "gpt-4o",
                    "temperature": 0.9,
                    "max_tokens": 8000
                }
            },
            "stages": {
                "default": "ollama:llama3",
                "drafter": "writer",
                "outliner": "gemini:gemini-1.5-pro"
            },
            "generation": { "chapters": 12, "revision": false }
        }"#;

        let config = Config::from_json_str(json).unwrap();
        assert_eq!(config.generation.chapters, 12);
        assert_eq!(config.generation.fact_cap, 30);
        assert_eq!(config.generation.effective_max_attempts(), 1);

        let drafter = config.stage_parameters(Stage::Drafting).unwrap();
        assert_eq!(drafter.model, "writer");
        assert_eq!(drafter.max_tokens, 8000);
        assert!((drafter.temperature - 0.9).abs() < f32::EPSILON);

        let analyzer = config.stage_parameters(Stage::Analysis).unwrap();
        assert_eq!(analyzer.model, "ollama:llama3");
        assert!((analyzer.temperature - Stage::Analysis.default_temperature()).abs() < f32::EPSILON);

        assert_eq!(
            config.stages.selections(),
            vec!["ollama:llama3", "gemini:gemini-1.5-pro", "writer"]
        );
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_json_str("   ").unwrap();
        assert_eq!(config.generation, GenerationSettings::default());
        assert_eq!(config.stages.for_stage(Stage::Extraction), "ollama:llama3");
        assert_eq!(config.generation.run_budget(), None);
    }

    #[test]
    fn invalid_selection_is_reported_with_stage() {
        let mut config = Config::default();
        config.stages.set(Stage::Outline, "azure://host:gpt");
        match config.stage_parameters(Stage::Outline) {
            Err(ConfigError::InvalidSelection { stage, selection, .. }) => {
                assert_eq!(stage, Stage::Outline);
                assert_eq!(selection, "azure://host:gpt");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn store_persists_config() {
        let temp = tempdir().unwrap();
        let config_path = temp.path().join("nested").join("config.json");

        let mut store = ConfigStore::open(config_path.clone()).unwrap();
        store.config_mut().upsert_llm_profile(
            "local",
            LlmConfig {
                interface_format: "Ollama".into(),
                model_name: "llama3".into(),
                ..LlmConfig::default()
            },
        );
        store.config_mut().generation.run_budget_secs = Some(900);
        store.touch_llm_interface("local");
        store.save().unwrap();

        let store = ConfigStore::open(config_path).unwrap();
        assert_eq!(store.last_llm_interface(), Some("local"));
        assert_eq!(
            store.config().generation.run_budget(),
            Some(Duration::from_secs(900))
        );
    }
}
