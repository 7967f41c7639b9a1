// shared-types-rs/src/config.rs
// Configuration for the prompt-evolution services.
//
// Loaded once by the binary from a TOML file (EVOLUTION_CONFIG_PATH, default
// ./config/evolution.toml) with environment overrides applied on top. A
// missing file yields the defaults below.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use config_rs::{env_bool, env_parse, env_string};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "./config/evolution.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub storage: StorageConfig,
    pub completion: CompletionConfig,
    pub transcripts: TranscriptConfig,
    pub analyzer: AnalyzerConfig,
    pub synthesizer: SynthesizerConfig,
    pub gate: GateConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("data/prompt-evolution"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Base URL of an OpenAI-compatible API, without `/chat/completions`.
    pub api_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 4096,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Directory of `*.ndjson` files, one transcript per line.
    pub dir: PathBuf,
    pub fetch_timeout_secs: u64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/transcripts"),
            fetch_timeout_secs: 30,
        }
    }
}

/// A keyword family that marks friction in a call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FrictionRule {
    pub category: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub severity: f64,
    pub recommendation: String,
}

impl FrictionRule {
    fn new(
        category: &str,
        description: &str,
        keywords: &[&str],
        severity: f64,
        recommendation: &str,
    ) -> Self {
        Self {
            category: category.to_string(),
            description: description.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            severity,
            recommendation: recommendation.to_string(),
        }
    }
}

/// Categories the analyzer derives from call metrics rather than keywords.
pub const UNSUCCESSFUL_CALL: &str = "unsuccessful_call";
pub const LONG_CALL: &str = "long_call";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub friction_rules: Vec<FrictionRule>,
    /// Phrases that mark a call as successful when it has no explicit outcome.
    pub success_markers: Vec<String>,
    pub long_call_secs: f64,
    pub unsuccessful_severity: f64,
    pub unsuccessful_recommendation: String,
    pub long_call_severity: f64,
    pub long_call_recommendation: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            friction_rules: vec![
                FrictionRule::new(
                    "human_handoff",
                    "Caller asked to be transferred to a person",
                    &["speak to a human", "real person", "representative", "operator"],
                    3.0,
                    "Offer a clear escalation path and acknowledge requests for a human immediately",
                ),
                FrictionRule::new(
                    "frustration",
                    "Caller expressed frustration",
                    &["frustrating", "frustrated", "annoying", "ridiculous", "forget it"],
                    3.0,
                    "Acknowledge frustration with empathetic language before continuing",
                ),
                FrictionRule::new(
                    "price_objection",
                    "Caller objected to price or value",
                    &["too expensive", "worth the money", "costs too much", "cheaper"],
                    2.0,
                    "Handle price objections by restating value and offering options",
                ),
                FrictionRule::new(
                    "hesitation",
                    "Caller deferred the decision",
                    &["think about it", "call back later", "maybe later", "not sure"],
                    2.0,
                    "Respond to hesitation by proposing a concrete follow-up time",
                ),
                FrictionRule::new(
                    "confusion",
                    "Caller did not understand the agent",
                    &["confused", "don't understand", "what do you mean", "repeat that"],
                    1.5,
                    "Use shorter sentences and confirm understanding before moving on",
                ),
            ],
            success_markers: vec![
                "appointment is booked".to_string(),
                "you're all set".to_string(),
                "booking confirmed".to_string(),
            ],
            long_call_secs: 600.0,
            unsuccessful_severity: 2.5,
            unsuccessful_recommendation:
                "Guide every call toward a concrete next step and confirm it before ending"
                    .to_string(),
            long_call_severity: 1.0,
            long_call_recommendation:
                "Collect booking details in fewer exchanges to keep calls short".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    pub created_by: String,
    /// Upper bound on recommendations embedded in one synthesis request.
    pub max_recommendations: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            created_by: "system:prompt-synthesizer".to_string(),
            max_recommendations: 5,
        }
    }
}

/// One scripted conversation replayed against a candidate prompt.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulationScenario {
    pub id: String,
    pub customer_turns: Vec<String>,
    pub expected_keywords: Vec<String>,
    #[serde(default)]
    pub forbidden_keywords: Vec<String>,
}

impl SimulationScenario {
    fn new(id: &str, turns: &[&str], expected: &[&str], forbidden: &[&str]) -> Self {
        let owned = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        Self {
            id: id.to_string(),
            customer_turns: owned(turns),
            expected_keywords: owned(expected),
            forbidden_keywords: owned(forbidden),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    pub max_growth_ratio: f64,
    pub forbidden_terms: Vec<String>,
    pub core_phrases: Vec<String>,
    pub simulation_threshold: f64,
    pub scenario_floor: f64,
    pub scenarios: Vec<SimulationScenario>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_chars: 50,
            max_chars: 4000,
            max_growth_ratio: 2.0,
            forbidden_terms: ["bypass", "disregard instructions", "harmful", "unethical", "illegal"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            core_phrases: ["appointment", "booking", "schedule", "services", "consultation"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            simulation_threshold: 0.6,
            scenario_floor: 0.25,
            scenarios: vec![
                SimulationScenario::new(
                    "price_objection",
                    &["I'm not sure if this is worth the money."],
                    &["understand", "value"],
                    &["guarantee"],
                ),
                SimulationScenario::new(
                    "hesitation",
                    &["I need to think about it."],
                    &["understand", "follow up"],
                    &[],
                ),
                SimulationScenario::new(
                    "human_request",
                    &["This is frustrating. Can I speak to a human?"],
                    &["sorry", "connect"],
                    &[],
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 0 6 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// Seed prompt installed as `v1.0` when the store is empty at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// JSON file holding a `PromptContent` document.
    pub prompt_path: Option<PathBuf>,
}

impl EvolutionConfig {
    /// Load from `EVOLUTION_CONFIG_PATH` (or the default path), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<EvolutionConfig, ConfigError> {
        let config_path =
            env::var("EVOLUTION_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load_from(Path::new(&config_path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse `path`, or return the defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<EvolutionConfig, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<EvolutionConfig, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(backend) = env_string("EVOLUTION_STORAGE_BACKEND") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "file" => self.storage.backend = StorageBackend::File,
                other => tracing::warn!(backend = %other, "Unknown storage backend, keeping configured value"),
            }
        }
        if let Some(dir) = env_string("EVOLUTION_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("EVOLUTION_TRANSCRIPTS_DIR") {
            self.transcripts.dir = PathBuf::from(dir);
        }
        if let Some(cron) = env_string("EVOLUTION_SCHEDULE") {
            self.scheduler.cron = cron;
        }
        if let Some(url) = env_string("LLM_API_URL") {
            self.completion.api_url = url;
        }
        if let Some(model) = env_string("LLM_MODEL") {
            self.completion.model = model;
        }
        if let Some(key) = env_string("LLM_API_KEY") {
            self.completion.api_key = Some(key);
        }
        self.completion.timeout_secs = env_parse("LLM_TIMEOUT_SECS", self.completion.timeout_secs);
        if let Some(level) = env_string("LOG_LEVEL") {
            self.logging.level = level;
        }
        self.logging.json = env_bool("LOG_JSON", self.logging.json);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidValue(msg));
        let gate = &self.gate;
        if gate.min_chars >= gate.max_chars {
            return invalid(format!(
                "gate.min_chars ({}) must be below gate.max_chars ({})",
                gate.min_chars, gate.max_chars
            ));
        }
        if gate.max_growth_ratio <= 0.0 {
            return invalid("gate.max_growth_ratio must be positive".to_string());
        }
        for (name, value) in [
            ("gate.simulation_threshold", gate.simulation_threshold),
            ("gate.scenario_floor", gate.scenario_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if let Some(s) = gate.scenarios.iter().find(|s| s.expected_keywords.is_empty()) {
            return invalid(format!("scenario '{}' has no expected keywords", s.id));
        }
        if self.completion.timeout_secs == 0 || self.transcripts.fetch_timeout_secs == 0 {
            return invalid("timeouts must be at least one second".to_string());
        }
        let mut seen = HashSet::new();
        for rule in &self.analyzer.friction_rules {
            let category = rule.category.trim();
            if category.is_empty() || rule.keywords.is_empty() {
                return invalid(format!(
                    "friction rule '{}' needs a category and at least one keyword",
                    rule.category
                ));
            }
            if category == UNSUCCESSFUL_CALL || category == LONG_CALL {
                return invalid(format!(
                    "friction rule category '{category}' is reserved for built-in issues"
                ));
            }
            if !seen.insert(category) {
                return invalid(format!("friction rule category '{category}' is declared twice"));
            }
            if rule.keywords.iter().any(|k| k.trim().is_empty()) {
                return invalid(format!("friction rule '{category}' has a blank keyword"));
            }
        }
        Ok(())
    }
}
