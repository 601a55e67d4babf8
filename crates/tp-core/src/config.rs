use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.taskpilot/config.toml`.
///
/// API keys are never stored here. The Anthropic key is read at runtime
/// from the variable named by [`ProvidersConfig::anthropic_key_env`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Config {
    /// Load config from `~/.taskpilot/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.context.validate()?;
        self.monitor.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskpilot")
            .join("config.toml")
    }

    /// Resolve `general.data_dir`, expanding a leading `~`.
    pub fn data_dir(&self) -> PathBuf {
        let raw = self.general.data_dir.as_str();
        match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest),
            None if raw == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            None => PathBuf::from(raw),
        }
    }

    /// Read the Anthropic API key from the configured env var.
    pub fn anthropic_api_key(&self) -> Option<String> {
        std::env::var(&self.providers.anthropic_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_project_name() -> String {
    "taskpilot".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> String {
    "~/.taskpilot".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Initial value of the auto-progression flag for a fresh session.
    #[serde(default)]
    pub auto_progression: bool,
    #[serde(default)]
    pub analyze_on_create: bool,
    /// Recorded as the acting agent on every history entry.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_progression: false,
            analyze_on_create: false,
            agent_id: default_agent_id(),
        }
    }
}

fn default_agent_id() -> String {
    "taskpilot-engine".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_items")]
    pub max_items_per_workflow: usize,
    #[serde(default = "default_max_tokens_before_compression")]
    pub max_tokens_before_compression: usize,
    /// Compression target as a fraction of the original token count.
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_compression_validity_secs")]
    pub compression_validity_secs: u64,
    #[serde(default = "default_growth_tolerance")]
    pub compression_growth_tolerance: usize,
    #[serde(default = "default_retained_recent")]
    pub retained_recent: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_items_per_workflow: default_max_items(),
            max_tokens_before_compression: default_max_tokens_before_compression(),
            compression_ratio: default_compression_ratio(),
            max_age_secs: default_max_age_secs(),
            compression_validity_secs: default_compression_validity_secs(),
            compression_growth_tolerance: default_growth_tolerance(),
            retained_recent: default_retained_recent(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.compression_ratio > 0.0 && self.compression_ratio <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "context.compression_ratio must be in (0, 1], got {}",
                self.compression_ratio
            )));
        }
        if self.max_items_per_workflow == 0 {
            return Err(ConfigError::Validation(
                "context.max_items_per_workflow must be at least 1".into(),
            ));
        }
        if !(1..=5).contains(&self.retained_recent) {
            return Err(ConfigError::Validation(format!(
                "context.retained_recent must be between 1 and 5, got {}",
                self.retained_recent
            )));
        }
        Ok(())
    }
}

fn default_max_items() -> usize {
    100
}
fn default_max_tokens_before_compression() -> usize {
    100_000
}
fn default_compression_ratio() -> f64 {
    0.7
}
fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_compression_validity_secs() -> u64 {
    30 * 60
}
fn default_growth_tolerance() -> usize {
    5
}
fn default_retained_recent() -> usize {
    3
}
fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_blocked_threshold")]
    pub blocked_threshold_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            blocked_threshold_secs: default_blocked_threshold(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_monitor_interval() -> u64 {
    5
}
fn default_blocked_threshold() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Name of the env var holding the Anthropic API key.
    #[serde(default = "default_anthropic_key_env")]
    pub anthropic_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic_key_env: default_anthropic_key_env(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
            base_url: default_base_url(),
        }
    }
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout() -> u64 {
    120
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
