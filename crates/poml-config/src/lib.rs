use poml_core::{PomlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod env_substitution;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConverterConfig {
    #[serde(default)]
    pub endpoint: EndpointSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub billing: BillingSettings,
    #[serde(default)]
    pub paths: PathSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Upper bound for a single HTTP attempt.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSettings {
    #[serde(default = "default_trial_limit")]
    pub trial_limit: u32,
    /// Conversions granted on top of the trial once signed in.
    #[serde(default = "default_bonus_allowance")]
    pub bonus_allowance: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySettings {
    #[serde(default)]
    pub record_anonymous: bool,
    /// How many recent records a non-Pro tier may see. Unset shows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_visible_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingSettings {
    /// Authenticated user ids holding a paid plan.
    #[serde(default)]
    pub pro_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl ConverterConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PomlError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut tree: Value = if yaml.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|e| PomlError::ConfigError(format!("Failed to parse YAML: {}", e)))?
        };
        if tree.is_null() {
            tree = Value::Object(serde_json::Map::new());
        }

        substitute_env_vars(&mut tree)?;

        let mut config: ConverterConfig = serde_json::from_value(tree)
            .map_err(|e| PomlError::ConfigError(format!("Invalid configuration: {}", e)))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(data_dir) = env::var("POML_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(data_dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.model.is_empty() {
            return Err(PomlError::ConfigError("Model cannot be empty".into()));
        }
        if !self.endpoint.base_url.starts_with("http://")
            && !self.endpoint.base_url.starts_with("https://")
        {
            return Err(PomlError::ConfigError(
                "Endpoint base_url must start with http:// or https://".into(),
            ));
        }
        if self.client.retry.max_attempts == 0 {
            return Err(PomlError::ConfigError("Retry max_attempts must be at least 1".into()));
        }
        if self.client.timeout_secs == 0 {
            return Err(PomlError::ConfigError("Client timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        default_data_dir().join("config.yaml")
    }
}

impl EndpointSettings {
    pub fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

impl RetryPolicy {
    /// Delay to wait after the given 1-based attempt failed, before the next one.
    ///
    /// Returns `None` once no attempt is left, so the final failure is never
    /// followed by a wait.
    pub fn delay_after(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt == 0 || failed_attempt >= self.max_attempts {
            return None;
        }

        let step = u64::from(failed_attempt - 1);
        let millis = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Linear => self.initial_delay_ms.saturating_mul(step + 1),
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(step as u32).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(factor)
            }
        };

        Some(Duration::from_millis(millis.min(self.max_delay_ms)))
    }
}

impl QuotaSettings {
    /// Total ceiling for a signed-in, non-Pro identity.
    pub fn bonus_limit(&self) -> u32 {
        self.trial_limit.saturating_add(self.bonus_allowance)
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: String::new(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            trial_limit: default_trial_limit(),
            bonus_allowance: default_bonus_allowance(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_base_url() -> String { "https://generativelanguage.googleapis.com/v1beta".to_string() }
fn default_model() -> String { "gemini-2.5-flash-preview-05-20".to_string() }
fn default_timeout_secs() -> u64 { 60 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_trial_limit() -> u32 { 2 }
fn default_bonus_allowance() -> u32 { 20 }

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("POML_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".poml-converter"))
        .unwrap_or_else(|| PathBuf::from("./.poml-converter"))
}
