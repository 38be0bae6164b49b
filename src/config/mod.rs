//! Configuration management.
//!
//! Values come from a TOML file and are then overridden by environment
//! variables (a `.env` file in the working directory is honoured). The core
//! only consumes the resolved structs below.

mod features;

pub use features::FeatureFlags;

use crate::llm::{ClientSettings, RetryConfig};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-4o";
/// Default small model for classification and skill updates.
pub const DEFAULT_NANO_MODEL: &str = "gpt-4o-mini";
/// Default token budget for large routes.
pub const DEFAULT_CONTEXT_BUDGET: usize = 32_000;
/// Default token budget for small routes.
pub const SMALL_CONTEXT_BUDGET: usize = 4_000;

/// Main configuration for tutorlog.
#[derive(Debug, Clone)]
pub struct TutorConfig {
    /// Directory holding the database and logs.
    pub data_dir: PathBuf,
    /// Feature flags.
    pub features: FeatureFlags,
    /// Remote model configuration.
    pub llm: LlmConfig,
    /// Summarization engine and scheduler configuration.
    pub summarization: SummarizationConfig,
    /// Metrics exporter configuration.
    pub metrics: MetricsSettings,
}

/// Remote completion service configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key for the completion service.
    pub api_key: Option<SecretString>,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Model used for summaries and chat.
    pub default_model: String,
    /// Model used for classification and skill updates.
    pub nano_model: String,
    /// Token budget for large routes.
    pub default_budget: usize,
    /// Token budget for small routes.
    pub small_budget: usize,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Sampling temperature.
    pub temperature: f32,
    /// Additional attempts after a retryable failure.
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff, in milliseconds.
    pub max_delay_ms: u64,
    /// Outbound queries per second.
    pub rate_limit_qps: f64,
    /// How long a call may wait for rate limiter admission, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            nano_model: DEFAULT_NANO_MODEL.to_string(),
            default_budget: DEFAULT_CONTEXT_BUDGET,
            small_budget: SMALL_CONTEXT_BUDGET,
            timeout_ms: 60_000,
            temperature: 0.7,
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            rate_limit_qps: 10.0,
            acquire_timeout_ms: 10_000,
        }
    }
}

/// Summarization engine and refresh scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizationConfig {
    /// Whether the scheduler and event hook do any work.
    pub enabled: bool,
    /// Maximum events aggregated into one update.
    pub batch_size: usize,
    /// Topics refreshed per scheduler batch.
    pub max_concurrent_topics: usize,
    /// Seconds between scheduler cycles.
    pub interval_secs: u64,
    /// Topics summarized more recently than this are skipped unless forced.
    pub cooldown_secs: u64,
    /// Prior events supplied as context.
    pub context_events: usize,
    /// Characters kept from each context event.
    pub context_chars: usize,
    /// Lookback used when discovering topics without an explicit cutoff.
    pub lookback_hours: i64,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            max_concurrent_topics: 5,
            interval_secs: 300,
            cooldown_secs: 300,
            context_events: 3,
            context_chars: 500,
            lookback_hours: 24,
        }
    }
}

impl SummarizationConfig {
    /// Returns the scheduler interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Whether the Prometheus recorder is installed.
    pub enabled: bool,
    /// Port for the Prometheus HTTP listener.
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Feature flags.
    pub features: Option<ConfigFileFeatures>,
    /// LLM configuration.
    pub llm: Option<ConfigFileLlm>,
    /// Summarization configuration.
    pub summarization: Option<ConfigFileSummarization>,
    /// Metrics configuration.
    pub metrics: Option<ConfigFileMetrics>,
}

/// Features section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileFeatures {
    /// Background summarization.
    pub summarization: Option<bool>,
    /// Payload logging.
    pub log_payloads: Option<bool>,
}

/// LLM section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLlm {
    /// API key.
    pub api_key: Option<String>,
    /// Base URL.
    pub base_url: Option<String>,
    /// Default model.
    pub default_model: Option<String>,
    /// Small model.
    pub nano_model: Option<String>,
    /// Large route budget.
    pub default_budget: Option<usize>,
    /// Small route budget.
    pub small_budget: Option<usize>,
    /// Request timeout.
    pub timeout_ms: Option<u64>,
    /// Temperature.
    pub temperature: Option<f32>,
    /// Max retries.
    pub max_retries: Option<u32>,
    /// Base backoff.
    pub base_delay_ms: Option<u64>,
    /// Max backoff.
    pub max_delay_ms: Option<u64>,
    /// Queries per second.
    pub rate_limit_qps: Option<f64>,
    /// Admission timeout.
    pub acquire_timeout_ms: Option<u64>,
}

/// Summarization section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileSummarization {
    /// Enabled.
    pub enabled: Option<bool>,
    /// Batch size.
    pub batch_size: Option<usize>,
    /// Topics per scheduler batch.
    pub max_concurrent_topics: Option<usize>,
    /// Interval.
    pub interval_secs: Option<u64>,
    /// Cooldown.
    pub cooldown_secs: Option<u64>,
}

/// Metrics section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileMetrics {
    /// Enabled.
    pub enabled: Option<bool>,
    /// Listener port.
    pub port: Option<u16>,
}

impl Default for TutorConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", "tutorlog")
            .map_or_else(|| PathBuf::from(".tutorlog"), |dirs| dirs.data_dir().to_path_buf());
        Self {
            data_dir,
            features: FeatureFlags::default(),
            llm: LlmConfig::default(),
            summarization: SummarizationConfig::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl TutorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path, then applies env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::operation("read_config_file", e))?;
        Self::from_toml_str(&contents).map(Self::with_env_overrides)
    }

    /// Parses configuration from TOML text without env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for [`ConfigFile`].
    pub fn from_toml_str(contents: &str) -> crate::Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| crate::Error::operation("parse_config_file", e))?;
        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks `<config_dir>/tutorlog/config.toml`, then
    /// `~/.config/tutorlog/config.toml`. Falls back to defaults; env
    /// overrides apply in every case.
    #[must_use]
    pub fn load_default() -> Self {
        let _ = dotenvy::dotenv();
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default().with_env_overrides();
        };

        let candidates = [
            base_dirs.config_dir().join("tutorlog").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("tutorlog")
                .join("config.toml"),
        ];
        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(path = %path.display(), "Ignoring config file: {e}"),
            }
        }

        Self::default().with_env_overrides()
    }

    /// Converts a `ConfigFile` to `TutorConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(features) = file.features {
            if let Some(v) = features.summarization {
                config.features.summarization = v;
            }
            if let Some(v) = features.log_payloads {
                config.features.log_payloads = v;
            }
        }
        if let Some(llm) = file.llm {
            apply_llm_section(&mut config.llm, llm);
        }
        if let Some(s) = file.summarization {
            if let Some(v) = s.enabled {
                config.summarization.enabled = v;
            }
            if let Some(v) = s.batch_size {
                config.summarization.batch_size = v.max(1);
            }
            if let Some(v) = s.max_concurrent_topics {
                config.summarization.max_concurrent_topics = v.max(1);
            }
            if let Some(v) = s.interval_secs {
                config.summarization.interval_secs = v.max(1);
            }
            if let Some(v) = s.cooldown_secs {
                config.summarization.cooldown_secs = v;
            }
        }
        if let Some(metrics) = file.metrics {
            if let Some(v) = metrics.enabled {
                config.metrics.enabled = v;
            }
            if let Some(v) = metrics.port {
                config.metrics.port = v;
            }
        }
        config.summarization.enabled &= config.features.summarization;

        config
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(key) = parse_string_env("OPENAI_API_KEY") {
            self.llm.api_key = Some(SecretString::from(key));
        }
        if let Some(url) = parse_string_env("TUTORLOG_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = parse_string_env("TUTORLOG_MODEL_DEFAULT") {
            self.llm.default_model = model;
        }
        if let Some(model) = parse_string_env("TUTORLOG_MODEL_NANO") {
            self.llm.nano_model = model;
        }
        if let Some(v) = parse_env::<u64>("TUTORLOG_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = v;
        }
        if let Some(v) = parse_env::<u32>("TUTORLOG_LLM_MAX_RETRIES") {
            self.llm.max_retries = v;
        }
        if let Some(v) = parse_env::<f64>("TUTORLOG_LLM_QPS") {
            self.llm.rate_limit_qps = v;
        }
        if let Some(dir) = parse_string_env("TUTORLOG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_bool_env("TUTORLOG_SUMMARIZATION_ENABLED") {
            self.features.summarization = v;
            self.summarization.enabled = v;
        }
        if let Some(v) = parse_bool_env("TUTORLOG_LOG_PAYLOADS") {
            self.features.log_payloads = v;
        }
        if let Some(v) = parse_bool_env("TUTORLOG_METRICS_ENABLED") {
            self.metrics.enabled = v;
        }
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Returns the `SQLite` database path inside the data directory.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tutorlog.db")
    }

    /// Builds orchestrator settings from the resolved configuration.
    #[must_use]
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            temperature: self.llm.temperature,
            acquire_timeout: Duration::from_millis(self.llm.acquire_timeout_ms),
            retry: RetryConfig::from_config(&self.llm),
            log_payloads: self.features.log_payloads,
        }
    }
}

fn apply_llm_section(llm: &mut LlmConfig, section: ConfigFileLlm) {
    if let Some(key) = section.api_key.filter(|k| !k.trim().is_empty()) {
        llm.api_key = Some(SecretString::from(key));
    }
    if let Some(v) = section.base_url {
        llm.base_url = v;
    }
    if let Some(v) = section.default_model {
        llm.default_model = v;
    }
    if let Some(v) = section.nano_model {
        llm.nano_model = v;
    }
    if let Some(v) = section.default_budget {
        llm.default_budget = v.max(1);
    }
    if let Some(v) = section.small_budget {
        llm.small_budget = v.max(1);
    }
    if let Some(v) = section.timeout_ms {
        llm.timeout_ms = v;
    }
    if let Some(v) = section.temperature {
        llm.temperature = v;
    }
    if let Some(v) = section.max_retries {
        llm.max_retries = v;
    }
    if let Some(v) = section.base_delay_ms {
        llm.base_delay_ms = v;
    }
    if let Some(v) = section.max_delay_ms {
        llm.max_delay_ms = v;
    }
    if let Some(v) = section.rate_limit_qps {
        llm.rate_limit_qps = v;
    }
    if let Some(v) = section.acquire_timeout_ms {
        llm.acquire_timeout_ms = v;
    }
}

pub(crate) fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        let value = value.to_lowercase();
        value == "true" || value == "1" || value == "yes"
    })
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_string_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_defaults_match_routing_table() {
        let config = TutorConfig::default();
        assert_eq!(config.llm.default_model, "gpt-4o");
        assert_eq!(config.llm.nano_model, "gpt-4o-mini");
        assert_eq!(config.llm.default_budget, 32_000);
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.summarization.cooldown_secs, 300);
        assert!(config.summarization.enabled);
        assert!(!config.features.log_payloads);
    }

    #[test]
    fn test_from_toml_overrides_sections() {
        let config = TutorConfig::from_toml_str(
            r#"
            data_dir = "/tmp/tutor"

            [llm]
            api_key = "sk-test"
            default_model = "gpt-4.1"
            max_retries = 5
            rate_limit_qps = 2.5

            [summarization]
            batch_size = 0
            max_concurrent_topics = 3

            [features]
            log_payloads = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/tutor"));
        assert_eq!(config.llm.default_model, "gpt-4.1");
        assert_eq!(config.llm.nano_model, DEFAULT_NANO_MODEL);
        assert_eq!(config.llm.max_retries, 5);
        assert!((config.llm.rate_limit_qps - 2.5).abs() < f64::EPSILON);
        assert_eq!(
            config.llm.api_key.as_ref().map(ExposeSecret::expose_secret),
            Some("sk-test")
        );
        assert_eq!(config.summarization.batch_size, 1);
        assert_eq!(config.summarization.max_concurrent_topics, 3);
        assert!(config.features.log_payloads);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/tutor/tutorlog.db"));
    }

    #[test]
    fn test_disabling_feature_disables_summarization() {
        let config = TutorConfig::from_toml_str("[features]\nsummarization = false\n").unwrap();
        assert!(!config.summarization.enabled);
    }

    #[test]
    fn test_invalid_toml_is_operation_error() {
        let err = TutorConfig::from_toml_str("llm = [").unwrap_err();
        assert!(matches!(err, crate::Error::OperationFailed { .. }));
    }

    #[test]
    fn test_client_settings_follow_config() {
        let mut config = TutorConfig::default();
        config.llm.max_retries = 1;
        config.llm.acquire_timeout_ms = 500;
        config.features.log_payloads = true;

        let settings = config.client_settings();
        assert_eq!(settings.retry.max_retries, 1);
        assert_eq!(settings.acquire_timeout, Duration::from_millis(500));
        assert!(settings.log_payloads);
    }
}
