//! Pipeline configuration.
//!
//! `PipelineConfig` is the process-wide default; each `start_pipeline` call
//! may supply `PipelineConfigOverrides` which are merged field by field over
//! it. The merged config travels with the `execute` job, so every process
//! that runs the control loop sees the same values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{BackoffPolicy, JobOptions};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Retry policy applied to every phase job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Total attempts per phase job, including the first.
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryStrategy {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            self.initial_delay_ms,
            self.backoff_multiplier,
            self.max_delay_ms,
        )
    }

    /// Delay before retry `attempt` (1-based):
    /// `initial_delay_ms * backoff_multiplier^(attempt - 1)`, capped at
    /// `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_policy().delay_for_attempt(attempt)
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Accepted for compatibility; phases always run sequentially.
    pub enable_parallel_phases: bool,
    pub enable_checkpoints: bool,
    /// Advisory checkpoint interval in seconds. Checkpoints are taken at
    /// phase boundaries regardless.
    pub checkpoint_interval: u64,
    pub retry_strategy: RetryStrategy,
    /// Per-attempt timeout handed to phase jobs, in milliseconds.
    pub timeout_ms: u64,
    /// Mirror transitions and checkpoints to the `audit` log target.
    pub enable_audit_log: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_parallel_phases: false,
            enable_checkpoints: true,
            checkpoint_interval: 60,
            retry_strategy: RetryStrategy::default(),
            timeout_ms: 300_000,
            enable_audit_log: true,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_ENABLE_PARALLEL_PHASES`: Accepted, unused (default: false)
    /// - `PIPELINE_ENABLE_CHECKPOINTS`: Record checkpoints (default: true)
    /// - `PIPELINE_CHECKPOINT_INTERVAL_SECS`: Advisory interval (default: 60)
    /// - `PIPELINE_MAX_RETRIES`: Attempts per phase job (default: 3)
    /// - `PIPELINE_BACKOFF_MULTIPLIER`: Backoff growth factor (default: 2.0)
    /// - `PIPELINE_INITIAL_DELAY_MS`: First retry delay (default: 1000)
    /// - `PIPELINE_MAX_DELAY_MS`: Retry delay cap (default: 30000)
    /// - `PIPELINE_TIMEOUT_MS`: Per-attempt timeout (default: 300000)
    /// - `PIPELINE_ENABLE_AUDIT_LOG`: Audit log target (default: true)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PIPELINE_ENABLE_PARALLEL_PHASES") {
            config.enable_parallel_phases =
                parse_env_bool(&val, "PIPELINE_ENABLE_PARALLEL_PHASES")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_ENABLE_CHECKPOINTS") {
            config.enable_checkpoints = parse_env_bool(&val, "PIPELINE_ENABLE_CHECKPOINTS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_CHECKPOINT_INTERVAL_SECS") {
            config.checkpoint_interval =
                parse_env_value(&val, "PIPELINE_CHECKPOINT_INTERVAL_SECS")?;
        }

        // Retry settings
        if let Ok(val) = std::env::var("PIPELINE_MAX_RETRIES") {
            config.retry_strategy.max_retries = parse_env_value(&val, "PIPELINE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_BACKOFF_MULTIPLIER") {
            config.retry_strategy.backoff_multiplier =
                parse_env_value(&val, "PIPELINE_BACKOFF_MULTIPLIER")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_INITIAL_DELAY_MS") {
            config.retry_strategy.initial_delay_ms =
                parse_env_value(&val, "PIPELINE_INITIAL_DELAY_MS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_MAX_DELAY_MS") {
            config.retry_strategy.max_delay_ms = parse_env_value(&val, "PIPELINE_MAX_DELAY_MS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_TIMEOUT_MS") {
            config.timeout_ms = parse_env_value(&val, "PIPELINE_TIMEOUT_MS")?;
        }

        if let Ok(val) = std::env::var("PIPELINE_ENABLE_AUDIT_LOG") {
            config.enable_audit_log = parse_env_bool(&val, "PIPELINE_ENABLE_AUDIT_LOG")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads defaults from a YAML file.
    ///
    /// The file has the shape of `PipelineConfigOverrides` (camelCase keys,
    /// every key optional); missing keys keep their built-in default.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let overrides: PipelineConfigOverrides = serde_yaml::from_str(&content)?;
        let config = Self::default().merged(&overrides);
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.retry_strategy;

        if retry.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::ValidationFailed(
                "initial_delay_ms cannot exceed max_delay_ms".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns a copy with every field set in `overrides` replaced.
    pub fn merged(&self, overrides: &PipelineConfigOverrides) -> Self {
        let mut config = self.clone();

        if let Some(v) = overrides.enable_parallel_phases {
            config.enable_parallel_phases = v;
        }
        if let Some(v) = overrides.enable_checkpoints {
            config.enable_checkpoints = v;
        }
        if let Some(v) = overrides.checkpoint_interval {
            config.checkpoint_interval = v;
        }
        if let Some(v) = overrides.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = overrides.enable_audit_log {
            config.enable_audit_log = v;
        }

        if let Some(retry) = &overrides.retry_strategy {
            let target = &mut config.retry_strategy;
            if let Some(v) = retry.max_retries {
                target.max_retries = v;
            }
            if let Some(v) = retry.backoff_multiplier {
                target.backoff_multiplier = v;
            }
            if let Some(v) = retry.initial_delay_ms {
                target.initial_delay_ms = v;
            }
            if let Some(v) = retry.max_delay_ms {
                target.max_delay_ms = v;
            }
        }

        config
    }

    /// Options for a phase job: `max_retries` attempts, exponential backoff,
    /// `timeout_ms` per attempt.
    pub fn phase_job_options(&self) -> JobOptions {
        JobOptions::new()
            .with_attempts(self.retry_strategy.max_retries)
            .with_backoff(self.retry_strategy.backoff_policy())
            .with_timeout_ms(self.timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builder method to enable or disable checkpoints.
    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.enable_checkpoints = enabled;
        self
    }

    /// Builder method to set the retry strategy.
    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Builder method to set the per-attempt timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Builder method to enable or disable the audit log.
    pub fn with_audit_log(mut self, enabled: bool) -> Self {
        self.enable_audit_log = enabled;
        self
    }
}

/// Partial retry strategy, merged over the default one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryStrategyOverrides {
    pub max_retries: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Per-run configuration supplied to `start_pipeline`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfigOverrides {
    pub enable_parallel_phases: Option<bool>,
    pub enable_checkpoints: Option<bool>,
    pub checkpoint_interval: Option<u64>,
    pub retry_strategy: Option<RetryStrategyOverrides>,
    pub timeout_ms: Option<u64>,
    pub enable_audit_log: Option<bool>,
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(!config.enable_parallel_phases);
        assert!(config.enable_checkpoints);
        assert_eq!(config.checkpoint_interval, 60);
        assert_eq!(config.retry_strategy.max_retries, 3);
        assert!((config.retry_strategy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.retry_strategy.initial_delay_ms, 1000);
        assert_eq!(config.retry_strategy.max_delay_ms, 30_000);
        assert_eq!(config.timeout_ms, 300_000);
        assert!(config.enable_audit_log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_formula() {
        let retry = RetryStrategy::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_phase_job_options() {
        let config = PipelineConfig::default().with_timeout_ms(5000);
        let options = config.phase_job_options();

        assert_eq!(options.attempts, 3);
        assert_eq!(options.timeout_ms, Some(5000));
        let backoff = options.backoff.unwrap();
        assert_eq!(backoff.delay, 1000);
        assert_eq!(backoff.max_delay, Some(30_000));
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let overrides = PipelineConfigOverrides {
            enable_checkpoints: Some(false),
            retry_strategy: Some(RetryStrategyOverrides {
                max_retries: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = PipelineConfig::default().merged(&overrides);

        assert!(!merged.enable_checkpoints);
        assert_eq!(merged.retry_strategy.max_retries, 5);
        assert_eq!(merged.retry_strategy.initial_delay_ms, 1000);
        assert_eq!(merged.timeout_ms, 300_000);
        assert!(merged.enable_audit_log);
    }

    #[test]
    fn test_empty_overrides_are_identity() {
        let base = PipelineConfig::default().with_audit_log(false);
        assert_eq!(base.merged(&PipelineConfigOverrides::default()), base);
    }

    #[test]
    fn test_overrides_wire_format() {
        let overrides: PipelineConfigOverrides = serde_json::from_str(
            r#"{"enableCheckpoints": false, "retryStrategy": {"maxRetries": 1}}"#,
        )
        .unwrap();

        assert_eq!(overrides.enable_checkpoints, Some(false));
        assert_eq!(
            overrides.retry_strategy.and_then(|r| r.max_retries),
            Some(1)
        );
        assert_eq!(overrides.timeout_ms, None);
    }

    #[test]
    fn test_validation_zero_retries() {
        let config = PipelineConfig::default().with_retry_strategy(RetryStrategy {
            max_retries: 0,
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_validation_multiplier_below_one() {
        let config = PipelineConfig::default().with_retry_strategy(RetryStrategy {
            backoff_multiplier: 0.5,
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_validation_initial_exceeds_max() {
        let config = PipelineConfig::default().with_retry_strategy(RetryStrategy {
            initial_delay_ms: 60_000,
            max_delay_ms: 1000,
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initial_delay_ms"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let config = PipelineConfig::default().with_timeout_ms(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "enableAuditLog: false\nretryStrategy:\n  maxRetries: 7\n  initialDelayMs: 10\ntimeoutMs: 2000"
        )
        .unwrap();

        let config = PipelineConfig::from_yaml_file(file.path()).unwrap();

        assert!(!config.enable_audit_log);
        assert_eq!(config.retry_strategy.max_retries, 7);
        assert_eq!(config.retry_strategy.initial_delay_ms, 10);
        assert_eq!(config.retry_strategy.max_delay_ms, 30_000);
        assert_eq!(config.timeout_ms, 2000);
        assert!(config.enable_checkpoints);
    }

    #[test]
    fn test_from_yaml_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retryStrategy:\n  maxRetries: 0").unwrap();

        let err = PipelineConfig::from_yaml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_from_yaml_file_missing() {
        let err = PipelineConfig::from_yaml_file("/nonexistent/pipeline.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let v: u32 = parse_env_value("12", "PIPELINE_MAX_RETRIES").unwrap();
        assert_eq!(v, 12);

        let err = parse_env_value::<u64>("abc", "PIPELINE_TIMEOUT_MS").unwrap_err();
        assert!(err.to_string().contains("PIPELINE_TIMEOUT_MS"));
    }
}
