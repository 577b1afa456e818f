//! Configuration for the resilience subsystem
//!
//! Two configuration layers:
//!
//! - [`WorkerConfig`]: immutable per-worker settings owned by a Subagent
//!   (restart budget, resource limits, task timeout).
//! - [`ResilienceConfig`]: subsystem-wide tunables loaded from TOML.
//!
//! ## Loading order
//!
//! 1. `WARDEN_CONFIG` environment variable (path to TOML file)
//! 2. `warden.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! The host constructs one `ResilienceConfig` at startup and passes it by
//! reference to every component that needs it; there is no global config
//! singleton.

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Per-worker configuration
// ============================================================================

/// Immutable configuration of a single worker. Created at registration,
/// owned by the worker's Subagent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Logical worker id (unique within the registry)
    pub id: String,
    /// Worker kind, used to provision identical replacements
    pub kind: String,
    /// Opaque payload handed to the provisioning collaborator
    #[serde(default)]
    pub config_payload: serde_json::Value,
    /// Automatic restart budget for this logical worker id
    pub max_restart_attempts: u32,
    /// Memory limit used for soft-threshold evaluation
    pub memory_limit_bytes: u64,
    /// CPU limit used for soft-threshold evaluation
    pub cpu_limit_percent: f64,
    /// Task timeout used as the latency limit for soft-threshold evaluation
    pub task_timeout_ms: u64,
}

impl WorkerConfig {
    /// Configuration for an identical replacement worker under a new id.
    /// The restart budget applies to the new id from zero; no state is
    /// migrated.
    pub fn replacement(&self, new_id: impl Into<String>) -> Self {
        Self {
            id: new_id.into(),
            ..self.clone()
        }
    }
}

// ============================================================================
// Subsystem configuration
// ============================================================================

/// Health-probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbingConfig {
    /// Per-worker probe interval in milliseconds
    pub interval_ms: u64,
    /// Transparent probe retries before a failure is counted
    pub retry_attempts: u32,
    /// Consecutive failures before the worker is declared failed
    pub consecutive_failure_threshold: u32,
    /// Heartbeat silence in milliseconds before the worker is declared failed
    pub heartbeat_timeout_ms: u64,
}

impl Default for ProbingConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::PROBE_INTERVAL.as_millis() as u64,
            retry_attempts: defaults::PROBE_RETRY_ATTEMPTS,
            consecutive_failure_threshold: defaults::CONSECUTIVE_FAILURE_THRESHOLD,
            heartbeat_timeout_ms: defaults::HEARTBEAT_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Hysteresis band for the degraded state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Fraction of a limit that trips healthy → degraded
    pub soft_ratio: f64,
    /// Fraction of a limit all metrics must drop below for degraded → healthy
    pub recovery_ratio: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            soft_ratio: defaults::SOFT_THRESHOLD_RATIO,
            recovery_ratio: defaults::RECOVERY_THRESHOLD_RATIO,
        }
    }
}

/// Predictive-scan settings. The probability *weights* are contract
/// constants in [`defaults`] and deliberately not configurable; only the
/// scan cadence and action tiers are.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Predictive scan interval in milliseconds
    pub scan_interval_ms: u64,
    /// Probability above which a replacement is spawned pre-emptively
    pub replace_above: f64,
    /// Probability above which load is reduced and a backup pre-registered
    pub backup_above: f64,
    /// Probability above which load is reduced
    pub reduce_load_above: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: defaults::PREDICTIVE_SCAN_INTERVAL.as_millis() as u64,
            replace_above: defaults::REPLACE_PROBABILITY,
            backup_above: defaults::BACKUP_PROBABILITY,
            reduce_load_above: defaults::REDUCE_LOAD_PROBABILITY,
        }
    }
}

/// Tightened circuit-breaker settings applied by `reduce_load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerTuningConfig {
    /// Lowered failure threshold for a worker under reduced load
    pub tightened_failure_threshold: u32,
    /// Lengthened recovery timeout in milliseconds
    pub tightened_recovery_timeout_ms: u64,
}

impl Default for BreakerTuningConfig {
    fn default() -> Self {
        Self {
            tightened_failure_threshold: defaults::TIGHTENED_FAILURE_THRESHOLD,
            tightened_recovery_timeout_ms: defaults::TIGHTENED_RECOVERY_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Settings for the domain-agnostic `HealthMonitor` and the `AlertManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Probe latency in milliseconds above which slow-response is emitted
    pub slow_response_ms: u64,
    /// Retention window for recorded alerts, in minutes
    pub alert_retention_minutes: i64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            slow_response_ms: defaults::SLOW_RESPONSE_THRESHOLD.as_millis() as u64,
            alert_retention_minutes: defaults::ALERT_RETENTION_MINUTES,
        }
    }
}

/// Subsystem-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub probing: ProbingConfig,
    pub thresholds: ThresholdConfig,
    pub prediction: PredictionConfig,
    pub breaker: BreakerTuningConfig,
    pub observation: ObservationConfig,
}

impl ResilienceConfig {
    /// Load configuration using the documented order: `WARDEN_CONFIG` env
    /// var, then `warden.toml` in the working directory, then defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("WARDEN_CONFIG") {
            match Self::from_file(&path) {
                Ok(config) => {
                    info!(path = %path, "Loaded resilience config from WARDEN_CONFIG");
                    return config;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "WARDEN_CONFIG set but unusable — falling back");
                }
            }
        }

        if Path::new("warden.toml").exists() {
            match Self::from_file("warden.toml") {
                Ok(config) => {
                    info!("Loaded resilience config from ./warden.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "./warden.toml unusable — using defaults");
                }
            }
        }

        info!("Using built-in resilience config defaults");
        Self::default()
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probing.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "probing.interval_ms must be positive".to_string(),
            ));
        }
        if self.probing.consecutive_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "probing.consecutive_failure_threshold must be positive".to_string(),
            ));
        }
        if !(0.0 < self.thresholds.recovery_ratio
            && self.thresholds.recovery_ratio < self.thresholds.soft_ratio
            && self.thresholds.soft_ratio <= 1.0)
        {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy 0 < recovery_ratio ({}) < soft_ratio ({}) <= 1",
                self.thresholds.recovery_ratio, self.thresholds.soft_ratio
            )));
        }
        let p = &self.prediction;
        if !(0.0 < p.reduce_load_above
            && p.reduce_load_above < p.backup_above
            && p.backup_above < p.replace_above
            && p.replace_above <= 1.0)
        {
            return Err(ConfigError::Invalid(format!(
                "prediction tiers must satisfy 0 < reduce_load_above ({}) < backup_above ({}) < replace_above ({}) <= 1",
                p.reduce_load_above, p.backup_above, p.replace_above
            )));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probing.interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.probing.heartbeat_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.prediction.scan_interval_ms)
    }

    pub fn slow_response_threshold(&self) -> Duration {
        Duration::from_millis(self.observation.slow_response_ms)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ResilienceConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_intervals() {
        let config = ResilienceConfig::default();
        assert_eq!(config.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_inverted_hysteresis_band_rejected() {
        let mut config = ResilienceConfig::default();
        config.thresholds.recovery_ratio = 0.95;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_prediction_tiers_rejected() {
        let mut config = ResilienceConfig::default();
        config.prediction.replace_above = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ResilienceConfig = toml::from_str(
            r#"
            [probing]
            interval_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.probing.interval_ms, 5000);
        // Untouched sections keep their defaults
        assert_eq!(config.prediction.replace_above, 0.9);
        assert_eq!(config.probing.retry_attempts, 3);
    }

    #[test]
    fn test_replacement_config_keeps_kind_and_limits() {
        let config = WorkerConfig {
            id: "worker-a".to_string(),
            kind: "research".to_string(),
            config_payload: serde_json::json!({"model": "large"}),
            max_restart_attempts: 3,
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_limit_percent: 80.0,
            task_timeout_ms: 30_000,
        };
        let replacement = config.replacement("worker-b");
        assert_eq!(replacement.id, "worker-b");
        assert_eq!(replacement.kind, "research");
        assert_eq!(replacement.max_restart_attempts, 3);
        assert_eq!(replacement.config_payload, config.config_payload);
    }
}
