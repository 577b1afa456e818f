//! Default constants for the resilience subsystem
//!
//! These back the `ResilienceConfig` defaults and, for the prediction
//! weights, are the contract itself: the failure-probability arithmetic is
//! a documented heuristic and its weights are deliberately not tunable.

use std::time::Duration;

// ============================================================================
// Probing
// ============================================================================

/// Per-worker health probe interval
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Transparent retries of a probe call before counting a real failure
pub const PROBE_RETRY_ATTEMPTS: u32 = 3;

/// Consecutive real probe failures before a worker is declared failed
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

/// Heartbeat silence before a worker is declared failed
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Hysteresis thresholds
// ============================================================================

/// Fraction of a configured limit that trips healthy → degraded
pub const SOFT_THRESHOLD_RATIO: f64 = 0.9;

/// Fraction of a configured limit all metrics must drop below for
/// degraded → healthy. The 0.7–0.9 band prevents flapping: a worker
/// sitting at 80% of a limit stays in its current state.
pub const RECOVERY_THRESHOLD_RATIO: f64 = 0.7;

/// Fraction of a configured limit that counts as resource pressure in
/// the failure-prediction heuristic
pub const RESOURCE_PRESSURE_RATIO: f64 = 0.8;

// ============================================================================
// Failure prediction (contract weights — do not tune)
// ============================================================================

/// Bounded trailing window of response-time samples kept per worker
pub const RESPONSE_TIME_WINDOW: usize = 100;

/// Minimum samples before the prediction heuristic produces a non-zero value
pub const MIN_PREDICTION_SAMPLES: usize = 10;

/// Size of each of the two trend windows (recent vs. preceding)
pub const TREND_WINDOW: usize = 10;

/// Relative response-time degradation that counts as a trend alarm
pub const DEGRADATION_ALARM_RATIO: f64 = 0.5;

/// Contribution of a response-time degradation alarm
pub const WEIGHT_DEGRADATION: f64 = 0.3;

/// Contribution of an unresolved probe failure
pub const WEIGHT_PROBE_FAILURE: f64 = 0.2;

/// Contribution of degraded status
pub const WEIGHT_DEGRADED_STATUS: f64 = 0.3;

/// Contribution of memory pressure (> 80% of limit)
pub const WEIGHT_MEMORY_PRESSURE: f64 = 0.1;

/// Contribution of CPU pressure (> 80% of limit)
pub const WEIGHT_CPU_PRESSURE: f64 = 0.1;

// ============================================================================
// Predictive scan
// ============================================================================

/// Interval of the manager's predictive scan, independent of reactive probing
pub const PREDICTIVE_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Probability above which a replacement is spawned pre-emptively
pub const REPLACE_PROBABILITY: f64 = 0.9;

/// Probability above which load is reduced and a backup pre-registered
pub const BACKUP_PROBABILITY: f64 = 0.8;

/// Probability above which load is reduced
pub const REDUCE_LOAD_PROBABILITY: f64 = 0.7;

// ============================================================================
// Circuit-breaker tuning
// ============================================================================

/// Tightened failure threshold applied by `reduce_load`
pub const TIGHTENED_FAILURE_THRESHOLD: u32 = 2;

/// Tightened recovery timeout applied by `reduce_load`
pub const TIGHTENED_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Monitor & alerts
// ============================================================================

/// Probe latency above which the monitor emits slow-response
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_secs(2);

/// Default retention window for recorded alerts
pub const ALERT_RETENTION_MINUTES: i64 = 60;
