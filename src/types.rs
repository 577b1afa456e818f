//! Shared data structures for the self-healing resilience subsystem
//!
//! Core types flowing between the Subagent state machines and the
//! SelfHealingManager:
//! - `WorkerStatus` / `HealthRecord`: per-worker liveness state
//! - `TaskRoute`: the coordination record binding a task to its worker
//! - `HealthReport` / `WorkerRisk`: aggregate reporting for operators
//!
//! `HealthRecord` is mutated only by its owning `Subagent`; everything the
//! manager sees is an owned snapshot clone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ============================================================================
// Worker status
// ============================================================================

/// Liveness state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Worker is operating normally
    Healthy,
    /// Worker is running but a soft resource or latency threshold is crossed
    Degraded,
    /// Worker is not responding, or restarts are exhausted
    Failed,
    /// A restart is in flight
    Recovering,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Healthy => write!(f, "healthy"),
            WorkerStatus::Degraded => write!(f, "degraded"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::Recovering => write!(f, "recovering"),
        }
    }
}

// ============================================================================
// Health record
// ============================================================================

/// Per-worker health record owned by its `Subagent`.
///
/// Invariant: once `status` is `Failed` with `restart_count` equal to the
/// worker's restart budget, `restart_count` never increases again and
/// `status` never becomes `Recovering`.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    /// Id of the worker this record describes
    pub worker_id: String,
    /// Current liveness state
    pub status: WorkerStatus,
    /// Time of the last completed unit of work
    pub last_heartbeat_at: Instant,
    /// Probe failures since the last successful probe
    pub consecutive_probe_failures: u32,
    /// Restarts performed on this logical worker id
    pub restart_count: u32,
    /// Last observed memory usage
    pub memory_usage_bytes: u64,
    /// Last observed CPU usage
    pub cpu_usage_percent: f64,
    /// Units of work completed by this worker
    pub tasks_processed: u64,
    /// Mean of the trailing response-time window
    pub average_response_time_ms: f64,
}

impl HealthRecord {
    /// Fresh record for a newly registered worker.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Healthy,
            last_heartbeat_at: Instant::now(),
            consecutive_probe_failures: 0,
            restart_count: 0,
            memory_usage_bytes: 0,
            cpu_usage_percent: 0.0,
            tasks_processed: 0,
            average_response_time_ms: 0.0,
        }
    }
}

/// Partial metrics merge payload for `Subagent::record_metrics`.
///
/// Only the fields present are applied; response-time samples feed the
/// bounded trailing window used for failure prediction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSample {
    pub memory_usage_bytes: Option<u64>,
    pub cpu_usage_percent: Option<f64>,
    pub response_time_ms: Option<f64>,
}

impl MetricsSample {
    /// Sample carrying only a response-time observation.
    pub fn response_time(ms: f64) -> Self {
        Self {
            response_time_ms: Some(ms),
            ..Self::default()
        }
    }
}

// ============================================================================
// Task routes
// ============================================================================

/// Binding from a task id to its currently assigned worker.
///
/// Created on first dispatch, updated on every reroute, deleted on task
/// completion. The route table is the sole coordination channel between
/// Subagent failure and manager-level rerouting; at most one route exists
/// per task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRoute {
    pub task_id: String,
    /// Worker the task was first dispatched to
    pub original_worker_id: String,
    /// Worker currently responsible for the task
    pub current_worker_id: String,
    /// Number of reroutes applied to this task
    pub reroute_count: u32,
    pub last_routed_at: DateTime<Utc>,
}

impl TaskRoute {
    /// Route for a task on its first dispatch.
    pub fn new(task_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        let worker_id = worker_id.into();
        Self {
            task_id: task_id.into(),
            original_worker_id: worker_id.clone(),
            current_worker_id: worker_id,
            reroute_count: 0,
            last_routed_at: Utc::now(),
        }
    }
}

// ============================================================================
// Health reporting
// ============================================================================

/// Failure-risk entry for one worker in a `HealthReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRisk {
    pub worker_id: String,
    /// Output of the worker's failure-prediction heuristic, in [0, 1]
    pub failure_probability: f64,
}

/// Aggregate system health snapshot. Informational only — nothing in the
/// subsystem drives control flow from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub total_workers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub recovering: usize,
    /// healthy / total, or 1.0 when no workers are registered
    pub system_health_score: f64,
    /// Per-worker failure probability, sorted descending
    pub at_risk: Vec<WorkerRisk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(WorkerStatus::Healthy.to_string(), "healthy");
        assert_eq!(WorkerStatus::Recovering.to_string(), "recovering");
    }

    #[test]
    fn test_new_route_points_at_original_worker() {
        let route = TaskRoute::new("task-1", "worker-a");
        assert_eq!(route.original_worker_id, "worker-a");
        assert_eq!(route.current_worker_id, "worker-a");
        assert_eq!(route.reroute_count, 0);
    }

    #[tokio::test]
    async fn test_fresh_record_is_healthy() {
        let record = HealthRecord::new("worker-a");
        assert_eq!(record.status, WorkerStatus::Healthy);
        assert_eq!(record.restart_count, 0);
        assert_eq!(record.consecutive_probe_failures, 0);
    }
}
