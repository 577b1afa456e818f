//! External collaborator contracts
//!
//! The resilience subsystem is an in-process library; the mechanisms that
//! actually run workers, dispatch tasks, and gate calls live in the host
//! service. These traits are the seams. Implementations are handed in at
//! construction; errors cross the boundary as `anyhow::Error` and are
//! converted to signals at their point of use — nothing here escapes to
//! the host as a panic.

use crate::config::WorkerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Worker runtime
// ============================================================================

/// Handle on a live worker process, provided by the host at registration.
///
/// `stop` followed by `start` is the restart sequence driven by a
/// Subagent's self-heal; both are suspension points, which is why the
/// Subagent holds its restart lock across the pair.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Liveness probe. An `Err` counts as a probe failure (after the
    /// configured transparent retries).
    async fn probe(&self) -> anyhow::Result<()>;

    /// Stop the worker ahead of a restart.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Start the worker after a stop.
    async fn start(&self) -> anyhow::Result<()>;
}

// ============================================================================
// Dispatch
// ============================================================================

/// Task-queue/dispatch service notified when routes move.
///
/// Notification is fire-and-forget: a failed notify does not roll back the
/// route update. The route table remains authoritative and the dispatch
/// layer reconciles from it.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn notify_reroute(
        &self,
        task_id: &str,
        from_worker_id: &str,
        to_worker_id: &str,
    ) -> anyhow::Result<()>;
}

// ============================================================================
// Provisioning
// ============================================================================

/// A freshly provisioned worker: its assigned id plus the runtime handle
/// the replacement Subagent will probe and restart.
pub struct ProvisionedWorker {
    pub worker_id: String,
    pub runtime: Arc<dyn WorkerRuntime>,
}

/// Collaborator that creates new worker processes.
///
/// Provisioning failure must be an observable `Err`, never a silent no-op;
/// the manager converts it to a replacement-failed signal and leaves the
/// failed worker registered for operator visibility.
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    async fn provision(
        &self,
        kind: &str,
        config: &WorkerConfig,
    ) -> anyhow::Result<ProvisionedWorker>;
}

// ============================================================================
// Circuit breakers
// ============================================================================

/// Thresholds pushed to a worker's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    /// Failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing recovery
    pub recovery_timeout: Duration,
}

/// Factory for per-worker circuit breakers.
///
/// This subsystem only tightens thresholds via `get_or_create`; it never
/// inspects breaker state, so no handle is returned across the seam.
#[async_trait]
pub trait CircuitBreakerFactory: Send + Sync {
    async fn get_or_create(
        &self,
        worker_id: &str,
        settings: BreakerSettings,
    ) -> anyhow::Result<()>;
}
