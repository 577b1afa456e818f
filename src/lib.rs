//! warden: self-healing resilience for worker-agent pools
//!
//! In-process subsystem that keeps a pool of worker agents alive: each
//! worker gets a [`Subagent`] state machine (probing, hysteresis-banded
//! degradation, restart with a bounded budget, failure prediction), and a
//! single [`SelfHealingManager`] coordinates rerouting, replacement
//! provisioning, and predictive load shedding across the pool.
//!
//! ## Architecture
//!
//! - **Subagent**: per-worker health state machine and restart logic
//! - **SelfHealingManager**: registry, task routes, replacement, predictive scan
//! - **HealthMonitor**: domain-agnostic periodic prober for non-worker targets
//! - **AlertManager**: rule-based alerting over metric snapshots
//! - **FallbackStrategyEngine**: ordered catalog of task-level recovery strategies
//!
//! All side effects on the host (probing, restarting, dispatch
//! notification, provisioning, breaker tuning) go through the traits in
//! [`collaborators`]; everything observable is announced on the
//! [`events::EventBus`].

pub mod alerts;
pub mod collaborators;
pub mod config;
pub mod events;
pub mod manager;
pub mod monitor;
pub mod strategy;
pub mod subagent;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, ResilienceConfig, WorkerConfig};

// Re-export commonly used types
pub use types::{HealthRecord, HealthReport, MetricsSample, TaskRoute, WorkerRisk, WorkerStatus};

// Re-export the event fabric
pub use events::{EventBus, LifecycleSignal, MonitorTransition, ResilienceEvent};

// Re-export the core state machines
pub use manager::{ManagerError, RerouteError, SelfHealingManager};
pub use subagent::{HealError, HealOutcome, Subagent};

// Re-export the auxiliary engines
pub use alerts::{Alert, AlertManager, AlertSeverity, MetricsSnapshot};
pub use monitor::{HealthMonitor, ProbeFn, ProbeHealth};
pub use strategy::{FailureContext, FallbackStrategyEngine, Strategy, StrategyAction};

// Re-export collaborator seams
pub use collaborators::{
    BreakerSettings, CircuitBreakerFactory, ProvisionedWorker, TaskDispatcher, WorkerProvisioner,
    WorkerRuntime,
};
