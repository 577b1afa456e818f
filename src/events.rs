//! Event fabric for the resilience subsystem
//!
//! Every state transition and terminal condition is observable through a
//! single broadcast bus. Components receive a cloned [`EventBus`] at
//! construction and publish to it; the host service subscribes. There is
//! no shared global emitter. The manager's own lifecycle handling rides a
//! separate lossless channel ([`LifecycleSignal`]) rather than the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Internal lifecycle signal from a Subagent to the manager.
///
/// Failure and escalation must reach the manager losslessly: the broadcast
/// bus can lag a slow subscriber under an event burst, so Subagents send
/// these on a dedicated unbounded channel as well. The bus carries the
/// corresponding [`ResilienceEvent`]s for external observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    Failed { worker_id: String },
    Escalated { worker_id: String },
}

/// Default broadcast capacity. Slow subscribers lag rather than block
/// publishers.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ============================================================================
// Events
// ============================================================================

/// Transition observed by the domain-agnostic `HealthMonitor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorTransition {
    /// Probe succeeded after the target was unhealthy
    Recovered,
    /// Probe reported reduced capability
    Degraded,
    /// Probe succeeded but exceeded the slow-response threshold
    SlowResponse,
    /// Probe failed after the target was healthy
    HealthCheckFailed,
}

/// Signals emitted by the resilience subsystem.
///
/// Every payload carries the affected worker id (where one exists) and a
/// UTC timestamp so external observers can be driven purely from the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ResilienceEvent {
    SubagentRegistered {
        worker_id: String,
        at: DateTime<Utc>,
    },
    SubagentDegraded {
        worker_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Worker crossed the hard failure threshold. Internal reroute trigger
    /// as well as an operator signal.
    SubagentFailed {
        worker_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    SubagentHealing {
        worker_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    SelfHealFailed {
        worker_id: String,
        error: String,
        at: DateTime<Utc>,
    },
    /// Restart budget exhausted. Terminal until operator action.
    SubagentEscalated {
        worker_id: String,
        restart_count: u32,
        at: DateTime<Utc>,
    },
    SubagentRemoved {
        worker_id: String,
        at: DateTime<Utc>,
    },
    TaskRerouted {
        task_id: String,
        from_worker_id: String,
        to_worker_id: String,
        at: DateTime<Utc>,
    },
    /// Reroute was requested but no healthy worker exists to receive tasks.
    NoHealthyAgents {
        failed_worker_id: String,
        stranded_tasks: usize,
        at: DateTime<Utc>,
    },
    ReplacementSpawned {
        failed_worker_id: String,
        replacement_worker_id: String,
        at: DateTime<Utc>,
    },
    ReplacementFailed {
        failed_worker_id: String,
        error: String,
        at: DateTime<Utc>,
    },
    HighFailureRisk {
        worker_id: String,
        probability: f64,
        at: DateTime<Utc>,
    },
    BackupPreparing {
        worker_id: String,
        backup_worker_id: String,
        at: DateTime<Utc>,
    },
    AlertRaised {
        rule_name: String,
        severity: crate::alerts::AlertSeverity,
        at: DateTime<Utc>,
    },
    MonitorTransition {
        monitored_id: String,
        transition: MonitorTransition,
        at: DateTime<Utc>,
    },
}

impl ResilienceEvent {
    /// Worker id the event concerns, if any.
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::SubagentRegistered { worker_id, .. }
            | Self::SubagentDegraded { worker_id, .. }
            | Self::SubagentFailed { worker_id, .. }
            | Self::SubagentHealing { worker_id, .. }
            | Self::SelfHealFailed { worker_id, .. }
            | Self::SubagentEscalated { worker_id, .. }
            | Self::SubagentRemoved { worker_id, .. }
            | Self::HighFailureRisk { worker_id, .. }
            | Self::BackupPreparing { worker_id, .. } => Some(worker_id),
            Self::NoHealthyAgents {
                failed_worker_id, ..
            }
            | Self::ReplacementSpawned {
                failed_worker_id, ..
            }
            | Self::ReplacementFailed {
                failed_worker_id, ..
            } => Some(failed_worker_id),
            Self::TaskRerouted { to_worker_id, .. } => Some(to_worker_id),
            Self::AlertRaised { .. } | Self::MonitorTransition { .. } => None,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Cloneable handle on the subsystem's broadcast event bus.
///
/// Publishing never fails: with no live subscribers the event is dropped
/// and traced, which keeps emission fire-and-forget for every component.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: ResilienceEvent) {
        if self.tx.send(event.clone()).is_err() {
            trace!(?event, "Event emitted with no subscribers");
        }
    }

    /// Number of live subscribers (diagnostics only).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
