//! HealthMonitor — domain-agnostic periodic prober
//!
//! Tracks a health state per registered id, drives each probe on its own
//! cancellable timer, and emits a transition event when the observed state
//! changes. The Subagent state machine does its own probing; this monitor
//! exists for everything else the host wants watched (upstream services,
//! queues, breakers) with the same event fabric.

use crate::events::{EventBus, MonitorTransition, ResilienceEvent};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of a successful probe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeHealth {
    /// Target is fully operational
    Healthy,
    /// Target responded but with reduced capability
    Degraded,
}

/// Probe callback: returns the target's health, or an error which counts
/// as a failed check.
pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<ProbeHealth>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackedState {
    Healthy,
    Degraded,
    Failed,
}

struct Tracked {
    state: TrackedState,
    cancel: CancellationToken,
}

/// Periodic prober with per-id health tracking.
pub struct HealthMonitor {
    tracked: Arc<RwLock<HashMap<String, Tracked>>>,
    events: EventBus,
    slow_response: Duration,
}

impl HealthMonitor {
    pub fn new(events: EventBus, slow_response: Duration) -> Self {
        Self {
            tracked: Arc::new(RwLock::new(HashMap::new())),
            events,
            slow_response,
        }
    }

    /// Arm a probe timer for `id`. A previous timer for the same id is
    /// cancelled and replaced; the id starts as healthy until a probe says
    /// otherwise.
    pub async fn start_monitoring(&self, id: impl Into<String>, probe: ProbeFn, interval: Duration) {
        let id = id.into();
        let cancel = CancellationToken::new();

        {
            let mut tracked = self.tracked.write().await;
            if let Some(previous) = tracked.insert(
                id.clone(),
                Tracked {
                    state: TrackedState::Healthy,
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
                debug!(id = %id, "Replaced existing monitor");
            }
        }

        let tracked = Arc::clone(&self.tracked);
        let events = self.events.clone();
        let slow_response = self.slow_response;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        run_probe(&tracked, &events, &id, &probe, slow_response).await;
                    }
                }
            }
            debug!("Monitor loop stopped");
        });
    }

    /// Disarm the probe timer for `id` and forget its state.
    pub async fn stop_monitoring(&self, id: &str) {
        if let Some(entry) = self.tracked.write().await.remove(id) {
            entry.cancel.cancel();
            debug!(id = id, "Monitoring stopped");
        }
    }

    /// Fraction of tracked ids currently healthy (1.0 when none tracked).
    pub async fn system_health_score(&self) -> f64 {
        let tracked = self.tracked.read().await;
        if tracked.is_empty() {
            return 1.0;
        }
        let healthy = tracked
            .values()
            .filter(|t| t.state == TrackedState::Healthy)
            .count();
        healthy as f64 / tracked.len() as f64
    }
}

/// One probe pass: call, classify, record the transition, emit its event.
async fn run_probe(
    tracked: &Arc<RwLock<HashMap<String, Tracked>>>,
    events: &EventBus,
    id: &str,
    probe: &ProbeFn,
    slow_response: Duration,
) {
    let started = Instant::now();
    let outcome = probe().await;
    let latency = started.elapsed();

    let mut guard = tracked.write().await;
    // stop_monitoring may have raced the probe call
    let Some(entry) = guard.get_mut(id) else {
        return;
    };
    let prior = entry.state;

    let (next, transition) = match outcome {
        Err(ref e) => {
            if prior != TrackedState::Failed {
                warn!(id = id, error = %e, "Health check failed");
                (TrackedState::Failed, Some(MonitorTransition::HealthCheckFailed))
            } else {
                (TrackedState::Failed, None)
            }
        }
        Ok(ProbeHealth::Degraded) => {
            if prior != TrackedState::Degraded {
                (TrackedState::Degraded, Some(MonitorTransition::Degraded))
            } else {
                (TrackedState::Degraded, None)
            }
        }
        Ok(ProbeHealth::Healthy) => {
            if prior != TrackedState::Healthy {
                (TrackedState::Healthy, Some(MonitorTransition::Recovered))
            } else if latency > slow_response {
                (TrackedState::Healthy, Some(MonitorTransition::SlowResponse))
            } else {
                (TrackedState::Healthy, None)
            }
        }
    };
    entry.state = next;
    drop(guard);

    if let Some(transition) = transition {
        events.emit(ResilienceEvent::MonitorTransition {
            monitored_id: id.to_string(),
            transition,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky_probe(failures_before_recovery: u32) -> ProbeFn {
        let calls = Arc::new(AtomicU32::new(0));
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures_before_recovery {
                    anyhow::bail!("probe refused");
                }
                Ok(ProbeHealth::Healthy)
            })
        })
    }

    fn healthy_probe() -> ProbeFn {
        Arc::new(|| Box::pin(async { Ok(ProbeHealth::Healthy) }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_recovery_transitions() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let monitor = HealthMonitor::new(bus, Duration::from_secs(2));

        monitor
            .start_monitoring("svc", flaky_probe(1), Duration::from_secs(5))
            .await;

        // First probe fails → health-check-failed
        tokio::time::sleep(Duration::from_secs(6)).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ResilienceEvent::MonitorTransition {
                transition: MonitorTransition::HealthCheckFailed,
                ..
            }
        ));
        assert_eq!(monitor.system_health_score().await, 0.0);

        // Second probe succeeds → recovered
        tokio::time::sleep(Duration::from_secs(5)).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ResilienceEvent::MonitorTransition {
                transition: MonitorTransition::Recovered,
                ..
            }
        ));
        assert_eq!(monitor.system_health_score().await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_healthy_emits_nothing() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let monitor = HealthMonitor::new(bus, Duration::from_secs(2));

        monitor
            .start_monitoring("svc", healthy_probe(), Duration::from_secs(5))
            .await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err(), "no transitions expected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_disarms_timer() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let monitor = HealthMonitor::new(bus, Duration::from_secs(2));

        monitor
            .start_monitoring("svc", flaky_probe(100), Duration::from_secs(5))
            .await;
        monitor.stop_monitoring("svc").await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err(), "cancelled probe must not fire");
        assert_eq!(monitor.system_health_score().await, 1.0); // nothing tracked
    }

    #[tokio::test(start_paused = true)]
    async fn test_score_counts_only_healthy_ids() {
        let bus = EventBus::default();
        let monitor = HealthMonitor::new(bus, Duration::from_secs(2));

        monitor
            .start_monitoring("good", healthy_probe(), Duration::from_secs(5))
            .await;
        monitor
            .start_monitoring("bad", flaky_probe(100), Duration::from_secs(5))
            .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(monitor.system_health_score().await, 0.5);
    }
}
