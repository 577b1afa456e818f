//! Subagent — per-worker health record and self-heal state machine
//!
//! Each registered worker gets one Subagent guarding its liveness:
//!
//! - a probe loop on its own timer, with transparent retries;
//! - the healthy / degraded / failed / recovering state machine with a
//!   hysteresis band (soft thresholds trip at 90% of a limit, recovery
//!   requires all metrics below 70%);
//! - a bounded trailing window of response-time samples feeding the
//!   failure-prediction heuristic;
//! - `self_heal()`, the bounded-restart recovery entry point.
//!
//! The health record is mutated only here. The manager reads snapshot
//! clones and issues commands; it never touches the live record.

use crate::collaborators::WorkerRuntime;
use crate::config::{defaults, ResilienceConfig, WorkerConfig};
use crate::events::{EventBus, LifecycleSignal, ResilienceEvent};
use crate::types::{HealthRecord, MetricsSample, WorkerStatus};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Errors & outcomes
// ============================================================================

/// Self-heal failures. Re-entrancy is not an error — a concurrent call is
/// a documented no-op reported as [`HealOutcome::AlreadyInFlight`].
#[derive(Debug, Error)]
pub enum HealError {
    /// Restart budget exhausted; terminal until operator action.
    #[error("worker {worker_id} exhausted its restart budget ({attempts} attempts)")]
    EscalationRequired { worker_id: String, attempts: u32 },
    /// The restart itself failed. No automatic retry; the next health
    /// check drives any further action.
    #[error("restart of worker {worker_id} failed: {source}")]
    RestartFailed {
        worker_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Successful outcomes of `self_heal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    /// Restart completed; the worker is healthy again.
    Recovered,
    /// Another heal holds the restart lock; this call did nothing.
    AlreadyInFlight,
}

// ============================================================================
// Subagent
// ============================================================================

struct Inner {
    record: HealthRecord,
    /// Trailing response-time samples, newest last, capped at the
    /// configured window.
    response_times: VecDeque<f64>,
}

/// Releases the restart lock when the heal attempt leaves scope.
struct HealLock<'a>(&'a AtomicBool);

impl Drop for HealLock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-worker wrapper owning one worker's health record and self-heal
/// state machine.
pub struct Subagent {
    config: WorkerConfig,
    settings: Arc<ResilienceConfig>,
    runtime: Arc<dyn WorkerRuntime>,
    events: EventBus,
    /// Lossless failure/escalation path to the manager; the bus alone may
    /// lag under burst.
    lifecycle: Option<mpsc::UnboundedSender<LifecycleSignal>>,
    inner: RwLock<Inner>,
    /// Restart lock: `self_heal` spans two suspension points (stop, then
    /// start) and must not re-enter itself.
    healing: AtomicBool,
    /// Set once the restart budget is exhausted; the escalation signal is
    /// emitted exactly once.
    escalated: AtomicBool,
    probing: Mutex<Option<CancellationToken>>,
}

impl Subagent {
    pub fn new(
        config: WorkerConfig,
        runtime: Arc<dyn WorkerRuntime>,
        events: EventBus,
        settings: Arc<ResilienceConfig>,
        lifecycle: Option<mpsc::UnboundedSender<LifecycleSignal>>,
    ) -> Self {
        let record = HealthRecord::new(config.id.clone());
        Self {
            config,
            settings,
            runtime,
            events,
            lifecycle,
            inner: RwLock::new(Inner {
                record,
                response_times: VecDeque::with_capacity(defaults::RESPONSE_TIME_WINDOW),
            }),
            healing: AtomicBool::new(false),
            escalated: AtomicBool::new(false),
            probing: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Arm the periodic probe loop. Idempotent: calling again while a loop
    /// is armed does nothing.
    pub fn start_probing(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.probing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.as_ref() {
            if !token.is_cancelled() {
                debug!(worker_id = %self.config.id, "Probe loop already armed");
                return;
            }
        }

        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(worker_id = %agent.config.id, interval_ms = interval.as_millis() as u64, "Probe loop armed");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => agent.evaluate_health().await,
                }
            }
            debug!(worker_id = %agent.config.id, "Probe loop stopped");
        });
    }

    /// Cancel the probe loop. No further probe fires after this returns.
    pub fn stop(&self) {
        let mut guard = self.probing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    /// Called by the dispatch collaborator whenever the worker completes a
    /// unit of work.
    pub async fn record_heartbeat(&self) {
        let mut inner = self.inner.write().await;
        inner.record.last_heartbeat_at = Instant::now();
        inner.record.tasks_processed += 1;
    }

    /// Merge observed metrics. Response-time samples land in the bounded
    /// trailing window used for trend analysis.
    pub async fn record_metrics(&self, sample: MetricsSample) {
        let mut inner = self.inner.write().await;
        if let Some(memory) = sample.memory_usage_bytes {
            inner.record.memory_usage_bytes = memory;
        }
        if let Some(cpu) = sample.cpu_usage_percent {
            inner.record.cpu_usage_percent = cpu;
        }
        if let Some(response_time) = sample.response_time_ms {
            inner.response_times.push_back(response_time);
            while inner.response_times.len() > defaults::RESPONSE_TIME_WINDOW {
                inner.response_times.pop_front();
            }
            let len = inner.response_times.len();
            inner.record.average_response_time_ms =
                inner.response_times.iter().sum::<f64>() / len as f64;
        }
    }

    /// Immutable snapshot of the health record.
    pub async fn health(&self) -> HealthRecord {
        self.inner.read().await.record.clone()
    }

    /// Whether the restart budget is exhausted.
    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Failure prediction
    // ------------------------------------------------------------------

    /// Failure probability in [0, 1] from the documented heuristic.
    ///
    /// Requires at least 10 response-time samples, else 0. The relative
    /// change between the mean of the most recent 10 samples and the mean
    /// of the preceding 10 contributes 0.3 when it exceeds 50%; an
    /// unresolved probe failure 0.2; degraded status 0.3; memory and CPU
    /// above 80% of their limits 0.1 each. Capped at 1.0. The weights are
    /// part of the tested contract.
    pub async fn predict_failure_probability(&self) -> f64 {
        let inner = self.inner.read().await;
        if inner.response_times.len() < defaults::MIN_PREDICTION_SAMPLES {
            return 0.0;
        }

        let samples: Vec<f64> = inner.response_times.iter().copied().collect();
        let recent_start = samples.len() - defaults::TREND_WINDOW;
        let recent_mean = mean(&samples[recent_start..]);
        let preceding_start = recent_start.saturating_sub(defaults::TREND_WINDOW);
        let preceding = &samples[preceding_start..recent_start];

        let degradation = if preceding.is_empty() {
            0.0
        } else {
            let preceding_mean = mean(preceding);
            if preceding_mean > 0.0 {
                (recent_mean - preceding_mean) / preceding_mean
            } else {
                0.0
            }
        };

        let record = &inner.record;
        let mut probability = 0.0;
        if degradation > defaults::DEGRADATION_ALARM_RATIO {
            probability += defaults::WEIGHT_DEGRADATION;
        }
        if record.consecutive_probe_failures > 0 {
            probability += defaults::WEIGHT_PROBE_FAILURE;
        }
        if record.status == WorkerStatus::Degraded {
            probability += defaults::WEIGHT_DEGRADED_STATUS;
        }
        if ratio(record.memory_usage_bytes as f64, self.config.memory_limit_bytes as f64)
            > defaults::RESOURCE_PRESSURE_RATIO
        {
            probability += defaults::WEIGHT_MEMORY_PRESSURE;
        }
        if ratio(record.cpu_usage_percent, self.config.cpu_limit_percent)
            > defaults::RESOURCE_PRESSURE_RATIO
        {
            probability += defaults::WEIGHT_CPU_PRESSURE;
        }

        probability.min(1.0)
    }

    // ------------------------------------------------------------------
    // Probe evaluation
    // ------------------------------------------------------------------

    /// One probe tick: run the probe (with transparent retries), update
    /// counters, and walk the state machine. Normally driven by the armed
    /// probe loop; exposed so tests and embedding hosts can drive
    /// evaluation deterministically.
    pub async fn evaluate_health(&self) {
        // Heal in flight owns all transitions until it completes
        if self.healing.load(Ordering::SeqCst) {
            return;
        }

        let probe_ok = self.probe_with_retries().await;

        let mut became_failed = false;
        let mut now_failed = false;
        {
            let mut inner = self.inner.write().await;
            let heartbeat_silent =
                inner.record.last_heartbeat_at.elapsed() > self.settings.heartbeat_timeout();
            let record = &mut inner.record;

            if probe_ok {
                record.consecutive_probe_failures = 0;
            } else {
                record.consecutive_probe_failures += 1;
            }

            let hard_failure = record.consecutive_probe_failures
                >= self.settings.probing.consecutive_failure_threshold
                || heartbeat_silent;

            match record.status {
                WorkerStatus::Recovering => {}
                WorkerStatus::Failed => now_failed = true,
                WorkerStatus::Healthy | WorkerStatus::Degraded if hard_failure => {
                    record.status = WorkerStatus::Failed;
                    became_failed = true;
                    now_failed = true;
                    let reason = if heartbeat_silent {
                        format!(
                            "no heartbeat for over {}s",
                            self.settings.heartbeat_timeout().as_secs()
                        )
                    } else {
                        format!("{} consecutive probe failures", record.consecutive_probe_failures)
                    };
                    warn!(worker_id = %record.worker_id, reason = %reason, "Worker failed");
                    self.events.emit(ResilienceEvent::SubagentFailed {
                        worker_id: record.worker_id.clone(),
                        reason,
                        at: Utc::now(),
                    });
                    self.signal_lifecycle(LifecycleSignal::Failed {
                        worker_id: record.worker_id.clone(),
                    });
                }
                WorkerStatus::Healthy => {
                    let (worst_ratio, worst_metric) = self.worst_usage_ratio(record);
                    if worst_ratio >= self.settings.thresholds.soft_ratio
                        || record.consecutive_probe_failures > 0
                    {
                        record.status = WorkerStatus::Degraded;
                        let reason = if record.consecutive_probe_failures > 0 {
                            format!(
                                "{} unresolved probe failure(s)",
                                record.consecutive_probe_failures
                            )
                        } else {
                            format!("{} at {:.0}% of limit", worst_metric, worst_ratio * 100.0)
                        };
                        info!(worker_id = %record.worker_id, reason = %reason, "Worker degraded");
                        self.events.emit(ResilienceEvent::SubagentDegraded {
                            worker_id: record.worker_id.clone(),
                            reason,
                            at: Utc::now(),
                        });
                    }
                }
                WorkerStatus::Degraded => {
                    // All metrics must drop below the recovery band at once
                    let (worst_ratio, _) = self.worst_usage_ratio(record);
                    if worst_ratio < self.settings.thresholds.recovery_ratio
                        && record.consecutive_probe_failures == 0
                    {
                        record.status = WorkerStatus::Healthy;
                        info!(worker_id = %record.worker_id, "Worker recovered to healthy");
                    }
                }
            }
        }

        if became_failed || (now_failed && !self.is_escalated()) {
            match self.self_heal().await {
                Ok(HealOutcome::Recovered) => {}
                Ok(HealOutcome::AlreadyInFlight) => {}
                Err(e) => debug!(worker_id = %self.config.id, error = %e, "Self-heal did not recover"),
            }
        }
    }

    fn signal_lifecycle(&self, signal: LifecycleSignal) {
        if let Some(tx) = &self.lifecycle {
            if tx.send(signal).is_err() {
                debug!(worker_id = %self.config.id, "Lifecycle receiver dropped");
            }
        }
    }

    /// Probe with transparent retries; only a fully exhausted attempt
    /// counts as a real failure.
    async fn probe_with_retries(&self) -> bool {
        for attempt in 1..=self.settings.probing.retry_attempts {
            match self.runtime.probe().await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(
                        worker_id = %self.config.id,
                        attempt = attempt,
                        error = %e,
                        "Probe attempt failed"
                    );
                }
            }
        }
        false
    }

    /// Worst of the memory / CPU / latency ratios against their configured
    /// limits, with the metric name for diagnostics.
    fn worst_usage_ratio(&self, record: &HealthRecord) -> (f64, &'static str) {
        let ratios = [
            (
                ratio(
                    record.memory_usage_bytes as f64,
                    self.config.memory_limit_bytes as f64,
                ),
                "memory",
            ),
            (
                ratio(record.cpu_usage_percent, self.config.cpu_limit_percent),
                "cpu",
            ),
            (
                ratio(
                    record.average_response_time_ms,
                    self.config.task_timeout_ms as f64,
                ),
                "response-time",
            ),
        ];
        ratios
            .into_iter()
            .fold((0.0, "memory"), |acc, r| if r.0 > acc.0 { r } else { acc })
    }

    // ------------------------------------------------------------------
    // Self-heal
    // ------------------------------------------------------------------

    /// Recovery entry point. A no-op while a heal is already in flight;
    /// raises the escalation signal (once) when the restart budget is
    /// exhausted. Otherwise: recovering → stop → start → healthy, with the
    /// restart lock held across both suspension points. A failed restart
    /// leaves the worker failed with no automatic retry.
    pub async fn self_heal(&self) -> Result<HealOutcome, HealError> {
        if self.healing.swap(true, Ordering::SeqCst) {
            debug!(worker_id = %self.config.id, "Self-heal already in flight — no-op");
            return Ok(HealOutcome::AlreadyInFlight);
        }
        let _lock = HealLock(&self.healing);

        let restart_count = self.inner.read().await.record.restart_count;
        if restart_count >= self.config.max_restart_attempts {
            if !self.escalated.swap(true, Ordering::SeqCst) {
                self.inner.write().await.record.status = WorkerStatus::Failed;
                warn!(
                    worker_id = %self.config.id,
                    restart_count = restart_count,
                    "Restart budget exhausted — escalating for external intervention"
                );
                self.events.emit(ResilienceEvent::SubagentEscalated {
                    worker_id: self.config.id.clone(),
                    restart_count,
                    at: Utc::now(),
                });
                self.signal_lifecycle(LifecycleSignal::Escalated {
                    worker_id: self.config.id.clone(),
                });
            }
            return Err(HealError::EscalationRequired {
                worker_id: self.config.id.clone(),
                attempts: restart_count,
            });
        }

        let attempt = restart_count + 1;
        self.inner.write().await.record.status = WorkerStatus::Recovering;
        info!(worker_id = %self.config.id, attempt = attempt, "Self-heal started");
        self.events.emit(ResilienceEvent::SubagentHealing {
            worker_id: self.config.id.clone(),
            attempt,
            at: Utc::now(),
        });

        let restart = async {
            self.runtime.stop().await?;
            self.runtime.start().await
        }
        .await;

        match restart {
            Ok(()) => {
                let mut inner = self.inner.write().await;
                inner.record.consecutive_probe_failures = 0;
                inner.record.restart_count += 1;
                inner.record.last_heartbeat_at = Instant::now();
                inner.record.status = WorkerStatus::Healthy;
                info!(
                    worker_id = %self.config.id,
                    restart_count = inner.record.restart_count,
                    "Self-heal succeeded"
                );
                Ok(HealOutcome::Recovered)
            }
            Err(e) => {
                self.inner.write().await.record.status = WorkerStatus::Failed;
                warn!(worker_id = %self.config.id, error = %e, "Self-heal failed");
                self.events.emit(ResilienceEvent::SelfHealFailed {
                    worker_id: self.config.id.clone(),
                    error: e.to_string(),
                    at: Utc::now(),
                });
                Err(HealError::RestartFailed {
                    worker_id: self.config.id.clone(),
                    source: e,
                })
            }
        }
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// usage / limit, 0 when the limit is unset.
fn ratio(usage: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        usage / limit
    } else {
        0.0
    }
}

// ============================================================================
// Tests
// ============================================================================
