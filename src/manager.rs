//! SelfHealingManager — global coordination across all Subagents
//!
//! Owns the Subagent registry and the task-route table, and implements the
//! cross-cutting policy:
//!
//! - task rerouting off failed workers (round-robin, idempotent);
//! - replacement provisioning when a worker's restart budget is exhausted;
//! - load shedding by tightening a worker's circuit breaker;
//! - an independent predictive-monitoring loop acting on failure
//!   probability before a hard failure is observed.
//!
//! The manager never mutates a Subagent's health record. It reads snapshot
//! clones and issues commands; all mutation stays with the owning Subagent.

use crate::collaborators::{
    BreakerSettings, CircuitBreakerFactory, TaskDispatcher, WorkerProvisioner, WorkerRuntime,
};
use crate::config::{ResilienceConfig, WorkerConfig};
use crate::events::{EventBus, LifecycleSignal, ResilienceEvent};
use crate::subagent::Subagent;
use crate::types::{HealthReport, TaskRoute, WorkerRisk, WorkerStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

/// Registry and collaborator failures surfaced by manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown worker {0}")]
    UnknownWorker(String),
    #[error("worker {0} is already registered")]
    DuplicateWorker(String),
    #[error("provisioning replacement for {worker_id} failed: {source}")]
    ProvisionFailed {
        worker_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("tuning circuit breaker for {worker_id} failed: {source}")]
    BreakerUnavailable {
        worker_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Reroute failures.
#[derive(Debug, Error)]
pub enum RerouteError {
    /// No healthy worker exists to receive the stranded tasks. The route
    /// table is left untouched; nothing is silently dropped.
    #[error("no healthy workers available to receive tasks from {0}")]
    TotalOutage(String),
}

// ============================================================================
// Manager
// ============================================================================

/// Coordinator for the whole worker pool.
pub struct SelfHealingManager {
    settings: Arc<ResilienceConfig>,
    subagents: RwLock<HashMap<String, Arc<Subagent>>>,
    routes: RwLock<HashMap<String, TaskRoute>>,
    /// Pre-registered inactive backups, keyed by the worker they back up.
    backups: RwLock<HashMap<String, WorkerConfig>>,
    dispatcher: Arc<dyn TaskDispatcher>,
    provisioner: Arc<dyn WorkerProvisioner>,
    breakers: Arc<dyn CircuitBreakerFactory>,
    events: EventBus,
    /// Lossless failure/escalation channel from the Subagents; the
    /// broadcast bus may lag external subscribers under burst, this never
    /// drops a signal.
    lifecycle_tx: mpsc::UnboundedSender<LifecycleSignal>,
    lifecycle_rx: Mutex<Option<mpsc::UnboundedReceiver<LifecycleSignal>>>,
    scan_cancel: CancellationToken,
    listener_cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SelfHealingManager {
    pub fn new(
        settings: ResilienceConfig,
        dispatcher: Arc<dyn TaskDispatcher>,
        provisioner: Arc<dyn WorkerProvisioner>,
        breakers: Arc<dyn CircuitBreakerFactory>,
        events: EventBus,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        Self {
            settings: Arc::new(settings),
            subagents: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            backups: RwLock::new(HashMap::new()),
            dispatcher,
            provisioner,
            breakers,
            events,
            lifecycle_tx,
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
            scan_cancel: CancellationToken::new(),
            listener_cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Create and wire a Subagent for a worker, start its health probing,
    /// and announce the registration.
    pub async fn register_worker(
        &self,
        config: WorkerConfig,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Result<Arc<Subagent>, ManagerError> {
        let worker_id = config.id.clone();
        let agent = Arc::new(Subagent::new(
            config,
            runtime,
            self.events.clone(),
            Arc::clone(&self.settings),
            Some(self.lifecycle_tx.clone()),
        ));

        {
            let mut subagents = self.subagents.write().await;
            if subagents.contains_key(&worker_id) {
                return Err(ManagerError::DuplicateWorker(worker_id));
            }
            subagents.insert(worker_id.clone(), Arc::clone(&agent));
        }

        agent.start_probing(self.settings.probe_interval());
        info!(worker_id = %worker_id, "Subagent registered");
        self.events.emit(ResilienceEvent::SubagentRegistered {
            worker_id,
            at: Utc::now(),
        });
        Ok(agent)
    }

    /// Stop a worker's probing and drop it from the registry.
    pub async fn decommission(&self, worker_id: &str) -> Result<(), ManagerError> {
        let agent = self
            .subagents
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| ManagerError::UnknownWorker(worker_id.to_string()))?;
        agent.stop();
        info!(worker_id = worker_id, "Subagent removed");
        self.events.emit(ResilienceEvent::SubagentRemoved {
            worker_id: worker_id.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Handle on a registered Subagent (for heartbeats and metrics).
    pub async fn subagent(&self, worker_id: &str) -> Option<Arc<Subagent>> {
        self.subagents.read().await.get(worker_id).cloned()
    }

    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subagents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Task routes
    // ------------------------------------------------------------------

    /// Record a task's first dispatch. Re-dispatching a live task id
    /// replaces its route; there is never more than one route per task.
    pub async fn record_dispatch(&self, task_id: &str, worker_id: &str) {
        let mut routes = self.routes.write().await;
        if routes
            .insert(task_id.to_string(), TaskRoute::new(task_id, worker_id))
            .is_some()
        {
            debug!(task_id = task_id, "Existing route replaced by new dispatch");
        }
    }

    /// Drop a task's route on completion or abandonment.
    pub async fn complete_task(&self, task_id: &str) -> bool {
        self.routes.write().await.remove(task_id).is_some()
    }

    pub async fn route(&self, task_id: &str) -> Option<TaskRoute> {
        self.routes.read().await.get(task_id).cloned()
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Move every route off `worker_id` onto healthy workers, round-robin
    /// keyed by each entry's own reroute count. With no healthy worker the
    /// total-outage signal fires and no entry is touched. Idempotent: with
    /// no surviving routes on the worker this does nothing.
    ///
    /// The scan runs without suspending; dispatch notifications are
    /// fire-and-forget afterwards, and the route table stays authoritative
    /// whether or not they land.
    pub async fn reroute_tasks_from(&self, worker_id: &str) -> Result<usize, RerouteError> {
        // Healthy targets first, before taking the route-table lock; sorted
        // so round-robin assignment is deterministic.
        let mut healthy = Vec::new();
        {
            let subagents = self.subagents.read().await;
            for (id, agent) in subagents.iter() {
                if id == worker_id {
                    continue;
                }
                if agent.health().await.status == WorkerStatus::Healthy {
                    healthy.push(id.clone());
                }
            }
        }
        healthy.sort();

        let mut notifications = Vec::new();
        {
            let mut routes = self.routes.write().await;
            let mut affected: Vec<&mut TaskRoute> = routes
                .values_mut()
                .filter(|r| r.current_worker_id == worker_id)
                .collect();
            if affected.is_empty() {
                return Ok(0);
            }
            if healthy.is_empty() {
                warn!(
                    worker_id = worker_id,
                    stranded = affected.len(),
                    "Total outage — no healthy worker to reroute to"
                );
                self.events.emit(ResilienceEvent::NoHealthyAgents {
                    failed_worker_id: worker_id.to_string(),
                    stranded_tasks: affected.len(),
                    at: Utc::now(),
                });
                return Err(RerouteError::TotalOutage(worker_id.to_string()));
            }

            affected.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            for route in affected {
                let target = healthy[route.reroute_count as usize % healthy.len()].clone();
                let from = std::mem::replace(&mut route.current_worker_id, target.clone());
                route.reroute_count += 1;
                route.last_routed_at = Utc::now();
                self.events.emit(ResilienceEvent::TaskRerouted {
                    task_id: route.task_id.clone(),
                    from_worker_id: from.clone(),
                    to_worker_id: target.clone(),
                    at: route.last_routed_at,
                });
                notifications.push((route.task_id.clone(), from, target));
            }
        }

        let rerouted = notifications.len();
        info!(worker_id = worker_id, rerouted = rerouted, "Tasks rerouted");
        for (task_id, from, to) in notifications {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.notify_reroute(&task_id, &from, &to).await {
                    warn!(
                        task_id = %task_id,
                        error = %e,
                        "Reroute notification failed — route table remains authoritative"
                    );
                }
            });
        }
        Ok(rerouted)
    }

    // ------------------------------------------------------------------
    // Replacement & load shedding
    // ------------------------------------------------------------------

    /// Provision a cold replacement of identical kind/config under a new
    /// id, register it, then retire the failed worker. On provisioning
    /// failure the failed worker stays registered for operator visibility;
    /// there is no retry loop.
    pub async fn spawn_replacement(&self, failed_worker_id: &str) -> Result<String, ManagerError> {
        let failed_config = self
            .subagent(failed_worker_id)
            .await
            .ok_or_else(|| ManagerError::UnknownWorker(failed_worker_id.to_string()))?
            .config()
            .clone();

        let provisioned = match self
            .provisioner
            .provision(&failed_config.kind, &failed_config)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    worker_id = failed_worker_id,
                    error = %e,
                    "Replacement provisioning failed — failed worker left registered"
                );
                self.events.emit(ResilienceEvent::ReplacementFailed {
                    failed_worker_id: failed_worker_id.to_string(),
                    error: e.to_string(),
                    at: Utc::now(),
                });
                return Err(ManagerError::ProvisionFailed {
                    worker_id: failed_worker_id.to_string(),
                    source: e,
                });
            }
        };

        let replacement_id = provisioned.worker_id.clone();
        let replacement_config = failed_config.replacement(&replacement_id);
        self.register_worker(replacement_config, provisioned.runtime)
            .await?;
        info!(
            failed_worker_id = failed_worker_id,
            replacement_worker_id = %replacement_id,
            "Replacement spawned"
        );
        self.events.emit(ResilienceEvent::ReplacementSpawned {
            failed_worker_id: failed_worker_id.to_string(),
            replacement_worker_id: replacement_id.clone(),
            at: Utc::now(),
        });
        self.decommission(failed_worker_id).await?;
        Ok(replacement_id)
    }

    /// Tighten the worker's circuit breaker: lower failure threshold,
    /// longer recovery window. This does not gate new assignments — the
    /// dispatch layer owns that decision.
    pub async fn reduce_load(&self, worker_id: &str) -> Result<(), ManagerError> {
        if self.subagent(worker_id).await.is_none() {
            return Err(ManagerError::UnknownWorker(worker_id.to_string()));
        }
        let settings = BreakerSettings {
            failure_threshold: self.settings.breaker.tightened_failure_threshold,
            recovery_timeout: Duration::from_millis(
                self.settings.breaker.tightened_recovery_timeout_ms,
            ),
        };
        self.breakers
            .get_or_create(worker_id, settings)
            .await
            .map_err(|e| ManagerError::BreakerUnavailable {
                worker_id: worker_id.to_string(),
                source: e,
            })?;
        info!(worker_id = worker_id, "Load reduced via tightened circuit breaker");
        Ok(())
    }

    /// Pre-register an inactive backup config for a worker. Nothing is
    /// provisioned or activated here; the backup exists so a later
    /// replacement can skip config assembly.
    async fn prepare_backup(&self, worker_id: &str) {
        let Some(agent) = self.subagent(worker_id).await else {
            return;
        };
        let mut backups = self.backups.write().await;
        if backups.contains_key(worker_id) {
            return;
        }
        let backup_id = format!("{}-backup-{}", worker_id, Uuid::new_v4());
        backups.insert(worker_id.to_string(), agent.config().replacement(&backup_id));
        info!(worker_id = worker_id, backup_worker_id = %backup_id, "Backup pre-registered");
        self.events.emit(ResilienceEvent::BackupPreparing {
            worker_id: worker_id.to_string(),
            backup_worker_id: backup_id,
            at: Utc::now(),
        });
    }

    /// Backup config pre-registered for a worker, if any.
    pub async fn backup_for(&self, worker_id: &str) -> Option<WorkerConfig> {
        self.backups.read().await.get(worker_id).cloned()
    }

    // ------------------------------------------------------------------
    // Predictive monitoring
    // ------------------------------------------------------------------

    /// One predictive pass over every Subagent. Tiered so only the
    /// highest-confidence band causes resource-creating action:
    /// probability above 0.9 spawns a replacement immediately; (0.8, 0.9]
    /// reduces load and pre-registers a backup; (0.7, 0.8] reduces load
    /// only.
    pub async fn run_predictive_scan(&self) {
        let agents: Vec<(String, Arc<Subagent>)> = {
            let subagents = self.subagents.read().await;
            let mut agents: Vec<_> = subagents
                .iter()
                .map(|(id, agent)| (id.clone(), Arc::clone(agent)))
                .collect();
            agents.sort_by(|a, b| a.0.cmp(&b.0));
            agents
        };

        for (worker_id, agent) in agents {
            if agent.is_escalated() {
                // Escalation already drives replacement via the lifecycle path
                continue;
            }
            let probability = agent.predict_failure_probability().await;
            let tiers = &self.settings.prediction;

            if probability > tiers.replace_above {
                warn!(
                    worker_id = %worker_id,
                    probability = probability,
                    "Failure imminent — spawning pre-emptive replacement"
                );
                self.events.emit(ResilienceEvent::HighFailureRisk {
                    worker_id: worker_id.clone(),
                    probability,
                    at: Utc::now(),
                });
                if let Err(e) = self.spawn_replacement(&worker_id).await {
                    warn!(worker_id = %worker_id, error = %e, "Pre-emptive replacement failed");
                }
            } else if probability > tiers.backup_above {
                info!(
                    worker_id = %worker_id,
                    probability = probability,
                    "Elevated failure risk — reducing load and preparing backup"
                );
                if let Err(e) = self.reduce_load(&worker_id).await {
                    warn!(worker_id = %worker_id, error = %e, "Load reduction failed");
                }
                self.prepare_backup(&worker_id).await;
            } else if probability > tiers.reduce_load_above {
                info!(
                    worker_id = %worker_id,
                    probability = probability,
                    "Raised failure risk — reducing load"
                );
                if let Err(e) = self.reduce_load(&worker_id).await {
                    warn!(worker_id = %worker_id, error = %e, "Load reduction failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Arm the predictive-scan loop and the lifecycle listener that turns
    /// Subagent failure signals into reroutes and replacements. Idempotent
    /// while running. The manager is single-shot: once `shutdown` has run,
    /// `start` refuses to rearm.
    pub fn start(self: &Arc<Self>) {
        if self.scan_cancel.is_cancelled() {
            warn!("Manager already shut down — not restarting");
            return;
        }
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if !background.is_empty() {
            debug!("Manager loops already started");
            return;
        }
        let Some(mut lifecycle_rx) = self
            .lifecycle_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("Lifecycle listener already consumed — not restarting");
            return;
        };

        let manager = Arc::clone(self);
        let scan_cancel = self.scan_cancel.clone();
        background.push(tokio::spawn(async move {
            let interval = manager.settings.scan_interval();
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scan_cancel.cancelled() => break,
                    _ = ticker.tick() => manager.run_predictive_scan().await,
                }
            }
            debug!("Predictive scan loop stopped");
        }));

        let manager = Arc::clone(self);
        let listener_cancel = self.listener_cancel.clone();
        background.push(tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    signal = lifecycle_rx.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };
                match signal {
                    LifecycleSignal::Failed { worker_id } => {
                        // Total outage is already signaled inside reroute
                        let _ = manager.reroute_tasks_from(&worker_id).await;
                    }
                    LifecycleSignal::Escalated { worker_id } => {
                        let _ = manager.reroute_tasks_from(&worker_id).await;
                        if let Err(e) = manager.spawn_replacement(&worker_id).await {
                            warn!(worker_id = %worker_id, error = %e, "Replacement after escalation failed");
                        }
                    }
                }
            }
            debug!("Lifecycle listener stopped");
        }));

        info!("Self-healing manager started");
    }

    /// Tear down in the safe order: cancel the predictive scan first so no
    /// pass runs against a half-torn-down registry, then stop every
    /// Subagent, then the lifecycle listener. Terminal — `start` refuses
    /// to rearm afterwards.
    pub async fn shutdown(&self) {
        self.scan_cancel.cancel();

        {
            let subagents = self.subagents.read().await;
            for agent in subagents.values() {
                agent.stop();
            }
        }
        self.listener_cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Self-healing manager stopped");
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Aggregate health report: per-status counts, system health score,
    /// and per-worker failure probability sorted descending. Informational
    /// only; nothing here drives control flow.
    pub async fn health_report(&self) -> HealthReport {
        let agents: Vec<Arc<Subagent>> = {
            let subagents = self.subagents.read().await;
            subagents.values().cloned().collect()
        };

        let mut healthy = 0;
        let mut degraded = 0;
        let mut failed = 0;
        let mut recovering = 0;
        let mut at_risk = Vec::with_capacity(agents.len());

        for agent in &agents {
            let record = agent.health().await;
            match record.status {
                WorkerStatus::Healthy => healthy += 1,
                WorkerStatus::Degraded => degraded += 1,
                WorkerStatus::Failed => failed += 1,
                WorkerStatus::Recovering => recovering += 1,
            }
            at_risk.push(WorkerRisk {
                worker_id: record.worker_id,
                failure_probability: agent.predict_failure_probability().await,
            });
        }

        at_risk.sort_by(|a, b| {
            b.failure_probability
                .partial_cmp(&a.failure_probability)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });

        let total = agents.len();
        HealthReport {
            generated_at: Utc::now(),
            total_workers: total,
            healthy,
            degraded,
            failed,
            recovering,
            system_health_score: if total == 0 {
                1.0
            } else {
                healthy as f64 / total as f64
            },
            at_risk,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
