//! End-to-end healing scenarios driven through the public API
//!
//! These tests run the manager's real loops on tokio's paused clock: probe
//! timers fire, failures escalate, the lifecycle listener reroutes and
//! provisions replacements, all deterministically.

use async_trait::async_trait;
use tokio_test::assert_ok;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden::{
    BreakerSettings, CircuitBreakerFactory, EventBus, FailureContext, FallbackStrategyEngine,
    MetricsSample, ProvisionedWorker, ResilienceConfig, ResilienceEvent, SelfHealingManager,
    StrategyAction, TaskDispatcher, WorkerConfig, WorkerProvisioner, WorkerRuntime, WorkerStatus,
};

// ============================================================================
// Host doubles
// ============================================================================

struct ScriptedRuntime {
    probe_healthy: AtomicBool,
    restarts: AtomicU32,
}

impl ScriptedRuntime {
    fn healthy() -> Arc<Self> {
        Arc::new(Self {
            probe_healthy: AtomicBool::new(true),
            restarts: AtomicU32::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            probe_healthy: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl WorkerRuntime for ScriptedRuntime {
    async fn probe(&self) -> anyhow::Result<()> {
        if self.probe_healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("probe refused")
        }
    }

    // Restart spans two suspension points, as a real process stop/start
    // would, so overlapping heals actually interleave
    async fn stop(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    notifications: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn notify_reroute(
        &self,
        task_id: &str,
        from_worker_id: &str,
        to_worker_id: &str,
    ) -> anyhow::Result<()> {
        self.notifications.lock().unwrap().push((
            task_id.to_string(),
            from_worker_id.to_string(),
            to_worker_id.to_string(),
        ));
        Ok(())
    }
}

struct HealthyProvisioner {
    provisioned: AtomicU32,
}

#[async_trait]
impl WorkerProvisioner for HealthyProvisioner {
    async fn provision(
        &self,
        _kind: &str,
        _config: &WorkerConfig,
    ) -> anyhow::Result<ProvisionedWorker> {
        let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(ProvisionedWorker {
            worker_id: format!("replacement-{n}"),
            runtime: ScriptedRuntime::healthy(),
        })
    }
}

#[derive(Default)]
struct NoopBreakers;

#[async_trait]
impl CircuitBreakerFactory for NoopBreakers {
    async fn get_or_create(
        &self,
        _worker_id: &str,
        _settings: BreakerSettings,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Fixture {
    manager: Arc<SelfHealingManager>,
    dispatcher: Arc<RecordingDispatcher>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warden=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn fixture() -> Fixture {
    init_tracing();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = Arc::new(SelfHealingManager::new(
        ResilienceConfig::default(),
        Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
        Arc::new(HealthyProvisioner {
            provisioned: AtomicU32::new(0),
        }),
        Arc::new(NoopBreakers),
        EventBus::default(),
    ));
    Fixture {
        manager,
        dispatcher,
    }
}

fn worker_config(id: &str, max_restart_attempts: u32) -> WorkerConfig {
    WorkerConfig {
        id: id.to_string(),
        kind: "research".to_string(),
        config_payload: serde_json::Value::Null,
        max_restart_attempts,
        memory_limit_bytes: 1024 * 1024 * 1024,
        cpu_limit_percent: 100.0,
        task_timeout_ms: 30_000,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// A worker with an exhausted restart budget escalates exactly once; the
/// lifecycle listener moves its tasks to the surviving worker and swaps in
/// a provisioned replacement.
#[tokio::test(start_paused = true)]
async fn escalated_worker_is_rerouted_and_replaced() {
    let f = fixture();
    let mut rx = f.manager.events().subscribe();

    tokio_test::assert_ok!(
        f.manager
            .register_worker(worker_config("flaky", 0), ScriptedRuntime::failing())
            .await
    );
    tokio_test::assert_ok!(
        f.manager
            .register_worker(worker_config("steady", 2), ScriptedRuntime::healthy())
            .await
    );
    f.manager.record_dispatch("task-1", "flaky").await;
    f.manager.record_dispatch("task-2", "flaky").await;
    f.manager.start();

    // Three 10s probe ticks push "flaky" over the failure threshold; its
    // zero restart budget escalates immediately. Heartbeat the survivor so
    // silence never fails it.
    for _ in 0..4 {
        let steady = f.manager.subagent("steady").await.unwrap();
        steady.record_heartbeat().await;
        if let Some(flaky) = f.manager.subagent("flaky").await {
            flaky.record_heartbeat().await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    // Both tasks moved off the escalated worker
    for task in ["task-1", "task-2"] {
        let route = f.manager.route(task).await.unwrap();
        assert_eq!(route.current_worker_id, "steady");
        assert_eq!(route.original_worker_id, "flaky");
        assert_eq!(route.reroute_count, 1);
    }
    assert_eq!(f.dispatcher.notifications.lock().unwrap().len(), 2);

    // Escalated worker replaced in the registry
    let ids = f.manager.worker_ids().await;
    assert!(!ids.contains(&"flaky".to_string()));
    assert!(ids.contains(&"replacement-0".to_string()));
    assert!(ids.contains(&"steady".to_string()));

    let mut escalations = 0;
    let mut reroutes = 0;
    let mut replacements = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            ResilienceEvent::SubagentEscalated { ref worker_id, .. } => {
                assert_eq!(worker_id, "flaky");
                escalations += 1;
            }
            ResilienceEvent::TaskRerouted { .. } => reroutes += 1,
            ResilienceEvent::ReplacementSpawned {
                ref replacement_worker_id,
                ..
            } => {
                assert_eq!(replacement_worker_id, "replacement-0");
                replacements += 1;
            }
            _ => {}
        }
    }
    assert_eq!(escalations, 1, "escalation signal fires exactly once");
    assert_eq!(reroutes, 2);
    assert_eq!(replacements, 1);

    f.manager.shutdown().await;
}

/// With zero healthy workers a reroute raises the total-outage signal and
/// leaves every route untouched — no task is silently dropped.
#[tokio::test(start_paused = true)]
async fn total_outage_raises_signal_and_keeps_routes() {
    let f = fixture();

    let agent = f
        .manager
        .register_worker(worker_config("solo", 0), ScriptedRuntime::failing())
        .await
        .unwrap();
    f.manager.record_dispatch("task-1", "solo").await;
    f.manager.record_dispatch("task-2", "solo").await;
    f.manager.record_dispatch("task-3", "solo").await;

    agent.record_heartbeat().await;
    for _ in 0..3 {
        agent.evaluate_health().await;
    }
    assert_eq!(agent.health().await.status, WorkerStatus::Failed);
    assert!(agent.is_escalated());

    let mut rx = f.manager.events().subscribe();
    let result = f.manager.reroute_tasks_from("solo").await;
    assert!(result.is_err());

    for task in ["task-1", "task-2", "task-3"] {
        let route = f.manager.route(task).await.unwrap();
        assert_eq!(route.current_worker_id, "solo");
        assert_eq!(route.reroute_count, 0);
    }
    assert!(f.dispatcher.notifications.lock().unwrap().is_empty());

    match rx.try_recv().unwrap() {
        ResilienceEvent::NoHealthyAgents {
            failed_worker_id,
            stranded_tasks,
            ..
        } => {
            assert_eq!(failed_worker_id, "solo");
            assert_eq!(stranded_tasks, 3);
        }
        other => panic!("expected no-healthy-agents, got {other:?}"),
    }
}

/// Response times stepping from 100ms to 400ms must push predicted failure
/// probability to at least the degradation weight.
#[tokio::test(start_paused = true)]
async fn response_time_degradation_raises_predicted_risk() {
    let f = fixture();
    let agent = f
        .manager
        .register_worker(worker_config("worker-a", 2), ScriptedRuntime::healthy())
        .await
        .unwrap();

    for _ in 0..10 {
        agent
            .record_metrics(MetricsSample::response_time(100.0))
            .await;
    }
    for _ in 0..10 {
        agent
            .record_metrics(MetricsSample::response_time(400.0))
            .await;
    }

    let p = agent.predict_failure_probability().await;
    assert!(p >= 0.3, "expected at least 0.3, got {p}");

    let report = f.manager.health_report().await;
    assert_eq!(report.at_risk[0].worker_id, "worker-a");
    assert!(report.at_risk[0].failure_probability >= 0.3);
}

/// A "focus" failure with no cached results selects the simpler-tool
/// strategy, substituting "think".
#[test]
fn focus_failure_without_cache_switches_to_think() {
    let engine = FallbackStrategyEngine::new();
    let context = FailureContext {
        worker_id: "focus".to_string(),
        failure_reason: "timeout".to_string(),
        attempt_number: 1,
        previous_results: None,
        original_payload: None,
    };

    let strategy = engine.best_strategy(&context);
    assert_eq!(strategy.name, "simpler-tool");
    assert_eq!(
        strategy.execute(&context),
        StrategyAction::SwitchTool {
            alternative_tool: "think".to_string()
        }
    );
}

/// Two concurrent self-heal calls on one worker perform exactly one
/// restart; the loser observes the in-flight no-op.
#[tokio::test(start_paused = true)]
async fn concurrent_self_heal_restarts_once() {
    let f = fixture();
    let runtime = ScriptedRuntime::healthy();
    let agent = f
        .manager
        .register_worker(
            worker_config("worker-a", 2),
            Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        )
        .await
        .unwrap();

    let first = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.self_heal().await })
    };
    let second = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.self_heal().await })
    };
    let (first, second) = tokio::join!(first, second);
    assert!(first.unwrap().is_ok());
    assert!(second.unwrap().is_ok());

    assert_eq!(runtime.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(agent.health().await.restart_count, 1);
}

/// Healthy pool: probe loops run for minutes without a single transition
/// or heal, and the health report stays clean.
#[tokio::test(start_paused = true)]
async fn steady_state_pool_stays_quiet() {
    let f = fixture();
    let mut rx = f.manager.events().subscribe();

    for id in ["worker-a", "worker-b", "worker-c"] {
        tokio_test::assert_ok!(
            f.manager
                .register_worker(worker_config(id, 2), ScriptedRuntime::healthy())
                .await
        );
    }
    f.manager.start();

    for _ in 0..12 {
        for id in ["worker-a", "worker-b", "worker-c"] {
            f.manager.subagent(id).await.unwrap().record_heartbeat().await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    let report = f.manager.health_report().await;
    assert_eq!(report.healthy, 3);
    assert_eq!(report.system_health_score, 1.0);

    while let Ok(event) = rx.try_recv() {
        assert!(
            matches!(event, ResilienceEvent::SubagentRegistered { .. }),
            "unexpected event in steady state: {event:?}"
        );
    }

    f.manager.shutdown().await;
}

/// Shutdown stops every loop: no probe, scan, or heal activity after it
/// completes.
#[tokio::test(start_paused = true)]
async fn shutdown_stops_all_activity() {
    let f = fixture();
    let runtime = ScriptedRuntime::failing();
    f.manager
        .register_worker(
            worker_config("worker-a", 5),
            Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        )
        .await
        .unwrap();
    f.manager.start();
    f.manager.shutdown().await;

    let mut rx = f.manager.events().subscribe();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(runtime.restarts.load(Ordering::SeqCst), 0);
    assert!(rx.try_recv().is_err(), "no events after shutdown");
}
