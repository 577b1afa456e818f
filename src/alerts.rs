//! AlertManager — rule-based alerting over metric snapshots
//!
//! Named predicates are evaluated against a [`MetricsSnapshot`]; each match
//! appends a timestamped [`Alert`] and raises an alert signal on the event
//! bus. Severity is assigned by static classification of the rule name.
//! The default catalog covers breaker-fleet failure patterns and is
//! extensible at runtime.

use crate::events::{EventBus, ResilienceEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

// ============================================================================
// Snapshot & alerts
// ============================================================================

/// Point-in-time metrics handed to `check_alerts`. The fixed fields cover
/// the default catalog; `extra` carries anything host-specific rules need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Fraction of recent calls that failed, in [0, 1]
    pub failure_rate: f64,
    /// Circuit breakers currently open
    pub open_breakers: usize,
    /// Circuit breakers currently half-open
    pub half_open_breakers: usize,
    /// Aggregate system health score, in [0, 1]
    pub system_health_score: f64,
    #[serde(default)]
    pub extra: HashMap<String, f64>,
}

/// Alert severity, classified statically from the rule name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// A triggered alert. Append-only per rule; prunable by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub rule_name: String,
    pub at: DateTime<Utc>,
    pub severity: AlertSeverity,
    /// Snapshot that triggered the rule
    pub payload: serde_json::Value,
}

/// Severity from the rule name alone, so runtime-registered rules get a
/// sensible classification without extra wiring.
fn classify_severity(rule_name: &str) -> AlertSeverity {
    if rule_name.contains("critical") || rule_name.contains("cascade") {
        AlertSeverity::Critical
    } else if rule_name.contains("down") || rule_name.contains("low") {
        AlertSeverity::Warning
    } else {
        AlertSeverity::Info
    }
}

// ============================================================================
// Manager
// ============================================================================

type RulePredicate = Box<dyn Fn(&MetricsSnapshot) -> bool + Send + Sync>;

/// Rule-based alert evaluation and retention.
pub struct AlertManager {
    rules: Vec<(String, RulePredicate)>,
    alerts: Vec<Alert>,
    events: EventBus,
}

impl AlertManager {
    /// Manager with the default rule catalog installed.
    pub fn new(events: EventBus) -> Self {
        let mut manager = Self {
            rules: Vec::new(),
            alerts: Vec::new(),
            events,
        };
        manager.add_rule("critical-failure-rate", |s| s.failure_rate > 0.8);
        manager.add_rule("multiple-services-down", |s| s.open_breakers > 3);
        manager.add_rule("cascade-risk", |s| {
            s.half_open_breakers > 2 && s.open_breakers > 1
        });
        manager.add_rule("low-system-health", |s| s.system_health_score < 0.5);
        manager
    }

    /// Register a rule. A rule with the same name is replaced.
    pub fn add_rule<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&MetricsSnapshot) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        self.rules.retain(|(existing, _)| *existing != name);
        self.rules.push((name, Box::new(predicate)));
    }

    /// Evaluate every rule against the snapshot. Each match records an
    /// alert and raises an alert signal.
    pub fn check_alerts(&mut self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let payload = serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null);
        let mut triggered = Vec::new();

        for (name, predicate) in &self.rules {
            if !predicate(snapshot) {
                continue;
            }
            let severity = classify_severity(name);
            let alert = Alert {
                rule_name: name.clone(),
                at: Utc::now(),
                severity,
                payload: payload.clone(),
            };
            match severity {
                AlertSeverity::Critical => {
                    warn!(rule = %name, severity = %severity, "Alert triggered")
                }
                _ => info!(rule = %name, severity = %severity, "Alert triggered"),
            }
            self.events.emit(ResilienceEvent::AlertRaised {
                rule_name: name.clone(),
                severity,
                at: alert.at,
            });
            triggered.push(alert.clone());
            self.alerts.push(alert);
        }

        triggered
    }

    /// Alerts within the trailing window, globally sorted newest first.
    pub fn recent_alerts(&self, window_minutes: i64) -> Vec<Alert> {
        let cutoff = Utc::now() - Duration::minutes(window_minutes);
        let mut recent: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| a.at >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.at.cmp(&a.at));
        recent
    }

    /// Drop recorded alerts older than `max_age`.
    pub fn prune_older_than(&mut self, max_age: Duration) {
        let cutoff = Utc::now() - max_age;
        let before = self.alerts.len();
        self.alerts.retain(|a| a.at >= cutoff);
        let pruned = before - self.alerts.len();
        if pruned > 0 {
            info!(pruned = pruned, retained = self.alerts.len(), "Pruned aged alerts");
        }
    }

    /// Total recorded alerts (diagnostics only).
    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }
}
