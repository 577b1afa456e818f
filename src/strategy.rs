//! FallbackStrategyEngine — ordered catalog of recovery strategies
//!
//! Given a failure context, the engine picks the highest-priority (lowest
//! number) applicable strategy. A catch-all at the lowest rank always
//! matches, so selection never fails with "no strategy".
//!
//! Built-in order: reuse the last good cached result → substitute a
//! simpler equivalent tool for a known-complex one → substitute a cheaper
//! resource tier → retry with reduced scope (early attempts only) →
//! structured error description.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// ============================================================================
// Failure context
// ============================================================================

/// Ephemeral description of one failure, constructed per failure and
/// consumed by strategy selection.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub worker_id: String,
    pub failure_reason: String,
    /// 1-based attempt number for the failing operation
    pub attempt_number: u32,
    /// Cached results from an earlier successful run, if any
    pub previous_results: Option<Value>,
    /// Original request payload, if available
    pub original_payload: Option<Value>,
}

/// Action produced by executing a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum StrategyAction {
    /// Serve the last good cached result instead of re-running
    UseCachedResult { results: Value },
    /// Re-run with a simpler equivalent tool
    SwitchTool { alternative_tool: String },
    /// Re-run on a cheaper resource tier
    DowngradeTier { tier: String },
    /// Re-run with deliberately reduced input scope
    RetryReducedScope { scope_factor: f64 },
    /// No recovery possible; return a structured error to the caller
    StructuredError { description: String },
}

// ============================================================================
// Strategies
// ============================================================================

type AppliesFn = Box<dyn Fn(&FailureContext) -> bool + Send + Sync>;
type ExecuteFn = Box<dyn Fn(&FailureContext) -> StrategyAction + Send + Sync>;

/// One recovery strategy. Lower priority numbers are tried first.
pub struct Strategy {
    pub name: String,
    pub description: String,
    pub priority: u32,
    applies: AppliesFn,
    execute: ExecuteFn,
}

impl Strategy {
    pub fn new<A, E>(
        name: impl Into<String>,
        description: impl Into<String>,
        priority: u32,
        applies: A,
        execute: E,
    ) -> Self
    where
        A: Fn(&FailureContext) -> bool + Send + Sync + 'static,
        E: Fn(&FailureContext) -> StrategyAction + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            priority,
            applies: Box::new(applies),
            execute: Box::new(execute),
        }
    }

    pub fn applies(&self, context: &FailureContext) -> bool {
        (self.applies)(context)
    }

    pub fn execute(&self, context: &FailureContext) -> StrategyAction {
        (self.execute)(context)
    }
}

/// Known-complex tools and their simpler equivalents.
const SIMPLER_EQUIVALENTS: &[(&str, &str)] = &[
    ("focus", "think"),
    ("research", "recall"),
    ("orchestrate", "delegate"),
];

/// Attempts under which a reduced-scope retry is still worthwhile.
const MAX_REDUCED_SCOPE_ATTEMPTS: u32 = 3;

/// Priority rank of the catch-all; nothing should register below it.
pub const CATCH_ALL_PRIORITY: u32 = 100;

fn simpler_equivalent(worker_id: &str) -> Option<&'static str> {
    SIMPLER_EQUIVALENTS
        .iter()
        .find(|(complex, _)| *complex == worker_id)
        .map(|(_, simpler)| *simpler)
}

// ============================================================================
// Engine
// ============================================================================

/// Ordered strategy catalog. Ordering is a stable sort on priority, so
/// strategies registered at equal priority keep their insertion order.
pub struct FallbackStrategyEngine {
    strategies: Vec<Strategy>,
}

impl FallbackStrategyEngine {
    /// Engine with the built-in catalog installed.
    pub fn new() -> Self {
        let mut engine = Self {
            strategies: Vec::new(),
        };

        engine.register(Strategy::new(
            "cached-result",
            "Serve the last good cached result",
            1,
            |ctx| ctx.previous_results.is_some(),
            |ctx| StrategyAction::UseCachedResult {
                results: ctx
                    .previous_results
                    .clone()
                    .unwrap_or(Value::Null),
            },
        ));

        engine.register(Strategy::new(
            "simpler-tool",
            "Substitute a simpler equivalent tool for a known-complex one",
            2,
            |ctx| simpler_equivalent(&ctx.worker_id).is_some(),
            |ctx| StrategyAction::SwitchTool {
                alternative_tool: simpler_equivalent(&ctx.worker_id)
                    .unwrap_or("think")
                    .to_string(),
            },
        ));

        engine.register(Strategy::new(
            "cheaper-tier",
            "Re-run the operation on the economy resource tier",
            3,
            |ctx| {
                ctx.original_payload
                    .as_ref()
                    .and_then(|p| p.get("tier"))
                    .and_then(Value::as_str)
                    .is_some_and(|tier| tier != "economy")
            },
            |_| StrategyAction::DowngradeTier {
                tier: "economy".to_string(),
            },
        ));

        engine.register(Strategy::new(
            "reduced-scope",
            "Retry with deliberately reduced input scope",
            4,
            |ctx| {
                ctx.attempt_number < MAX_REDUCED_SCOPE_ATTEMPTS && ctx.original_payload.is_some()
            },
            |_| StrategyAction::RetryReducedScope { scope_factor: 0.5 },
        ));

        engine.register(Strategy::new(
            "structured-error",
            "Describe the failure to the caller",
            CATCH_ALL_PRIORITY,
            |_| true,
            |ctx| StrategyAction::StructuredError {
                description: format!(
                    "worker {} failed after {} attempt(s): {}",
                    ctx.worker_id, ctx.attempt_number, ctx.failure_reason
                ),
            },
        ));

        engine
    }

    /// Register a strategy and re-sort the catalog (stable, by priority).
    pub fn register(&mut self, strategy: Strategy) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.priority);
    }

    /// The highest-priority applicable strategy. The catch-all guarantees
    /// a match.
    pub fn best_strategy(&self, context: &FailureContext) -> &Strategy {
        let chosen = self
            .strategies
            .iter()
            .find(|s| s.applies(context))
            .unwrap_or_else(|| {
                // Catch-all is installed in new() and register() never removes
                &self.strategies[self.strategies.len() - 1]
            });
        debug!(
            strategy = %chosen.name,
            priority = chosen.priority,
            worker_id = %context.worker_id,
            "Fallback strategy selected"
        );
        chosen
    }

    /// Select and execute in one step.
    pub fn recover(&self, context: &FailureContext) -> StrategyAction {
        self.best_strategy(context).execute(context)
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name.as_str()).collect()
    }
}

impl Default for FallbackStrategyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(worker_id: &str) -> FailureContext {
        FailureContext {
            worker_id: worker_id.to_string(),
            failure_reason: "timeout".to_string(),
            attempt_number: 1,
            previous_results: None,
            original_payload: None,
        }
    }

    #[test]
    fn test_catalog_order() {
        let engine = FallbackStrategyEngine::new();
        assert_eq!(
            engine.strategy_names(),
            vec![
                "cached-result",
                "simpler-tool",
                "cheaper-tier",
                "reduced-scope",
                "structured-error"
            ]
        );
    }

    #[test]
    fn test_cached_result_wins_when_available() {
        let engine = FallbackStrategyEngine::new();
        let mut ctx = context("focus");
        ctx.previous_results = Some(json!({"summary": "done"}));

        let strategy = engine.best_strategy(&ctx);
        assert_eq!(strategy.name, "cached-result");
        assert_eq!(
            strategy.execute(&ctx),
            StrategyAction::UseCachedResult {
                results: json!({"summary": "done"})
            }
        );
    }

    #[test]
    fn test_focus_without_cache_selects_simpler_tool() {
        let engine = FallbackStrategyEngine::new();
        let ctx = context("focus");

        let strategy = engine.best_strategy(&ctx);
        assert_eq!(strategy.name, "simpler-tool");
        assert_eq!(strategy.priority, 2);
        assert_eq!(
            strategy.execute(&ctx),
            StrategyAction::SwitchTool {
                alternative_tool: "think".to_string()
            }
        );
    }

    #[test]
    fn test_cheaper_tier_for_tiered_payload() {
        let engine = FallbackStrategyEngine::new();
        let mut ctx = context("summarize");
        ctx.original_payload = Some(json!({"tier": "premium", "input": "x"}));

        let strategy = engine.best_strategy(&ctx);
        assert_eq!(strategy.name, "cheaper-tier");
        assert_eq!(
            strategy.execute(&ctx),
            StrategyAction::DowngradeTier {
                tier: "economy".to_string()
            }
        );
    }

    #[test]
    fn test_reduced_scope_only_for_early_attempts() {
        let engine = FallbackStrategyEngine::new();
        let mut ctx = context("summarize");
        ctx.original_payload = Some(json!({"tier": "economy", "input": "x"}));

        ctx.attempt_number = 2;
        assert_eq!(engine.best_strategy(&ctx).name, "reduced-scope");

        ctx.attempt_number = 5;
        assert_eq!(engine.best_strategy(&ctx).name, "structured-error");
    }

    #[test]
    fn test_catch_all_always_matches() {
        let engine = FallbackStrategyEngine::new();
        let ctx = context("unknown-worker");
        let action = engine.recover(&ctx);
        assert!(matches!(action, StrategyAction::StructuredError { .. }));
    }

    #[test]
    fn test_runtime_registration_respects_priority() {
        let mut engine = FallbackStrategyEngine::new();
        engine.register(Strategy::new(
            "pin-to-standby",
            "Route to the standby pool",
            0,
            |ctx| ctx.failure_reason == "overload",
            |_| StrategyAction::SwitchTool {
                alternative_tool: "standby".to_string(),
            },
        ));

        let mut ctx = context("focus");
        ctx.failure_reason = "overload".to_string();
        assert_eq!(engine.best_strategy(&ctx).name, "pin-to-standby");

        // Non-overload failures still fall through to the built-ins
        ctx.failure_reason = "timeout".to_string();
        assert_eq!(engine.best_strategy(&ctx).name, "simpler-tool");
    }
}
