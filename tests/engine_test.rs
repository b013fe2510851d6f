//! End-to-end tests for the action engine.
//!
//! Runs the full trigger → run → learn loop against an in-memory SQLite
//! database with a scripted executor standing in for agent webhooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use perf_action_engine::engine::{
    ActionConfig, ActionEngine, ActionExecutor, ActionRegistry, ActionRequest, ActionRule,
    ActionStatus, DecisionReason, EngineConfig, ExecutionOutcome, MetricContext, MetricSnapshot,
    Recommendation, RuleScope, SqliteMetricSource, TriggerCondition,
};
use perf_action_engine::error::ExecutorError;
use perf_action_engine::storage::{ActionLogFilter, SqliteStorage};

// ============================================================================
// Harness
// ============================================================================

#[derive(Clone)]
enum Behavior {
    Succeed(Option<f64>),
    SucceedAfter(u64, Option<f64>),
    Transient,
}

/// Executor whose result is scripted per action kind.
#[derive(Default)]
struct ScriptedExecutor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn set(&self, action_kind: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(action_kind.to_string(), behavior);
    }

    fn calls_for(&self, action_kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.as_str() == action_kind)
            .count()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        self.calls.lock().unwrap().push(request.action_kind.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&request.action_kind)
            .cloned()
            .unwrap_or(Behavior::Succeed(None));
        match behavior {
            Behavior::Succeed(post_value) => Ok(ExecutionOutcome {
                post_value,
                ..Default::default()
            }),
            Behavior::SucceedAfter(delay_ms, post_value) => {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                Ok(ExecutionOutcome {
                    post_value,
                    ..Default::default()
                })
            }
            Behavior::Transient => Err(ExecutorError::Transient {
                message: "agent unavailable".to_string(),
            }),
        }
    }
}

struct Harness {
    engine: ActionEngine,
    metrics: SqliteMetricSource,
    executor: Arc<ScriptedExecutor>,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.runner.base_backoff_ms = 1;
    config.runner.max_backoff_ms = 2;
    config.learning.settle_delay_secs = 0;
    config.learning.minimum_sample_size = 10;
    config.learning.confidence_threshold = 0.3;
    config
}

async fn harness(config: EngineConfig) -> Harness {
    let storage = Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage"),
    );
    let metrics = SqliteMetricSource::new(storage.pool().clone());
    let executor = Arc::new(ScriptedExecutor::default());
    let registry = Arc::new(ActionRegistry::with_default_catalog(executor.clone()));
    let engine = ActionEngine::new(storage, Arc::new(metrics.clone()), registry, config)
        .expect("Failed to create engine");
    Harness {
        engine,
        metrics,
        executor,
    }
}

async fn record(metrics: &SqliteMetricSource, ctx: &MetricContext, value: f64, minutes_ago: i64) {
    metrics
        .record_snapshot(
            ctx,
            &MetricSnapshot::new(value, Utc::now() - Duration::minutes(minutes_ago))
                .with_samples(20),
        )
        .await
        .expect("Failed to record snapshot");
}

fn engagement_rule() -> ActionRule {
    ActionRule::new(
        "boost low engagement",
        "content",
        "boost_engagement",
        "engagement",
        TriggerCondition::LessThan,
        0.5,
    )
}

fn overall() -> MetricContext {
    MetricContext::new("content", "overall")
}

// ============================================================================
// Scenario
// ============================================================================

#[tokio::test]
async fn test_end_to_end_trigger_run_learn() {
    let h = harness(test_config()).await;
    let ctx = MetricContext::new("content", "engagement").with_campaign("spring");
    let rule = h
        .engine
        .create_rule(engagement_rule().with_scope(RuleScope {
            campaign_ids: vec!["spring".to_string()],
            ..Default::default()
        }))
        .await
        .unwrap();

    // Seeded on rule creation
    let seeded = h.engine.get_metric_weights(&ctx).await.unwrap().unwrap();
    assert_eq!(seeded.version, 1);
    assert_eq!(seeded.threshold, 0.5);

    for minutes_ago in [40, 30, 20, 10] {
        record(&h.metrics, &ctx, 0.3, minutes_ago).await;
    }

    let checks = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(checks.fired, 1);
    assert_eq!(checks.completed, 1);
    let log_id = checks.records[0].action_log_id.clone().unwrap();

    let log = h.engine.get_action_log(&log_id).await.unwrap();
    assert_eq!(log.rule_id, Some(rule.id.clone()));
    assert_eq!(log.status, ActionStatus::Completed);
    assert_eq!(log.trigger_value, 0.3);

    // Metric recovers after the action
    record(&h.metrics, &ctx, 0.45, 0).await;

    let analysis = h.engine.process_action_outcome(&log_id, false).await.unwrap();
    assert!(analysis.validated);
    assert_eq!(analysis.recommendation, Recommendation::IncreaseWeight);
    assert!((analysis.improvement.unwrap() - 0.5).abs() < 1e-9);
    assert_eq!(analysis.weight_version, Some(2));

    let weight = h.engine.get_metric_weights(&ctx).await.unwrap().unwrap();
    assert_eq!(weight.version, 2);
    assert!((weight.weight - 1.05).abs() < 1e-9);
    assert_eq!(weight.previous_version_id, Some(seeded.id));

    // Learning the same log again is a no-op
    let again = h.engine.process_action_outcome(&log_id, false).await.unwrap();
    assert!(again.already_processed);
    assert_eq!(h.engine.weight_history(&ctx).await.unwrap().len(), 2);

    let rule_after = h.engine.get_rule(&rule.id).await.unwrap();
    assert!(rule_after.last_triggered_at.is_some());
}

#[tokio::test]
async fn test_low_engagement_boost_raises_weight() {
    let h = harness(test_config()).await;
    h.executor
        .set("boost_engagement", Behavior::Succeed(Some(2.4)));
    let ctx = MetricContext::new("content", "engagement");
    h.engine
        .create_rule(
            ActionRule::new(
                "engagement below 2",
                "content",
                "boost_engagement",
                "engagement",
                TriggerCondition::LessThan,
                2.0,
            )
            .with_cooldown_secs(3600),
        )
        .await
        .unwrap();
    let seeded = h.engine.get_metric_weights(&ctx).await.unwrap().unwrap();

    record(&h.metrics, &ctx, 1.2, 20).await;
    record(&h.metrics, &ctx, 1.2, 10).await;

    let checks = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(checks.fired, 1);
    assert_eq!(checks.completed, 1);
    let log_id = checks.records[0].action_log_id.clone().unwrap();
    let log = h.engine.get_action_log(&log_id).await.unwrap();
    assert_eq!(log.action_kind, "boost_engagement");
    assert_eq!(log.trigger_value, 1.2);

    let analysis = h.engine.process_action_outcome(&log_id, false).await.unwrap();
    assert!(analysis.validated);
    assert!(analysis.confidence >= 0.3);
    assert!((analysis.improvement.unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(analysis.recommendation, Recommendation::IncreaseWeight);

    let weight = h.engine.get_metric_weights(&ctx).await.unwrap().unwrap();
    assert_eq!(weight.version, 2);
    assert!(weight.weight > seeded.weight);
    assert!((weight.weight - 1.1).abs() < 1e-9);
    let history = h.engine.weight_history(&ctx).await.unwrap();
    assert_eq!(history.iter().filter(|w| w.is_active).count(), 1);
    assert!(!history.iter().find(|w| w.id == seeded.id).unwrap().is_active);

    // Still breaching, but inside the hour-long cooldown.
    record(&h.metrics, &ctx, 1.2, 5).await;
    let again = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(again.executed, 0);
    assert!(matches!(
        again.records[0].decision.reason,
        DecisionReason::CooldownActive { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_dispatch_once_per_context() {
    let h = harness(test_config()).await;
    h.executor
        .set("boost_engagement", Behavior::SucceedAfter(100, None));
    h.engine
        .create_rule(engagement_rule().with_cooldown_secs(3600))
        .await
        .unwrap();
    let ctx = MetricContext::new("content", "engagement");
    record(&h.metrics, &ctx, 0.2, 1).await;

    let (first, second) = tokio::join!(
        h.engine.run_action_checks(None, None, false),
        h.engine.run_action_checks(None, None, false),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.executed + second.executed, 1);
    assert_eq!(h.executor.calls_for("boost_engagement"), 1);
    let logs = h
        .engine
        .list_action_logs(&ActionLogFilter::default())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
}

// ============================================================================
// Runner
// ============================================================================

#[tokio::test]
async fn test_retry_bound_then_single_fallback() {
    let h = harness(test_config()).await;
    h.executor.set("boost_engagement", Behavior::Transient);
    h.executor.set("refresh_content", Behavior::Transient);

    let result = h
        .engine
        .trigger_action("content", "boost_engagement", ActionConfig::default(), None)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.log.status, ActionStatus::Failed);
    assert_eq!(result.log.retry_count, 3);
    assert_eq!(result.log.max_retries, 3);
    assert_eq!(h.executor.calls_for("boost_engagement"), 4);

    let fallback = result.fallback.unwrap();
    assert_eq!(fallback.parent_id, Some(result.log.id.clone()));
    assert_eq!(fallback.status, ActionStatus::Failed);
    // One attempt, whatever the fallback kind's own retry policy.
    assert_eq!(fallback.max_retries, 0);
    assert_eq!(fallback.retry_count, 0);
    assert_eq!(h.executor.calls_for("refresh_content"), 1);

    let logs = h
        .engine
        .list_action_logs(&ActionLogFilter::default())
        .await
        .unwrap();
    assert_eq!(logs.len(), 2);
}

#[tokio::test]
async fn test_fallback_success_stands() {
    let h = harness(test_config()).await;
    h.executor.set("boost_engagement", Behavior::Transient);

    let result = h
        .engine
        .trigger_action("content", "boost_engagement", ActionConfig::default(), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.status, ActionStatus::Completed);
    assert_eq!(result.log.status, ActionStatus::Failed);
}

#[tokio::test]
async fn test_retry_override_from_config() {
    let mut config = test_config();
    config.runner.fallback_enabled = false;
    let h = harness(config).await;
    h.executor.set("boost_engagement", Behavior::Transient);

    let result = h
        .engine
        .trigger_action(
            "content",
            "boost_engagement",
            ActionConfig {
                max_retries: Some(1),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.log.retry_count, 1);
    assert_eq!(h.executor.calls_for("boost_engagement"), 2);
    assert!(result.fallback.is_none());
}

// ============================================================================
// Trigger
// ============================================================================

#[tokio::test]
async fn test_consecutive_breach_required() {
    let h = harness(test_config()).await;
    h.engine
        .create_rule(engagement_rule().with_consecutive(3, 3600))
        .await
        .unwrap();
    let ctx = MetricContext::new("content", "engagement");

    for (i, minutes_ago) in [3, 2].into_iter().enumerate() {
        record(&h.metrics, &ctx, 0.2, minutes_ago).await;
        let checks = h.engine.run_action_checks(None, None, false).await.unwrap();
        assert_eq!(checks.executed, 0);
        assert_eq!(
            checks.records[0].decision.reason,
            DecisionReason::StreakBuilding {
                current: i as u32 + 1,
                required: 3
            }
        );
    }

    // Re-checking the same snapshot does not advance the streak
    let checks = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(checks.executed, 0);

    record(&h.metrics, &ctx, 0.2, 1).await;
    let checks = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(checks.executed, 1);
}

#[tokio::test]
async fn test_consecutive_breach_sequence_fires_on_sixth() {
    let h = harness(test_config()).await;
    h.engine
        .create_rule(engagement_rule().with_consecutive(3, 3600))
        .await
        .unwrap();
    let ctx = MetricContext::new("content", "engagement");

    // breach, breach, ok, breach, breach, breach
    let sequence = [0.2, 0.2, 0.8, 0.2, 0.2, 0.2];
    let mut fired = Vec::new();
    for (i, value) in sequence.into_iter().enumerate() {
        record(&h.metrics, &ctx, value, 6 - i as i64).await;
        let checks = h.engine.run_action_checks(None, None, false).await.unwrap();
        fired.push(checks.executed == 1);
    }
    assert_eq!(fired, vec![false, false, false, false, false, true]);
    assert_eq!(h.executor.calls_for("boost_engagement"), 1);
}

#[tokio::test]
async fn test_cooldown_blocks_second_fire() {
    let h = harness(test_config()).await;
    h.engine
        .create_rule(engagement_rule().with_cooldown_secs(3600))
        .await
        .unwrap();
    let ctx = MetricContext::new("content", "engagement");

    record(&h.metrics, &ctx, 0.2, 2).await;
    let first = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(first.executed, 1);

    record(&h.metrics, &ctx, 0.1, 1).await;
    let second = h.engine.run_action_checks(None, None, false).await.unwrap();
    assert_eq!(second.executed, 0);
    assert!(matches!(
        second.records[0].decision.reason,
        DecisionReason::CooldownActive { remaining_secs } if remaining_secs > 3500
    ));
}

// ============================================================================
// Learning
// ============================================================================

async fn run_and_learn(h: &Harness, action: &str) -> perf_action_engine::engine::FeedbackAnalysis {
    let result = h
        .engine
        .trigger_action("content", action, ActionConfig::default(), None)
        .await
        .unwrap();
    h.engine
        .process_action_outcome(&result.log.id, false)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_weight_bounds_and_version_monotonicity() {
    let mut config = test_config();
    config.learning.learning_rate = 1.0;
    config.learning.decay_rate = 0.0;
    config.learning.weight_max = 1.2;
    let h = harness(config).await;
    h.executor.set("boost_engagement", Behavior::Succeed(Some(0.6)));

    for round in 0..5 {
        record(&h.metrics, &overall(), 0.1, 30 - round).await;
        let analysis = run_and_learn(&h, "boost_engagement").await;
        assert!(analysis.validated);

        let weight = h.engine.get_metric_weights(&overall()).await.unwrap().unwrap();
        assert!(weight.weight <= 1.2 && weight.weight >= 0.1);
    }

    let history = h.engine.weight_history(&overall()).await.unwrap();
    let versions: Vec<i64> = history.iter().map(|w| w.version).collect();
    assert_eq!(versions, vec![6, 5, 4, 3, 2, 1]);
    assert_eq!(history.iter().filter(|w| w.is_active).count(), 1);
    assert!(history[0].is_active);
    assert_eq!(history[0].weight, 1.2);
}

#[tokio::test]
async fn test_rollback_is_idempotent() {
    let mut config = test_config();
    config.runner.fallback_enabled = false;
    let h = harness(config).await;
    h.executor.set("boost_engagement", Behavior::Succeed(Some(0.2)));
    h.executor.set("refresh_content", Behavior::Transient);

    record(&h.metrics, &overall(), 0.1, 10).await;
    let learned = run_and_learn(&h, "boost_engagement").await;
    assert_eq!(learned.weight_version, Some(2));

    let failed = h
        .engine
        .trigger_action("content", "refresh_content", ActionConfig::default(), None)
        .await
        .unwrap();
    assert_eq!(failed.log.status, ActionStatus::Failed);

    let rollback = h
        .engine
        .process_action_outcome(&failed.log.id, false)
        .await
        .unwrap();
    assert!(rollback.rolled_back);
    assert_eq!(rollback.recommendation, Recommendation::RolledBack);
    assert_eq!(rollback.weight_version, Some(1));

    let active = h.engine.get_metric_weights(&overall()).await.unwrap().unwrap();
    assert_eq!(active.version, 1);

    for force in [false, true] {
        let again = h
            .engine
            .process_action_outcome(&failed.log.id, force)
            .await
            .unwrap();
        assert!(again.already_processed);
        assert_eq!(again.weight_version, Some(1));
    }

    let history = h.engine.weight_history(&overall()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|w| w.is_active).count(), 1);
}

#[tokio::test]
async fn test_batch_learning_summary() {
    let h = harness(test_config()).await;
    h.executor.set("boost_engagement", Behavior::Succeed(Some(0.15)));
    record(&h.metrics, &overall(), 0.1, 10).await;

    for _ in 0..2 {
        h.engine
            .trigger_action("content", "boost_engagement", ActionConfig::default(), None)
            .await
            .unwrap();
    }

    let summary = h
        .engine
        .process_batch_learning(Some("content"), None, 24, false)
        .await
        .unwrap();
    assert_eq!(summary.total_logs, 2);
    assert_eq!(summary.processed_logs, 2);
    assert_eq!(summary.weight_updates, 2);
    assert!(summary.failed_contexts.is_empty());
    assert!((summary.average_improvement - 0.5).abs() < 1e-9);

    let rerun = h
        .engine
        .process_batch_learning(Some("content"), None, 24, false)
        .await
        .unwrap();
    assert_eq!(rerun.processed_logs, 0);
    assert_eq!(rerun.skipped_logs, 2);
}
