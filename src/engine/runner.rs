//! Action runner.
//!
//! Drives one action through its lifecycle:
//!
//! ```text
//! validate ──✗──→ configuration error (no log written)
//!    │
//!    ▼
//! PENDING → RUNNING ──ok──→ COMPLETED (impact metrics + rollback data)
//!    ↑         │
//!    │         ├─transient/timeout, retries left──→ backoff → PENDING
//!    │         ├─transient/timeout, retries spent─→ FAILED → one fallback log
//!    │         └─rejected / shutdown──────────────→ CANCELLED
//! ```
//!
//! Execution for one context key is serialized; different keys run
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::config::RunnerConfig;
use super::registry::{ActionRegistry, ActionRequest, ResolvedAction};
use super::types::{
    ActionConfig, ActionLog, ActionLogId, ActionRule, ActionStatus, ImpactMetrics, MetricContext,
    RuleId,
};
use crate::error::{EngineError, EngineResult, ExecutorError};
use crate::storage::Repository;

/// What to run.
#[derive(Debug, Clone)]
pub struct ActionPlan {
    /// Rule that fired (None for manual triggers)
    pub rule_id: Option<RuleId>,
    /// Agent kind targeted
    pub agent_kind: String,
    /// Action kind to run
    pub action_kind: String,
    /// Context being corrected
    pub context: MetricContext,
    /// Metric value at trigger time
    pub trigger_value: f64,
    /// Priority recorded on the log
    pub priority: i32,
    /// Retry override from the rule
    pub rule_max_retries: Option<u32>,
    /// Fallback override from the rule
    pub fallback_override: Option<String>,
    /// Action configuration
    pub config: ActionConfig,
}

impl ActionPlan {
    /// Plan the action a rule dispatches for a context.
    pub fn from_rule(rule: &ActionRule, context: MetricContext, trigger_value: f64) -> Self {
        Self {
            rule_id: Some(rule.id.clone()),
            agent_kind: rule.agent_kind.clone(),
            action_kind: rule.action_kind.clone(),
            context,
            trigger_value,
            priority: rule.priority,
            rule_max_retries: rule.max_retries,
            fallback_override: rule.fallback_action_kind.clone(),
            config: rule.action_config.clone(),
        }
    }

    /// Plan a manually triggered action.
    pub fn manual(
        agent_kind: impl Into<String>,
        action_kind: impl Into<String>,
        context: MetricContext,
        trigger_value: f64,
        config: ActionConfig,
    ) -> Self {
        Self {
            rule_id: None,
            agent_kind: agent_kind.into(),
            action_kind: action_kind.into(),
            context,
            trigger_value,
            priority: 0,
            rule_max_retries: None,
            fallback_override: None,
            config,
        }
    }
}

/// Result of running a plan.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The primary action log, in a terminal status
    pub log: ActionLog,
    /// The fallback log, when the primary failed and a fallback ran
    pub fallback: Option<ActionLog>,
}

impl RunOutcome {
    /// The log whose result stands: the fallback if one ran, else the primary.
    pub fn effective(&self) -> &ActionLog {
        self.fallback.as_ref().unwrap_or(&self.log)
    }
}

/// A validated plan with its resolved limits.
struct PreparedAction {
    resolved: ResolvedAction,
    max_retries: u32,
    timeout: Duration,
}

/// Executes action plans.
pub struct ActionRunner {
    registry: Arc<ActionRegistry>,
    repository: Arc<dyn Repository>,
    config: RwLock<RunnerConfig>,
    context_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ActionRunner {
    /// Create a runner.
    pub fn new(
        registry: Arc<ActionRegistry>,
        repository: Arc<dyn Repository>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            repository,
            config: RwLock::new(config),
            context_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the runner configuration.
    pub async fn update_config(&self, config: RunnerConfig) {
        *self.config.write().await = config;
    }

    /// Check a plan against the registry without running it.
    pub async fn validate(&self, plan: &ActionPlan) -> EngineResult<()> {
        self.prepare(plan, &self.config.read().await.clone())
            .map(|_| ())
    }

    /// Run a plan to a terminal status.
    ///
    /// Configuration errors are returned before any log is written.
    /// `cancel` flipping to `true` ends the action as CANCELLED.
    pub async fn run(
        &self,
        plan: ActionPlan,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<RunOutcome> {
        let lock = self.context_lock(&plan.context.key()).await;
        let _guard = lock.lock().await;
        self.run_locked(plan, cancel).await
    }

    /// [`run`](Self::run) for a caller already holding the plan's context lock.
    pub(crate) async fn run_locked(
        &self,
        plan: ActionPlan,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<RunOutcome> {
        let config = self.config.read().await.clone();
        let prepared = self.prepare(&plan, &config)?;

        let mut log = new_log(&plan, prepared.max_retries, None);
        self.repository.create_action_log(&log).await?;
        info!(
            action_log_id = %log.id,
            action_kind = %log.action_kind,
            agent_kind = %log.agent_kind,
            context = %plan.context,
            max_retries = log.max_retries,
            "Action created"
        );

        self.drive(&mut log, &prepared, &config, cancel).await?;

        let fallback = if log.status == ActionStatus::Failed && config.fallback_enabled {
            self.run_fallback(&plan, &log, &config, cancel).await?
        } else {
            None
        };

        Ok(RunOutcome { log, fallback })
    }

    async fn run_fallback(
        &self,
        plan: &ActionPlan,
        failed: &ActionLog,
        config: &RunnerConfig,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<Option<ActionLog>> {
        let Some(fallback_kind) = self
            .registry
            .fallback_for(&plan.action_kind, plan.fallback_override.as_deref())
        else {
            return Ok(None);
        };

        let fallback_plan = ActionPlan {
            action_kind: fallback_kind,
            rule_max_retries: None,
            fallback_override: None,
            ..plan.clone()
        };
        // A fallback gets exactly one attempt.
        let prepared = match self.prepare(&fallback_plan, config) {
            Ok(prepared) => PreparedAction {
                max_retries: 0,
                ..prepared
            },
            Err(e) => {
                warn!(
                    action_log_id = %failed.id,
                    fallback = %fallback_plan.action_kind,
                    error = %e,
                    "Fallback skipped"
                );
                return Ok(None);
            }
        };

        let mut log = new_log(&fallback_plan, prepared.max_retries, Some(failed.id.clone()));
        self.repository.create_action_log(&log).await?;
        info!(
            action_log_id = %log.id,
            parent_id = %failed.id,
            action_kind = %log.action_kind,
            "Fallback action created"
        );

        self.drive(&mut log, &prepared, config, cancel).await?;
        Ok(Some(log))
    }

    /// Attempt loop for one log.
    async fn drive(
        &self,
        log: &mut ActionLog,
        prepared: &PreparedAction,
        config: &RunnerConfig,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let mut cancel = cancel.clone();

        loop {
            if *cancel.borrow() {
                log.cancel(Utc::now(), "cancelled by shutdown")?;
                self.repository.update_action_log(log).await?;
                warn!(action_log_id = %log.id, "Action cancelled before attempt");
                return Ok(());
            }

            log.start_attempt(Utc::now())?;
            self.repository.update_action_log(log).await?;

            let request = ActionRequest {
                action_log_id: log.id.clone(),
                action_kind: log.action_kind.clone(),
                agent_kind: log.agent_kind.clone(),
                context: log.context.clone(),
                trigger_value: log.trigger_value,
                config: log.config.clone(),
                attempt: log.retry_count + 1,
                is_fallback: log.is_fallback(),
            };
            debug!(
                action_log_id = %log.id,
                attempt = request.attempt,
                "Executing action attempt"
            );

            let attempt = tokio::select! {
                result = tokio::time::timeout(
                    prepared.timeout,
                    prepared.resolved.executor.execute(&request),
                ) => Some(result),
                _ = wait_for_cancel(&mut cancel) => None,
            };

            let failure = match attempt {
                None => {
                    log.cancel(Utc::now(), "cancelled by shutdown")?;
                    self.repository.update_action_log(log).await?;
                    warn!(action_log_id = %log.id, "Action cancelled during attempt");
                    return Ok(());
                }
                Some(Ok(Ok(outcome))) => {
                    let impact = ImpactMetrics::compute(log.trigger_value, outcome.post_value);
                    log.complete(Utc::now(), impact, outcome.rollback_data)?;
                    self.repository.update_action_log(log).await?;
                    info!(
                        action_log_id = %log.id,
                        retries = log.retry_count,
                        post_value = ?outcome.post_value,
                        "Action completed"
                    );
                    return Ok(());
                }
                Some(Ok(Err(ExecutorError::Rejected { reason }))) => {
                    log.cancel(Utc::now(), format!("rejected: {}", reason))?;
                    self.repository.update_action_log(log).await?;
                    warn!(action_log_id = %log.id, reason = %reason, "Action rejected");
                    return Ok(());
                }
                Some(Ok(Err(ExecutorError::Transient { message }))) => message,
                Some(Err(_elapsed)) => format!(
                    "attempt timed out after {}ms",
                    prepared.timeout.as_millis()
                ),
            };

            if !log.can_retry() {
                log.fail(Utc::now(), failure.clone())?;
                self.repository.update_action_log(log).await?;
                warn!(
                    action_log_id = %log.id,
                    retries = log.retry_count,
                    error = %failure,
                    "Action failed, retries exhausted"
                );
                return Ok(());
            }

            log.schedule_retry(failure.clone())?;
            self.repository.update_action_log(log).await?;

            let delay = config.backoff_for(log.retry_count);
            warn!(
                action_log_id = %log.id,
                retry = log.retry_count,
                max_retries = log.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Action attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_cancel(&mut cancel) => {}
            }
        }
    }

    fn prepare(&self, plan: &ActionPlan, config: &RunnerConfig) -> EngineResult<PreparedAction> {
        let resolved = self
            .registry
            .validate(&plan.action_kind, &plan.agent_kind, &plan.config)?
            .clone();

        if let Some(fallback) = &plan.fallback_override {
            if fallback == &plan.action_kind {
                return Err(EngineError::Configuration {
                    message: format!("action {} cannot be its own fallback", fallback),
                });
            }
            self.registry.resolve(fallback)?;
        }

        let policy = resolved.capability.retry_policy;
        let max_retries = plan
            .config
            .max_retries
            .or(plan.rule_max_retries)
            .unwrap_or(policy.max_retries);
        let timeout_ms = plan
            .config
            .timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(if policy.timeout_ms > 0 {
                policy.timeout_ms
            } else {
                config.default_timeout_ms
            });

        Ok(PreparedAction {
            resolved,
            max_retries,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Lock serializing execution for one context key. Idle locks are
    /// pruned on each call.
    pub(crate) async fn context_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.context_locks.lock().await;
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

fn new_log(plan: &ActionPlan, max_retries: u32, parent_id: Option<ActionLogId>) -> ActionLog {
    let mut log = ActionLog::new(
        plan.agent_kind.clone(),
        plan.action_kind.clone(),
        plan.context.clone(),
        plan.trigger_value,
        max_retries,
    );
    log.rule_id = plan.rule_id.clone();
    log.priority = plan.priority;
    log.config = plan.config.clone();
    log.parent_id = parent_id;
    log
}

/// Resolves once the flag is raised; never resolves if the sender is gone.
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{ActionCapability, ExecutionOutcome, MockActionExecutor};
    use crate::storage::SqliteStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            ..RunnerConfig::default()
        }
    }

    async fn runner_with(registry: ActionRegistry) -> (ActionRunner, Arc<SqliteStorage>) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let runner = ActionRunner::new(Arc::new(registry), storage.clone(), fast_config());
        (runner, storage)
    }

    fn plan(action_kind: &str) -> ActionPlan {
        ActionPlan::manual(
            "content",
            action_kind,
            MetricContext::new("content", "engagement").with_campaign("spring"),
            1.2,
            ActionConfig::default(),
        )
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_success_records_impact() {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().times(1).returning(|_| {
            Ok(ExecutionOutcome {
                post_value: Some(1.8),
                rollback_data: Some(serde_json::json!({"boost_id": "b1"})),
                message: None,
            })
        });
        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"]).with_retry(2, 1000),
                Arc::new(executor),
            )
            .unwrap();
        let (runner, storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.status, ActionStatus::Completed);
        let impact = outcome.log.impact_metrics.clone().unwrap();
        assert!((impact.absolute_change.unwrap() - 0.6).abs() < 1e-9);
        assert!((impact.percent_change.unwrap() - 50.0).abs() < 1e-9);

        let stored = storage.get_action_log(&outcome.log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.rollback_data, Some(serde_json::json!({"boost_id": "b1"})));
    }

    #[tokio::test]
    async fn test_configuration_error_writes_no_log() {
        let (runner, storage) = runner_with(ActionRegistry::new()).await;
        let (_tx, rx) = no_cancel();

        let err = runner.run(plan("explode"), &rx).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));

        let logs = storage
            .list_action_logs(&Default::default())
            .await
            .unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_fail() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ExecutorError::Transient {
                message: "agent unavailable".to_string(),
            })
        });
        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"]).with_retry(2, 1000),
                Arc::new(executor),
            )
            .unwrap();
        let (runner, _storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.status, ActionStatus::Failed);
        assert_eq!(outcome.log.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome.fallback.is_none());
    }

    #[tokio::test]
    async fn test_rejection_cancels_without_retry() {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().times(1).returning(|_| {
            Err(ExecutorError::Rejected {
                reason: "campaign archived".to_string(),
            })
        });
        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"]).with_retry(3, 1000),
                Arc::new(executor),
            )
            .unwrap();
        let (runner, _storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.status, ActionStatus::Cancelled);
        assert_eq!(outcome.log.retry_count, 0);
        assert!(outcome
            .log
            .error_message
            .as_deref()
            .unwrap()
            .contains("campaign archived"));
    }

    #[tokio::test]
    async fn test_fallback_runs_once_with_parent_link() {
        let mut failing = MockActionExecutor::new();
        failing.expect_execute().returning(|_| {
            Err(ExecutorError::Transient {
                message: "boom".to_string(),
            })
        });
        let mut fallback = MockActionExecutor::new();
        fallback
            .expect_execute()
            .times(1)
            .withf(|req| req.is_fallback && req.action_kind == "refresh")
            .returning(|_| Ok(ExecutionOutcome::default()));

        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("refresh", "Refresh", &["content"]).with_retry(0, 1000),
                Arc::new(fallback),
            )
            .unwrap();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"])
                    .with_retry(1, 1000)
                    .with_fallback("refresh"),
                Arc::new(failing),
            )
            .unwrap();
        let (runner, storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.status, ActionStatus::Failed);
        let fallback_log = outcome.fallback.clone().unwrap();
        assert_eq!(fallback_log.parent_id.as_ref(), Some(&outcome.log.id));
        assert_eq!(fallback_log.status, ActionStatus::Completed);
        assert_eq!(outcome.effective().id, fallback_log.id);

        let stored = storage.get_action_log(&fallback_log.id).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, Some(outcome.log.id.clone()));
    }

    #[tokio::test]
    async fn test_failing_fallback_gets_one_attempt() {
        let mut failing = MockActionExecutor::new();
        failing.expect_execute().returning(|_| {
            Err(ExecutorError::Transient {
                message: "boom".to_string(),
            })
        });
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let counter = fallback_calls.clone();
        let mut fallback = MockActionExecutor::new();
        fallback.expect_execute().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ExecutorError::Transient {
                message: "still down".to_string(),
            })
        });

        let mut registry = ActionRegistry::new();
        registry
            .register(
                // Its own policy would allow three retries.
                ActionCapability::new("refresh", "Refresh", &["content"]).with_retry(3, 1000),
                Arc::new(fallback),
            )
            .unwrap();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"])
                    .with_retry(2, 1000)
                    .with_fallback("refresh"),
                Arc::new(failing),
            )
            .unwrap();
        let (runner, _storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.retry_count, 2);
        let fallback_log = outcome.fallback.unwrap();
        assert_eq!(fallback_log.status, ActionStatus::Failed);
        assert_eq!(fallback_log.max_retries, 0);
        assert_eq!(fallback_log.retry_count, 0);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        struct SlowExecutor;

        #[async_trait::async_trait]
        impl crate::engine::registry::ActionExecutor for SlowExecutor {
            async fn execute(
                &self,
                _request: &ActionRequest,
            ) -> Result<ExecutionOutcome, ExecutorError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ExecutionOutcome::default())
            }
        }

        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"]).with_retry(1, 20),
                Arc::new(SlowExecutor),
            )
            .unwrap();
        let (runner, _storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.status, ActionStatus::Failed);
        assert_eq!(outcome.log.retry_count, 1);
        assert!(outcome
            .log
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_action() {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().never();
        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"]),
                Arc::new(executor),
            )
            .unwrap();
        let (runner, _storage) = runner_with(registry).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = runner.run(plan("boost"), &rx).await.unwrap();
        assert_eq!(outcome.log.status, ActionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_override_precedence() {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().returning(|_| {
            Err(ExecutorError::Transient {
                message: "x".to_string(),
            })
        });
        let mut registry = ActionRegistry::new();
        registry
            .register(
                ActionCapability::new("boost", "Boost", &["content"]).with_retry(5, 1000),
                Arc::new(executor),
            )
            .unwrap();
        let (runner, _storage) = runner_with(registry).await;
        let (_tx, rx) = no_cancel();

        let mut p = plan("boost");
        p.rule_max_retries = Some(2);
        p.config.max_retries = Some(1);
        let outcome = runner.run(p, &rx).await.unwrap();
        assert_eq!(outcome.log.max_retries, 1);
        assert_eq!(outcome.log.retry_count, 1);
    }
}
