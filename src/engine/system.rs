//! Engine façade.
//!
//! [`ActionEngine`] wires the trigger evaluator, action runner, feedback
//! engine and insight generator over one repository and metric source:
//!
//! ```text
//! MetricSource ─→ TriggerEvaluator ─→ arbitration ─→ ActionRunner ─→ ActionLog
//!                                                                      │
//!        MetricWeight versions ←── FeedbackEngine ←────────────────────┘
//!                 │
//!                 └──→ LearningLog ─→ InsightGenerator ─→ LearningInsight
//! ```
//!
//! All configuration lives in one [`EngineConfig`] behind an `RwLock`;
//! [`ActionEngine::update_config`] validates it and pushes each section to its
//! component.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::insights::{InsightGenerator, InsightReport};
use super::learner::{BatchLearningSummary, FeedbackAnalysis, FeedbackEngine};
use super::metrics::MetricSource;
use super::registry::ActionRegistry;
use super::runner::{ActionPlan, ActionRunner, RunOutcome};
use super::trigger::{arbitrate, DecisionReason, TriggerDecision, TriggerEvaluator};
use super::types::{
    ActionConfig, ActionLog, ActionLogId, ActionRule, ActionStatus, InsightId, LearningInsight,
    LearningTrigger, MetricContext, MetricWeight, RuleId,
};
use crate::error::{EngineError, EngineResult, RegistryError, StorageError};
use crate::storage::{ActionLogFilter, InsightFilter, Repository};

/// Metric type used when a manual trigger does not name one.
pub const DEFAULT_METRIC_TYPE: &str = "overall";

// ============================================================================
// Result Types
// ============================================================================

/// Result of a manually triggered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action (or its fallback) completed
    pub success: bool,
    /// Status of the log whose result stands
    pub status: ActionStatus,
    /// The primary action log
    pub log: ActionLog,
    /// The fallback log, if one ran
    pub fallback: Option<ActionLog>,
}

impl From<RunOutcome> for ActionResult {
    fn from(outcome: RunOutcome) -> Self {
        let status = outcome.effective().status;
        Self {
            success: status == ActionStatus::Completed,
            status,
            log: outcome.log,
            fallback: outcome.fallback,
        }
    }
}

/// One rule/context evaluation of an action-check pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    /// Rule evaluated
    pub rule_id: RuleId,
    /// Rule name
    pub rule_name: String,
    /// Context key evaluated
    pub context_key: String,
    /// The decision
    pub decision: TriggerDecision,
    /// Log created when the action ran
    pub action_log_id: Option<ActionLogId>,
    /// Status the action (or its fallback) ended in
    pub status: Option<ActionStatus>,
}

/// Totals for one action-check pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSummary {
    /// Whether actions were only previewed
    pub dry_run: bool,
    /// Enabled rules considered
    pub rules: usize,
    /// Contexts considered
    pub contexts: usize,
    /// Rule/context pairs evaluated
    pub evaluated: usize,
    /// Pairs whose condition fired (before arbitration)
    pub fired: usize,
    /// Pairs that lost arbitration
    pub superseded: usize,
    /// Actions run
    pub executed: usize,
    /// Actions that completed
    pub completed: usize,
    /// Actions that failed
    pub failed: usize,
    /// Actions that were cancelled
    pub cancelled: usize,
    /// Per-pair records
    pub records: Vec<CheckRecord>,
    /// Errors that did not stop the pass
    pub errors: Vec<String>,
}

impl CheckSummary {
    fn tally(&mut self, outcome: &RunOutcome) {
        self.executed += 1;
        match outcome.effective().status {
            ActionStatus::Completed => self.completed += 1,
            ActionStatus::Failed => self.failed += 1,
            ActionStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
    }

    /// Fold one context's results into the pass totals.
    fn absorb(&mut self, part: CheckSummary) {
        self.evaluated += part.evaluated;
        self.fired += part.fired;
        self.superseded += part.superseded;
        self.executed += part.executed;
        self.completed += part.completed;
        self.failed += part.failed;
        self.cancelled += part.cancelled;
        self.records.extend(part.records);
        self.errors.extend(part.errors);
    }
}

/// What a per-context check task needs from the engine.
#[derive(Clone)]
struct CheckDeps {
    evaluator: Arc<TriggerEvaluator>,
    metrics: Arc<dyn MetricSource>,
    runner: Arc<ActionRunner>,
    repository: Arc<dyn Repository>,
    cancel: watch::Receiver<bool>,
}

struct Evaluated {
    rule: ActionRule,
    context: MetricContext,
    trigger_value: Option<f64>,
    decision: TriggerDecision,
}

// ============================================================================
// Action Engine
// ============================================================================

/// Adaptive performance-action engine.
pub struct ActionEngine {
    repository: Arc<dyn Repository>,
    metrics: Arc<dyn MetricSource>,
    registry: Arc<ActionRegistry>,
    evaluator: Arc<TriggerEvaluator>,
    runner: Arc<ActionRunner>,
    feedback: Arc<FeedbackEngine>,
    insights: InsightGenerator,
    config: RwLock<EngineConfig>,
    shutdown: watch::Sender<bool>,
}

impl ActionEngine {
    /// Create an engine. Fails when the configuration is invalid.
    pub fn new(
        repository: Arc<dyn Repository>,
        metrics: Arc<dyn MetricSource>,
        registry: Arc<ActionRegistry>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|message| EngineError::Configuration { message })?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            evaluator: Arc::new(TriggerEvaluator::new(config.trigger.clone())),
            runner: Arc::new(ActionRunner::new(
                Arc::clone(&registry),
                Arc::clone(&repository),
                config.runner.clone(),
            )),
            feedback: Arc::new(FeedbackEngine::new(
                Arc::clone(&repository),
                Arc::clone(&metrics),
                config.learning.clone(),
            )),
            insights: InsightGenerator::new(Arc::clone(&repository), config.insights.clone()),
            repository,
            metrics,
            registry,
            config: RwLock::new(config),
            shutdown,
        })
    }

    /// Current configuration.
    pub async fn config(&self) -> EngineConfig {
        self.config.read().await.clone()
    }

    /// Validate and apply a new configuration.
    pub async fn update_config(&self, config: EngineConfig) -> EngineResult<()> {
        config
            .validate()
            .map_err(|message| EngineError::Configuration { message })?;

        self.evaluator.update_config(config.trigger.clone()).await;
        self.runner.update_config(config.runner.clone()).await;
        self.feedback.update_config(config.learning.clone()).await;
        self.insights.update_config(config.insights.clone()).await;
        *self.config.write().await = config;
        info!("Engine configuration updated");
        Ok(())
    }

    /// The action registry in use.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop in-flight actions and batch learning.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("Engine shutdown requested");
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Run an action by hand.
    ///
    /// The context is the agent kind with `config.metric_type` (default
    /// `overall`) and the optional campaign; the trigger value is that
    /// context's latest metric value, or `0.0` without one.
    pub async fn trigger_action(
        &self,
        agent_kind: &str,
        action_kind: &str,
        config: ActionConfig,
        campaign_id: Option<&str>,
    ) -> EngineResult<ActionResult> {
        let metric_type = config
            .metric_type
            .clone()
            .unwrap_or_else(|| DEFAULT_METRIC_TYPE.to_string());
        let mut context = MetricContext::new(agent_kind, metric_type);
        if let Some(campaign) = campaign_id {
            context = context.with_campaign(campaign);
        }

        let trigger_value = self
            .metrics
            .get_snapshot(&context)
            .await?
            .map(|s| s.value)
            .unwrap_or(0.0);

        let plan = ActionPlan::manual(agent_kind, action_kind, context, trigger_value, config);
        let outcome = self.runner.run(plan, &self.shutdown_signal()).await?;
        Ok(outcome.into())
    }

    /// Evaluate every enabled rule against current metrics and run the
    /// winning actions.
    ///
    /// `agent_kinds` and `campaign_ids` narrow the pass; `dry_run` previews
    /// decisions without advancing streaks or running anything.
    pub async fn run_action_checks(
        &self,
        agent_kinds: Option<&[String]>,
        campaign_ids: Option<&[String]>,
        dry_run: bool,
    ) -> EngineResult<CheckSummary> {
        let rules: Vec<ActionRule> = self
            .repository
            .list_rules(true)
            .await?
            .into_iter()
            .filter(|rule| agent_kinds.map_or(true, |kinds| kinds.contains(&rule.agent_kind)))
            .collect();
        let contexts: Vec<MetricContext> = self
            .metrics
            .list_contexts()
            .await?
            .into_iter()
            .filter(|ctx| {
                campaign_ids.map_or(true, |ids| {
                    ctx.campaign_id
                        .as_ref()
                        .is_some_and(|campaign| ids.contains(campaign))
                })
            })
            .collect();

        let mut summary = CheckSummary {
            dry_run,
            rules: rules.len(),
            contexts: contexts.len(),
            ..Default::default()
        };
        self.check(rules, contexts, dry_run, &mut summary).await;

        info!(
            dry_run,
            evaluated = summary.evaluated,
            fired = summary.fired,
            executed = summary.executed,
            completed = summary.completed,
            failed = summary.failed,
            errors = summary.errors.len(),
            "Action checks finished"
        );
        Ok(summary)
    }

    /// Evaluate and run the rules watching one context.
    pub async fn check_context(
        &self,
        context: &MetricContext,
        dry_run: bool,
    ) -> EngineResult<CheckSummary> {
        let rules: Vec<ActionRule> = self
            .repository
            .list_rules(true)
            .await?
            .into_iter()
            .filter(|rule| watches(rule, context))
            .collect();
        let mut summary = CheckSummary {
            dry_run,
            rules: rules.len(),
            contexts: 1,
            ..Default::default()
        };
        self.check(rules, vec![context.clone()], dry_run, &mut summary)
            .await;
        Ok(summary)
    }

    async fn check(
        &self,
        rules: Vec<ActionRule>,
        contexts: Vec<MetricContext>,
        dry_run: bool,
        summary: &mut CheckSummary,
    ) {
        let max_parallel = self.config.read().await.trigger.max_parallel_evaluations.max(1);
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let deps = CheckDeps {
            evaluator: Arc::clone(&self.evaluator),
            metrics: Arc::clone(&self.metrics),
            runner: Arc::clone(&self.runner),
            repository: Arc::clone(&self.repository),
            cancel: self.shutdown_signal(),
        };

        // Fan out across contexts; rules for one context share a task.
        let mut tasks: JoinSet<CheckSummary> = JoinSet::new();
        for context in contexts {
            let watching: Vec<ActionRule> = rules
                .iter()
                .filter(|rule| watches(rule, &context))
                .cloned()
                .collect();
            if watching.is_empty() {
                continue;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let deps = deps.clone();
            tasks.spawn(async move {
                let _permit = permit;
                check_one_context(&deps, watching, context, dry_run).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(part) => summary.absorb(part),
                Err(e) => summary.errors.push(format!("check task failed: {}", e)),
            }
        }
    }

    // ========================================================================
    // Learning
    // ========================================================================

    /// Learn from one terminal action log.
    pub async fn process_action_outcome(
        &self,
        action_log_id: &ActionLogId,
        force_analysis: bool,
    ) -> EngineResult<FeedbackAnalysis> {
        let log = self.get_action_log(action_log_id).await?;
        self.feedback
            .process_outcome(&log, LearningTrigger::ActionOutcome, force_analysis)
            .await
    }

    /// Learn from every terminal log in the window.
    pub async fn process_batch_learning(
        &self,
        agent_kind: Option<&str>,
        metric_type: Option<&str>,
        time_window_hours: i64,
        force: bool,
    ) -> EngineResult<BatchLearningSummary> {
        self.feedback
            .process_batch(
                agent_kind.map(str::to_string),
                metric_type.map(str::to_string),
                time_window_hours,
                force,
                LearningTrigger::Batch,
                self.shutdown_signal(),
            )
            .await
    }

    /// Batch learning over the scheduler's window, skipping learned logs.
    pub async fn run_scheduled_learning(&self) -> EngineResult<BatchLearningSummary> {
        let hours = self.config.read().await.scheduler.learning_window_hours;
        self.feedback
            .process_batch(
                None,
                None,
                hours,
                false,
                LearningTrigger::Scheduled,
                self.shutdown_signal(),
            )
            .await
    }

    /// Learn from the not-yet-learned terminal logs of one context.
    pub async fn learn_context(
        &self,
        context: &MetricContext,
    ) -> EngineResult<Vec<FeedbackAnalysis>> {
        let hours = self.config.read().await.scheduler.learning_window_hours;
        let filter = ActionLogFilter {
            context_key: Some(context.key()),
            ..ActionLogFilter::terminal_since(Utc::now() - chrono::Duration::hours(hours.max(0)))
        };
        let mut logs = self.repository.list_action_logs(&filter).await?;
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut analyses = Vec::new();
        for log in logs {
            if *self.shutdown.borrow() {
                break;
            }
            let analysis = self
                .feedback
                .process_outcome(&log, LearningTrigger::Scheduled, false)
                .await?;
            if !analysis.already_processed {
                analyses.push(analysis);
            }
        }
        Ok(analyses)
    }

    // ========================================================================
    // Weights
    // ========================================================================

    /// Active weight of a context.
    pub async fn get_metric_weights(
        &self,
        context: &MetricContext,
    ) -> EngineResult<Option<MetricWeight>> {
        self.feedback.current_weight(context).await
    }

    /// Active weights, optionally narrowed.
    pub async fn list_metric_weights(
        &self,
        agent_kind: Option<&str>,
        metric_type: Option<&str>,
    ) -> EngineResult<Vec<MetricWeight>> {
        Ok(self
            .repository
            .list_active_weights(agent_kind, metric_type)
            .await?)
    }

    /// Every weight version of a context, newest first.
    pub async fn weight_history(&self, context: &MetricContext) -> EngineResult<Vec<MetricWeight>> {
        Ok(self.repository.weight_history(&context.key()).await?)
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Validate and store a rule, seeding weights for the contexts it watches.
    pub async fn create_rule(&self, rule: ActionRule) -> EngineResult<ActionRule> {
        self.check_rule(&rule)?;
        self.repository.create_rule(&rule).await?;
        self.seed_rule_weights(&rule).await?;
        info!(
            rule_id = %rule.id,
            agent_kind = %rule.agent_kind,
            action_kind = %rule.action_kind,
            metric_type = %rule.metric_type,
            "Rule created"
        );
        Ok(rule)
    }

    /// Validate and replace a rule.
    pub async fn update_rule(&self, mut rule: ActionRule) -> EngineResult<ActionRule> {
        let existing = self.get_rule(&rule.id).await?;
        self.check_rule(&rule)?;
        rule.created_at = existing.created_at;
        rule.updated_at = Utc::now();
        self.repository.update_rule(&rule).await?;
        self.seed_rule_weights(&rule).await?;
        info!(rule_id = %rule.id, "Rule updated");
        Ok(rule)
    }

    /// Enable or disable a rule.
    pub async fn set_rule_enabled(&self, id: &RuleId, enabled: bool) -> EngineResult<ActionRule> {
        let mut rule = self.get_rule(id).await?;
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        self.repository.update_rule(&rule).await?;
        info!(rule_id = %id, enabled, "Rule toggled");
        Ok(rule)
    }

    /// Get a rule.
    pub async fn get_rule(&self, id: &RuleId) -> EngineResult<ActionRule> {
        self.repository
            .get_rule(id)
            .await?
            .ok_or_else(|| not_found("action rule", id.as_str()))
    }

    /// List rules.
    pub async fn list_rules(&self, enabled_only: bool) -> EngineResult<Vec<ActionRule>> {
        Ok(self.repository.list_rules(enabled_only).await?)
    }

    fn check_rule(&self, rule: &ActionRule) -> EngineResult<()> {
        rule.check_shape()?;
        let invalid = |e: RegistryError| EngineError::InvalidRule {
            rule_id: rule.id.to_string(),
            reason: e.to_string(),
        };
        self.registry
            .validate(&rule.action_kind, &rule.agent_kind, &rule.action_config)
            .map_err(invalid)?;
        if let Some(fallback) = &rule.fallback_action_kind {
            let resolved = self.registry.resolve(fallback).map_err(|_| {
                invalid(RegistryError::UnknownFallback {
                    action_kind: rule.action_kind.clone(),
                    fallback: fallback.clone(),
                })
            })?;
            if !resolved.capability.supports_agent(&rule.agent_kind) {
                return Err(invalid(RegistryError::IncompatibleAgent {
                    action_kind: fallback.clone(),
                    agent_kind: rule.agent_kind.clone(),
                }));
            }
        }
        Ok(())
    }

    /// Insert-if-absent, so a retried rule creation is harmless.
    async fn seed_rule_weights(&self, rule: &ActionRule) -> EngineResult<()> {
        let learning = self.config.read().await.learning.clone();
        let base = rule.base_context();
        let contexts: Vec<MetricContext> = if rule.scope.campaign_ids.is_empty() {
            vec![base]
        } else {
            rule.scope
                .campaign_ids
                .iter()
                .map(|campaign| base.clone().with_campaign(campaign.clone()))
                .collect()
        };
        for context in contexts {
            let weight = MetricWeight::initial(context, rule.threshold, &learning);
            if self.repository.seed_weight(&weight).await? {
                debug!(rule_id = %rule.id, context = %weight.context, "Weight seeded");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Action Logs
    // ========================================================================

    /// Get an action log.
    pub async fn get_action_log(&self, id: &ActionLogId) -> EngineResult<ActionLog> {
        self.repository
            .get_action_log(id)
            .await?
            .ok_or_else(|| not_found("action log", id.as_str()))
    }

    /// List action logs.
    pub async fn list_action_logs(&self, filter: &ActionLogFilter) -> EngineResult<Vec<ActionLog>> {
        Ok(self.repository.list_action_logs(filter).await?)
    }

    // ========================================================================
    // Insights
    // ========================================================================

    /// Derive new insights from recent learning.
    pub async fn generate_insights(&self, agent_kind: Option<&str>) -> EngineResult<InsightReport> {
        self.insights.generate(agent_kind).await
    }

    /// List insights.
    pub async fn list_insights(&self, filter: &InsightFilter) -> EngineResult<Vec<LearningInsight>> {
        Ok(self.repository.list_insights(filter).await?)
    }

    /// PENDING → VALIDATED.
    pub async fn validate_insight(&self, id: &InsightId) -> EngineResult<LearningInsight> {
        self.change_insight(id, |insight, now| insight.validate(now))
            .await
    }

    /// VALIDATED → IMPLEMENTED.
    pub async fn implement_insight(&self, id: &InsightId) -> EngineResult<LearningInsight> {
        self.change_insight(id, |insight, now| insight.implement(now))
            .await
    }

    /// PENDING|VALIDATED → ARCHIVED.
    pub async fn archive_insight(&self, id: &InsightId) -> EngineResult<LearningInsight> {
        self.change_insight(id, |insight, now| insight.archive(now))
            .await
    }

    /// Hide an insight from default listings. Status is unchanged.
    pub async fn dismiss_insight(&self, id: &InsightId) -> EngineResult<LearningInsight> {
        self.change_insight(id, |insight, _| {
            insight.dismissed = true;
            Ok(())
        })
        .await
    }

    async fn change_insight<F>(&self, id: &InsightId, change: F) -> EngineResult<LearningInsight>
    where
        F: FnOnce(&mut LearningInsight, DateTime<Utc>) -> EngineResult<()>,
    {
        let mut insight = self
            .repository
            .get_insight(id)
            .await?
            .ok_or_else(|| not_found("insight", id.as_str()))?;
        change(&mut insight, Utc::now())?;
        self.repository.update_insight(&insight).await?;
        info!(
            insight_id = %id,
            status = %insight.status,
            dismissed = insight.dismissed,
            "Insight updated"
        );
        Ok(insight)
    }
}

/// Whether the rule's metric identity matches the context. Scope and the
/// enabled flag are left to the evaluator so they show up as decisions.
fn watches(rule: &ActionRule, context: &MetricContext) -> bool {
    rule.agent_kind == context.agent_kind
        && rule.metric_type == context.metric_type
        && rule.metric_subtype == context.metric_subtype
        && rule.metric_category == context.category
}

/// Evaluate, arbitrate and dispatch for one context.
///
/// Outside a dry run the context lock is held from before the evaluation
/// until the winning action ends, so a concurrent pass over the same context
/// sees this pass's cooldown.
async fn check_one_context(
    deps: &CheckDeps,
    rules: Vec<ActionRule>,
    context: MetricContext,
    dry_run: bool,
) -> CheckSummary {
    let mut part = CheckSummary {
        dry_run,
        ..Default::default()
    };

    let lock = if dry_run {
        None
    } else {
        Some(deps.runner.context_lock(&context.key()).await)
    };
    let _guard = match &lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let now = Utc::now();
    let snapshot = match deps.metrics.get_snapshot(&context).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            part.errors.push(format!("context {}: {}", context.key(), e));
            return part;
        }
    };
    let trigger_value = snapshot.as_ref().map(|s| s.value);

    let mut fired = Vec::new();
    for rule in rules {
        let decision = if dry_run {
            deps.evaluator
                .preview(&rule, &context, snapshot.as_ref(), now)
                .await
        } else {
            deps.evaluator
                .evaluate(&rule, &context, snapshot.as_ref(), now)
                .await
        };
        part.evaluated += 1;
        let pair = Evaluated {
            rule,
            context: context.clone(),
            trigger_value,
            decision,
        };
        if pair.decision.fire {
            fired.push(pair);
        } else {
            part.records.push(record(&pair, None));
        }
    }
    part.fired = fired.len();

    let Some((top, _)) = arbitrate(fired.iter().map(|p| p.rule.clone()).collect()) else {
        return part;
    };
    let mut winner = None;
    for mut pair in fired {
        if pair.rule.id == top.id {
            winner = Some(pair);
            continue;
        }
        debug!(
            rule_id = %pair.rule.id,
            winner = %top.id,
            context = %context,
            "Rule superseded by higher priority"
        );
        pair.decision = TriggerDecision {
            fire: false,
            reason: DecisionReason::SupersededByPriority {
                winner: top.id.clone(),
            },
        };
        part.superseded += 1;
        part.records.push(record(&pair, None));
    }

    let Some(pair) = winner else {
        return part;
    };
    if dry_run {
        part.records.push(record(&pair, None));
        return part;
    }
    let Some(trigger_value) = pair.trigger_value else {
        part.records.push(record(&pair, None));
        return part;
    };

    let plan = ActionPlan::from_rule(&pair.rule, pair.context.clone(), trigger_value);
    if let Err(e) = deps.runner.validate(&plan).await {
        warn!(rule_id = %pair.rule.id, error = %e, "Fired rule cannot run");
        part.errors.push(format!("rule {}: {}", pair.rule.id, e));
        part.records.push(record(&pair, None));
        return part;
    }

    let dispatched_at = Utc::now();
    deps.evaluator
        .record_fire(&pair.rule.id, &pair.context, dispatched_at)
        .await;
    if let Err(e) = deps
        .repository
        .mark_rule_triggered(&pair.rule.id, dispatched_at)
        .await
    {
        part.errors.push(format!("rule {}: {}", pair.rule.id, e));
    }

    match deps.runner.run_locked(plan, &deps.cancel).await {
        Ok(outcome) => {
            part.tally(&outcome);
            part.records.push(record(&pair, Some(&outcome)));
        }
        Err(e) => {
            part.errors.push(format!("rule {}: {}", pair.rule.id, e));
            part.records.push(record(&pair, None));
        }
    }
    part
}

fn record(pair: &Evaluated, outcome: Option<&RunOutcome>) -> CheckRecord {
    CheckRecord {
        rule_id: pair.rule.id.clone(),
        rule_name: pair.rule.name.clone(),
        context_key: pair.context.key(),
        decision: pair.decision.clone(),
        action_log_id: outcome.map(|o| o.log.id.clone()),
        status: outcome.map(|o| o.effective().status),
    }
}

fn not_found(entity: &'static str, id: &str) -> EngineError {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
    .into()
}
