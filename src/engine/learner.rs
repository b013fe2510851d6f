//! Feedback loop engine.
//!
//! Turns terminal action logs into weight updates:
//!
//! ```text
//! ActionLog → post value → improvement & confidence → gate → CAS weight swap
//!    │                                                  ↓
//!    └─ FAILED + rollback_on_failure ──→ restore previous weight version
//! ```
//!
//! Weight versions are never mutated. Each update inserts a new version and
//! deactivates the old one in the same transaction as its learning log; a
//! concurrent writer makes the swap fail and the cycle re-reads and retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::LearningConfig;
use super::metrics::MetricSource;
use super::types::{
    performance_score, ActionLog, ActionLogId, ActionStatus, LearningLog, LearningLogId,
    LearningTrigger, LearningType, MetricContext, MetricSnapshot, MetricWeight,
};
use crate::error::{EngineError, EngineResult, StorageError};
use crate::storage::{ActionLogFilter, Repository};

/// Smoothing factor for the stored performance score.
const SCORE_SMOOTHING: f64 = 0.3;

// ============================================================================
// Analysis Types
// ============================================================================

/// What the analysis suggests for the context's weight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// The action helped; weight went up
    IncreaseWeight,
    /// The action hurt; weight went down
    DecreaseWeight,
    /// No measurable change
    Maintain,
    /// Not enough evidence to change anything
    CollectMoreData,
    /// The previous weight version was restored
    RolledBack,
}

/// One weight change made by an analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightAdjustment {
    /// Context whose weight changed
    pub context_key: String,
    /// Weight before
    pub previous_weight: f64,
    /// Weight after
    pub new_weight: f64,
    /// Learning rate applied (0 for rollbacks)
    pub learning_rate: f64,
    /// Version now active
    pub version: i64,
}

/// Result of processing one action outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackAnalysis {
    /// Action log analysed
    pub action_log_id: ActionLogId,
    /// Context key of that log
    pub context_key: String,
    /// Confidence in the measurement (0.0 - 1.0)
    pub confidence: f64,
    /// Relative improvement, when a post value was available
    pub improvement: Option<f64>,
    /// Suggested direction
    pub recommendation: Recommendation,
    /// Weight changes made
    pub adjustments: Vec<WeightAdjustment>,
    /// Whether the analysis passed the sample and confidence gates
    pub validated: bool,
    /// Whether a previous weight version was restored
    pub rolled_back: bool,
    /// Weight version produced or restored
    pub weight_version: Option<i64>,
    /// Learning log recorded for this analysis
    pub learning_log_id: Option<LearningLogId>,
    /// Whether this result was read back from an earlier run
    pub already_processed: bool,
}

impl FeedbackAnalysis {
    fn from_recorded(action_log: &ActionLog, recorded: &LearningLog) -> Self {
        let recommendation = match recorded.learning_type {
            LearningType::Rollback => Recommendation::RolledBack,
            LearningType::InsufficientData => Recommendation::CollectMoreData,
            LearningType::WeightAdjustment => {
                direction(recorded.new_value - recorded.previous_value, 0.0)
            }
        };
        let adjustments = match (recorded.learning_type, recorded.weight_version) {
            (LearningType::InsufficientData, _) | (_, None) => Vec::new(),
            (_, Some(version)) => vec![WeightAdjustment {
                context_key: recorded.context.key(),
                previous_weight: recorded.previous_value,
                new_weight: recorded.new_value,
                learning_rate: recorded.learning_rate,
                version,
            }],
        };
        Self {
            action_log_id: action_log.id.clone(),
            context_key: action_log.context.key(),
            confidence: recorded.confidence,
            improvement: recorded.actual_improvement,
            recommendation,
            adjustments,
            validated: recorded.validated,
            rolled_back: recorded.rolled_back,
            weight_version: recorded.weight_version,
            learning_log_id: Some(recorded.id.clone()),
            already_processed: true,
        }
    }
}

/// Totals for one batch learning run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchLearningSummary {
    /// Terminal logs found in the window
    pub total_logs: usize,
    /// Logs analysed in this run
    pub processed_logs: usize,
    /// Logs skipped because they were already learned from
    pub skipped_logs: usize,
    /// Contexts visited
    pub contexts: usize,
    /// Contexts whose learning failed (CAS exhaustion or storage errors)
    pub failed_contexts: Vec<String>,
    /// New weight versions written
    pub weight_updates: usize,
    /// Weight versions restored
    pub rollbacks: usize,
    /// Mean confidence over processed logs
    pub average_confidence: f64,
    /// Mean improvement over processed logs that had one
    pub average_improvement: f64,
    /// Whether the run stopped early on shutdown
    pub cancelled: bool,
    /// Per-log analyses of this run
    pub analyses: Vec<FeedbackAnalysis>,
}

// ============================================================================
// Statistics helpers
// ============================================================================

/// `(post − pre) / max(|pre|, ε)`.
pub fn improvement_ratio(pre: f64, post: f64, epsilon: f64) -> f64 {
    (post - pre) / pre.abs().max(epsilon)
}

/// Coefficient of variation of the values.
///
/// Fewer than two values carry no spread information and count as `1.0`.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 1.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    if mean == 0.0 {
        return 1.0;
    }
    std_dev / mean.abs()
}

/// `n / (n + minimum) · 1 / (1 + cv)`.
pub fn confidence_score(sample_count: u64, minimum_sample_size: u64, cv: f64) -> f64 {
    let n = sample_count as f64;
    let size_factor = if sample_count == 0 {
        0.0
    } else {
        n / (n + minimum_sample_size as f64)
    };
    let stability = 1.0 / (1.0 + cv.max(0.0));
    (size_factor * stability).clamp(0.0, 1.0)
}

fn direction(delta: f64, epsilon: f64) -> Recommendation {
    if delta > epsilon {
        Recommendation::IncreaseWeight
    } else if delta < -epsilon {
        Recommendation::DecreaseWeight
    } else {
        Recommendation::Maintain
    }
}

// ============================================================================
// Feedback Engine
// ============================================================================

/// Learns from action outcomes.
pub struct FeedbackEngine {
    repository: Arc<dyn Repository>,
    metrics: Arc<dyn MetricSource>,
    config: RwLock<LearningConfig>,
}

impl FeedbackEngine {
    /// Create a feedback engine.
    pub fn new(
        repository: Arc<dyn Repository>,
        metrics: Arc<dyn MetricSource>,
        config: LearningConfig,
    ) -> Self {
        Self {
            repository,
            metrics,
            config: RwLock::new(config),
        }
    }

    /// Replace the learning configuration.
    pub async fn update_config(&self, config: LearningConfig) {
        *self.config.write().await = config;
    }

    /// Analyse a terminal action log and update the context's weight.
    pub async fn process_outcome(
        &self,
        log: &ActionLog,
        trigger: LearningTrigger,
        force: bool,
    ) -> EngineResult<FeedbackAnalysis> {
        if !log.status.is_terminal() {
            return Err(EngineError::NotProcessable {
                action_log_id: log.id.to_string(),
                status: log.status.to_string(),
            });
        }

        let config = self.config.read().await.clone();
        let recorded = self.repository.learning_logs_for_action(&log.id).await?;

        match log.status {
            ActionStatus::Failed => {
                if let Some(rollback) = recorded.iter().find(|l| l.rolled_back) {
                    return Ok(FeedbackAnalysis::from_recorded(log, rollback));
                }
                if let (Some(last), false) = (recorded.last(), force) {
                    return Ok(FeedbackAnalysis::from_recorded(log, last));
                }
                if config.rollback_on_failure {
                    self.roll_back(log, trigger, &config).await
                } else {
                    self.record_unvalidated(log, trigger, None, 0.0, &config)
                        .await
                }
            }
            ActionStatus::Cancelled => match recorded.last() {
                Some(last) if !force => Ok(FeedbackAnalysis::from_recorded(log, last)),
                _ => {
                    self.record_unvalidated(log, trigger, None, 0.0, &config)
                        .await
                }
            },
            _ => match recorded.last() {
                Some(last) if !force => Ok(FeedbackAnalysis::from_recorded(log, last)),
                _ => self.learn_from_completed(log, trigger, &config).await,
            },
        }
    }

    /// Learn from every terminal log in the window.
    ///
    /// Logs of one context run sequentially, oldest first; contexts run in
    /// parallel up to `max_parallel_contexts`. Raising `cancel` stops new
    /// contexts from starting.
    pub async fn process_batch(
        self: &Arc<Self>,
        agent_kind: Option<String>,
        metric_type: Option<String>,
        time_window_hours: i64,
        force: bool,
        trigger: LearningTrigger,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<BatchLearningSummary> {
        let max_parallel = self.config.read().await.max_parallel_contexts.max(1);
        let since = Utc::now() - chrono::Duration::hours(time_window_hours.max(0));
        let filter = ActionLogFilter {
            agent_kind,
            metric_type,
            ..ActionLogFilter::terminal_since(since)
        };
        let logs = self.repository.list_action_logs(&filter).await?;

        let mut by_context: BTreeMap<String, Vec<ActionLog>> = BTreeMap::new();
        for log in logs {
            by_context.entry(log.context.key()).or_default().push(log);
        }
        for group in by_context.values_mut() {
            group.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }

        let mut summary = BatchLearningSummary {
            total_logs: by_context.values().map(Vec::len).sum(),
            contexts: by_context.len(),
            ..Default::default()
        };
        info!(
            logs = summary.total_logs,
            contexts = summary.contexts,
            force,
            trigger = %trigger,
            "Batch learning started"
        );

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut tasks: JoinSet<(String, ContextResult)> = JoinSet::new();

        for (key, group) in by_context {
            if *cancel.borrow() {
                summary.cancelled = true;
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if *cancel.borrow() {
                summary.cancelled = true;
                break;
            }
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let result = engine.learn_context(&group, trigger, force).await;
                (key, result)
            });
        }

        let mut confidence_sum = 0.0;
        let mut improvement_sum = 0.0;
        let mut improvement_count = 0usize;

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Batch learning task panicked");
                    continue;
                }
            };
            summary.skipped_logs += result.skipped;
            for analysis in result.analyses {
                summary.processed_logs += 1;
                confidence_sum += analysis.confidence;
                if let Some(improvement) = analysis.improvement {
                    improvement_sum += improvement;
                    improvement_count += 1;
                }
                if analysis.rolled_back {
                    summary.rollbacks += 1;
                } else if !analysis.adjustments.is_empty() {
                    summary.weight_updates += 1;
                }
                summary.analyses.push(analysis);
            }
            if let Some(error) = result.error {
                warn!(context = %key, error = %error, "Context learning failed");
                summary.failed_contexts.push(key);
            }
        }

        if summary.processed_logs > 0 {
            summary.average_confidence = confidence_sum / summary.processed_logs as f64;
        }
        if improvement_count > 0 {
            summary.average_improvement = improvement_sum / improvement_count as f64;
        }
        summary.failed_contexts.sort();

        info!(
            processed = summary.processed_logs,
            skipped = summary.skipped_logs,
            weight_updates = summary.weight_updates,
            rollbacks = summary.rollbacks,
            failed_contexts = summary.failed_contexts.len(),
            cancelled = summary.cancelled,
            "Batch learning finished"
        );
        Ok(summary)
    }

    async fn learn_context(
        &self,
        group: &[ActionLog],
        trigger: LearningTrigger,
        force: bool,
    ) -> ContextResult {
        let mut result = ContextResult::default();
        for log in group {
            match self.process_outcome(log, trigger, force).await {
                Ok(analysis) if analysis.already_processed => result.skipped += 1,
                Ok(analysis) => result.analyses.push(analysis),
                Err(e) => {
                    result.error = Some(e.to_string());
                    break;
                }
            }
        }
        result
    }

    async fn learn_from_completed(
        &self,
        log: &ActionLog,
        trigger: LearningTrigger,
        config: &LearningConfig,
    ) -> EngineResult<FeedbackAnalysis> {
        let context = &log.context;
        self.seed_weight(log, config).await?;

        let latest = self.metrics.get_snapshot(context).await?;
        let Some(post) = self.post_value(log, latest.as_ref(), config) else {
            debug!(action_log_id = %log.id, "No post value available");
            return self
                .record_unvalidated(log, trigger, None, 0.0, config)
                .await;
        };

        let improvement = improvement_ratio(log.trigger_value, post, config.improvement_epsilon);
        let history = self
            .metrics
            .get_history(context, config.history_window())
            .await?;
        let values: Vec<f64> = history.iter().map(|s| s.value).collect();
        let sample_count = if history.is_empty() {
            latest.as_ref().map(|s| s.sample_count).unwrap_or(0)
        } else {
            history.iter().map(|s| s.sample_count).sum()
        };
        let cv = coefficient_of_variation(&values);
        let confidence = confidence_score(sample_count, config.minimum_sample_size, cv);

        if sample_count < config.minimum_sample_size || confidence < config.confidence_threshold {
            debug!(
                action_log_id = %log.id,
                sample_count,
                confidence,
                "Analysis below learning gates"
            );
            return self
                .record_unvalidated(log, trigger, Some(improvement), confidence, config)
                .await;
        }

        self.swap_weight(log, trigger, improvement, confidence, config)
            .await
    }

    /// Post value: the freshest settled snapshot, else what the executor reported.
    fn post_value(
        &self,
        log: &ActionLog,
        latest: Option<&MetricSnapshot>,
        config: &LearningConfig,
    ) -> Option<f64> {
        let settled_after: Option<DateTime<Utc>> = log.completed_at.map(|at| {
            at + chrono::Duration::seconds(config.settle_delay_secs.min(i64::MAX as u64) as i64)
        });
        let settled = match (latest, settled_after) {
            (Some(snapshot), Some(after)) if snapshot.timestamp >= after => Some(snapshot.value),
            _ => None,
        };
        settled.or_else(|| log.impact_metrics.as_ref().and_then(|m| m.post_value))
    }

    async fn seed_weight(&self, log: &ActionLog, config: &LearningConfig) -> EngineResult<()> {
        let key = log.context.key();
        if self.repository.get_active_weight(&key).await?.is_some() {
            return Ok(());
        }
        let threshold = match &log.rule_id {
            Some(rule_id) => self
                .repository
                .get_rule(rule_id)
                .await?
                .map(|rule| rule.threshold)
                .unwrap_or(log.trigger_value),
            None => log.trigger_value,
        };
        let initial = MetricWeight::initial(log.context.clone(), threshold, config);
        if self.repository.seed_weight(&initial).await? {
            info!(context = %key, weight = initial.weight, "Seeded initial weight");
        }
        Ok(())
    }

    async fn swap_weight(
        &self,
        log: &ActionLog,
        trigger: LearningTrigger,
        improvement: f64,
        confidence: f64,
        config: &LearningConfig,
    ) -> EngineResult<FeedbackAnalysis> {
        let key = log.context.key();

        for attempt in 1..=config.max_cas_retries {
            let active = self
                .repository
                .get_active_weight(&key)
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    entity: "active metric weight",
                    id: key.clone(),
                })?;
            let max_version = self.repository.max_weight_version(&key).await?;

            let learning_rate = config.effective_learning_rate(active.version);
            let new_weight = config.clamp_weight(
                active.weight + learning_rate * improvement * config.stability_weight,
            );
            let score = active.performance_score * (1.0 - SCORE_SMOOTHING)
                + performance_score(improvement) * SCORE_SMOOTHING;
            let now = Utc::now();
            let next = active.successor(max_version + 1, new_weight, confidence, score, now);

            let learning_log = LearningLog {
                id: LearningLogId::new(),
                context: log.context.clone(),
                action_log_id: Some(log.id.clone()),
                trigger_type: trigger,
                learning_type: LearningType::WeightAdjustment,
                previous_value: active.weight,
                new_value: new_weight,
                learning_rate,
                confidence,
                actual_improvement: Some(improvement),
                validated: true,
                rolled_back: false,
                weight_id: Some(next.id.clone()),
                weight_version: Some(next.version),
                created_at: now,
            };

            match self
                .repository
                .swap_active_weight(&active.id, &next, &learning_log)
                .await
            {
                Ok(()) => {
                    info!(
                        action_log_id = %log.id,
                        context = %key,
                        version = next.version,
                        previous_weight = active.weight,
                        new_weight,
                        improvement,
                        confidence,
                        "Weight updated"
                    );
                    return Ok(FeedbackAnalysis {
                        action_log_id: log.id.clone(),
                        context_key: key,
                        confidence,
                        improvement: Some(improvement),
                        recommendation: direction(improvement, config.improvement_epsilon),
                        adjustments: vec![WeightAdjustment {
                            context_key: log.context.key(),
                            previous_weight: active.weight,
                            new_weight,
                            learning_rate,
                            version: next.version,
                        }],
                        validated: true,
                        rolled_back: false,
                        weight_version: Some(next.version),
                        learning_log_id: Some(learning_log.id),
                        already_processed: false,
                    });
                }
                Err(StorageError::VersionConflict { .. }) => {
                    warn!(context = %key, attempt, "Weight swap conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::LearningConflict {
            context_key: key,
            attempts: config.max_cas_retries,
        })
    }

    async fn roll_back(
        &self,
        log: &ActionLog,
        trigger: LearningTrigger,
        config: &LearningConfig,
    ) -> EngineResult<FeedbackAnalysis> {
        let key = log.context.key();

        for attempt in 1..=config.max_cas_retries {
            let Some(active) = self.repository.get_active_weight(&key).await? else {
                return self.record_unvalidated(log, trigger, None, 0.0, config).await;
            };
            let Some(previous_id) = active.previous_version_id.clone() else {
                debug!(context = %key, "No previous weight version to restore");
                return self.record_unvalidated(log, trigger, None, 0.0, config).await;
            };
            let previous = self
                .repository
                .get_weight(&previous_id)
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    entity: "metric weight",
                    id: previous_id.to_string(),
                })?;

            let learning_log = LearningLog {
                id: LearningLogId::new(),
                context: log.context.clone(),
                action_log_id: Some(log.id.clone()),
                trigger_type: trigger,
                learning_type: LearningType::Rollback,
                previous_value: active.weight,
                new_value: previous.weight,
                learning_rate: 0.0,
                confidence: previous.confidence,
                actual_improvement: None,
                validated: true,
                rolled_back: true,
                weight_id: Some(previous.id.clone()),
                weight_version: Some(previous.version),
                created_at: Utc::now(),
            };

            match self
                .repository
                .restore_weight(&active.id, &previous.id, &learning_log)
                .await
            {
                Ok(()) => {
                    warn!(
                        action_log_id = %log.id,
                        context = %key,
                        restored_version = previous.version,
                        replaced_version = active.version,
                        "Weight rolled back after failed action"
                    );
                    return Ok(FeedbackAnalysis {
                        action_log_id: log.id.clone(),
                        context_key: key,
                        confidence: previous.confidence,
                        improvement: None,
                        recommendation: Recommendation::RolledBack,
                        adjustments: vec![WeightAdjustment {
                            context_key: log.context.key(),
                            previous_weight: active.weight,
                            new_weight: previous.weight,
                            learning_rate: 0.0,
                            version: previous.version,
                        }],
                        validated: true,
                        rolled_back: true,
                        weight_version: Some(previous.version),
                        learning_log_id: Some(learning_log.id),
                        already_processed: false,
                    });
                }
                Err(StorageError::VersionConflict { .. }) => {
                    warn!(context = %key, attempt, "Weight restore conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::LearningConflict {
            context_key: key,
            attempts: config.max_cas_retries,
        })
    }

    async fn record_unvalidated(
        &self,
        log: &ActionLog,
        trigger: LearningTrigger,
        improvement: Option<f64>,
        confidence: f64,
        config: &LearningConfig,
    ) -> EngineResult<FeedbackAnalysis> {
        let key = log.context.key();
        let current = self.repository.get_active_weight(&key).await?;
        let weight = current
            .as_ref()
            .map(|w| w.weight)
            .unwrap_or(config.initial_weight);

        let learning_log = LearningLog {
            id: LearningLogId::new(),
            context: log.context.clone(),
            action_log_id: Some(log.id.clone()),
            trigger_type: trigger,
            learning_type: LearningType::InsufficientData,
            previous_value: weight,
            new_value: weight,
            learning_rate: 0.0,
            confidence,
            actual_improvement: improvement,
            validated: false,
            rolled_back: false,
            weight_id: current.as_ref().map(|w| w.id.clone()),
            weight_version: current.as_ref().map(|w| w.version),
            created_at: Utc::now(),
        };
        self.repository.create_learning_log(&learning_log).await?;

        Ok(FeedbackAnalysis {
            action_log_id: log.id.clone(),
            context_key: key,
            confidence,
            improvement,
            recommendation: Recommendation::CollectMoreData,
            adjustments: Vec::new(),
            validated: false,
            rolled_back: false,
            weight_version: current.map(|w| w.version),
            learning_log_id: Some(learning_log.id),
            already_processed: false,
        })
    }

    /// Current weight of a context, if it has one.
    pub async fn current_weight(&self, context: &MetricContext) -> EngineResult<Option<MetricWeight>> {
        Ok(self.repository.get_active_weight(&context.key()).await?)
    }
}

#[derive(Default)]
struct ContextResult {
    analyses: Vec<FeedbackAnalysis>,
    skipped: usize,
    error: Option<String>,
}
