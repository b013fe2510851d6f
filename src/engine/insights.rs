//! Insight generation over recent learning history.
//!
//! Learning logs are grouped per context. Each group with enough measured
//! outcomes is checked for three patterns:
//!
//! - **performance**: average performance score below the floor
//! - **trend**: too many negative improvements (child of the performance
//!   insight when both fire)
//! - **engagement**: the metric type clustering at poor/critical levels
//!
//! A pending insight with the same context, type and tag is never duplicated.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::config::InsightConfig;
use super::types::{
    InsightId, InsightPriority, InsightStatus, InsightType, LearningInsight, LearningLog,
    MetricContext, PerformanceLevel,
};
use crate::error::EngineResult;
use crate::storage::Repository;

/// Outcome of one generation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightReport {
    /// Contexts with enough data to analyse
    pub contexts_analyzed: usize,
    /// Contexts skipped for lack of data
    pub contexts_skipped: usize,
    /// Insights created in this pass
    pub created: Vec<LearningInsight>,
    /// Patterns that already had a pending insight
    pub duplicates: usize,
}

/// Aggregates of one context's measured learning logs.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStats {
    /// Measured logs
    pub samples: usize,
    /// Mean performance score (0 - 100)
    pub average_score: f64,
    /// Fraction of logs with negative improvement
    pub decreasing_ratio: f64,
    /// Fraction of logs at poor or critical level
    pub poor_ratio: f64,
    /// Mean analysis confidence
    pub average_confidence: f64,
}

impl ContextStats {
    /// Aggregate the logs that carry an improvement measurement.
    pub fn from_logs(logs: &[&LearningLog]) -> Option<Self> {
        let measured: Vec<(f64, f64, f64)> = logs
            .iter()
            .filter_map(|log| {
                let improvement = log.actual_improvement?;
                let score = log.performance_score()?;
                Some((improvement, score, log.confidence))
            })
            .collect();
        if measured.is_empty() {
            return None;
        }

        let n = measured.len() as f64;
        let decreasing = measured.iter().filter(|(imp, _, _)| *imp < 0.0).count();
        let poor = measured
            .iter()
            .filter(|(_, score, _)| PerformanceLevel::from_score(*score).is_poor_or_worse())
            .count();

        Some(Self {
            samples: measured.len(),
            average_score: measured.iter().map(|(_, s, _)| s).sum::<f64>() / n,
            decreasing_ratio: decreasing as f64 / n,
            poor_ratio: poor as f64 / n,
            average_confidence: measured.iter().map(|(_, _, c)| c).sum::<f64>() / n,
        })
    }
}

/// Derives insights from learning logs.
pub struct InsightGenerator {
    repository: Arc<dyn Repository>,
    config: RwLock<InsightConfig>,
}

impl InsightGenerator {
    /// Create a generator.
    pub fn new(repository: Arc<dyn Repository>, config: InsightConfig) -> Self {
        Self {
            repository,
            config: RwLock::new(config),
        }
    }

    /// Replace the insight configuration.
    pub async fn update_config(&self, config: InsightConfig) {
        *self.config.write().await = config;
    }

    /// Analyse recent learning logs and persist new insights.
    pub async fn generate(&self, agent_kind: Option<&str>) -> EngineResult<InsightReport> {
        let config = self.config.read().await.clone();
        let since = Utc::now() - chrono::Duration::hours(config.lookback_hours.max(0));
        let logs = self.repository.list_learning_logs(since, agent_kind).await?;

        let mut groups: BTreeMap<String, (MetricContext, Vec<&LearningLog>)> = BTreeMap::new();
        for log in &logs {
            groups
                .entry(log.context.key())
                .or_insert_with(|| (log.context.clone(), Vec::new()))
                .1
                .push(log);
        }

        let mut report = InsightReport::default();
        for (key, (context, group)) in &groups {
            let stats = match ContextStats::from_logs(group) {
                Some(stats) if stats.samples >= config.min_logs_per_context => stats,
                _ => {
                    report.contexts_skipped += 1;
                    continue;
                }
            };
            report.contexts_analyzed += 1;
            debug!(
                context = %key,
                samples = stats.samples,
                average_score = stats.average_score,
                decreasing_ratio = stats.decreasing_ratio,
                poor_ratio = stats.poor_ratio,
                "Context analysed"
            );
            self.analyse_context(key, context, &stats, &config, &mut report)
                .await?;
        }

        info!(
            analyzed = report.contexts_analyzed,
            skipped = report.contexts_skipped,
            created = report.created.len(),
            duplicates = report.duplicates,
            "Insight generation finished"
        );
        Ok(report)
    }

    async fn analyse_context(
        &self,
        key: &str,
        context: &MetricContext,
        stats: &ContextStats,
        config: &InsightConfig,
        report: &mut InsightReport,
    ) -> EngineResult<()> {
        let mut performance_id: Option<InsightId> = None;

        if stats.average_score < config.performance_floor {
            let impact = ((config.performance_floor - stats.average_score)
                / config.performance_floor.max(f64::EPSILON))
            .clamp(0.0, 1.0);
            let draft = draft(
                key,
                context,
                InsightType::Performance,
                InsightPriority::High,
                impact,
                stats.average_confidence,
                format!("Low performance for {}", context.metric_type),
                format!(
                    "Average performance score {:.1} over {} actions is below {:.1}",
                    stats.average_score, stats.samples, config.performance_floor
                ),
                "Review the rules and actions for this context; consider a different action kind or threshold".to_string(),
            );
            performance_id = self.persist(draft, None, report).await?;
        }

        if stats.decreasing_ratio > config.decreasing_trend_ratio {
            let draft = draft(
                key,
                context,
                InsightType::Trend,
                InsightPriority::Medium,
                stats.decreasing_ratio,
                stats.average_confidence,
                format!("Decreasing trend for {}", context.metric_type),
                format!(
                    "{:.0}% of {} recent actions were followed by a decrease",
                    stats.decreasing_ratio * 100.0,
                    stats.samples
                ),
                "Pause or soften the actions firing for this context until the trend reverses"
                    .to_string(),
            );
            self.persist(draft, performance_id.clone(), report).await?;
        }

        if stats.poor_ratio >= config.poor_cluster_ratio {
            let mut draft = draft(
                key,
                context,
                InsightType::Engagement,
                InsightPriority::Medium,
                stats.poor_ratio,
                stats.average_confidence,
                format!("{} clustering at poor performance", context.metric_type),
                format!(
                    "{:.0}% of {} recent outcomes for {} were poor or critical",
                    stats.poor_ratio * 100.0,
                    stats.samples,
                    context.metric_type
                ),
                format!(
                    "Revisit the {} strategy for agent {}",
                    context.metric_type, context.agent_kind
                ),
            );
            draft.metric_type = Some(context.metric_type.clone());
            self.persist(draft, None, report).await?;
        }

        Ok(())
    }

    /// Store the draft unless an equivalent pending insight exists.
    ///
    /// Returns the ID of the stored or already-pending insight.
    async fn persist(
        &self,
        mut draft: LearningInsight,
        parent_id: Option<InsightId>,
        report: &mut InsightReport,
    ) -> EngineResult<Option<InsightId>> {
        if let Some(existing) = self
            .repository
            .find_pending_insight(
                &draft.context_key,
                draft.insight_type,
                draft.metric_type.as_deref(),
            )
            .await?
        {
            report.duplicates += 1;
            return Ok(Some(existing.id));
        }

        draft.parent_id = parent_id;
        self.repository.create_insight(&draft).await?;
        info!(
            insight_id = %draft.id,
            context = %draft.context_key,
            insight_type = %draft.insight_type,
            priority = %draft.priority,
            "Insight created"
        );
        let id = draft.id.clone();
        report.created.push(draft);
        Ok(Some(id))
    }
}

#[allow(clippy::too_many_arguments)]
fn draft(
    key: &str,
    context: &MetricContext,
    insight_type: InsightType,
    priority: InsightPriority,
    impact: f64,
    confidence: f64,
    title: String,
    description: String,
    recommendation: String,
) -> LearningInsight {
    LearningInsight {
        id: InsightId::new(),
        context_key: key.to_string(),
        agent_kind: context.agent_kind.clone(),
        metric_type: None,
        insight_type,
        priority,
        impact: impact.clamp(0.0, 1.0),
        title,
        description,
        recommendation,
        status: InsightStatus::Pending,
        confidence: confidence.clamp(0.0, 1.0),
        parent_id: None,
        dismissed: false,
        created_at: Utc::now(),
        validated_at: None,
        implemented_at: None,
        archived_at: None,
    }
}
