//! Storage layer for the action engine.
//!
//! This module defines the [`Repository`] trait the engine persists through
//! and a SQLite implementation. Rules, action logs, versioned metric
//! weights, learning logs and insights all live in one database; weight
//! swaps and restores are single transactions so a context never has two
//! active versions.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::engine::types::{
    ActionLog, ActionLogId, ActionRule, ActionStatus, InsightId, InsightStatus, InsightType,
    LearningInsight, LearningLog, MetricWeight, RuleId, WeightId,
};
use crate::error::{StorageError, StorageResult};

/// Filter for listing action logs.
#[derive(Debug, Clone, Default)]
pub struct ActionLogFilter {
    /// Only logs for this agent kind
    pub agent_kind: Option<String>,
    /// Only logs for this metric type
    pub metric_type: Option<String>,
    /// Only logs for this context key
    pub context_key: Option<String>,
    /// Only logs created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only logs in one of these statuses (empty = any)
    pub statuses: Vec<ActionStatus>,
    /// Maximum rows returned
    pub limit: Option<u32>,
}

impl ActionLogFilter {
    /// Terminal logs created since `since`.
    pub fn terminal_since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            statuses: vec![
                ActionStatus::Completed,
                ActionStatus::Failed,
                ActionStatus::Cancelled,
            ],
            ..Default::default()
        }
    }
}

/// Filter for listing insights.
#[derive(Debug, Clone, Default)]
pub struct InsightFilter {
    /// Only insights in this status
    pub status: Option<InsightStatus>,
    /// Only insights for this agent kind
    pub agent_kind: Option<String>,
    /// Include dismissed insights
    pub include_dismissed: bool,
    /// Maximum rows returned
    pub limit: Option<u32>,
}

/// Persistence operations the engine relies on.
#[async_trait]
pub trait Repository: Send + Sync {
    // Rule operations

    /// Insert a new rule.
    async fn create_rule(&self, rule: &ActionRule) -> StorageResult<()>;
    /// Replace an existing rule.
    async fn update_rule(&self, rule: &ActionRule) -> StorageResult<()>;
    /// Get a rule by ID.
    async fn get_rule(&self, id: &RuleId) -> StorageResult<Option<ActionRule>>;
    /// List rules, optionally only enabled ones.
    async fn list_rules(&self, enabled_only: bool) -> StorageResult<Vec<ActionRule>>;
    /// Record that a rule dispatched an action.
    async fn mark_rule_triggered(&self, id: &RuleId, at: DateTime<Utc>) -> StorageResult<()>;

    // Action log operations

    /// Insert a new action log. A parent link must reference a persisted log.
    async fn create_action_log(&self, log: &ActionLog) -> StorageResult<()>;
    /// Persist status, retry and outcome changes of a log.
    async fn update_action_log(&self, log: &ActionLog) -> StorageResult<()>;
    /// Get an action log by ID.
    async fn get_action_log(&self, id: &ActionLogId) -> StorageResult<Option<ActionLog>>;
    /// List action logs, newest first.
    async fn list_action_logs(&self, filter: &ActionLogFilter) -> StorageResult<Vec<ActionLog>>;

    // Metric weight operations

    /// Get the active weight version for a context.
    async fn get_active_weight(&self, context_key: &str) -> StorageResult<Option<MetricWeight>>;
    /// Get a weight version by ID.
    async fn get_weight(&self, id: &WeightId) -> StorageResult<Option<MetricWeight>>;
    /// Insert the first version of a context unless one exists.
    ///
    /// Returns whether a row was inserted.
    async fn seed_weight(&self, weight: &MetricWeight) -> StorageResult<bool>;
    /// Atomically replace the active version `expected_active` with `next`
    /// and record `log`.
    ///
    /// Fails with [`StorageError::VersionConflict`] when `expected_active` is
    /// no longer active or `next.version` is not one past the context's
    /// highest version.
    async fn swap_active_weight(
        &self,
        expected_active: &WeightId,
        next: &MetricWeight,
        log: &LearningLog,
    ) -> StorageResult<()>;
    /// Atomically deactivate `expected_active`, re-activate `restore` and
    /// record `log`.
    async fn restore_weight(
        &self,
        expected_active: &WeightId,
        restore: &WeightId,
        log: &LearningLog,
    ) -> StorageResult<()>;
    /// All versions of a context, newest first.
    async fn weight_history(&self, context_key: &str) -> StorageResult<Vec<MetricWeight>>;
    /// Highest version number of a context (0 when none exist).
    async fn max_weight_version(&self, context_key: &str) -> StorageResult<i64>;
    /// Active weights, optionally narrowed by agent kind and metric type.
    async fn list_active_weights(
        &self,
        agent_kind: Option<&str>,
        metric_type: Option<&str>,
    ) -> StorageResult<Vec<MetricWeight>>;

    // Learning log operations

    /// Insert a learning log that does not change any weight.
    async fn create_learning_log(&self, log: &LearningLog) -> StorageResult<()>;
    /// Learning logs recorded for an action log, oldest first.
    async fn learning_logs_for_action(
        &self,
        action_log_id: &ActionLogId,
    ) -> StorageResult<Vec<LearningLog>>;
    /// Learning logs recorded since `since`, oldest first.
    async fn list_learning_logs(
        &self,
        since: DateTime<Utc>,
        agent_kind: Option<&str>,
    ) -> StorageResult<Vec<LearningLog>>;

    // Insight operations

    /// Insert a new insight. A parent link must reference a persisted insight.
    async fn create_insight(&self, insight: &LearningInsight) -> StorageResult<()>;
    /// Persist status and flag changes of an insight.
    async fn update_insight(&self, insight: &LearningInsight) -> StorageResult<()>;
    /// Get an insight by ID.
    async fn get_insight(&self, id: &InsightId) -> StorageResult<Option<LearningInsight>>;
    /// List insights, highest priority then newest first.
    async fn list_insights(&self, filter: &InsightFilter) -> StorageResult<Vec<LearningInsight>>;
    /// Find a pending insight with the same context, type and tag.
    async fn find_pending_insight(
        &self,
        context_key: &str,
        insight_type: InsightType,
        metric_type: Option<&str>,
    ) -> StorageResult<Option<LearningInsight>>;
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("Invalid timestamp '{}': {}", value, e),
        })
}

pub(crate) fn parse_optional_timestamp(
    value: Option<String>,
) -> StorageResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format_is_sortable() {
        let early = parse_timestamp("2026-03-01T10:00:00.5Z").unwrap();
        let late = parse_timestamp("2026-03-01T10:00:00.25+00:00").unwrap();
        // Fixed width keeps lexical order equal to chronological order.
        assert!(format_timestamp(&early) > format_timestamp(&late));
        assert_eq!(format_timestamp(&early), "2026-03-01T10:00:00.500000Z");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
        assert!(parse_timestamp("yesterday").is_err());
        assert_eq!(parse_optional_timestamp(None).unwrap(), None);
    }
}
