//! Integration tests for SQLite storage layer
//!
//! Tests repository operations using in-memory and file-backed databases.

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use perf_action_engine::config::DatabaseConfig;
use perf_action_engine::engine::{
    ActionConfig, ActionLog, ActionLogId, ActionRule, ActionStatus, ImpactMetrics, InsightId,
    InsightPriority, InsightStatus, InsightType, LearningConfig, LearningInsight, LearningLog,
    LearningLogId, LearningTrigger, LearningType, MetricContext, MetricWeight, ParamValue,
    RuleScope, TriggerCondition,
};
use perf_action_engine::error::StorageError;
use perf_action_engine::storage::{ActionLogFilter, InsightFilter, Repository, SqliteStorage};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

fn ctx() -> MetricContext {
    MetricContext::new("ad", "ctr").with_campaign("summer")
}

fn learning_log(context: &MetricContext, weight: &MetricWeight, new_value: f64) -> LearningLog {
    LearningLog {
        id: LearningLogId::new(),
        context: context.clone(),
        action_log_id: None,
        trigger_type: LearningTrigger::Batch,
        learning_type: LearningType::WeightAdjustment,
        previous_value: weight.weight,
        new_value,
        learning_rate: 0.1,
        confidence: 0.8,
        actual_improvement: Some(0.2),
        validated: true,
        rolled_back: false,
        weight_id: None,
        weight_version: None,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod rule_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_rule_round_trip_with_typed_config() {
        let storage = create_test_storage().await;
        let mut rule = ActionRule::new(
            "cut spend",
            "ad",
            "reduce_budget",
            "ctr",
            TriggerCondition::ChangePercent,
            -20.0,
        )
        .with_cooldown_secs(600)
        .with_priority(3)
        .with_scope(RuleScope {
            campaign_ids: vec!["summer".to_string()],
            regions: vec!["eu".to_string()],
            platforms: vec![],
        });
        rule.action_config = ActionConfig {
            budget_delta: Some(-50.0),
            ..Default::default()
        }
        .with_extra("channel", ParamValue::String("search".to_string()));
        rule.max_retries = Some(1);

        storage.create_rule(&rule).await.unwrap();
        let loaded = storage.get_rule(&rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, rule.name);
        assert_eq!(loaded.condition, TriggerCondition::ChangePercent);
        assert_eq!(loaded.cooldown_secs, 600);
        assert_eq!(loaded.priority, 3);
        assert_eq!(loaded.max_retries, Some(1));
        assert_eq!(loaded.scope, rule.scope);
        assert_eq!(loaded.action_config, rule.action_config);
        // Timestamps are stored at microsecond precision.
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            rule.created_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_list_enabled_rules_and_mark_triggered() {
        let storage = create_test_storage().await;
        let enabled = ActionRule::new("a", "ad", "pause_campaign", "ctr", TriggerCondition::LessThan, 0.01);
        let mut disabled =
            ActionRule::new("b", "ad", "pause_campaign", "ctr", TriggerCondition::LessThan, 0.02);
        disabled.enabled = false;
        storage.create_rule(&enabled).await.unwrap();
        storage.create_rule(&disabled).await.unwrap();

        assert_eq!(storage.list_rules(false).await.unwrap().len(), 2);
        let only_enabled = storage.list_rules(true).await.unwrap();
        assert_eq!(only_enabled.len(), 1);
        assert_eq!(only_enabled[0].id, enabled.id);

        let at = Utc::now();
        storage.mark_rule_triggered(&enabled.id, at).await.unwrap();
        let loaded = storage.get_rule(&enabled.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_triggered_at.map(|t| t.timestamp_micros()),
            Some(at.timestamp_micros())
        );
    }
}

#[cfg(test)]
mod action_log_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_parent_must_exist() {
        let storage = create_test_storage().await;
        let mut orphan = ActionLog::new("ad", "pause_campaign", ctx(), 0.01, 5);
        orphan.parent_id = Some(ActionLogId::from("action_missing"));

        let err = storage.create_action_log(&orphan).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_and_filter_logs() {
        let storage = create_test_storage().await;
        let mut done = ActionLog::new("ad", "pause_campaign", ctx(), 0.01, 5);
        storage.create_action_log(&done).await.unwrap();
        let now = Utc::now();
        done.start_attempt(now).unwrap();
        done.complete(
            now,
            ImpactMetrics::compute(0.01, Some(0.02)),
            Some(serde_json::json!({"previous_state": "active"})),
        )
        .unwrap();
        storage.update_action_log(&done).await.unwrap();

        let pending = ActionLog::new("ad", "pause_campaign", ctx(), 0.01, 5);
        storage.create_action_log(&pending).await.unwrap();

        let loaded = storage.get_action_log(&done.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Completed);
        assert_eq!(loaded.impact_metrics, done.impact_metrics);
        assert_eq!(loaded.rollback_data, done.rollback_data);

        let terminal = storage
            .list_action_logs(&ActionLogFilter::terminal_since(Utc::now() - Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].id, done.id);

        let by_context = storage
            .list_action_logs(&ActionLogFilter {
                context_key: Some(ctx().key()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_context.len(), 2);
    }
}

#[cfg(test)]
mod weight_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_seed_is_insert_if_absent() {
        let storage = create_test_storage().await;
        let config = LearningConfig::default();
        let first = MetricWeight::initial(ctx(), 0.01, &config);
        let second = MetricWeight::initial(ctx(), 0.05, &config);

        assert!(storage.seed_weight(&first).await.unwrap());
        assert!(!storage.seed_weight(&second).await.unwrap());

        let active = storage.get_active_weight(&ctx().key()).await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
        assert_eq!(storage.max_weight_version(&ctx().key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_swap_detects_stale_expectation() {
        let storage = create_test_storage().await;
        let config = LearningConfig::default();
        let v1 = MetricWeight::initial(ctx(), 0.01, &config);
        storage.seed_weight(&v1).await.unwrap();

        let v2 = v1.successor(2, 1.1, 0.7, 55.0, Utc::now());
        storage
            .swap_active_weight(&v1.id, &v2, &learning_log(&ctx(), &v1, 1.1))
            .await
            .unwrap();

        // A writer that still believes v1 is active loses.
        let stale = v1.successor(3, 1.3, 0.7, 60.0, Utc::now());
        let err = storage
            .swap_active_weight(&v1.id, &stale, &learning_log(&ctx(), &v1, 1.3))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));

        // A version number that skips ahead is refused too.
        let skipping = v2.successor(5, 1.2, 0.7, 60.0, Utc::now());
        assert!(storage
            .swap_active_weight(&v2.id, &skipping, &learning_log(&ctx(), &v2, 1.2))
            .await
            .is_err());

        let history = storage.weight_history(&ctx().key()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, v2.id);
        assert!(history[0].is_active);
        assert!(!history[1].is_active);
    }

    #[tokio::test]
    async fn test_restore_previous_version() {
        let storage = create_test_storage().await;
        let config = LearningConfig::default();
        let v1 = MetricWeight::initial(ctx(), 0.01, &config);
        storage.seed_weight(&v1).await.unwrap();
        let v2 = v1.successor(2, 1.1, 0.7, 55.0, Utc::now());
        storage
            .swap_active_weight(&v1.id, &v2, &learning_log(&ctx(), &v1, 1.1))
            .await
            .unwrap();

        let mut rollback = learning_log(&ctx(), &v2, v1.weight);
        rollback.learning_type = LearningType::Rollback;
        rollback.rolled_back = true;
        storage.restore_weight(&v2.id, &v1.id, &rollback).await.unwrap();

        let active = storage.get_active_weight(&ctx().key()).await.unwrap().unwrap();
        assert_eq!(active.id, v1.id);
        // No new version is created by a restore.
        assert_eq!(storage.max_weight_version(&ctx().key()).await.unwrap(), 2);

        // Restoring again from the now-inactive v2 conflicts.
        let err = storage
            .restore_weight(&v2.id, &v1.id, &rollback_log(&ctx()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
    }

    fn rollback_log(context: &MetricContext) -> LearningLog {
        let weight = MetricWeight::initial(context.clone(), 0.0, &LearningConfig::default());
        let mut log = learning_log(context, &weight, weight.weight);
        log.learning_type = LearningType::Rollback;
        log.rolled_back = true;
        log
    }

    #[tokio::test]
    async fn test_list_active_weights_filters() {
        let storage = create_test_storage().await;
        let config = LearningConfig::default();
        for context in [
            MetricContext::new("ad", "ctr"),
            MetricContext::new("ad", "cpc"),
            MetricContext::new("content", "engagement"),
        ] {
            storage
                .seed_weight(&MetricWeight::initial(context, 1.0, &config))
                .await
                .unwrap();
        }

        assert_eq!(storage.list_active_weights(None, None).await.unwrap().len(), 3);
        assert_eq!(storage.list_active_weights(Some("ad"), None).await.unwrap().len(), 2);
        assert_eq!(
            storage
                .list_active_weights(Some("ad"), Some("cpc"))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}

#[cfg(test)]
mod insight_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn insight(insight_type: InsightType, metric_type: Option<&str>) -> LearningInsight {
        LearningInsight {
            id: InsightId::new(),
            context_key: ctx().key(),
            agent_kind: "ad".to_string(),
            metric_type: metric_type.map(str::to_string),
            insight_type,
            priority: InsightPriority::Medium,
            impact: 0.5,
            title: "t".to_string(),
            description: "d".to_string(),
            recommendation: "r".to_string(),
            status: InsightStatus::Pending,
            confidence: 0.6,
            parent_id: None,
            dismissed: false,
            created_at: Utc::now(),
            validated_at: None,
            implemented_at: None,
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn test_find_pending_matches_tag() {
        let storage = create_test_storage().await;
        let tagged = insight(InsightType::Engagement, Some("ctr"));
        storage.create_insight(&tagged).await.unwrap();

        let found = storage
            .find_pending_insight(&ctx().key(), InsightType::Engagement, Some("ctr"))
            .await
            .unwrap();
        assert_eq!(found.map(|i| i.id), Some(tagged.id.clone()));
        assert!(storage
            .find_pending_insight(&ctx().key(), InsightType::Engagement, None)
            .await
            .unwrap()
            .is_none());

        let mut validated = storage.get_insight(&tagged.id).await.unwrap().unwrap();
        validated.validate(Utc::now()).unwrap();
        storage.update_insight(&validated).await.unwrap();
        assert!(storage
            .find_pending_insight(&ctx().key(), InsightType::Engagement, Some("ctr"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_parent_link_and_dismissed_filter() {
        let storage = create_test_storage().await;
        let mut orphan = insight(InsightType::Trend, None);
        orphan.parent_id = Some(InsightId::from("insight_missing"));
        assert!(storage.create_insight(&orphan).await.is_err());

        let parent = insight(InsightType::Performance, None);
        storage.create_insight(&parent).await.unwrap();
        let mut child = insight(InsightType::Trend, None);
        child.parent_id = Some(parent.id.clone());
        child.dismissed = true;
        storage.create_insight(&child).await.unwrap();

        let visible = storage.list_insights(&InsightFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 1);
        let all = storage
            .list_insights(&InsightFilter {
                include_dismissed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_file_database_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("actions.db"),
            max_connections: 2,
        };

        let rule = ActionRule::new("r", "ad", "pause_campaign", "ctr", TriggerCondition::LessThan, 0.01);
        {
            let storage = SqliteStorage::new(&config).await.unwrap();
            storage.create_rule(&rule).await.unwrap();
        }

        let reopened = SqliteStorage::new(&config).await.unwrap();
        let loaded = reopened.get_rule(&rule.id).await.unwrap();
        assert_eq!(loaded.map(|r| r.name), Some("r".to_string()));
    }
}
