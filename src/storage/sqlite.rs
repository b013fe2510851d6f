use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, ActionLogFilter, InsightFilter,
    Repository,
};
use crate::config::DatabaseConfig;
use crate::engine::types::{
    ActionLog, ActionLogId, ActionRule, InsightId, InsightType, LearningInsight, LearningLog,
    LearningLogId, MetricWeight, RuleId, WeightId,
};
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RULE_COLUMNS: &str = "id, name, agent_kind, action_kind, metric_type, metric_subtype, \
     metric_category, condition, threshold, time_window_secs, consecutive_count, cooldown_secs, \
     priority, max_retries, enabled, scope, fallback_action_kind, action_config, created_at, \
     updated_at, last_triggered_at";

const ACTION_LOG_COLUMNS: &str = "id, rule_id, agent_kind, action_kind, context, trigger_value, \
     status, priority, retry_count, max_retries, config, error_message, impact_metrics, \
     rollback_data, parent_id, created_at, executed_at, completed_at";

const WEIGHT_COLUMNS: &str = "id, context, weight, threshold, confidence, version, \
     performance_score, last_adjusted_at, previous_version_id, is_active, created_at";

const LEARNING_LOG_COLUMNS: &str = "id, context, action_log_id, trigger_type, learning_type, \
     previous_value, new_value, learning_rate, confidence, actual_improvement, validated, \
     rolled_back, weight_id, weight_version, created_at";

const INSIGHT_COLUMNS: &str = "id, context_key, agent_kind, metric_type, insight_type, priority, \
     impact, title, description, recommendation, status, confidence, parent_id, dismissed, \
     created_at, validated_at, implemented_at, archived_at";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database (single connection, so every query
    /// sees the same data).
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid memory database options: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to create in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn exists(&self, table: &'static str, id: &str) -> StorageResult<bool> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", table);
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error("check existence", e))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl Repository for SqliteStorage {
    // ===== Rules =====

    async fn create_rule(&self, rule: &ActionRule) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO action_rules (id, name, agent_kind, action_kind, metric_type,
                metric_subtype, metric_category, condition, threshold, time_window_secs,
                consecutive_count, cooldown_secs, priority, max_retries, enabled, scope,
                fallback_action_kind, action_config, created_at, updated_at, last_triggered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.id.as_str())
        .bind(&rule.name)
        .bind(&rule.agent_kind)
        .bind(&rule.action_kind)
        .bind(&rule.metric_type)
        .bind(&rule.metric_subtype)
        .bind(&rule.metric_category)
        .bind(rule.condition.as_str())
        .bind(rule.threshold)
        .bind(rule.time_window_secs as i64)
        .bind(rule.consecutive_count as i64)
        .bind(rule.cooldown_secs as i64)
        .bind(rule.priority)
        .bind(rule.max_retries.map(i64::from))
        .bind(rule.enabled)
        .bind(to_json(&rule.scope)?)
        .bind(&rule.fallback_action_kind)
        .bind(to_json(&rule.action_config)?)
        .bind(format_timestamp(&rule.created_at))
        .bind(format_timestamp(&rule.updated_at))
        .bind(rule.last_triggered_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("create rule", e))?;

        Ok(())
    }

    async fn update_rule(&self, rule: &ActionRule) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE action_rules SET name = ?, agent_kind = ?, action_kind = ?, metric_type = ?,
                metric_subtype = ?, metric_category = ?, condition = ?, threshold = ?,
                time_window_secs = ?, consecutive_count = ?, cooldown_secs = ?, priority = ?,
                max_retries = ?, enabled = ?, scope = ?, fallback_action_kind = ?,
                action_config = ?, updated_at = ?, last_triggered_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rule.name)
        .bind(&rule.agent_kind)
        .bind(&rule.action_kind)
        .bind(&rule.metric_type)
        .bind(&rule.metric_subtype)
        .bind(&rule.metric_category)
        .bind(rule.condition.as_str())
        .bind(rule.threshold)
        .bind(rule.time_window_secs as i64)
        .bind(rule.consecutive_count as i64)
        .bind(rule.cooldown_secs as i64)
        .bind(rule.priority)
        .bind(rule.max_retries.map(i64::from))
        .bind(rule.enabled)
        .bind(to_json(&rule.scope)?)
        .bind(&rule.fallback_action_kind)
        .bind(to_json(&rule.action_config)?)
        .bind(format_timestamp(&rule.updated_at))
        .bind(rule.last_triggered_at.as_ref().map(format_timestamp))
        .bind(rule.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update rule", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "action rule",
                id: rule.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_rule(&self, id: &RuleId) -> StorageResult<Option<ActionRule>> {
        let sql = format!("SELECT {} FROM action_rules WHERE id = ?", RULE_COLUMNS);
        let row: Option<RuleRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get rule", e))?;

        row.map(ActionRule::try_from).transpose()
    }

    async fn list_rules(&self, enabled_only: bool) -> StorageResult<Vec<ActionRule>> {
        let sql = if enabled_only {
            format!(
                "SELECT {} FROM action_rules WHERE enabled = 1 ORDER BY priority DESC, created_at ASC, id ASC",
                RULE_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM action_rules ORDER BY priority DESC, created_at ASC, id ASC",
                RULE_COLUMNS
            )
        };
        let rows: Vec<RuleRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("list rules", e))?;

        rows.into_iter().map(ActionRule::try_from).collect()
    }

    async fn mark_rule_triggered(&self, id: &RuleId, at: DateTime<Utc>) -> StorageResult<()> {
        let result = sqlx::query("UPDATE action_rules SET last_triggered_at = ? WHERE id = ?")
            .bind(format_timestamp(&at))
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("mark rule triggered", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "action rule",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ===== Action logs =====

    async fn create_action_log(&self, log: &ActionLog) -> StorageResult<()> {
        if let Some(parent) = &log.parent_id {
            if !self.exists("action_logs", parent.as_str()).await? {
                return Err(StorageError::NotFound {
                    entity: "parent action log",
                    id: parent.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO action_logs (id, rule_id, agent_kind, action_kind, context_key,
                metric_type, campaign_id, context, trigger_value, status, priority, retry_count,
                max_retries, config, error_message, impact_metrics, rollback_data, parent_id,
                created_at, executed_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.id.as_str())
        .bind(log.rule_id.as_ref().map(|r| r.0.clone()))
        .bind(&log.agent_kind)
        .bind(&log.action_kind)
        .bind(log.context.key())
        .bind(&log.context.metric_type)
        .bind(&log.context.campaign_id)
        .bind(to_json(&log.context)?)
        .bind(log.trigger_value)
        .bind(log.status.as_str())
        .bind(log.priority)
        .bind(i64::from(log.retry_count))
        .bind(i64::from(log.max_retries))
        .bind(to_json(&log.config)?)
        .bind(&log.error_message)
        .bind(log.impact_metrics.as_ref().map(to_json).transpose()?)
        .bind(log.rollback_data.as_ref().map(to_json).transpose()?)
        .bind(log.parent_id.as_ref().map(|p| p.0.clone()))
        .bind(format_timestamp(&log.created_at))
        .bind(log.executed_at.as_ref().map(format_timestamp))
        .bind(log.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("create action log", e))?;

        Ok(())
    }

    async fn update_action_log(&self, log: &ActionLog) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE action_logs SET status = ?, retry_count = ?, max_retries = ?,
                error_message = ?, impact_metrics = ?, rollback_data = ?, executed_at = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(log.status.as_str())
        .bind(i64::from(log.retry_count))
        .bind(i64::from(log.max_retries))
        .bind(&log.error_message)
        .bind(log.impact_metrics.as_ref().map(to_json).transpose()?)
        .bind(log.rollback_data.as_ref().map(to_json).transpose()?)
        .bind(log.executed_at.as_ref().map(format_timestamp))
        .bind(log.completed_at.as_ref().map(format_timestamp))
        .bind(log.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update action log", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "action log",
                id: log.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_action_log(&self, id: &ActionLogId) -> StorageResult<Option<ActionLog>> {
        let sql = format!("SELECT {} FROM action_logs WHERE id = ?", ACTION_LOG_COLUMNS);
        let row: Option<ActionLogRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get action log", e))?;

        row.map(ActionLog::try_from).transpose()
    }

    async fn list_action_logs(&self, filter: &ActionLogFilter) -> StorageResult<Vec<ActionLog>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM action_logs WHERE 1 = 1",
            ACTION_LOG_COLUMNS
        ));
        if let Some(agent_kind) = &filter.agent_kind {
            qb.push(" AND agent_kind = ").push_bind(agent_kind.clone());
        }
        if let Some(metric_type) = &filter.metric_type {
            qb.push(" AND metric_type = ").push_bind(metric_type.clone());
        }
        if let Some(context_key) = &filter.context_key {
            qb.push(" AND context_key = ").push_bind(context_key.clone());
        }
        if let Some(since) = &filter.since {
            qb.push(" AND created_at >= ").push_bind(format_timestamp(since));
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<ActionLogRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("list action logs", e))?;

        rows.into_iter().map(ActionLog::try_from).collect()
    }

    // ===== Metric weights =====

    async fn get_active_weight(&self, context_key: &str) -> StorageResult<Option<MetricWeight>> {
        let sql = format!(
            "SELECT {} FROM metric_weights WHERE context_key = ? AND is_active = 1",
            WEIGHT_COLUMNS
        );
        let row: Option<WeightRow> = sqlx::query_as(&sql)
            .bind(context_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get active weight", e))?;

        row.map(MetricWeight::try_from).transpose()
    }

    async fn get_weight(&self, id: &WeightId) -> StorageResult<Option<MetricWeight>> {
        let sql = format!("SELECT {} FROM metric_weights WHERE id = ?", WEIGHT_COLUMNS);
        let row: Option<WeightRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get weight", e))?;

        row.map(MetricWeight::try_from).transpose()
    }

    async fn seed_weight(&self, weight: &MetricWeight) -> StorageResult<bool> {
        // UNIQUE (context_key, version) turns a second seed into a no-op.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO metric_weights (id, context_key, agent_kind, metric_type,
                context, weight, threshold, confidence, version, performance_score,
                last_adjusted_at, previous_version_id, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, NULL, 1, ?)
            "#,
        )
        .bind(weight.id.as_str())
        .bind(weight.context.key())
        .bind(&weight.context.agent_kind)
        .bind(&weight.context.metric_type)
        .bind(to_json(&weight.context)?)
        .bind(weight.weight)
        .bind(weight.threshold)
        .bind(weight.confidence)
        .bind(weight.performance_score)
        .bind(weight.last_adjusted_at.as_ref().map(format_timestamp))
        .bind(format_timestamp(&weight.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("seed weight", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn swap_active_weight(
        &self,
        expected_active: &WeightId,
        next: &MetricWeight,
        log: &LearningLog,
    ) -> StorageResult<()> {
        let context_key = next.context.key();
        let conflict = || StorageError::VersionConflict {
            context_key: context_key.clone(),
            expected: expected_active.to_string(),
        };
        let map_err = |operation: &'static str| {
            let context_key = context_key.clone();
            let expected = expected_active.to_string();
            move |e: sqlx::Error| {
                if is_conflict(&e) {
                    StorageError::VersionConflict {
                        context_key,
                        expected,
                    }
                } else {
                    query_error(operation, e)
                }
            }
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("begin weight swap", e))?;

        let active: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM metric_weights WHERE context_key = ? AND is_active = 1",
        )
        .bind(&context_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err("read active weight"))?;

        if active.map(|(id,)| id).as_deref() != Some(expected_active.as_str()) {
            return Err(conflict());
        }

        let (max_version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM metric_weights WHERE context_key = ?",
        )
        .bind(&context_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err("read max version"))?;

        if next.version != max_version + 1 {
            return Err(conflict());
        }

        sqlx::query("UPDATE metric_weights SET is_active = 0 WHERE id = ? AND is_active = 1")
            .bind(expected_active.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_err("deactivate weight"))?;

        sqlx::query(
            r#"
            INSERT INTO metric_weights (id, context_key, agent_kind, metric_type, context,
                weight, threshold, confidence, version, performance_score, last_adjusted_at,
                previous_version_id, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(next.id.as_str())
        .bind(&context_key)
        .bind(&next.context.agent_kind)
        .bind(&next.context.metric_type)
        .bind(to_json(&next.context)?)
        .bind(next.weight)
        .bind(next.threshold)
        .bind(next.confidence)
        .bind(next.version)
        .bind(next.performance_score)
        .bind(next.last_adjusted_at.as_ref().map(format_timestamp))
        .bind(expected_active.as_str())
        .bind(format_timestamp(&next.created_at))
        .execute(&mut *tx)
        .await
        .map_err(map_err("insert weight version"))?;

        insert_learning_log(&mut *tx, log)
            .await
            .map_err(map_err("insert learning log"))?;

        tx.commit().await.map_err(map_err("commit weight swap"))?;

        debug!(
            context = %context_key,
            version = next.version,
            weight = next.weight,
            "Weight version swapped"
        );
        Ok(())
    }

    async fn restore_weight(
        &self,
        expected_active: &WeightId,
        restore: &WeightId,
        log: &LearningLog,
    ) -> StorageResult<()> {
        let context_key = log.context.key();
        let conflict = || StorageError::VersionConflict {
            context_key: context_key.clone(),
            expected: expected_active.to_string(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("begin weight restore", e))?;

        let rows: Vec<(String, i64, bool)> = sqlx::query_as(
            "SELECT id, version, is_active FROM metric_weights WHERE context_key = ? AND id IN (?, ?)",
        )
        .bind(&context_key)
        .bind(expected_active.as_str())
        .bind(restore.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| query_error("read weights for restore", e))?;

        let active = rows
            .iter()
            .find(|(id, _, _)| id == expected_active.as_str());
        let target = rows.iter().find(|(id, _, _)| id == restore.as_str());

        let (active_version, target_version) = match (active, target) {
            (Some((_, av, true)), Some((_, tv, false))) => (*av, *tv),
            (Some((_, _, false)), _) => return Err(conflict()),
            (None, _) => return Err(conflict()),
            (Some(_), None) => {
                return Err(StorageError::NotFound {
                    entity: "metric weight",
                    id: restore.to_string(),
                })
            }
            (Some((_, _, true)), Some((_, _, true))) => return Err(conflict()),
        };
        if target_version >= active_version {
            return Err(conflict());
        }

        sqlx::query("UPDATE metric_weights SET is_active = 0 WHERE id = ?")
            .bind(expected_active.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| query_error("deactivate weight", e))?;

        sqlx::query("UPDATE metric_weights SET is_active = 1 WHERE id = ?")
            .bind(restore.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_conflict(&e) {
                    conflict()
                } else {
                    query_error("reactivate weight", e)
                }
            })?;

        insert_learning_log(&mut *tx, log)
            .await
            .map_err(|e| query_error("insert learning log", e))?;

        tx.commit()
            .await
            .map_err(|e| query_error("commit weight restore", e))?;

        info!(
            context = %context_key,
            restored_version = target_version,
            replaced_version = active_version,
            "Weight version restored"
        );
        Ok(())
    }

    async fn weight_history(&self, context_key: &str) -> StorageResult<Vec<MetricWeight>> {
        let sql = format!(
            "SELECT {} FROM metric_weights WHERE context_key = ? ORDER BY version DESC",
            WEIGHT_COLUMNS
        );
        let rows: Vec<WeightRow> = sqlx::query_as(&sql)
            .bind(context_key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("get weight history", e))?;

        rows.into_iter().map(MetricWeight::try_from).collect()
    }

    async fn max_weight_version(&self, context_key: &str) -> StorageResult<i64> {
        let (max_version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM metric_weights WHERE context_key = ?",
        )
        .bind(context_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("get max weight version", e))?;

        Ok(max_version)
    }

    async fn list_active_weights(
        &self,
        agent_kind: Option<&str>,
        metric_type: Option<&str>,
    ) -> StorageResult<Vec<MetricWeight>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM metric_weights WHERE is_active = 1",
            WEIGHT_COLUMNS
        ));
        if let Some(agent_kind) = agent_kind {
            qb.push(" AND agent_kind = ").push_bind(agent_kind.to_string());
        }
        if let Some(metric_type) = metric_type {
            qb.push(" AND metric_type = ").push_bind(metric_type.to_string());
        }
        qb.push(" ORDER BY context_key ASC");

        let rows: Vec<WeightRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("list active weights", e))?;

        rows.into_iter().map(MetricWeight::try_from).collect()
    }

    // ===== Learning logs =====

    async fn create_learning_log(&self, log: &LearningLog) -> StorageResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_error("acquire connection", e))?;
        insert_learning_log(&mut *conn, log)
            .await
            .map_err(|e| query_error("create learning log", e))?;
        Ok(())
    }

    async fn learning_logs_for_action(
        &self,
        action_log_id: &ActionLogId,
    ) -> StorageResult<Vec<LearningLog>> {
        let sql = format!(
            "SELECT {} FROM learning_logs WHERE action_log_id = ? ORDER BY created_at ASC, id ASC",
            LEARNING_LOG_COLUMNS
        );
        let rows: Vec<LearningLogRow> = sqlx::query_as(&sql)
            .bind(action_log_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("get learning logs for action", e))?;

        rows.into_iter().map(LearningLog::try_from).collect()
    }

    async fn list_learning_logs(
        &self,
        since: DateTime<Utc>,
        agent_kind: Option<&str>,
    ) -> StorageResult<Vec<LearningLog>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM learning_logs WHERE created_at >= ",
            LEARNING_LOG_COLUMNS
        ));
        qb.push_bind(format_timestamp(&since));
        if let Some(agent_kind) = agent_kind {
            qb.push(" AND agent_kind = ").push_bind(agent_kind.to_string());
        }
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows: Vec<LearningLogRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("list learning logs", e))?;

        rows.into_iter().map(LearningLog::try_from).collect()
    }

    // ===== Insights =====

    async fn create_insight(&self, insight: &LearningInsight) -> StorageResult<()> {
        if let Some(parent) = &insight.parent_id {
            if !self.exists("learning_insights", parent.as_str()).await? {
                return Err(StorageError::NotFound {
                    entity: "parent insight",
                    id: parent.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO learning_insights (id, context_key, agent_kind, metric_type,
                insight_type, priority, impact, title, description, recommendation, status,
                confidence, parent_id, dismissed, created_at, validated_at, implemented_at,
                archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(insight.id.as_str())
        .bind(&insight.context_key)
        .bind(&insight.agent_kind)
        .bind(&insight.metric_type)
        .bind(insight.insight_type.as_str())
        .bind(insight.priority.as_str())
        .bind(insight.impact)
        .bind(&insight.title)
        .bind(&insight.description)
        .bind(&insight.recommendation)
        .bind(insight.status.as_str())
        .bind(insight.confidence)
        .bind(insight.parent_id.as_ref().map(|p| p.0.clone()))
        .bind(insight.dismissed)
        .bind(format_timestamp(&insight.created_at))
        .bind(insight.validated_at.as_ref().map(format_timestamp))
        .bind(insight.implemented_at.as_ref().map(format_timestamp))
        .bind(insight.archived_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("create insight", e))?;

        Ok(())
    }

    async fn update_insight(&self, insight: &LearningInsight) -> StorageResult<()> {
        // parent_id and created_at are write-once
        let result = sqlx::query(
            r#"
            UPDATE learning_insights SET status = ?, dismissed = ?, validated_at = ?,
                implemented_at = ?, archived_at = ?
            WHERE id = ?
            "#,
        )
        .bind(insight.status.as_str())
        .bind(insight.dismissed)
        .bind(insight.validated_at.as_ref().map(format_timestamp))
        .bind(insight.implemented_at.as_ref().map(format_timestamp))
        .bind(insight.archived_at.as_ref().map(format_timestamp))
        .bind(insight.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update insight", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "insight",
                id: insight.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_insight(&self, id: &InsightId) -> StorageResult<Option<LearningInsight>> {
        let sql = format!(
            "SELECT {} FROM learning_insights WHERE id = ?",
            INSIGHT_COLUMNS
        );
        let row: Option<InsightRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get insight", e))?;

        row.map(LearningInsight::try_from).transpose()
    }

    async fn list_insights(&self, filter: &InsightFilter) -> StorageResult<Vec<LearningInsight>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM learning_insights WHERE 1 = 1",
            INSIGHT_COLUMNS
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(agent_kind) = &filter.agent_kind {
            qb.push(" AND agent_kind = ").push_bind(agent_kind.clone());
        }
        if !filter.include_dismissed {
            qb.push(" AND dismissed = 0");
        }
        qb.push(
            " ORDER BY CASE priority WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0 END DESC, \
             created_at DESC, id ASC",
        );
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<InsightRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("list insights", e))?;

        rows.into_iter().map(LearningInsight::try_from).collect()
    }

    async fn find_pending_insight(
        &self,
        context_key: &str,
        insight_type: InsightType,
        metric_type: Option<&str>,
    ) -> StorageResult<Option<LearningInsight>> {
        let sql = format!(
            "SELECT {} FROM learning_insights \
             WHERE context_key = ? AND insight_type = ? AND status = 'pending' \
             AND metric_type IS ? \
             ORDER BY created_at DESC LIMIT 1",
            INSIGHT_COLUMNS
        );
        let row: Option<InsightRow> = sqlx::query_as(&sql)
            .bind(context_key)
            .bind(insight_type.as_str())
            .bind(metric_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("find pending insight", e))?;

        row.map(LearningInsight::try_from).transpose()
    }
}

async fn insert_learning_log(
    conn: &mut sqlx::SqliteConnection,
    log: &LearningLog,
) -> Result<(), sqlx::Error> {
    let context = serde_json::to_string(&log.context)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO learning_logs (id, context_key, agent_kind, metric_type, context,
            action_log_id, trigger_type, learning_type, previous_value, new_value,
            learning_rate, confidence, actual_improvement, validated, rolled_back, weight_id,
            weight_version, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(log.id.as_str())
    .bind(log.context.key())
    .bind(&log.context.agent_kind)
    .bind(&log.context.metric_type)
    .bind(context)
    .bind(log.action_log_id.as_ref().map(|a| a.0.clone()))
    .bind(log.trigger_type.as_str())
    .bind(log.learning_type.as_str())
    .bind(log.previous_value)
    .bind(log.new_value)
    .bind(log.learning_rate)
    .bind(log.confidence)
    .bind(log.actual_improvement)
    .bind(log.validated)
    .bind(log.rolled_back)
    .bind(log.weight_id.as_ref().map(|w| w.0.clone()))
    .bind(log.weight_version)
    .bind(format_timestamp(&log.created_at))
    .execute(conn)
    .await?;

    Ok(())
}

/// Busy/locked databases and unique-index violations all mean another
/// writer got there first.
fn is_conflict(err: &sqlx::Error) -> bool {
    match err.as_database_error() {
        Some(db) => {
            db.is_unique_violation()
                || matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
        }
        None => false,
    }
}

fn query_error(operation: &str, err: sqlx::Error) -> StorageError {
    StorageError::Query {
        message: format!("Failed to {}: {}", operation, err),
    }
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(value: &str) -> StorageResult<T> {
    serde_json::from_str(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> StorageResult<T> {
    value
        .parse()
        .map_err(|message| StorageError::Serialization { message })
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct RuleRow {
    id: String,
    name: String,
    agent_kind: String,
    action_kind: String,
    metric_type: String,
    metric_subtype: Option<String>,
    metric_category: Option<String>,
    condition: String,
    threshold: f64,
    time_window_secs: i64,
    consecutive_count: i64,
    cooldown_secs: i64,
    priority: i32,
    max_retries: Option<i64>,
    enabled: bool,
    scope: String,
    fallback_action_kind: Option<String>,
    action_config: String,
    created_at: String,
    updated_at: String,
    last_triggered_at: Option<String>,
}

impl TryFrom<RuleRow> for ActionRule {
    type Error = StorageError;

    fn try_from(row: RuleRow) -> StorageResult<Self> {
        Ok(Self {
            id: RuleId(row.id),
            name: row.name,
            agent_kind: row.agent_kind,
            action_kind: row.action_kind,
            metric_type: row.metric_type,
            metric_subtype: row.metric_subtype,
            metric_category: row.metric_category,
            condition: parse_enum(&row.condition)?,
            threshold: row.threshold,
            time_window_secs: row.time_window_secs.max(0) as u64,
            consecutive_count: row.consecutive_count.max(1) as u32,
            cooldown_secs: row.cooldown_secs.max(0) as u64,
            priority: row.priority,
            max_retries: row.max_retries.map(|r| r.max(0) as u32),
            enabled: row.enabled,
            scope: from_json(&row.scope)?,
            fallback_action_kind: row.fallback_action_kind,
            action_config: from_json(&row.action_config)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            last_triggered_at: parse_optional_timestamp(row.last_triggered_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActionLogRow {
    id: String,
    rule_id: Option<String>,
    agent_kind: String,
    action_kind: String,
    context: String,
    trigger_value: f64,
    status: String,
    priority: i32,
    retry_count: i64,
    max_retries: i64,
    config: String,
    error_message: Option<String>,
    impact_metrics: Option<String>,
    rollback_data: Option<String>,
    parent_id: Option<String>,
    created_at: String,
    executed_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<ActionLogRow> for ActionLog {
    type Error = StorageError;

    fn try_from(row: ActionLogRow) -> StorageResult<Self> {
        Ok(Self {
            id: ActionLogId(row.id),
            rule_id: row.rule_id.map(RuleId),
            agent_kind: row.agent_kind,
            action_kind: row.action_kind,
            context: from_json(&row.context)?,
            trigger_value: row.trigger_value,
            status: parse_enum(&row.status)?,
            priority: row.priority,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            config: from_json(&row.config)?,
            error_message: row.error_message,
            impact_metrics: row.impact_metrics.as_deref().map(from_json).transpose()?,
            rollback_data: row.rollback_data.as_deref().map(from_json).transpose()?,
            parent_id: row.parent_id.map(ActionLogId),
            created_at: parse_timestamp(&row.created_at)?,
            executed_at: parse_optional_timestamp(row.executed_at)?,
            completed_at: parse_optional_timestamp(row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WeightRow {
    id: String,
    context: String,
    weight: f64,
    threshold: f64,
    confidence: f64,
    version: i64,
    performance_score: f64,
    last_adjusted_at: Option<String>,
    previous_version_id: Option<String>,
    is_active: bool,
    created_at: String,
}

impl TryFrom<WeightRow> for MetricWeight {
    type Error = StorageError;

    fn try_from(row: WeightRow) -> StorageResult<Self> {
        Ok(Self {
            id: WeightId(row.id),
            context: from_json(&row.context)?,
            weight: row.weight,
            threshold: row.threshold,
            confidence: row.confidence,
            version: row.version,
            performance_score: row.performance_score,
            last_adjusted_at: parse_optional_timestamp(row.last_adjusted_at)?,
            previous_version_id: row.previous_version_id.map(WeightId),
            is_active: row.is_active,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LearningLogRow {
    id: String,
    context: String,
    action_log_id: Option<String>,
    trigger_type: String,
    learning_type: String,
    previous_value: f64,
    new_value: f64,
    learning_rate: f64,
    confidence: f64,
    actual_improvement: Option<f64>,
    validated: bool,
    rolled_back: bool,
    weight_id: Option<String>,
    weight_version: Option<i64>,
    created_at: String,
}

impl TryFrom<LearningLogRow> for LearningLog {
    type Error = StorageError;

    fn try_from(row: LearningLogRow) -> StorageResult<Self> {
        Ok(Self {
            id: LearningLogId(row.id),
            context: from_json(&row.context)?,
            action_log_id: row.action_log_id.map(ActionLogId),
            trigger_type: parse_enum(&row.trigger_type)?,
            learning_type: parse_enum(&row.learning_type)?,
            previous_value: row.previous_value,
            new_value: row.new_value,
            learning_rate: row.learning_rate,
            confidence: row.confidence,
            actual_improvement: row.actual_improvement,
            validated: row.validated,
            rolled_back: row.rolled_back,
            weight_id: row.weight_id.map(WeightId),
            weight_version: row.weight_version,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InsightRow {
    id: String,
    context_key: String,
    agent_kind: String,
    metric_type: Option<String>,
    insight_type: String,
    priority: String,
    impact: f64,
    title: String,
    description: String,
    recommendation: String,
    status: String,
    confidence: f64,
    parent_id: Option<String>,
    dismissed: bool,
    created_at: String,
    validated_at: Option<String>,
    implemented_at: Option<String>,
    archived_at: Option<String>,
}

impl TryFrom<InsightRow> for LearningInsight {
    type Error = StorageError;

    fn try_from(row: InsightRow) -> StorageResult<Self> {
        Ok(Self {
            id: InsightId(row.id),
            context_key: row.context_key,
            agent_kind: row.agent_kind,
            metric_type: row.metric_type,
            insight_type: parse_enum(&row.insight_type)?,
            priority: parse_enum(&row.priority)?,
            impact: row.impact,
            title: row.title,
            description: row.description,
            recommendation: row.recommendation,
            status: parse_enum(&row.status)?,
            confidence: row.confidence,
            parent_id: row.parent_id.map(InsightId),
            dismissed: row.dismissed,
            created_at: parse_timestamp(&row.created_at)?,
            validated_at: parse_optional_timestamp(row.validated_at)?,
            implemented_at: parse_optional_timestamp(row.implemented_at)?,
            archived_at: parse_optional_timestamp(row.archived_at)?,
        })
    }
}
