//! Metric snapshot provider.
//!
//! The engine never collects metrics itself; it reads them through
//! [`MetricSource`]. [`SqliteMetricSource`] reads the `metric_snapshots`
//! table that an external ingestion job fills.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::types::{MetricContext, MetricSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::storage::{format_timestamp, parse_timestamp};

/// Read access to metric streams.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Latest snapshot for a context.
    async fn get_snapshot(&self, context: &MetricContext) -> EngineResult<Option<MetricSnapshot>>;

    /// Snapshots within `window` of now, oldest first.
    async fn get_history(
        &self,
        context: &MetricContext,
        window: Duration,
    ) -> EngineResult<Vec<MetricSnapshot>>;

    /// Every context that currently has data.
    async fn list_contexts(&self) -> EngineResult<Vec<MetricContext>>;
}

/// [`MetricSource`] backed by the `metric_snapshots` table.
#[derive(Clone)]
pub struct SqliteMetricSource {
    pool: SqlitePool,
}

impl SqliteMetricSource {
    /// Create a source over an existing pool (migrations already applied).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a snapshot.
    ///
    /// When `previous_value` is unset it is filled from the latest stored
    /// value of the same context.
    pub async fn record_snapshot(
        &self,
        context: &MetricContext,
        snapshot: &MetricSnapshot,
    ) -> EngineResult<()> {
        let previous = match snapshot.previous_value {
            Some(prev) => Some(prev),
            None => self.get_snapshot(context).await?.map(|s| s.value),
        };
        let context_json = serde_json::to_string(context).map_err(|e| EngineError::Metrics {
            message: format!("Failed to encode context: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO metric_snapshots (context_key, agent_kind, metric_type, context, value,
                previous_value, sample_count, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(context.key())
        .bind(&context.agent_kind)
        .bind(&context.metric_type)
        .bind(context_json)
        .bind(snapshot.value)
        .bind(previous)
        .bind(snapshot.sample_count as i64)
        .bind(format_timestamp(&snapshot.timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| metrics_error("record snapshot", e))?;

        Ok(())
    }
}

#[async_trait]
impl MetricSource for SqliteMetricSource {
    async fn get_snapshot(&self, context: &MetricContext) -> EngineResult<Option<MetricSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT value, previous_value, sample_count, recorded_at
            FROM metric_snapshots
            WHERE context_key = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(context.key())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| metrics_error("get snapshot", e))?;

        row.map(MetricSnapshot::try_from).transpose()
    }

    async fn get_history(
        &self,
        context: &MetricContext,
        window: Duration,
    ) -> EngineResult<Vec<MetricSnapshot>> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let since: DateTime<Utc> = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let rows: Vec<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT value, previous_value, sample_count, recorded_at
            FROM metric_snapshots
            WHERE context_key = ? AND recorded_at >= ?
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(context.key())
        .bind(format_timestamp(&since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metrics_error("get history", e))?;

        rows.into_iter().map(MetricSnapshot::try_from).collect()
    }

    async fn list_contexts(&self) -> EngineResult<Vec<MetricContext>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT context FROM metric_snapshots
            WHERE id IN (SELECT MAX(id) FROM metric_snapshots GROUP BY context_key)
            ORDER BY context_key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metrics_error("list contexts", e))?;

        rows.into_iter()
            .map(|(json,)| {
                serde_json::from_str(&json).map_err(|e| EngineError::Metrics {
                    message: format!("Invalid stored context: {}", e),
                })
            })
            .collect()
    }
}

fn metrics_error(operation: &str, err: sqlx::Error) -> EngineError {
    EngineError::Metrics {
        message: format!("Failed to {}: {}", operation, err),
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    value: f64,
    previous_value: Option<f64>,
    sample_count: i64,
    recorded_at: String,
}

impl TryFrom<SnapshotRow> for MetricSnapshot {
    type Error = EngineError;

    fn try_from(row: SnapshotRow) -> EngineResult<Self> {
        Ok(Self {
            value: row.value,
            previous_value: row.previous_value,
            timestamp: parse_timestamp(&row.recorded_at)?,
            sample_count: row.sample_count.max(0) as u64,
        })
    }
}
