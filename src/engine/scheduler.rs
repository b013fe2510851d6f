//! Periodic control loop.
//!
//! Each tick runs action checks, then scheduled learning, then (optionally)
//! insight generation. A failing stage is logged and the next stage still
//! runs; the loop itself only stops on shutdown.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::learner::FeedbackAnalysis;
use super::system::{ActionEngine, CheckSummary};
use super::types::MetricContext;
use crate::error::EngineResult;

/// What one tick did. A `None` stage failed (and was logged).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    /// Actions checked and run
    pub checks: Option<CheckSummary>,
    /// Logs learned from
    pub learned: Option<usize>,
    /// Insights created
    pub insights_created: Option<usize>,
}

/// Runs the engine on a timer.
pub struct BatchScheduler;

impl BatchScheduler {
    /// Spawn the loop. It ticks every `scheduler.tick_interval_secs` (read
    /// once at start) until `shutdown` flips to `true`.
    pub fn spawn(engine: Arc<ActionEngine>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = engine.config().await.scheduler.tick_interval();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tick = Self::run_once(&engine);
                        tokio::pin!(tick);
                        tokio::select! {
                            _ = &mut tick => {}
                            changed = stop_requested(&mut shutdown) => {
                                if changed.is_err() {
                                    info!("Shutdown channel closed, scheduler stopping");
                                }
                                // Cancel in-flight actions so the tick ends promptly.
                                engine.shutdown();
                                tick.await;
                                break;
                            }
                        }
                    }
                    changed = stop_requested(&mut shutdown) => {
                        if changed.is_err() {
                            info!("Shutdown channel closed, scheduler stopping");
                        }
                        break;
                    }
                }
            }

            engine.shutdown();
            info!("Scheduler stopped");
        })
    }

    /// Run a single tick.
    pub async fn run_once(engine: &ActionEngine) -> TickReport {
        let mut report = TickReport::default();

        match engine.run_action_checks(None, None, false).await {
            Ok(summary) => report.checks = Some(summary),
            Err(e) => error!(error = %e, "Scheduled action checks failed"),
        }

        match engine.run_scheduled_learning().await {
            Ok(summary) => report.learned = Some(summary.processed_logs),
            Err(e) => error!(error = %e, "Scheduled learning failed"),
        }

        if engine.config().await.scheduler.generate_insights {
            match engine.generate_insights(None).await {
                Ok(insights) => report.insights_created = Some(insights.created.len()),
                Err(e) => error!(error = %e, "Scheduled insight generation failed"),
            }
        }

        info!(
            executed = report.checks.as_ref().map(|c| c.executed),
            learned = report.learned,
            insights = report.insights_created,
            "Scheduler tick finished"
        );
        report
    }

    /// Evaluate, execute and learn for one context.
    pub async fn run_context(
        engine: &ActionEngine,
        context: &MetricContext,
    ) -> EngineResult<(CheckSummary, Vec<FeedbackAnalysis>)> {
        let checks = engine.check_context(context, false).await?;
        let analyses = engine.learn_context(context).await?;
        Ok((checks, analyses))
    }
}

/// Resolves once `shutdown` is `true`, or with an error when the sender is gone.
async fn stop_requested(
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), watch::error::RecvError> {
    // The watch guard is !Send and must not outlive this call.
    shutdown.wait_for(|stop| *stop).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;
    use crate::engine::metrics::SqliteMetricSource;
    use crate::engine::registry::{ActionRegistry, ExecutionOutcome, MockActionExecutor};
    use crate::engine::types::{ActionRule, MetricSnapshot, TriggerCondition};
    use crate::storage::SqliteStorage;
    use chrono::Utc;
    use std::time::Duration;

    async fn engine() -> (Arc<ActionEngine>, SqliteMetricSource) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let metrics = SqliteMetricSource::new(storage.pool().clone());
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().returning(|_| {
            Ok(ExecutionOutcome {
                post_value: Some(0.6),
                ..Default::default()
            })
        });
        let registry = Arc::new(ActionRegistry::with_default_catalog(Arc::new(executor)));
        let engine = ActionEngine::new(
            storage,
            Arc::new(metrics.clone()),
            registry,
            EngineConfig::default(),
        )
        .unwrap();
        (Arc::new(engine), metrics)
    }

    #[tokio::test]
    async fn test_run_once_runs_every_stage() {
        let (engine, metrics) = engine().await;
        engine
            .create_rule(ActionRule::new(
                "low engagement",
                "content",
                "boost_engagement",
                "engagement",
                TriggerCondition::LessThan,
                0.5,
            ))
            .await
            .unwrap();
        metrics
            .record_snapshot(
                &MetricContext::new("content", "engagement"),
                &MetricSnapshot::new(0.3, Utc::now()),
            )
            .await
            .unwrap();

        let report = BatchScheduler::run_once(&engine).await;
        assert_eq!(report.checks.unwrap().completed, 1);
        // The completed action is learned from in the same tick.
        assert_eq!(report.learned, Some(1));
        assert!(report.insights_created.is_some());
    }

    #[tokio::test]
    async fn test_run_context() {
        let (engine, _) = engine().await;
        let ctx = MetricContext::new("content", "engagement");
        let (checks, analyses) = BatchScheduler::run_context(&engine, &ctx).await.unwrap();
        assert_eq!(checks.evaluated, 0);
        assert!(analyses.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let (engine, _) = engine().await;
        let (tx, rx) = watch::channel(false);
        let handle = BatchScheduler::spawn(Arc::clone(&engine), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(*engine.shutdown_signal().borrow());
    }

    struct SlowExecutor;

    #[async_trait::async_trait]
    impl crate::engine::registry::ActionExecutor for SlowExecutor {
        async fn execute(
            &self,
            _request: &crate::engine::registry::ActionRequest,
        ) -> Result<ExecutionOutcome, crate::error::ExecutorError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(ExecutionOutcome::default())
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_action_inside_tick() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let metrics = SqliteMetricSource::new(storage.pool().clone());
        let registry = Arc::new(ActionRegistry::with_default_catalog(Arc::new(SlowExecutor)));
        let engine = Arc::new(
            ActionEngine::new(
                storage,
                Arc::new(metrics.clone()),
                registry,
                EngineConfig::default(),
            )
            .unwrap(),
        );
        engine
            .create_rule(ActionRule::new(
                "low engagement",
                "content",
                "boost_engagement",
                "engagement",
                TriggerCondition::LessThan,
                0.5,
            ))
            .await
            .unwrap();
        metrics
            .record_snapshot(
                &MetricContext::new("content", "engagement"),
                &MetricSnapshot::new(0.3, Utc::now()),
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = BatchScheduler::spawn(Arc::clone(&engine), rx);

        // The first tick fires immediately and the action is now in flight.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stop_sent = std::time::Instant::now();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler waited for the action")
            .unwrap();
        assert!(stop_sent.elapsed() < Duration::from_secs(2));

        let logs = engine
            .list_action_logs(&Default::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, crate::engine::types::ActionStatus::Cancelled);
    }
}
