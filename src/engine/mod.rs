//! Adaptive performance-action engine.
//!
//! Watches per-context metric streams, fires corrective actions when rules
//! trip, and learns per-context weights from how those actions turned out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │ TRIGGER  │───▶│  RUNNER  │───▶│ FEEDBACK │───▶│ INSIGHTS │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//!      ▲                                               │
//!      └──────────────── BatchScheduler ◀──────────────┘
//! ```
//!
//! ## Trigger
//! - Threshold, equality and percent-change conditions
//! - Consecutive-breach streaks within a time window
//! - Per-context cooldowns and priority arbitration
//!
//! ## Runner
//! - Registry validation before any log is written
//! - Per-attempt timeout, exponential backoff, one fallback
//!
//! ## Feedback
//! - Versioned weights updated by compare-and-swap
//! - Rollback to the previous version when an action fails
//!
//! ## Insights
//! - Performance, trend and engagement patterns over learning history
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use perf_action_engine::engine::{
//!     ActionEngine, ActionRegistry, EngineConfig, SqliteMetricSource, WebhookExecutor,
//! };
//!
//! let executor = Arc::new(WebhookExecutor::new(&config.webhook)?);
//! let registry = Arc::new(ActionRegistry::with_default_catalog(executor));
//! let metrics = Arc::new(SqliteMetricSource::new(storage.pool().clone()));
//! let engine = ActionEngine::new(Arc::new(storage), metrics, registry, EngineConfig::from_env())?;
//! let summary = engine.run_action_checks(None, None, false).await?;
//! ```

pub mod cli;
pub mod config;
pub mod insights;
pub mod learner;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod system;
pub mod trigger;
pub mod types;
pub mod webhook;

// Re-export main types for convenience
pub use cli::{execute_command, CliResult, EngineCommands};
pub use config::{
    EngineConfig, InsightConfig, LearningConfig, RunnerConfig, SchedulerConfig, TriggerConfig,
};
pub use insights::{ContextStats, InsightGenerator, InsightReport};
pub use learner::{
    BatchLearningSummary, FeedbackAnalysis, FeedbackEngine, Recommendation, WeightAdjustment,
};
pub use metrics::{MetricSource, SqliteMetricSource};
pub use registry::{
    ActionCapability, ActionExecutor, ActionRegistry, ActionRequest, ExecutionOutcome,
    ParamBounds, ResolvedAction, RetryPolicy,
};
pub use runner::{ActionPlan, ActionRunner, RunOutcome};
pub use scheduler::{BatchScheduler, TickReport};
pub use system::{ActionEngine, ActionResult, CheckRecord, CheckSummary, DEFAULT_METRIC_TYPE};
pub use trigger::{DecisionReason, TriggerDecision, TriggerEvaluator};
pub use types::{
    ActionConfig, ActionLog, ActionLogId, ActionRule, ActionStatus, ImpactMetrics, InsightId,
    InsightPriority, InsightStatus, InsightType, LearningInsight, LearningLog, LearningLogId,
    LearningTrigger, LearningType, MetricContext, MetricSnapshot, MetricWeight, ParamValue,
    PerformanceLevel, RuleId, RuleScope, TriggerCondition, WeightId,
};
pub use webhook::WebhookExecutor;
