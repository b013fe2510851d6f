//! Core types for the action engine.
//!
//! This module defines the entities the control loop reads and writes:
//! - [`ActionRule`]: standing "if metric crosses threshold, run action" policy
//! - [`ActionLog`]: one action execution including its retries
//! - [`MetricWeight`]: an immutable version of a context's learned weight
//! - [`LearningLog`]: one weight-adjustment (or rollback) event
//! - [`LearningInsight`]: a derived, human-confirmed recommendation
//!
//! Status enums own their transition tables so every caller enforces the
//! same monotonic lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::LearningConfig;
use crate::error::{EngineError, EngineResult};

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new unique identifier.
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), uuid::Uuid::new_v4()))
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

entity_id!(
    /// Unique identifier for an action rule.
    RuleId,
    "rule"
);
entity_id!(
    /// Unique identifier for an action log.
    ActionLogId,
    "action"
);
entity_id!(
    /// Unique identifier for one metric weight version.
    WeightId,
    "weight"
);
entity_id!(
    /// Unique identifier for a learning log entry.
    LearningLogId,
    "learning"
);
entity_id!(
    /// Unique identifier for a learning insight.
    InsightId,
    "insight"
);

// ============================================================================
// Metric Context
// ============================================================================

/// Identifies one metric stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct MetricContext {
    /// Agent kind the metric belongs to (e.g. "content", "ad", "seo")
    pub agent_kind: String,
    /// Metric type (e.g. "engagement", "ctr")
    pub metric_type: String,
    /// Optional metric subtype
    pub metric_subtype: Option<String>,
    /// Optional category
    pub category: Option<String>,
    /// Optional campaign scope
    pub campaign_id: Option<String>,
    /// Optional region scope
    pub region: Option<String>,
    /// Optional platform scope
    pub platform: Option<String>,
}

impl MetricContext {
    /// Create a context for an agent kind and metric type.
    pub fn new(agent_kind: impl Into<String>, metric_type: impl Into<String>) -> Self {
        Self {
            agent_kind: agent_kind.into(),
            metric_type: metric_type.into(),
            ..Default::default()
        }
    }

    /// Set the metric subtype.
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.metric_subtype = Some(subtype.into());
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the campaign scope.
    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    /// Set the region scope.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the platform scope.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Canonical key used for storage, grouping and per-context locking.
    ///
    /// Absent parts render as `*` so `campaign=None` never collides with a
    /// campaign literally named "".
    pub fn key(&self) -> String {
        fn part(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("*")
        }
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.agent_kind,
            self.metric_type,
            part(&self.metric_subtype),
            part(&self.category),
            part(&self.campaign_id),
            part(&self.region),
            part(&self.platform),
        )
    }
}

impl std::fmt::Display for MetricContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

// ============================================================================
// Metric Snapshot
// ============================================================================

/// Point-in-time observation of a metric context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSnapshot {
    /// Current value
    pub value: f64,
    /// Value of the previous observation, if known
    pub previous_value: Option<f64>,
    /// When the value was observed
    pub timestamp: DateTime<Utc>,
    /// Number of raw samples aggregated into this value
    pub sample_count: u64,
}

impl MetricSnapshot {
    /// Create a new snapshot.
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            previous_value: None,
            timestamp,
            sample_count: 1,
        }
    }

    /// Set the previous value.
    pub fn with_previous(mut self, previous: f64) -> Self {
        self.previous_value = Some(previous);
        self
    }

    /// Set the sample count.
    pub fn with_samples(mut self, sample_count: u64) -> Self {
        self.sample_count = sample_count;
        self
    }

    /// Signed percent change from the previous value.
    ///
    /// `None` when there is no previous value or it is zero.
    pub fn change_percent(&self) -> Option<f64> {
        match self.previous_value {
            Some(prev) if prev != 0.0 => Some((self.value - prev) / prev * 100.0),
            _ => None,
        }
    }
}

// ============================================================================
// Trigger Condition
// ============================================================================

/// Comparison a rule applies to a metric snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Value strictly above threshold
    GreaterThan,
    /// Value strictly below threshold
    LessThan,
    /// Value within epsilon of threshold
    Equals,
    /// Percent change from previous value crosses the signed threshold
    ChangePercent,
}

impl TriggerCondition {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::GreaterThan => "greater_than",
            TriggerCondition::LessThan => "less_than",
            TriggerCondition::Equals => "equals",
            TriggerCondition::ChangePercent => "change_percent",
        }
    }
}

impl std::fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TriggerCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "greater_than" => Ok(TriggerCondition::GreaterThan),
            "less_than" => Ok(TriggerCondition::LessThan),
            "equals" => Ok(TriggerCondition::Equals),
            "change_percent" => Ok(TriggerCondition::ChangePercent),
            _ => Err(format!("Unknown trigger condition: {}", s)),
        }
    }
}

// ============================================================================
// Typed Action Configuration
// ============================================================================

/// Parameter value types accepted in an action's extra parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Duration in milliseconds
    DurationMs(u64),
    /// Boolean value
    Boolean(bool),
}

impl ParamValue {
    /// Get as float, if applicable.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as string slice, if applicable.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{:.4}", v),
            ParamValue::String(v) => write!(f, "\"{}\"", v),
            ParamValue::DurationMs(v) => write!(f, "{}ms", v),
            ParamValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// Typed configuration attached to rules and action invocations.
///
/// The named fields are the options every executor understands; anything
/// executor-specific goes in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionConfig {
    /// Metric type the action is meant to move (manual triggers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    /// Relative strength of the action (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    /// Budget change in account currency (negative reduces)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_delta: Option<f64>,
    /// Metric value the action aims for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<f64>,
    /// Retry override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Per-attempt timeout override (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Executor-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, ParamValue>,
}

impl ActionConfig {
    /// Add an executor-specific parameter.
    pub fn with_extra(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether a named parameter is present, either as a typed option or in `extra`.
    pub fn has_param(&self, name: &str) -> bool {
        match name {
            "metric_type" => self.metric_type.is_some(),
            "intensity" => self.intensity.is_some(),
            "budget_delta" => self.budget_delta.is_some(),
            "target_value" => self.target_value.is_some(),
            "max_retries" => self.max_retries.is_some(),
            "timeout_ms" => self.timeout_ms.is_some(),
            other => self.extra.contains_key(other),
        }
    }
}

// ============================================================================
// Action Rule
// ============================================================================

/// Scope filters; an empty list matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuleScope {
    /// Campaigns the rule applies to
    #[serde(default)]
    pub campaign_ids: Vec<String>,
    /// Regions the rule applies to
    #[serde(default)]
    pub regions: Vec<String>,
    /// Platforms the rule applies to
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl RuleScope {
    /// Check whether a context falls inside this scope.
    pub fn matches(&self, context: &MetricContext) -> bool {
        fn allowed(filter: &[String], value: &Option<String>) -> bool {
            filter.is_empty()
                || value
                    .as_ref()
                    .map(|v| filter.iter().any(|f| f == v))
                    .unwrap_or(false)
        }
        allowed(&self.campaign_ids, &context.campaign_id)
            && allowed(&self.regions, &context.region)
            && allowed(&self.platforms, &context.platform)
    }
}

/// Standing policy: when the metric crosses the threshold, run the action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRule {
    /// Unique rule identifier
    pub id: RuleId,
    /// Human-readable name
    pub name: String,
    /// Agent kind the action targets
    pub agent_kind: String,
    /// Action kind to run
    pub action_kind: String,
    /// Metric type watched
    pub metric_type: String,
    /// Optional metric subtype
    pub metric_subtype: Option<String>,
    /// Optional metric category
    pub metric_category: Option<String>,
    /// Condition applied to the snapshot
    pub condition: TriggerCondition,
    /// Threshold for the condition
    pub threshold: f64,
    /// Window consecutive breaches must fall in (seconds, 0 = engine default)
    pub time_window_secs: u64,
    /// Consecutive qualifying snapshots required before firing
    pub consecutive_count: u32,
    /// Minimum time between two firings for one context (seconds)
    pub cooldown_secs: u64,
    /// Higher priority wins when several rules fire for one context
    pub priority: i32,
    /// Retry override (falls back to the registry's retry policy)
    pub max_retries: Option<u32>,
    /// Whether the rule is evaluated at all
    pub enabled: bool,
    /// Campaign/region/platform filters
    pub scope: RuleScope,
    /// Fallback override (falls back to the registry entry)
    pub fallback_action_kind: Option<String>,
    /// Configuration handed to the executor
    pub action_config: ActionConfig,
    /// When the rule was created
    pub created_at: DateTime<Utc>,
    /// When the rule was last changed
    pub updated_at: DateTime<Utc>,
    /// When the rule last dispatched an action
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl ActionRule {
    /// Create an enabled rule with a single-breach trigger and no cooldown.
    pub fn new(
        name: impl Into<String>,
        agent_kind: impl Into<String>,
        action_kind: impl Into<String>,
        metric_type: impl Into<String>,
        condition: TriggerCondition,
        threshold: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId::new(),
            name: name.into(),
            agent_kind: agent_kind.into(),
            action_kind: action_kind.into(),
            metric_type: metric_type.into(),
            metric_subtype: None,
            metric_category: None,
            condition,
            threshold,
            time_window_secs: 0,
            consecutive_count: 1,
            cooldown_secs: 0,
            priority: 0,
            max_retries: None,
            enabled: true,
            scope: RuleScope::default(),
            fallback_action_kind: None,
            action_config: ActionConfig::default(),
            created_at: now,
            updated_at: now,
            last_triggered_at: None,
        }
    }

    /// Set the cooldown period.
    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    /// Set the consecutive-breach requirement.
    pub fn with_consecutive(mut self, count: u32, window_secs: u64) -> Self {
        self.consecutive_count = count;
        self.time_window_secs = window_secs;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the scope filters.
    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    /// Context this rule watches, before campaign/region/platform expansion.
    pub fn base_context(&self) -> MetricContext {
        MetricContext {
            agent_kind: self.agent_kind.clone(),
            metric_type: self.metric_type.clone(),
            metric_subtype: self.metric_subtype.clone(),
            category: self.metric_category.clone(),
            campaign_id: None,
            region: None,
            platform: None,
        }
    }

    /// Whether the rule watches the given context.
    pub fn applies_to(&self, context: &MetricContext) -> bool {
        self.enabled
            && self.agent_kind == context.agent_kind
            && self.metric_type == context.metric_type
            && self.metric_subtype == context.metric_subtype
            && self.metric_category == context.category
            && self.scope.matches(context)
    }

    /// Structural checks that do not need the registry.
    pub fn check_shape(&self) -> EngineResult<()> {
        let invalid = |reason: &str| EngineError::InvalidRule {
            rule_id: self.id.to_string(),
            reason: reason.to_string(),
        };
        if self.agent_kind.trim().is_empty() {
            return Err(invalid("agent kind is empty"));
        }
        if self.action_kind.trim().is_empty() {
            return Err(invalid("action kind is empty"));
        }
        if self.metric_type.trim().is_empty() {
            return Err(invalid("metric type is empty"));
        }
        if self.consecutive_count == 0 {
            return Err(invalid("consecutive count must be at least 1"));
        }
        if !self.threshold.is_finite() {
            return Err(invalid("threshold must be finite"));
        }
        if self.fallback_action_kind.as_deref() == Some(self.action_kind.as_str()) {
            return Err(invalid("fallback action cannot be the action itself"));
        }
        Ok(())
    }
}

// ============================================================================
// Action Status and Log
// ============================================================================

/// Lifecycle of an action log.
///
/// ```text
/// PENDING → RUNNING → {COMPLETED, FAILED, CANCELLED}
///    ↑         │
///    └─ retry ─┘
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Created or waiting for its next attempt
    Pending,
    /// Attempt in flight
    Running,
    /// Executor reported success
    Completed,
    /// Retries exhausted
    Failed,
    /// Rejected by the executor or stopped by shutdown
    Cancelled,
}

impl ActionStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }

    /// Allowed transitions.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ActionStatus::Pending),
            "running" => Ok(ActionStatus::Running),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            "cancelled" => Ok(ActionStatus::Cancelled),
            _ => Err(format!("Unknown action status: {}", s)),
        }
    }
}

/// Before/after deltas computed by the engine once an action completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImpactMetrics {
    /// Metric value that triggered the action
    pub pre_value: f64,
    /// Value the executor observed after acting, if it reported one
    pub post_value: Option<f64>,
    /// `post - pre`
    pub absolute_change: Option<f64>,
    /// `(post - pre) / |pre| * 100`
    pub percent_change: Option<f64>,
}

impl ImpactMetrics {
    /// Compute deltas from the pre and (optional) post values.
    pub fn compute(pre_value: f64, post_value: Option<f64>) -> Self {
        let absolute_change = post_value.map(|post| post - pre_value);
        let percent_change = match (absolute_change, pre_value) {
            (Some(delta), pre) if pre != 0.0 => Some(delta / pre.abs() * 100.0),
            _ => None,
        };
        Self {
            pre_value,
            post_value,
            absolute_change,
            percent_change,
        }
    }
}

/// One execution of an action, including its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionLog {
    /// Unique log identifier
    pub id: ActionLogId,
    /// Rule that fired it (None for manual triggers)
    pub rule_id: Option<RuleId>,
    /// Agent kind targeted
    pub agent_kind: String,
    /// Action kind run
    pub action_kind: String,
    /// Metric context the action is meant to move
    pub context: MetricContext,
    /// Metric value at trigger time
    pub trigger_value: f64,
    /// Current lifecycle status
    pub status: ActionStatus,
    /// Priority inherited from the rule
    pub priority: i32,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Retries allowed
    pub max_retries: u32,
    /// Configuration handed to the executor
    pub config: ActionConfig,
    /// Last failure reason, if any
    pub error_message: Option<String>,
    /// Engine-computed deltas (set on completion)
    pub impact_metrics: Option<ImpactMetrics>,
    /// Executor-provided state for reversing the action
    pub rollback_data: Option<serde_json::Value>,
    /// Failed log this fallback was issued for
    pub parent_id: Option<ActionLogId>,
    /// When the log was created
    pub created_at: DateTime<Utc>,
    /// When the first attempt started
    pub executed_at: Option<DateTime<Utc>>,
    /// When the log reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionLog {
    /// Create a pending log.
    pub fn new(
        agent_kind: impl Into<String>,
        action_kind: impl Into<String>,
        context: MetricContext,
        trigger_value: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: ActionLogId::new(),
            rule_id: None,
            agent_kind: agent_kind.into(),
            action_kind: action_kind.into(),
            context,
            trigger_value,
            status: ActionStatus::Pending,
            priority: 0,
            retry_count: 0,
            max_retries,
            config: ActionConfig::default(),
            error_message: None,
            impact_metrics: None,
            rollback_data: None,
            parent_id: None,
            created_at: Utc::now(),
            executed_at: None,
            completed_at: None,
        }
    }

    /// Campaign the action ran against.
    pub fn campaign_id(&self) -> Option<&str> {
        self.context.campaign_id.as_deref()
    }

    /// Whether this log is a fallback for an earlier failure.
    pub fn is_fallback(&self) -> bool {
        self.parent_id.is_some()
    }

    fn transition(&mut self, next: ActionStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "action log",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// PENDING → RUNNING.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(ActionStatus::Running)?;
        if self.executed_at.is_none() {
            self.executed_at = Some(now);
        }
        Ok(())
    }

    /// RUNNING → COMPLETED.
    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        impact: ImpactMetrics,
        rollback_data: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        self.transition(ActionStatus::Completed)?;
        self.completed_at = Some(now);
        self.impact_metrics = Some(impact);
        self.rollback_data = rollback_data;
        self.error_message = None;
        Ok(())
    }

    /// Whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// RUNNING → PENDING, consuming one retry.
    pub fn schedule_retry(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        if !self.can_retry() {
            return Err(EngineError::InvalidTransition {
                entity: "action log",
                id: self.id.to_string(),
                from: format!("{} (retries exhausted)", self.status),
                to: ActionStatus::Pending.to_string(),
            });
        }
        self.transition(ActionStatus::Pending)?;
        self.retry_count += 1;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// RUNNING → FAILED. Only allowed once every retry is spent.
    pub fn fail(&mut self, now: DateTime<Utc>, reason: impl Into<String>) -> EngineResult<()> {
        if self.can_retry() {
            return Err(EngineError::InvalidTransition {
                entity: "action log",
                id: self.id.to_string(),
                from: format!(
                    "{} ({}/{} retries used)",
                    self.status, self.retry_count, self.max_retries
                ),
                to: ActionStatus::Failed.to_string(),
            });
        }
        self.transition(ActionStatus::Failed)?;
        self.completed_at = Some(now);
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// PENDING|RUNNING → CANCELLED.
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: impl Into<String>) -> EngineResult<()> {
        self.transition(ActionStatus::Cancelled)?;
        self.completed_at = Some(now);
        self.error_message = Some(reason.into());
        Ok(())
    }
}

// ============================================================================
// Metric Weight
// ============================================================================

/// One immutable version of a context's learned weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricWeight {
    /// Unique version identifier
    pub id: WeightId,
    /// Context the weight belongs to
    pub context: MetricContext,
    /// Learned importance, bounded by the learning config
    pub weight: f64,
    /// Learned threshold
    pub threshold: f64,
    /// Confidence in this version (0.0 - 1.0)
    pub confidence: f64,
    /// Version number, starting at 1
    pub version: i64,
    /// Smoothed performance score (0 - 100)
    pub performance_score: f64,
    /// When the weight was last adjusted
    pub last_adjusted_at: Option<DateTime<Utc>>,
    /// Version this one was derived from
    pub previous_version_id: Option<WeightId>,
    /// Whether this is the context's current version
    pub is_active: bool,
    /// When the version was written
    pub created_at: DateTime<Utc>,
}

impl MetricWeight {
    /// First version for a context.
    pub fn initial(context: MetricContext, threshold: f64, config: &LearningConfig) -> Self {
        Self {
            id: WeightId::new(),
            context,
            weight: config.initial_weight,
            threshold,
            confidence: 0.0,
            version: 1,
            performance_score: 50.0,
            last_adjusted_at: None,
            previous_version_id: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Derive the next version from this one.
    ///
    /// `version` is supplied by the caller because the next number is one
    /// past the context's highest version, which after a rollback is not
    /// necessarily `self.version + 1`.
    pub fn successor(
        &self,
        version: i64,
        weight: f64,
        confidence: f64,
        performance_score: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WeightId::new(),
            context: self.context.clone(),
            weight,
            threshold: self.threshold,
            confidence: confidence.clamp(0.0, 1.0),
            version,
            performance_score: performance_score.clamp(0.0, 100.0),
            last_adjusted_at: Some(now),
            previous_version_id: Some(self.id.clone()),
            is_active: true,
            created_at: now,
        }
    }
}

// ============================================================================
// Learning Log
// ============================================================================

/// What started a learning event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningTrigger {
    /// A single action outcome
    ActionOutcome,
    /// An on-demand batch run
    Batch,
    /// A scheduler tick
    Scheduled,
}

impl LearningTrigger {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningTrigger::ActionOutcome => "action_outcome",
            LearningTrigger::Batch => "batch",
            LearningTrigger::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for LearningTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LearningTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "action_outcome" => Ok(LearningTrigger::ActionOutcome),
            "batch" => Ok(LearningTrigger::Batch),
            "scheduled" => Ok(LearningTrigger::Scheduled),
            _ => Err(format!("Unknown learning trigger: {}", s)),
        }
    }
}

/// What a learning event did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    /// A new weight version was written
    WeightAdjustment,
    /// The previous weight version was restored
    Rollback,
    /// Analysis recorded without changing the weight
    InsufficientData,
}

impl LearningType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningType::WeightAdjustment => "weight_adjustment",
            LearningType::Rollback => "rollback",
            LearningType::InsufficientData => "insufficient_data",
        }
    }
}

impl std::fmt::Display for LearningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LearningType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weight_adjustment" => Ok(LearningType::WeightAdjustment),
            "rollback" => Ok(LearningType::Rollback),
            "insufficient_data" => Ok(LearningType::InsufficientData),
            _ => Err(format!("Unknown learning type: {}", s)),
        }
    }
}

/// Record of one weight-adjustment event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningLog {
    /// Unique identifier
    pub id: LearningLogId,
    /// Context learned about
    pub context: MetricContext,
    /// Originating action log
    pub action_log_id: Option<ActionLogId>,
    /// What started the event
    pub trigger_type: LearningTrigger,
    /// What the event did
    pub learning_type: LearningType,
    /// Weight before
    pub previous_value: f64,
    /// Weight after
    pub new_value: f64,
    /// Learning rate applied
    pub learning_rate: f64,
    /// Confidence of the analysis
    pub confidence: f64,
    /// Measured improvement ratio
    pub actual_improvement: Option<f64>,
    /// Whether the analysis passed the sample/confidence gates
    pub validated: bool,
    /// Whether a previous weight version was restored
    pub rolled_back: bool,
    /// Weight version produced or restored
    pub weight_id: Option<WeightId>,
    /// Version number of `weight_id`
    pub weight_version: Option<i64>,
    /// When the event was recorded
    pub created_at: DateTime<Utc>,
}

impl LearningLog {
    /// Performance score (0 - 100) implied by this event's improvement.
    pub fn performance_score(&self) -> Option<f64> {
        self.actual_improvement.map(performance_score)
    }
}

/// Map an improvement ratio onto a 0 - 100 performance score.
pub fn performance_score(improvement: f64) -> f64 {
    if !improvement.is_finite() {
        return if improvement > 0.0 { 100.0 } else { 0.0 };
    }
    (50.0 + 50.0 * improvement).clamp(0.0, 100.0)
}

/// Coarse performance bands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    /// Below 20
    Critical = 0,
    /// 20 - 40
    Poor = 1,
    /// 40 - 60
    Average = 2,
    /// 60 - 80
    Good = 3,
    /// 80 and above
    Excellent = 4,
}

impl PerformanceLevel {
    /// Band for a 0 - 100 score.
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 80.0 => PerformanceLevel::Excellent,
            s if s >= 60.0 => PerformanceLevel::Good,
            s if s >= 40.0 => PerformanceLevel::Average,
            s if s >= 20.0 => PerformanceLevel::Poor,
            _ => PerformanceLevel::Critical,
        }
    }

    /// Whether the band needs attention.
    pub fn is_poor_or_worse(&self) -> bool {
        *self <= PerformanceLevel::Poor
    }
}

// ============================================================================
// Learning Insight
// ============================================================================

/// Category of insight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    /// Average performance below the floor
    Performance,
    /// Too many decreasing observations
    Trend,
    /// A metric type clustering at poor/critical performance
    Engagement,
}

impl InsightType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Performance => "performance",
            InsightType::Trend => "trend",
            InsightType::Engagement => "engagement",
        }
    }
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "performance" => Ok(InsightType::Performance),
            "trend" => Ok(InsightType::Trend),
            "engagement" => Ok(InsightType::Engagement),
            _ => Err(format!("Unknown insight type: {}", s)),
        }
    }
}

/// Insight priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum InsightPriority {
    /// Informational
    Low = 0,
    /// Worth a look
    Medium = 1,
    /// Needs attention
    High = 2,
}

impl InsightPriority {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightPriority::Low => "low",
            InsightPriority::Medium => "medium",
            InsightPriority::High => "high",
        }
    }
}

impl std::fmt::Display for InsightPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InsightPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(InsightPriority::Low),
            "medium" => Ok(InsightPriority::Medium),
            "high" => Ok(InsightPriority::High),
            _ => Err(format!("Unknown insight priority: {}", s)),
        }
    }
}

/// Lifecycle of an insight. Every move past PENDING is a human decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    /// Generated, awaiting review
    Pending,
    /// Confirmed by a reviewer
    Validated,
    /// Acted upon
    Implemented,
    /// Set aside
    Archived,
}

impl InsightStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::Pending => "pending",
            InsightStatus::Validated => "validated",
            InsightStatus::Implemented => "implemented",
            InsightStatus::Archived => "archived",
        }
    }

    /// Allowed transitions.
    pub fn can_transition_to(&self, next: InsightStatus) -> bool {
        use InsightStatus::*;
        matches!(
            (self, next),
            (Pending, Validated) | (Validated, Implemented) | (Pending, Archived) | (Validated, Archived)
        )
    }
}

impl std::fmt::Display for InsightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InsightStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(InsightStatus::Pending),
            "validated" => Ok(InsightStatus::Validated),
            "implemented" => Ok(InsightStatus::Implemented),
            "archived" => Ok(InsightStatus::Archived),
            _ => Err(format!("Unknown insight status: {}", s)),
        }
    }
}

/// Derived, user-facing recommendation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningInsight {
    /// Unique identifier
    pub id: InsightId,
    /// Context key the insight was derived from
    pub context_key: String,
    /// Agent kind of that context
    pub agent_kind: String,
    /// Metric type tag
    pub metric_type: Option<String>,
    /// Category
    pub insight_type: InsightType,
    /// Priority
    pub priority: InsightPriority,
    /// Estimated impact (0.0 - 1.0)
    pub impact: f64,
    /// Short title
    pub title: String,
    /// What was observed
    pub description: String,
    /// What to do about it
    pub recommendation: String,
    /// Lifecycle status
    pub status: InsightStatus,
    /// Confidence (0.0 - 1.0)
    pub confidence: f64,
    /// Parent insight (write-once)
    pub parent_id: Option<InsightId>,
    /// Hidden from default listings
    pub dismissed: bool,
    /// When generated
    pub created_at: DateTime<Utc>,
    /// When validated
    pub validated_at: Option<DateTime<Utc>>,
    /// When implemented
    pub implemented_at: Option<DateTime<Utc>>,
    /// When archived
    pub archived_at: Option<DateTime<Utc>>,
}

impl LearningInsight {
    fn transition(&mut self, next: InsightStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "insight",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// PENDING → VALIDATED.
    pub fn validate(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(InsightStatus::Validated)?;
        self.validated_at.get_or_insert(now);
        Ok(())
    }

    /// VALIDATED → IMPLEMENTED.
    pub fn implement(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(InsightStatus::Implemented)?;
        self.implemented_at.get_or_insert(now);
        Ok(())
    }

    /// PENDING|VALIDATED → ARCHIVED.
    pub fn archive(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(InsightStatus::Archived)?;
        self.archived_at.get_or_insert(now);
        Ok(())
    }
}
