//! Action capability registry.
//!
//! The registry is the catalog that maps an action kind to everything the
//! engine needs to run it: the agent kinds it may target, the parameters it
//! requires, bounds on numeric parameters, its default retry policy, an
//! optional fallback action kind, and the executor that performs it.
//!
//! Every action passes [`ActionRegistry::validate`] before an action log is
//! created, so unknown kinds and incompatible agents never reach the runner.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{ActionConfig, ActionLogId, MetricContext};
use crate::error::{ExecutorError, RegistryError, RegistryResult};

// ============================================================================
// Executor Interface
// ============================================================================

/// Everything an executor needs to perform one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRequest {
    /// Log the attempt belongs to
    pub action_log_id: ActionLogId,
    /// Action kind to perform
    pub action_kind: String,
    /// Agent kind targeted
    pub agent_kind: String,
    /// Metric context being corrected
    pub context: MetricContext,
    /// Metric value at trigger time
    pub trigger_value: f64,
    /// Effective action configuration
    pub config: ActionConfig,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Whether this is a fallback for a failed action
    pub is_fallback: bool,
}

/// What an executor reports on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    /// Metric value the agent observed right after acting, if any
    #[serde(default)]
    pub post_value: Option<f64>,
    /// Opaque state needed to reverse the action
    #[serde(default)]
    pub rollback_data: Option<serde_json::Value>,
    /// Free-form note from the agent
    #[serde(default)]
    pub message: Option<String>,
}

/// Performs actions against agents.
///
/// Implementations must be idempotent per `action_log_id`: the engine
/// delivers at-least-once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform one attempt.
    async fn execute(&self, request: &ActionRequest) -> Result<ExecutionOutcome, ExecutorError>;
}

// ============================================================================
// Capabilities
// ============================================================================

/// Default retry behaviour of an action kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Per-attempt timeout (milliseconds)
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Per-attempt timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Inclusive bounds for a numeric parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ParamBounds {
    /// Minimum allowed value
    pub min: f64,
    /// Maximum allowed value
    pub max: f64,
}

impl ParamBounds {
    /// Create new bounds.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Static description of an action kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCapability {
    /// Action kind this capability describes
    pub action_kind: String,
    /// Human-readable description
    pub description: String,
    /// Agent kinds the action may target
    pub compatible_agents: HashSet<String>,
    /// Parameters that must be present
    pub required_params: Vec<String>,
    /// Parameters that may be present
    pub optional_params: Vec<String>,
    /// Bounds for numeric parameters
    pub param_bounds: HashMap<String, ParamBounds>,
    /// Default retry policy
    pub retry_policy: RetryPolicy,
    /// Action to try once when retries are exhausted
    pub fallback_action_kind: Option<String>,
}

impl ActionCapability {
    /// Create a capability for the given agent kinds.
    pub fn new(action_kind: &str, description: &str, agents: &[&str]) -> Self {
        Self {
            action_kind: action_kind.to_string(),
            description: description.to_string(),
            compatible_agents: agents.iter().map(|a| a.to_string()).collect(),
            required_params: Vec::new(),
            optional_params: Vec::new(),
            param_bounds: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            fallback_action_kind: None,
        }
    }

    /// Require a parameter.
    pub fn requires(mut self, param: &str) -> Self {
        self.required_params.push(param.to_string());
        self
    }

    /// Accept an optional parameter.
    pub fn accepts(mut self, param: &str) -> Self {
        self.optional_params.push(param.to_string());
        self
    }

    /// Bound a numeric parameter.
    pub fn bounded(mut self, param: &str, min: f64, max: f64) -> Self {
        self.param_bounds
            .insert(param.to_string(), ParamBounds::new(min, max));
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, max_retries: u32, timeout_ms: u64) -> Self {
        self.retry_policy = RetryPolicy {
            max_retries,
            timeout_ms,
        };
        self
    }

    /// Set the fallback action kind.
    pub fn with_fallback(mut self, fallback: &str) -> Self {
        self.fallback_action_kind = Some(fallback.to_string());
        self
    }

    /// Whether the action may target the agent kind.
    pub fn supports_agent(&self, agent_kind: &str) -> bool {
        self.compatible_agents.contains(agent_kind)
    }

    fn check_params(&self, config: &ActionConfig) -> RegistryResult<()> {
        for param in &self.required_params {
            if !config.has_param(param) {
                return Err(RegistryError::MissingParameter {
                    action_kind: self.action_kind.clone(),
                    param: param.clone(),
                });
            }
        }

        for (param, bounds) in &self.param_bounds {
            let value = match param.as_str() {
                "intensity" => config.intensity,
                "budget_delta" => config.budget_delta,
                "target_value" => config.target_value,
                other => config.extra.get(other).and_then(|v| v.as_float()),
            };
            if let Some(value) = value {
                if !bounds.contains(value) {
                    return Err(RegistryError::ParameterOutOfBounds {
                        action_kind: self.action_kind.clone(),
                        param: param.clone(),
                        value,
                        min: bounds.min,
                        max: bounds.max,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A capability together with the executor that performs it.
#[derive(Clone)]
pub struct ResolvedAction {
    /// Capability description
    pub capability: ActionCapability,
    /// Executor handle
    pub executor: Arc<dyn ActionExecutor>,
}

impl fmt::Debug for ResolvedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAction")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Catalog of runnable actions.
///
/// Constructed once and shared as `Arc<ActionRegistry>`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ResolvedAction>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.actions.keys().collect();
        kinds.sort();
        f.debug_struct("ActionRegistry")
            .field("action_kinds", &kinds)
            .finish()
    }
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the marketing action catalog, all performed
    /// by one executor.
    ///
    /// | Action | Agents | Required | Fallback |
    /// |---|---|---|---|
    /// | `boost_engagement` | content, social | - | `refresh_content` |
    /// | `refresh_content` | content, social, seo | - | - |
    /// | `reduce_budget` | ad | `budget_delta` | `pause_campaign` |
    /// | `increase_budget` | ad | `budget_delta` | - |
    /// | `pause_campaign` | ad | - | - |
    /// | `adjust_targeting` | ad, social | - | - |
    pub fn with_default_catalog(executor: Arc<dyn ActionExecutor>) -> Self {
        let mut registry = Self::new();
        for capability in default_catalog() {
            // Catalog kinds are distinct, so registration cannot collide.
            let kind = capability.action_kind.clone();
            registry.actions.insert(
                kind,
                ResolvedAction {
                    capability,
                    executor: Arc::clone(&executor),
                },
            );
        }
        registry
    }

    /// Register an action kind.
    pub fn register(
        &mut self,
        capability: ActionCapability,
        executor: Arc<dyn ActionExecutor>,
    ) -> RegistryResult<()> {
        if self.actions.contains_key(&capability.action_kind) {
            return Err(RegistryError::DuplicateAction(capability.action_kind));
        }
        self.actions.insert(
            capability.action_kind.clone(),
            ResolvedAction {
                capability,
                executor,
            },
        );
        Ok(())
    }

    /// Look up an action kind.
    pub fn resolve(&self, action_kind: &str) -> RegistryResult<&ResolvedAction> {
        self.actions
            .get(action_kind)
            .ok_or_else(|| RegistryError::UnknownAction(action_kind.to_string()))
    }

    /// Registered action kinds, sorted.
    pub fn action_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.actions.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Check that `action_kind` exists, supports `agent_kind` and that
    /// `config` carries its required parameters within bounds.
    pub fn validate(
        &self,
        action_kind: &str,
        agent_kind: &str,
        config: &ActionConfig,
    ) -> RegistryResult<&ResolvedAction> {
        let resolved = self.resolve(action_kind)?;
        let capability = &resolved.capability;

        if !capability.supports_agent(agent_kind) {
            return Err(RegistryError::IncompatibleAgent {
                action_kind: action_kind.to_string(),
                agent_kind: agent_kind.to_string(),
            });
        }
        capability.check_params(config)?;

        if let Some(fallback) = &capability.fallback_action_kind {
            if !self.actions.contains_key(fallback) {
                return Err(RegistryError::UnknownFallback {
                    action_kind: action_kind.to_string(),
                    fallback: fallback.clone(),
                });
            }
        }
        Ok(resolved)
    }

    /// Fallback for an action: the override if given, else the catalog entry.
    pub fn fallback_for(&self, action_kind: &str, override_kind: Option<&str>) -> Option<String> {
        override_kind.map(str::to_string).or_else(|| {
            self.actions
                .get(action_kind)
                .and_then(|r| r.capability.fallback_action_kind.clone())
        })
    }
}

fn default_catalog() -> Vec<ActionCapability> {
    vec![
        ActionCapability::new(
            "boost_engagement",
            "Promote high-performing content to lift engagement",
            &["content", "social"],
        )
        .accepts("intensity")
        .accepts("target_value")
        .bounded("intensity", 0.0, 1.0)
        .with_retry(3, 30_000)
        .with_fallback("refresh_content"),
        ActionCapability::new(
            "refresh_content",
            "Regenerate stale content for the campaign",
            &["content", "social", "seo"],
        )
        .accepts("intensity")
        .bounded("intensity", 0.0, 1.0)
        .with_retry(2, 60_000),
        ActionCapability::new(
            "reduce_budget",
            "Lower spend on an underperforming campaign",
            &["ad"],
        )
        .requires("budget_delta")
        .bounded("budget_delta", -1_000_000.0, 0.0)
        .with_retry(3, 15_000)
        .with_fallback("pause_campaign"),
        ActionCapability::new(
            "increase_budget",
            "Raise spend on an outperforming campaign",
            &["ad"],
        )
        .requires("budget_delta")
        .bounded("budget_delta", 0.0, 1_000_000.0)
        .with_retry(3, 15_000),
        ActionCapability::new("pause_campaign", "Stop delivery of a campaign", &["ad"])
            .with_retry(5, 15_000),
        ActionCapability::new(
            "adjust_targeting",
            "Narrow or widen the audience of a campaign",
            &["ad", "social"],
        )
        .accepts("intensity")
        .accepts("target_value")
        .bounded("intensity", 0.0, 1.0)
        .with_retry(3, 30_000),
    ]
}
