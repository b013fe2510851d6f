//! Trigger evaluation.
//!
//! Decides whether a rule fires for a context given the latest snapshot:
//!
//! ```text
//! disabled? → out of scope? → cooldown? → condition → consecutive streak → FIRE
//! ```
//!
//! Streak and cooldown state is kept in memory per `(rule, context key)`.
//! Cooldowns are seeded from the rule's persisted `last_triggered_at` until
//! this process records its own fire for that rule.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::config::TriggerConfig;
use super::types::{ActionRule, MetricContext, MetricSnapshot, RuleId, TriggerCondition};

// ============================================================================
// Decisions
// ============================================================================

/// Why a rule did or did not fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionReason {
    /// Condition held (and the streak, if any, completed)
    ConditionMet {
        /// Observed value (percent change for `change_percent`)
        observed: f64,
        /// Rule threshold
        threshold: f64,
    },
    /// Condition did not hold
    ConditionNotMet {
        /// Observed value
        observed: f64,
        /// Rule threshold
        threshold: f64,
    },
    /// Not enough data to evaluate (no snapshot, or no usable previous value)
    InsufficientData,
    /// Condition held but the consecutive streak is not complete yet
    StreakBuilding {
        /// Qualifying snapshots so far
        current: u32,
        /// Qualifying snapshots required
        required: u32,
    },
    /// The rule fired for this context too recently
    CooldownActive {
        /// Seconds until the rule may fire again
        remaining_secs: u64,
    },
    /// Context falls outside the rule's scope filters
    OutOfScope,
    /// Rule is disabled
    RuleDisabled,
    /// A higher priority rule fired for the same context in this tick
    SupersededByPriority {
        /// Rule that won arbitration
        winner: RuleId,
    },
}

/// Outcome of evaluating one rule against one context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDecision {
    /// Whether the action should be dispatched
    pub fire: bool,
    /// Explanation
    pub reason: DecisionReason,
}

impl TriggerDecision {
    fn fire(observed: f64, threshold: f64) -> Self {
        Self {
            fire: true,
            reason: DecisionReason::ConditionMet {
                observed,
                threshold,
            },
        }
    }

    fn skip(reason: DecisionReason) -> Self {
        Self {
            fire: false,
            reason,
        }
    }
}

// ============================================================================
// Cooldown Tracker
// ============================================================================

/// Last fire time per `(rule, context key)`.
#[derive(Debug, Default)]
struct CooldownTracker {
    fired_at: HashMap<(RuleId, String), DateTime<Utc>>,
    /// Rules this process has fired at least once; their persisted
    /// `last_triggered_at` no longer applies to other contexts.
    observed_rules: HashSet<RuleId>,
}

impl CooldownTracker {
    fn last_fire(&self, rule: &ActionRule, key: &str) -> Option<DateTime<Utc>> {
        if let Some(at) = self.fired_at.get(&(rule.id.clone(), key.to_string())) {
            return Some(*at);
        }
        if self.observed_rules.contains(&rule.id) {
            None
        } else {
            rule.last_triggered_at
        }
    }

    fn remaining_secs(&self, rule: &ActionRule, key: &str, now: DateTime<Utc>) -> Option<u64> {
        if rule.cooldown_secs == 0 {
            return None;
        }
        let last = self.last_fire(rule, key)?;
        let cooldown_ms = rule.cooldown_secs.saturating_mul(1000) as i64;
        let elapsed_ms = (now - last).num_milliseconds();
        if elapsed_ms >= cooldown_ms {
            return None;
        }
        let remaining_ms = (cooldown_ms - elapsed_ms.max(0)) as u64;
        Some(remaining_ms.div_ceil(1000))
    }

    fn record(&mut self, rule_id: &RuleId, key: &str, at: DateTime<Utc>) {
        self.fired_at.insert((rule_id.clone(), key.to_string()), at);
        self.observed_rules.insert(rule_id.clone());
    }
}

// ============================================================================
// Streak Tracker
// ============================================================================

/// Consecutive qualifying snapshots for one `(rule, context key)`.
#[derive(Debug, Default, Clone)]
struct Streak {
    /// Timestamp of the last snapshot seen, qualifying or not
    last_seen: Option<DateTime<Utc>>,
    /// Timestamps of the current run of qualifying snapshots
    qualifying: VecDeque<DateTime<Utc>>,
}

enum StreakStep {
    Complete,
    Building(u32),
    Broken,
}

impl Streak {
    fn step(
        &mut self,
        qualifies: bool,
        at: DateTime<Utc>,
        window: chrono::Duration,
        required: u32,
    ) -> StreakStep {
        if self.last_seen == Some(at) {
            return StreakStep::Building(self.qualifying.len() as u32);
        }
        self.last_seen = Some(at);

        if !qualifies {
            self.qualifying.clear();
            return StreakStep::Broken;
        }

        self.qualifying.push_back(at);
        let cutoff = at - window;
        while self.qualifying.front().is_some_and(|t| *t < cutoff) {
            self.qualifying.pop_front();
        }

        let current = self.qualifying.len() as u32;
        if current >= required {
            self.qualifying.clear();
            StreakStep::Complete
        } else {
            StreakStep::Building(current)
        }
    }
}

#[derive(Debug, Default)]
struct EvaluatorState {
    cooldowns: CooldownTracker,
    streaks: HashMap<(RuleId, String), Streak>,
}

// ============================================================================
// Evaluator
// ============================================================================

/// Evaluates rules against metric snapshots.
#[derive(Debug)]
pub struct TriggerEvaluator {
    config: RwLock<TriggerConfig>,
    state: Mutex<EvaluatorState>,
}

impl TriggerEvaluator {
    /// Create an evaluator with empty streak and cooldown state.
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(EvaluatorState::default()),
        }
    }

    /// Replace the evaluator configuration.
    pub async fn update_config(&self, config: TriggerConfig) {
        *self.config.write().await = config;
    }

    /// Evaluate a rule, advancing its streak state.
    pub async fn evaluate(
        &self,
        rule: &ActionRule,
        context: &MetricContext,
        snapshot: Option<&MetricSnapshot>,
        now: DateTime<Utc>,
    ) -> TriggerDecision {
        self.decide(rule, context, snapshot, now, true).await
    }

    /// Evaluate a rule without touching streak state.
    pub async fn preview(
        &self,
        rule: &ActionRule,
        context: &MetricContext,
        snapshot: Option<&MetricSnapshot>,
        now: DateTime<Utc>,
    ) -> TriggerDecision {
        self.decide(rule, context, snapshot, now, false).await
    }

    /// Start the cooldown for a rule whose action was dispatched.
    pub async fn record_fire(&self, rule_id: &RuleId, context: &MetricContext, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.cooldowns.record(rule_id, &context.key(), at);
    }

    async fn decide(
        &self,
        rule: &ActionRule,
        context: &MetricContext,
        snapshot: Option<&MetricSnapshot>,
        now: DateTime<Utc>,
        commit: bool,
    ) -> TriggerDecision {
        let config = self.config.read().await.clone();

        if !rule.enabled {
            return TriggerDecision::skip(DecisionReason::RuleDisabled);
        }
        if !rule.applies_to(context) {
            return TriggerDecision::skip(DecisionReason::OutOfScope);
        }

        let key = context.key();
        let mut state = self.state.lock().await;

        if let Some(remaining_secs) = state.cooldowns.remaining_secs(rule, &key, now) {
            return TriggerDecision::skip(DecisionReason::CooldownActive { remaining_secs });
        }

        let Some(snapshot) = snapshot else {
            return TriggerDecision::skip(DecisionReason::InsufficientData);
        };

        let (observed, qualifies) = match check_condition(rule, snapshot, config.equals_epsilon) {
            Some(result) => result,
            None => {
                // A missing previous value breaks any streak in progress.
                if commit {
                    if let Some(streak) = state.streaks.get_mut(&(rule.id.clone(), key.clone())) {
                        streak.step(false, snapshot.timestamp, chrono::Duration::zero(), 1);
                    }
                }
                return TriggerDecision::skip(DecisionReason::InsufficientData);
            }
        };

        if rule.consecutive_count <= 1 {
            return if qualifies {
                TriggerDecision::fire(observed, rule.threshold)
            } else {
                TriggerDecision::skip(DecisionReason::ConditionNotMet {
                    observed,
                    threshold: rule.threshold,
                })
            };
        }

        let window_secs = if rule.time_window_secs > 0 {
            rule.time_window_secs
        } else {
            config.default_time_window_secs
        };
        let window = chrono::Duration::seconds(window_secs.min(i64::MAX as u64) as i64);
        let streak_key = (rule.id.clone(), key);

        let step = if commit {
            state
                .streaks
                .entry(streak_key)
                .or_default()
                .step(qualifies, snapshot.timestamp, window, rule.consecutive_count)
        } else {
            let mut scratch = state.streaks.get(&streak_key).cloned().unwrap_or_default();
            scratch.step(qualifies, snapshot.timestamp, window, rule.consecutive_count)
        };

        let decision = match step {
            StreakStep::Complete => TriggerDecision::fire(observed, rule.threshold),
            StreakStep::Building(current) => {
                TriggerDecision::skip(DecisionReason::StreakBuilding {
                    current,
                    required: rule.consecutive_count,
                })
            }
            StreakStep::Broken => TriggerDecision::skip(DecisionReason::ConditionNotMet {
                observed,
                threshold: rule.threshold,
            }),
        };

        debug!(
            rule_id = %rule.id,
            context = %context,
            fire = decision.fire,
            reason = ?decision.reason,
            "Rule evaluated"
        );
        decision
    }
}

/// Apply the rule's condition.
///
/// Returns the observed value and whether it qualifies, or `None` when a
/// `change_percent` rule has no usable previous value.
pub fn check_condition(
    rule: &ActionRule,
    snapshot: &MetricSnapshot,
    epsilon: f64,
) -> Option<(f64, bool)> {
    match rule.condition {
        TriggerCondition::GreaterThan => Some((snapshot.value, snapshot.value > rule.threshold)),
        TriggerCondition::LessThan => Some((snapshot.value, snapshot.value < rule.threshold)),
        TriggerCondition::Equals => Some((
            snapshot.value,
            (snapshot.value - rule.threshold).abs() <= epsilon,
        )),
        TriggerCondition::ChangePercent => {
            let change = snapshot.change_percent()?;
            let qualifies = if rule.threshold >= 0.0 {
                change >= rule.threshold
            } else {
                change <= rule.threshold
            };
            Some((change, qualifies))
        }
    }
}

/// Arbitration order: higher priority first, then earliest created, then id.
pub fn arbitration_order(a: &ActionRule, b: &ActionRule) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Split the rules that fired for one context into the winner and the
/// superseded rest.
pub fn arbitrate(mut fired: Vec<ActionRule>) -> Option<(ActionRule, Vec<ActionRule>)> {
    if fired.is_empty() {
        return None;
    }
    fired.sort_by(arbitration_order);
    let winner = fired.remove(0);
    Some((winner, fired))
}
