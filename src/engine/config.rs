//! Configuration for the action engine.
//!
//! This module provides configuration structures for every stage of the
//! control loop: trigger evaluation, action running, feedback learning,
//! insight generation and the batch scheduler.

use std::time::Duration;

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Trigger evaluator configuration
    pub trigger: TriggerConfig,

    /// Action runner configuration
    pub runner: RunnerConfig,

    /// Feedback loop configuration
    pub learning: LearningConfig,

    /// Insight generator configuration
    pub insights: InsightConfig,

    /// Batch scheduler configuration
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            trigger: TriggerConfig::from_env(),
            runner: RunnerConfig::from_env(),
            learning: LearningConfig::from_env(),
            insights: InsightConfig::default(),
            scheduler: SchedulerConfig::from_env(),
        }
    }

    /// Reject configurations the control loop cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let l = &self.learning;
        if l.weight_min <= 0.0 || l.weight_min >= l.weight_max {
            return Err(format!(
                "weight bounds must satisfy 0 < min < max, got [{}, {}]",
                l.weight_min, l.weight_max
            ));
        }
        if l.initial_weight < l.weight_min || l.initial_weight > l.weight_max {
            return Err(format!(
                "initial weight {} outside [{}, {}]",
                l.initial_weight, l.weight_min, l.weight_max
            ));
        }
        if l.learning_rate <= 0.0 || l.min_learning_rate < 0.0 {
            return Err("learning rates must be positive".to_string());
        }
        if l.decay_rate < 0.0 {
            return Err("decay rate must not be negative".to_string());
        }
        if !(0.0..=1.0).contains(&l.confidence_threshold) {
            return Err(format!(
                "confidence threshold {} outside [0, 1]",
                l.confidence_threshold
            ));
        }
        if l.max_cas_retries == 0 {
            return Err("max_cas_retries must be at least 1".to_string());
        }
        if self.runner.default_timeout_ms == 0 {
            return Err("action timeout must be positive".to_string());
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err("scheduler tick interval must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.insights.decreasing_trend_ratio) {
            return Err("decreasing trend ratio must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

/// Configuration for the trigger evaluator.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Tolerance for the `equals` condition
    pub equals_epsilon: f64,

    /// Window used when a rule leaves its time window at zero (seconds)
    pub default_time_window_secs: u64,

    /// Maximum contexts checked concurrently
    pub max_parallel_evaluations: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            equals_epsilon: 1e-6,
            default_time_window_secs: 3600, // 1 hour
            max_parallel_evaluations: 8,
        }
    }
}

impl TriggerConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            equals_epsilon: std::env::var("PAE_EQUALS_EPSILON")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1e-6),
            default_time_window_secs: std::env::var("PAE_DEFAULT_TIME_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3600),
            max_parallel_evaluations: std::env::var("PAE_MAX_PARALLEL_EVALUATIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),
        }
    }
}

/// Configuration for the action runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-attempt timeout when neither the action nor the registry sets one (milliseconds)
    pub default_timeout_ms: u64,

    /// First retry delay; doubles on each further retry (milliseconds)
    pub base_backoff_ms: u64,

    /// Upper bound on the retry delay (milliseconds)
    pub max_backoff_ms: u64,

    /// Whether exhausted actions may issue their fallback action
    pub fallback_enabled: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30000,
            base_backoff_ms: 1000,
            max_backoff_ms: 60000,
            fallback_enabled: true,
        }
    }
}

impl RunnerConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            default_timeout_ms: std::env::var("PAE_ACTION_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
            base_backoff_ms: std::env::var("PAE_BASE_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            max_backoff_ms: std::env::var("PAE_MAX_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60000),
            fallback_enabled: std::env::var("PAE_FALLBACK_ENABLED")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Get the default attempt timeout as Duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let delay = self
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Configuration for the feedback loop.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Base learning rate applied to the improvement score
    pub learning_rate: f64,

    /// How quickly the learning rate shrinks as a context accumulates versions
    pub decay_rate: f64,

    /// Floor for the decayed learning rate
    pub min_learning_rate: f64,

    /// Lower weight bound
    pub weight_min: f64,

    /// Upper weight bound
    pub weight_max: f64,

    /// Weight given to a context's first version
    pub initial_weight: f64,

    /// Multiplier damping each adjustment
    pub stability_weight: f64,

    /// Minimum metric samples before a weight may change
    pub minimum_sample_size: u64,

    /// Minimum confidence (0.0 - 1.0) before a weight may change
    pub confidence_threshold: f64,

    /// Restore the previous weight version when an action fails
    pub rollback_on_failure: bool,

    /// Time between action completion and the post-action metric read (seconds)
    pub settle_delay_secs: u64,

    /// History window used for the variance estimate (seconds)
    pub history_window_secs: u64,

    /// Compare-and-swap attempts before a weight update is abandoned
    pub max_cas_retries: u32,

    /// Contexts processed concurrently by batch learning
    pub max_parallel_contexts: usize,

    /// Denominator floor for the improvement ratio
    pub improvement_epsilon: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            decay_rate: 0.05,
            min_learning_rate: 0.01,
            weight_min: 0.1,
            weight_max: 10.0,
            initial_weight: 1.0,
            stability_weight: 1.0,
            minimum_sample_size: 10,
            confidence_threshold: 0.6,
            rollback_on_failure: true,
            settle_delay_secs: 300, // 5 minutes
            history_window_secs: 86400, // 24 hours
            max_cas_retries: 5,
            max_parallel_contexts: 4,
            improvement_epsilon: 1e-6,
        }
    }
}

impl LearningConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            learning_rate: std::env::var("PAE_LEARNING_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.learning_rate),
            decay_rate: std::env::var("PAE_DECAY_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.decay_rate),
            weight_min: std::env::var("PAE_WEIGHT_MIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.weight_min),
            weight_max: std::env::var("PAE_WEIGHT_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.weight_max),
            minimum_sample_size: std::env::var("PAE_MIN_SAMPLE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.minimum_sample_size),
            confidence_threshold: std::env::var("PAE_CONFIDENCE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.confidence_threshold),
            rollback_on_failure: std::env::var("PAE_ROLLBACK_ON_FAILURE")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.rollback_on_failure),
            settle_delay_secs: std::env::var("PAE_SETTLE_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.settle_delay_secs),
            max_parallel_contexts: std::env::var("PAE_MAX_PARALLEL_CONTEXTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_parallel_contexts),
            ..defaults
        }
    }

    /// Get settle delay as Duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Get the variance history window as Duration.
    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }

    /// Learning rate after decay for a context currently at `version`.
    pub fn effective_learning_rate(&self, version: i64) -> f64 {
        let adjustments = (version.max(1) - 1) as f64;
        let decayed = self.learning_rate / (1.0 + self.decay_rate * adjustments);
        decayed.max(self.min_learning_rate)
    }

    /// Clamp a weight into the configured bounds.
    pub fn clamp_weight(&self, weight: f64) -> f64 {
        if weight.is_nan() {
            return self.initial_weight;
        }
        weight.clamp(self.weight_min, self.weight_max)
    }
}

/// Configuration for insight generation.
#[derive(Debug, Clone)]
pub struct InsightConfig {
    /// Average performance score (0 - 100) below which a performance insight is raised
    pub performance_floor: f64,

    /// Fraction of decreasing observations that raises a trend insight
    pub decreasing_trend_ratio: f64,

    /// Fraction of poor/critical observations for one metric type that raises a cluster insight
    pub poor_cluster_ratio: f64,

    /// Minimum learning logs per context before any insight is considered
    pub min_logs_per_context: usize,

    /// How far back insight generation looks (hours)
    pub lookback_hours: i64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            performance_floor: 40.0,
            decreasing_trend_ratio: 0.3,
            poor_cluster_ratio: 0.5,
            min_logs_per_context: 3,
            lookback_hours: 168, // 1 week
        }
    }
}

/// Configuration for the batch scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler ticks (seconds)
    pub tick_interval_secs: u64,

    /// Window handed to scheduled learning (hours)
    pub learning_window_hours: i64,

    /// Whether scheduled ticks generate insights
    pub generate_insights: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 300, // 5 minutes
            learning_window_hours: 24,
            generate_insights: true,
        }
    }
}

impl SchedulerConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            tick_interval_secs: std::env::var("PAE_TICK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            learning_window_hours: std::env::var("PAE_LEARNING_WINDOW_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(24),
            generate_insights: std::env::var("PAE_GENERATE_INSIGHTS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Get tick interval as Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.learning.weight_min, 0.1);
        assert_eq!(config.learning.weight_max, 10.0);
        assert_eq!(config.scheduler.tick_interval_secs, 300);
        assert!(config.learning.rollback_on_failure);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RunnerConfig {
            base_backoff_ms: 100,
            max_backoff_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(4), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_learning_rate_decays_with_version() {
        let config = LearningConfig::default();
        let first = config.effective_learning_rate(1);
        let tenth = config.effective_learning_rate(10);
        assert_eq!(first, 0.1);
        assert!(tenth < first);
        assert!(config.effective_learning_rate(10_000) >= config.min_learning_rate);
    }

    #[test]
    fn test_clamp_weight() {
        let config = LearningConfig::default();
        assert_eq!(config.clamp_weight(100.0), 10.0);
        assert_eq!(config.clamp_weight(-3.0), 0.1);
        assert_eq!(config.clamp_weight(f64::NAN), 1.0);
        assert_eq!(config.clamp_weight(2.5), 2.5);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = EngineConfig::default();
        config.learning.weight_min = 5.0;
        config.learning.weight_max = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_confidence_threshold() {
        let mut config = EngineConfig::default();
        config.learning.confidence_threshold = 1.5;
        assert!(config.validate().unwrap_err().contains("confidence"));
    }

    #[test]
    fn test_duration_helpers() {
        let config = EngineConfig::default();
        assert_eq!(config.learning.settle_delay(), Duration::from_secs(300));
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(300));
        assert_eq!(config.runner.default_timeout(), Duration::from_secs(30));
    }
}
