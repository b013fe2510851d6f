//! CLI commands for operating the engine.
//!
//! Every command except `serve` (handled by the binary) runs one engine
//! operation and renders a plain-text report.

use clap::Subcommand;

use super::system::{ActionEngine, CheckSummary};
use super::types::{ActionConfig, InsightId, InsightStatus};
use crate::storage::InsightFilter;

const RULE: &str =
    "═══════════════════════════════════════════════════════════════════════════════\n";

/// Engine CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum EngineCommands {
    /// Run one action-check pass
    Check {
        /// Only preview decisions; run nothing
        #[arg(long)]
        dry_run: bool,

        /// Only rules for these agent kinds
        #[arg(long = "agent")]
        agents: Vec<String>,

        /// Only contexts for these campaigns
        #[arg(long = "campaign")]
        campaigns: Vec<String>,
    },

    /// Trigger an action by hand
    Trigger {
        /// Agent kind to target
        agent: String,

        /// Action kind to run
        action: String,

        /// Campaign to run it against
        #[arg(long)]
        campaign: Option<String>,

        /// Metric type the action is meant to move
        #[arg(long)]
        metric: Option<String>,

        /// Action intensity (0.0 - 1.0)
        #[arg(long)]
        intensity: Option<f64>,

        /// Budget change
        #[arg(long, allow_hyphen_values = true)]
        budget_delta: Option<f64>,
    },

    /// Run batch learning over recent action logs
    Learn {
        /// Window in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Only logs for this agent kind
        #[arg(long)]
        agent: Option<String>,

        /// Only logs for this metric type
        #[arg(long)]
        metric: Option<String>,

        /// Re-learn logs that were already processed
        #[arg(long)]
        force: bool,
    },

    /// Generate insights, then list pending ones
    Insights {
        /// Only this agent kind
        #[arg(long)]
        agent: Option<String>,
    },

    /// Change an insight's status
    Insight {
        /// Insight ID
        id: String,

        /// One of: validate, implement, archive, dismiss
        action: String,
    },

    /// Show active metric weights
    Weights {
        /// Only this agent kind
        #[arg(long)]
        agent: Option<String>,

        /// Only this metric type
        #[arg(long)]
        metric: Option<String>,
    },

    /// List action rules
    Rules {
        /// Include disabled rules
        #[arg(long)]
        all: bool,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute an engine CLI command.
pub async fn execute_command(command: EngineCommands, engine: &ActionEngine) -> CliResult {
    match command {
        EngineCommands::Check {
            dry_run,
            agents,
            campaigns,
        } => execute_check(engine, dry_run, agents, campaigns).await,
        EngineCommands::Trigger {
            agent,
            action,
            campaign,
            metric,
            intensity,
            budget_delta,
        } => {
            let config = ActionConfig {
                metric_type: metric,
                intensity,
                budget_delta,
                ..Default::default()
            };
            execute_trigger(engine, &agent, &action, config, campaign.as_deref()).await
        }
        EngineCommands::Learn {
            hours,
            agent,
            metric,
            force,
        } => execute_learn(engine, hours, agent, metric, force).await,
        EngineCommands::Insights { agent } => execute_insights(engine, agent).await,
        EngineCommands::Insight { id, action } => execute_insight(engine, id, &action).await,
        EngineCommands::Weights { agent, metric } => execute_weights(engine, agent, metric).await,
        EngineCommands::Rules { all } => execute_rules(engine, all).await,
    }
}

async fn execute_check(
    engine: &ActionEngine,
    dry_run: bool,
    agents: Vec<String>,
    campaigns: Vec<String>,
) -> CliResult {
    let agents = (!agents.is_empty()).then_some(agents);
    let campaigns = (!campaigns.is_empty()).then_some(campaigns);

    match engine
        .run_action_checks(agents.as_deref(), campaigns.as_deref(), dry_run)
        .await
    {
        Ok(summary) => CliResult::success(render_checks(&summary)),
        Err(e) => CliResult::error(format!("Action checks failed: {}", e)),
    }
}

fn render_checks(summary: &CheckSummary) -> String {
    let mut output = String::new();
    output.push_str(if summary.dry_run {
        "\nAction Checks (dry run)\n"
    } else {
        "\nAction Checks\n"
    });
    output.push_str(RULE);
    output.push_str(&format!(
        "Rules: {}  Contexts: {}  Evaluated: {}\n",
        summary.rules, summary.contexts, summary.evaluated
    ));
    output.push_str(&format!(
        "Fired: {}  Superseded: {}  Executed: {} (completed {}, failed {}, cancelled {})\n\n",
        summary.fired,
        summary.superseded,
        summary.executed,
        summary.completed,
        summary.failed,
        summary.cancelled
    ));

    for record in summary.records.iter().filter(|r| r.decision.fire) {
        let status = record
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "not run".to_string());
        output.push_str(&format!(
            "  {} → {} [{}]\n",
            record.rule_name, record.context_key, status
        ));
    }
    for error in &summary.errors {
        output.push_str(&format!("  error: {}\n", error));
    }
    output
}

async fn execute_trigger(
    engine: &ActionEngine,
    agent: &str,
    action: &str,
    config: ActionConfig,
    campaign: Option<&str>,
) -> CliResult {
    match engine.trigger_action(agent, action, config, campaign).await {
        Ok(result) => {
            let mut output = format!(
                "Action {} ({}) ended {}\n",
                result.log.id, result.log.action_kind, result.log.status
            );
            if let Some(message) = &result.log.error_message {
                output.push_str(&format!("  last error: {}\n", message));
            }
            if let Some(fallback) = &result.fallback {
                output.push_str(&format!(
                    "Fallback {} ({}) ended {}\n",
                    fallback.id, fallback.action_kind, fallback.status
                ));
            }
            if result.success {
                CliResult::success(output)
            } else {
                CliResult::error(output)
            }
        }
        Err(e) => CliResult::error(format!("Trigger failed: {}", e)),
    }
}

async fn execute_learn(
    engine: &ActionEngine,
    hours: i64,
    agent: Option<String>,
    metric: Option<String>,
    force: bool,
) -> CliResult {
    match engine
        .process_batch_learning(agent.as_deref(), metric.as_deref(), hours, force)
        .await
    {
        Ok(summary) => {
            let mut output = String::new();
            output.push_str("\nBatch Learning\n");
            output.push_str(RULE);
            output.push_str(&format!(
                "Logs: {} (processed {}, skipped {})  Contexts: {}\n",
                summary.total_logs, summary.processed_logs, summary.skipped_logs, summary.contexts
            ));
            output.push_str(&format!(
                "Weight updates: {}  Rollbacks: {}\n",
                summary.weight_updates, summary.rollbacks
            ));
            output.push_str(&format!(
                "Average confidence: {:.3}  Average improvement: {:+.3}\n",
                summary.average_confidence, summary.average_improvement
            ));
            for context in &summary.failed_contexts {
                output.push_str(&format!("  failed: {}\n", context));
            }
            if summary.cancelled {
                output.push_str("Run cancelled before all contexts were processed\n");
            }
            CliResult::success(output)
        }
        Err(e) => CliResult::error(format!("Batch learning failed: {}", e)),
    }
}

async fn execute_insights(engine: &ActionEngine, agent: Option<String>) -> CliResult {
    let report = match engine.generate_insights(agent.as_deref()).await {
        Ok(report) => report,
        Err(e) => return CliResult::error(format!("Insight generation failed: {}", e)),
    };
    let filter = InsightFilter {
        status: Some(InsightStatus::Pending),
        agent_kind: agent,
        ..Default::default()
    };
    let pending = match engine.list_insights(&filter).await {
        Ok(pending) => pending,
        Err(e) => return CliResult::error(format!("Failed to list insights: {}", e)),
    };

    let mut output = String::new();
    output.push_str("\nInsights\n");
    output.push_str(RULE);
    output.push_str(&format!(
        "Created: {}  Already pending: {}  Contexts analysed: {}\n\n",
        report.created.len(),
        report.duplicates,
        report.contexts_analyzed
    ));
    if pending.is_empty() {
        output.push_str("No pending insights.\n");
    }
    for insight in pending {
        output.push_str(&format!(
            "[{}] {} ({}, {})\n    {}\n    → {}\n",
            insight.id,
            insight.title,
            insight.insight_type,
            insight.priority,
            insight.description,
            insight.recommendation
        ));
    }
    CliResult::success(output)
}

async fn execute_insight(engine: &ActionEngine, id: String, action: &str) -> CliResult {
    let id = InsightId(id);
    let result = match action {
        "validate" => engine.validate_insight(&id).await,
        "implement" => engine.implement_insight(&id).await,
        "archive" => engine.archive_insight(&id).await,
        "dismiss" => engine.dismiss_insight(&id).await,
        other => {
            return CliResult::error(format!(
                "Unknown insight action '{}'. Use validate, implement, archive or dismiss.",
                other
            ))
        }
    };
    match result {
        Ok(insight) => CliResult::success(format!(
            "Insight {} is now {}{}\n",
            insight.id,
            insight.status,
            if insight.dismissed { " (dismissed)" } else { "" }
        )),
        Err(e) => CliResult::error(format!("Insight update failed: {}", e)),
    }
}

async fn execute_weights(
    engine: &ActionEngine,
    agent: Option<String>,
    metric: Option<String>,
) -> CliResult {
    match engine
        .list_metric_weights(agent.as_deref(), metric.as_deref())
        .await
    {
        Ok(weights) => {
            let mut output = String::new();
            output.push_str("\nMetric Weights\n");
            output.push_str(RULE);
            if weights.is_empty() {
                output.push_str("No weights recorded.\n");
            }
            for weight in weights {
                output.push_str(&format!(
                    "{:<48} v{:<4} weight {:>7.4}  confidence {:.2}  score {:>5.1}\n",
                    weight.context.key(),
                    weight.version,
                    weight.weight,
                    weight.confidence,
                    weight.performance_score
                ));
            }
            CliResult::success(output)
        }
        Err(e) => CliResult::error(format!("Failed to list weights: {}", e)),
    }
}

async fn execute_rules(engine: &ActionEngine, all: bool) -> CliResult {
    match engine.list_rules(!all).await {
        Ok(rules) => {
            let mut output = String::new();
            output.push_str("\nAction Rules\n");
            output.push_str(RULE);
            if rules.is_empty() {
                output.push_str("No rules defined.\n");
            }
            for rule in rules {
                output.push_str(&format!(
                    "{} {} [{}]\n    {}.{} {} {} → {} (priority {}, cooldown {}s, {}x)\n",
                    if rule.enabled { "●" } else { "○" },
                    rule.name,
                    rule.id,
                    rule.agent_kind,
                    rule.metric_type,
                    rule.condition,
                    rule.threshold,
                    rule.action_kind,
                    rule.priority,
                    rule.cooldown_secs,
                    rule.consecutive_count
                ));
            }
            CliResult::success(output)
        }
        Err(e) => CliResult::error(format!("Failed to list rules: {}", e)),
    }
}
