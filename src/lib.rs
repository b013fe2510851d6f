//! # Performance Action Engine
//!
//! A closed-loop control engine for marketing agents: it watches metric
//! streams per context, dispatches corrective actions when rules trip, and
//! learns from each action's measured effect.
//!
//! ## Features
//!
//! - **Rule Triggers**: Thresholds, percent change, consecutive breaches, cooldowns
//! - **Action Runner**: Capability registry, retries with backoff, timeouts, fallbacks
//! - **Feedback Loop**: Versioned per-context weights with rollback on failure
//! - **Insights**: Performance, trend and engagement patterns for human review
//! - **Scheduler**: Periodic checks, learning and insight generation
//!
//! ## Architecture
//!
//! ```text
//! Metric snapshots → ActionEngine → Agent webhooks (HTTP)
//!                         ↓
//!                   SQLite (State)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use perf_action_engine::Config;
//! use perf_action_engine::engine::{ActionEngine, ActionRegistry, SqliteMetricSource, WebhookExecutor};
//! use perf_action_engine::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let metrics = Arc::new(SqliteMetricSource::new(storage.pool().clone()));
//!     let executor = Arc::new(WebhookExecutor::new(&config.webhook)?);
//!     let registry = Arc::new(ActionRegistry::with_default_catalog(executor));
//!     let engine = ActionEngine::new(Arc::new(storage), metrics, registry, config.engine)?;
//!     engine.run_action_checks(None, None, false).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Configuration management for the engine.
pub mod config;
/// Triggering, execution, learning and insights.
pub mod engine;
/// Error types and result aliases for the application.
pub mod error;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use engine::{ActionEngine, EngineConfig};
pub use error::{AppError, AppResult};
