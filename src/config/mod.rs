use std::env;
use std::path::PathBuf;

use crate::engine::EngineConfig;
use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite settings
    pub database: DatabaseConfig,
    /// Log level and format
    pub logging: LoggingConfig,
    /// Agent webhook settings
    pub webhook: WebhookConfig,
    /// Control-loop tuning
    pub engine: EngineConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file path (`DATABASE_PATH`)
    pub path: PathBuf,
    /// Pool size (`DATABASE_MAX_CONNECTIONS`)
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive (`LOG_LEVEL`)
    pub level: String,
    /// Output format (`LOG_FORMAT`)
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    /// Human-readable
    Pretty,
    /// One JSON object per line
    Json,
}

/// Agent webhook configuration used by the default action executor
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Agent base URL (`ACTION_WEBHOOK_URL`); unset disables the executor
    pub base_url: Option<String>,
    /// Bearer token (`ACTION_WEBHOOK_TOKEN`)
    pub token: Option<String>,
    /// Per-request timeout (`REQUEST_TIMEOUT_MS`)
    pub timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/actions.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let webhook = WebhookConfig {
            base_url: env::var("ACTION_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            token: env::var("ACTION_WEBHOOK_TOKEN")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
        };

        let engine = EngineConfig::from_env();
        engine.validate().map_err(|message| AppError::Config { message })?;

        Ok(Config {
            database,
            logging,
            webhook,
            engine,
        })
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout_ms: 30000,
        }
    }
}
