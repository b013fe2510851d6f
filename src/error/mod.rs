use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or missing startup configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong
        message: String,
    },

    /// Storage failure outside an engine call.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Anything else.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong
        message: String,
    },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Opening the database failed.
    #[error("Database connection failed: {message}")]
    Connection {
        /// Driver message
        message: String,
    },

    /// A statement failed.
    #[error("Query failed: {message}")]
    Query {
        /// Driver message
        message: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("Serialization failed: {message}")]
    Serialization {
        /// What failed to convert
        message: String,
    },

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of row
        entity: &'static str,
        /// ID looked up
        id: String,
    },

    /// The active weight changed between read and write.
    #[error("Version conflict on {context_key}: expected active weight {expected}")]
    VersionConflict {
        /// Context whose weight moved
        context_key: String,
        /// Weight version the writer expected to be active
        expected: String,
    },

    /// Applying the schema failed.
    #[error("Migration failed: {message}")]
    Migration {
        /// Migrator message
        message: String,
    },

    /// Raw driver error.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Control-loop errors surfaced by the engine façade
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown action kind, agent/action incompatibility, missing parameters.
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is misconfigured
        message: String,
    },

    /// A rule failed shape or registry checks.
    #[error("Invalid rule {rule_id}: {reason}")]
    InvalidRule {
        /// Offending rule
        rule_id: String,
        /// Why it was refused
        reason: String,
    },

    /// A status change the lifecycle does not allow.
    #[error("Invalid status transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        /// Kind of record
        entity: &'static str,
        /// Record ID
        id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Learning was asked for a log that has not finished.
    #[error("Action log {action_log_id} cannot be processed in status {status}")]
    NotProcessable {
        /// The log
        action_log_id: String,
        /// Its current status
        status: String,
    },

    /// Weight swaps kept conflicting until the retry limit.
    #[error("Learning update failed for {context_key} after {attempts} attempts")]
    LearningConflict {
        /// Context that could not be updated
        context_key: String,
        /// Swap attempts made
        attempts: u32,
    },

    /// The metric source failed.
    #[error("Metric source error: {message}")]
    Metrics {
        /// Source message
        message: String,
    },

    /// Persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Action catalog errors. All of them are configuration errors: never retried.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No executor registered for the kind.
    #[error("Unknown action kind: {0}")]
    UnknownAction(String),

    /// The kind was registered twice.
    #[error("Action kind already registered: {0}")]
    DuplicateAction(String),

    /// The agent kind is not in the action's compatible set.
    #[error("Action {action_kind} is not compatible with agent kind {agent_kind}")]
    IncompatibleAgent {
        /// Action requested
        action_kind: String,
        /// Agent it was aimed at
        agent_kind: String,
    },

    /// A required parameter is absent.
    #[error("Action {action_kind} requires parameter {param}")]
    MissingParameter {
        /// Action requested
        action_kind: String,
        /// Missing parameter
        param: String,
    },

    /// A numeric parameter lies outside its declared range.
    #[error("Parameter {param} of {action_kind} out of bounds: {value} not in [{min}, {max}]")]
    ParameterOutOfBounds {
        /// Action requested
        action_kind: String,
        /// Parameter checked
        param: String,
        /// Value given
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// The declared fallback kind is not registered.
    #[error("Fallback {fallback} of {action_kind} is not registered")]
    UnknownFallback {
        /// Action declaring the fallback
        action_kind: String,
        /// Missing fallback kind
        fallback: String,
    },
}

/// Errors reported by an action executor.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    /// Temporary failure, worth retrying.
    #[error("Transient executor failure: {message}")]
    Transient {
        /// Executor message
        message: String,
    },

    /// The agent refused the action; retrying will not help.
    #[error("Action rejected: {reason}")]
    Rejected {
        /// Why the agent refused
        reason: String,
    },
}

impl ExecutorError {
    /// Whether the runner should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Transient { .. })
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        EngineError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for registry lookups
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::NotFound {
            entity: "action log",
            id: "log-1".to_string(),
        };
        assert_eq!(err.to_string(), "action log not found: log-1");

        let err = StorageError::VersionConflict {
            context_key: "content|engagement".to_string(),
            expected: "weight_1".to_string(),
        };
        assert!(err.to_string().contains("content|engagement"));

        let err = StorageError::Migration {
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: version mismatch");
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Configuration {
            message: "unknown action kind: explode".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Configuration error: unknown action kind: explode"
        );

        let err = EngineError::InvalidTransition {
            entity: "action log",
            id: "a1".to_string(),
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for action log a1: completed -> running"
        );

        let err = EngineError::LearningConflict {
            context_key: "ctx".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "Learning update failed for ctx after 5 attempts"
        );
    }

    #[test]
    fn test_registry_error_is_configuration_error() {
        let err: EngineError = RegistryError::IncompatibleAgent {
            action_kind: "reduce_budget".to_string(),
            agent_kind: "seo".to_string(),
        }
        .into();
        match err {
            EngineError::Configuration { message } => {
                assert!(message.contains("reduce_budget"));
                assert!(message.contains("seo"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_executor_error_retryable() {
        assert!(ExecutorError::Transient {
            message: "503".to_string()
        }
        .is_retryable());
        assert!(!ExecutorError::Rejected {
            reason: "campaign archived".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_engine_error_conversion_to_app_error() {
        let err = EngineError::Metrics {
            message: "down".to_string(),
        };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Engine(_)));
    }
}
