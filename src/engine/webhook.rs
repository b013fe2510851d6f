//! HTTP executor for agent webhooks.
//!
//! Maps agent responses onto the runner's retry model: 2xx completes, 408,
//! 429 and 5xx are transient, any other 4xx is a rejection.

use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use super::registry::{ActionExecutor, ActionRequest, ExecutionOutcome};
use crate::config::WebhookConfig;
use crate::error::{EngineError, EngineResult, ExecutorError};

/// Executor that POSTs each attempt to an agent webhook.
///
/// Requests go to `{base_url}/agents/{agent_kind}/actions/{action_kind}` with
/// the [`ActionRequest`] as JSON body and the action log ID as
/// `Idempotency-Key`, so agents can drop redelivered attempts.
#[derive(Clone)]
pub struct WebhookExecutor {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout_ms: u64,
}

impl WebhookExecutor {
    /// Create an executor from webhook configuration.
    pub fn new(config: &WebhookConfig) -> EngineResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| EngineError::Configuration {
                message: "ACTION_WEBHOOK_URL is not set".to_string(),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::Configuration {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    fn endpoint(&self, request: &ActionRequest) -> String {
        format!(
            "{}/agents/{}/actions/{}",
            self.base_url, request.agent_kind, request.action_kind
        )
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ExecutionOutcome, ExecutorError> {
        let url = self.endpoint(request);
        debug!(
            action_log_id = %request.action_log_id,
            attempt = request.attempt,
            url = %url,
            "Calling action webhook"
        );

        let start = Instant::now();
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", request.action_log_id.as_str())
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Transient {
                    message: format!("Webhook timed out after {}ms", self.timeout_ms),
                }
            } else {
                ExecutorError::Transient {
                    message: format!("Webhook request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(
                action_log_id = %request.action_log_id,
                status = status.as_u16(),
                latency_ms = start.elapsed().as_millis(),
                "Action webhook returned an error"
            );
            return Err(classify_status(status, body));
        }

        let outcome = if body.trim().is_empty() {
            ExecutionOutcome::default()
        } else {
            serde_json::from_str(&body).map_err(|e| ExecutorError::Transient {
                message: format!("Failed to parse webhook response: {}", e),
            })?
        };

        info!(
            action_log_id = %request.action_log_id,
            action_kind = %request.action_kind,
            latency_ms = start.elapsed().as_millis(),
            "Action webhook succeeded"
        );
        Ok(outcome)
    }
}

/// 408, 429 and 5xx are worth retrying; any other failure is a refusal.
fn classify_status(status: StatusCode, body: String) -> ExecutorError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ExecutorError::Transient { message: detail }
    } else {
        ExecutorError::Rejected { reason: detail }
    }
}
