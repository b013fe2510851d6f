//! Integration tests for the webhook action executor
//!
//! Tests HTTP executor behavior using wiremock for request/response mocking.

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use perf_action_engine::config::WebhookConfig;
use perf_action_engine::engine::{
    ActionConfig, ActionExecutor, ActionLogId, ActionRequest, ExecutionOutcome, MetricContext,
    WebhookExecutor,
};
use perf_action_engine::error::ExecutorError;

/// Create an executor pointing to the mock server
fn create_test_executor(base_url: &str, token: Option<&str>) -> WebhookExecutor {
    let config = WebhookConfig {
        base_url: Some(format!("{}/", base_url)),
        token: token.map(str::to_string),
        timeout_ms: 2000,
    };
    WebhookExecutor::new(&config).expect("Failed to create executor")
}

fn create_test_request() -> ActionRequest {
    ActionRequest {
        action_log_id: ActionLogId::from("action_test-1"),
        action_kind: "pause_campaign".to_string(),
        agent_kind: "ad".to_string(),
        context: MetricContext::new("ad", "ctr").with_campaign("summer"),
        trigger_value: 0.004,
        config: ActionConfig::default(),
        attempt: 1,
        is_fallback: false,
    }
}

#[cfg(test)]
mod success_tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_call_parses_outcome() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/agents/ad/actions/pause_campaign"))
            .and(header("Authorization", "Bearer agent-token"))
            .and(header("Idempotency-Key", "action_test-1"))
            .and(body_partial_json(json!({
                "agent_kind": "ad",
                "attempt": 1,
                "is_fallback": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "post_value": 0.012,
                "rollback_data": {"status": "active"},
                "message": "paused"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let executor = create_test_executor(&mock_server.uri(), Some("agent-token"));
        let outcome = executor.execute(&create_test_request()).await;

        assert!(outcome.is_ok(), "Call should succeed: {:?}", outcome.err());
        let outcome = outcome.unwrap();
        assert_eq!(outcome.post_value, Some(0.012));
        assert_eq!(outcome.rollback_data, Some(json!({"status": "active"})));
        assert_eq!(outcome.message.as_deref(), Some("paused"));
    }

    #[tokio::test]
    async fn test_empty_body_is_default_outcome() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/agents/ad/actions/pause_campaign"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let executor = create_test_executor(&mock_server.uri(), None);
        let outcome = executor.execute(&create_test_request()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::default());
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let executor = create_test_executor(&mock_server.uri(), None);
        let err = executor.execute(&create_test_request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("campaign archived"))
            .mount(&mock_server)
            .await;

        let executor = create_test_executor(&mock_server.uri(), None);
        let err = executor.execute(&create_test_request()).await.unwrap_err();
        match err {
            ExecutorError::Rejected { reason } => {
                assert!(reason.contains("422"));
                assert!(reason.contains("campaign archived"));
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let executor = create_test_executor(&mock_server.uri(), None);
        let err = executor.execute(&create_test_request()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_transient() {
        let executor = create_test_executor("http://127.0.0.1:1", None);
        let err = executor.execute(&create_test_request()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
