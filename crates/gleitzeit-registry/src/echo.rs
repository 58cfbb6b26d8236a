//! Echo provider: an in-process `echo/v1` implementation for tests and
//! demos.

use async_trait::async_trait;
use gleitzeit_core::{
    ErrorKind, InvocationError, InvocationRequest, InvocationResponse, MethodSpec, ProtocolSpec,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::provider::ProviderClient;

/// Simple echo provider.
///
/// Methods:
/// - `echo/ping`: returns `{response: params.message}` (default `"pong"`).
/// - `echo/echo`: returns `{echoed: params.value}`.
/// - `echo/timestamp`: returns the current time.
/// - `echo/delay`: sleeps `params.seconds` (capped) then echoes the params.
/// - `echo/fail`: fails a configured number of times before succeeding;
///   with `params.kind = "invalid_params"` it always rejects. Drives the
///   retry and fail-fast paths in tests.
pub struct EchoProvider {
    provider_id: String,
    fail_remaining: AtomicU32,
}

impl EchoProvider {
    /// Longest delay `echo/delay` will honor.
    const MAX_DELAY_SECONDS: f64 = 10.0;

    /// Creates a provider that never fails on `echo/fail`.
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            fail_remaining: AtomicU32::new(0),
        }
    }

    /// Creates a provider whose `echo/fail` fails with a transport error
    /// `failures` times before succeeding.
    pub fn flaky(provider_id: impl Into<String>, failures: u32) -> Self {
        Self {
            provider_id: provider_id.into(),
            fail_remaining: AtomicU32::new(failures),
        }
    }

    /// The `echo/v1` protocol specification.
    pub fn protocol_spec() -> ProtocolSpec {
        ProtocolSpec::new("echo/v1")
            .expect("static protocol id")
            .with_description("Echo provider for testing and demonstration")
            .with_method(MethodSpec::new("echo/ping", "Echo a message back"))
            .with_method(MethodSpec::new("echo/echo", "Echo a value back"))
            .with_method(MethodSpec::new("echo/timestamp", "Return the current time"))
            .with_method(MethodSpec::new("echo/delay", "Echo after a delay"))
            .with_method(MethodSpec::new("echo/fail", "Fail a configured number of times"))
    }

    /// The methods every echo provider supports.
    pub fn methods() -> Vec<String> {
        vec![
            "echo/ping".to_string(),
            "echo/echo".to_string(),
            "echo/timestamp".to_string(),
            "echo/delay".to_string(),
            "echo/fail".to_string(),
        ]
    }

    fn handle_fail(&self, request: &InvocationRequest) -> InvocationResponse {
        if request
            .params
            .get("kind")
            .and_then(|v| v.as_str())
            .map(|k| k == "invalid_params")
            .unwrap_or(false)
        {
            return InvocationResponse::failure(
                request.id.clone(),
                InvocationError::new(ErrorKind::InvalidParameters, "rejected by echo provider"),
            );
        }

        let took_failure = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if took_failure {
            debug!("echo provider {} failing on purpose", self.provider_id);
            return InvocationResponse::failure(
                request.id.clone(),
                InvocationError::new(ErrorKind::Transport, "injected transport failure"),
            );
        }

        InvocationResponse::success(request.id.clone(), serde_json::json!({ "ok": true }))
    }
}

#[async_trait]
impl ProviderClient for EchoProvider {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        match request.method.as_str() {
            "echo/ping" => {
                let message = request
                    .params
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| serde_json::Value::String("pong".to_string()));
                InvocationResponse::success(
                    request.id.clone(),
                    serde_json::json!({ "response": message }),
                )
            }

            "echo/echo" => {
                let value = request
                    .params
                    .get("value")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                InvocationResponse::success(
                    request.id.clone(),
                    serde_json::json!({ "echoed": value }),
                )
            }

            "echo/timestamp" => {
                let now = chrono::Utc::now();
                InvocationResponse::success(
                    request.id.clone(),
                    serde_json::json!({
                        "timestamp": now.to_rfc3339(),
                        "unix_timestamp": now.timestamp(),
                    }),
                )
            }

            "echo/delay" => {
                let seconds = request
                    .params
                    .get("seconds")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0)
                    .clamp(0.0, Self::MAX_DELAY_SECONDS);
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                InvocationResponse::success(
                    request.id.clone(),
                    serde_json::json!({ "delayed": seconds }),
                )
            }

            "echo/fail" => self.handle_fail(&request),

            other => InvocationResponse::failure(
                request.id.clone(),
                InvocationError::new(
                    ErrorKind::InvalidParameters,
                    format!("unknown echo method: {}", other),
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(method: &str, params: serde_json::Value) -> InvocationRequest {
        let params = params
            .as_object()
            .cloned()
            .unwrap_or_else(serde_json::Map::new);
        InvocationRequest::new(method, params, Utc::now() + chrono::Duration::seconds(5))
    }

    #[tokio::test]
    async fn test_ping() {
        let provider = EchoProvider::new("echo-1");
        let response = provider
            .invoke(request("echo/ping", serde_json::json!({"message": "hi"})))
            .await;
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!({"response": "hi"})
        );

        let response = provider.invoke(request("echo/ping", serde_json::json!({}))).await;
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!({"response": "pong"})
        );
    }

    #[tokio::test]
    async fn test_echo() {
        let provider = EchoProvider::new("echo-1");
        let response = provider
            .invoke(request("echo/echo", serde_json::json!({"value": [1, 2]})))
            .await;
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!({"echoed": [1, 2]})
        );
    }

    #[tokio::test]
    async fn test_flaky_fail_then_succeed() {
        let provider = EchoProvider::flaky("echo-1", 2);

        for _ in 0..2 {
            let response = provider.invoke(request("echo/fail", serde_json::json!({}))).await;
            let err = response.into_result().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transport);
            assert!(err.is_retryable());
        }

        let response = provider.invoke(request("echo/fail", serde_json::json!({}))).await;
        assert_eq!(
            response.into_result().unwrap(),
            serde_json::json!({"ok": true})
        );
    }

    #[tokio::test]
    async fn test_invalid_params_rejection() {
        let provider = EchoProvider::new("echo-1");
        let response = provider
            .invoke(request(
                "echo/fail",
                serde_json::json!({"kind": "invalid_params"}),
            ))
            .await;
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let provider = EchoProvider::new("echo-1");
        let response = provider.invoke(request("echo/shout", serde_json::json!({}))).await;
        assert!(response.into_result().is_err());
    }
}
