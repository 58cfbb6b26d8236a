//! Provider invocation wire contract (engine -> provider).

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single method invocation sent to a provider.
///
/// The transport (in-process call, local socket, network hub) is opaque to
/// the engine; the same object crosses every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Request id; unique per attempt.
    pub id: String,

    /// Method to invoke, e.g. `"llm/chat"`.
    pub method: String,

    /// Fully-resolved parameters (substitution already applied).
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Absolute deadline for the attempt.
    pub deadline: DateTime<Utc>,
}

impl InvocationRequest {
    /// Creates a request with a fresh id.
    pub fn new(
        method: impl Into<String>,
        params: serde_json::Map<String, serde_json::Value>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
            deadline,
        }
    }

    /// Time remaining until the deadline, clamped at zero.
    pub fn time_remaining(&self) -> std::time::Duration {
        (self.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Structured error carried in a failure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationError {
    /// Stable integer code from the documented catalog.
    pub code: i32,

    /// Short human-readable message.
    pub message: String,

    /// Optional structured detail. `data.retryable` (bool) lets a provider
    /// mark a semantic failure as retryable.
    pub data: Option<serde_json::Value>,
}

impl InvocationError {
    /// Creates an error from a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Creates a provider error, optionally marked retryable.
    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: ErrorKind::ProviderError.code(),
            message: message.into(),
            data: Some(serde_json::json!({ "retryable": retryable })),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.code)
    }

    /// Whether the failure should advance the retry counter.
    ///
    /// Provider errors default to non-retryable unless the provider set
    /// `data.retryable`; every other kind follows the standard table.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::ProviderError => self
                .data
                .as_ref()
                .and_then(|d| d.get("retryable"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            kind => kind.is_retryable(),
        }
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Provider response to an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvocationResponse {
    /// The call succeeded.
    Success {
        /// Echoed request id.
        id: String,
        /// JSON-serializable result value.
        result: serde_json::Value,
    },
    /// The call failed.
    Failure {
        /// Echoed request id.
        id: String,
        /// Structured error.
        error: InvocationError,
    },
}

impl InvocationResponse {
    /// Builds a success response for a request.
    pub fn success(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::Success {
            id: request_id.into(),
            result,
        }
    }

    /// Builds a failure response for a request.
    pub fn failure(request_id: impl Into<String>, error: InvocationError) -> Self {
        Self::Failure {
            id: request_id.into(),
            error,
        }
    }

    /// Converts into a plain result.
    pub fn into_result(self) -> Result<serde_json::Value, InvocationError> {
        match self {
            InvocationResponse::Success { result, .. } => Ok(result),
            InvocationResponse::Failure { error, .. } => Err(error),
        }
    }
}
