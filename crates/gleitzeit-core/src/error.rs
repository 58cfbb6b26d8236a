//! Error types and retry classification for the Gleitzeit core.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse error classification consumed by the retry policy.
///
/// Every error in the platform maps onto one of these kinds; the engine
/// decides whether to retry a task from the kind alone, never from the
/// concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad workflow document, unknown protocol/method, circular dependency,
    /// bad substitution token. Surfaced to the caller, never retried.
    Validation,

    /// Workflow/task/provider id unknown.
    NotFound,

    /// Queue depth above the high-water mark; caller retries later.
    Backpressure,

    /// No provider currently qualifies for the task.
    ProviderUnavailable,

    /// A provider exists but its health check rules it out.
    ProviderUnhealthy,

    /// Connection-level failure talking to a provider.
    Transport,

    /// Deadline exceeded.
    Timeout,

    /// Provider rejected the call with a permanent parameter error.
    InvalidParameters,

    /// Provider returned a semantic failure.
    ProviderError,

    /// Anything else (storage faults, bugs).
    Internal,
}

impl ErrorKind {
    /// Whether a task failure of this kind advances the attempt counter
    /// under the task's retry config.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderUnavailable
                | ErrorKind::ProviderUnhealthy
                | ErrorKind::Transport
                | ErrorKind::Timeout
        )
    }

    /// Stable integer code used on the invocation wire contract.
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::Validation => error_codes::VALIDATION,
            ErrorKind::NotFound => error_codes::NOT_FOUND,
            ErrorKind::Backpressure => error_codes::BACKPRESSURE,
            ErrorKind::ProviderUnavailable => error_codes::PROVIDER_UNAVAILABLE,
            ErrorKind::ProviderUnhealthy => error_codes::PROVIDER_UNHEALTHY,
            ErrorKind::Transport => error_codes::TRANSPORT,
            ErrorKind::Timeout => error_codes::TIMEOUT,
            ErrorKind::InvalidParameters => error_codes::INVALID_PARAMS,
            ErrorKind::ProviderError => error_codes::PROVIDER_ERROR,
            ErrorKind::Internal => error_codes::INTERNAL,
        }
    }

    /// Maps a wire error code back onto a kind. Unknown codes are treated
    /// as provider errors.
    pub fn from_code(code: i32) -> Self {
        match code {
            error_codes::VALIDATION => ErrorKind::Validation,
            error_codes::NOT_FOUND => ErrorKind::NotFound,
            error_codes::BACKPRESSURE => ErrorKind::Backpressure,
            error_codes::PROVIDER_UNAVAILABLE => ErrorKind::ProviderUnavailable,
            error_codes::PROVIDER_UNHEALTHY => ErrorKind::ProviderUnhealthy,
            error_codes::TRANSPORT => ErrorKind::Transport,
            error_codes::TIMEOUT => ErrorKind::Timeout,
            error_codes::INVALID_PARAMS => ErrorKind::InvalidParameters,
            error_codes::INTERNAL => ErrorKind::Internal,
            _ => ErrorKind::ProviderError,
        }
    }
}

/// Stable error codes for the provider invocation contract.
pub mod error_codes {
    /// Invalid parameters (JSON-RPC compatible).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Workflow document or submission rejected.
    pub const VALIDATION: i32 = 1000;
    /// Connection-level failure.
    pub const TRANSPORT: i32 = 1001;
    /// Deadline exceeded.
    pub const TIMEOUT: i32 = 1002;
    /// No provider qualifies.
    pub const PROVIDER_UNAVAILABLE: i32 = 1003;
    /// Provider ruled out by health tracking.
    pub const PROVIDER_UNHEALTHY: i32 = 1004;
    /// Id unknown.
    pub const NOT_FOUND: i32 = 1005;
    /// Queue full.
    pub const BACKPRESSURE: i32 = 1006;
    /// Provider-side semantic failure.
    pub const PROVIDER_ERROR: i32 = 2000;
    /// Engine-internal fault.
    pub const INTERNAL: i32 = 2500;
}

/// Core error type shared across the platform crates.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Workflow document failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The dependency relation contains a cycle.
    #[error("Circular dependency: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// A `${...}` substitution token could not be resolved.
    #[error("Parameter substitution failed for task {task_id}: {reason}")]
    ParameterSubstitution { task_id: String, reason: String },

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Queue is above its high-water mark.
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// Document could not be parsed.
    #[error("Invalid workflow document: {0}")]
    InvalidDocument(String),

    /// Internal invariant violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Classification used by the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_)
            | CoreError::CircularDependency { .. }
            | CoreError::ParameterSubstitution { .. }
            | CoreError::InvalidDocument(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Backpressure(_) => ErrorKind::Backpressure,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidDocument(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::InvalidDocument(err.to_string())
    }
}
