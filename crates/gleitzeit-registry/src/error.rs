//! Error types for the protocol/provider registry.

use gleitzeit_core::{ErrorKind, InvocationError};
use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors produced by the registry.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// A protocol with this id is already registered.
    #[error("Protocol already exists: {0}")]
    ProtocolAlreadyExists(String),

    /// The referenced protocol is unknown.
    #[error("Protocol not found: {0}")]
    ProtocolNotFound(String),

    /// A provider with this id is already registered.
    #[error("Provider already exists: {0}")]
    ProviderAlreadyExists(String),

    /// The referenced provider is unknown.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// A provider declared a method its protocol does not define.
    #[error("Method {method} is not part of protocol {protocol}")]
    UnsupportedMethod { protocol: String, method: String },

    /// No healthy provider qualifies for the request.
    #[error("No provider available for {protocol} {method}")]
    NoProviderAvailable { protocol: String, method: String },

    /// The invocation itself failed; carries the wire error.
    #[error("Invocation failed: {0}")]
    Invocation(InvocationError),
}

impl RegistryError {
    /// Classification used by the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::ProtocolAlreadyExists(_)
            | RegistryError::ProviderAlreadyExists(_)
            | RegistryError::UnsupportedMethod { .. } => ErrorKind::Validation,
            RegistryError::ProtocolNotFound(_) | RegistryError::ProviderNotFound(_) => {
                ErrorKind::NotFound
            }
            RegistryError::NoProviderAvailable { .. } => ErrorKind::ProviderUnavailable,
            RegistryError::Invocation(err) => err.kind(),
        }
    }
}
