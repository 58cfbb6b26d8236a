//! Protocol specifications: named/versioned sets of methods.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Specification of one protocol method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Fully-qualified method name, e.g. `"llm/chat"`.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Parameter schema (JSON-schema shaped). Opaque to the engine;
    /// providers may validate against it.
    #[serde(default = "default_schema")]
    pub params_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl MethodSpec {
    /// Creates a method spec with an open parameter schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params_schema: default_schema(),
        }
    }

    /// Sets the parameter schema.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.params_schema = schema;
        self
    }
}

/// A named, versioned set of method specifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// Protocol id in `name/vN` form, e.g. `"echo/v1"`.
    pub id: String,

    /// Protocol name without the version suffix.
    pub name: String,

    /// Protocol version string, e.g. `"v1"`.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Method specs keyed by method name. Sorted for stable serialization.
    pub methods: BTreeMap<String, MethodSpec>,
}

impl ProtocolSpec {
    /// Creates a protocol spec from an id of the form `name/vN`.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        let (name, version) = id.split_once('/').ok_or_else(|| {
            CoreError::Validation(format!("protocol id must be name/version: {}", id))
        })?;

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            id,
            description: String::new(),
            methods: BTreeMap::new(),
        })
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a method spec.
    pub fn with_method(mut self, method: MethodSpec) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    /// Whether the protocol declares the given method.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

/// Provider health as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    /// No signal yet.
    #[default]
    Unknown,
    /// Heartbeats fresh, circuit closed.
    Healthy,
    /// Still receiving traffic, deprioritized behind healthy providers.
    Degraded,
    /// Ruled out of selection (missed heartbeats or open circuit).
    Unhealthy,
}

impl ProviderHealth {
    /// Whether a provider in this state may receive traffic.
    pub fn is_selectable(&self) -> bool {
        matches!(
            self,
            ProviderHealth::Healthy | ProviderHealth::Degraded | ProviderHealth::Unknown
        )
    }
}

impl std::fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderHealth::Unknown => "unknown",
            ProviderHealth::Healthy => "healthy",
            ProviderHealth::Degraded => "degraded",
            ProviderHealth::Unhealthy => "unhealthy",
        };
        write!(f, "{}", s)
    }
}
