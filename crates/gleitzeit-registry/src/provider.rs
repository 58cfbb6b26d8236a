//! Provider handles, records, and selection requirements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gleitzeit_core::{InvocationRequest, InvocationResponse, ProviderHealth, TaskRequirements};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The one-operation seam between the engine and a concrete provider.
///
/// Implementations are in-process objects; remote providers are reached
/// through a [`HubTransport`] instead and never implement this trait
/// directly.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Dispatches one method invocation. Implementations must respect the
    /// request deadline on a best-effort basis; the engine enforces it
    /// regardless.
    async fn invoke(&self, request: InvocationRequest) -> InvocationResponse;

    /// Liveness probe used by the health estimator.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Transport for hub-mediated provider invocations.
///
/// The concrete wire protocol (local socket, network hub) lives outside
/// the core; the registry only needs this seam.
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Dispatches a request to a provider endpoint on the hub.
    async fn invoke(&self, endpoint: &str, request: InvocationRequest) -> InvocationResponse;

    /// Liveness probe for a provider endpoint.
    async fn health_check(&self, endpoint: &str) -> bool;
}

/// Tagged handle to a registered provider.
///
/// In-process and hub-mediated providers are distinguished by variant, not
/// by inheritance; the engine treats both uniformly through
/// [`crate::ProviderRegistry::invoke`].
#[derive(Clone)]
pub enum ProviderHandle {
    /// An in-process provider.
    Local(Arc<dyn ProviderClient>),

    /// A provider reachable through the hub transport at `endpoint`.
    Hub {
        /// Hub endpoint identifier.
        endpoint: String,
    },
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderHandle::Local(client) => write!(f, "Local({})", client.name()),
            ProviderHandle::Hub { endpoint } => write!(f, "Hub({})", endpoint),
        }
    }
}

/// Requirements a task may place on provider selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRequirements {
    /// Tags the provider record must carry (e.g. region, tier).
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Capabilities the provider must declare (e.g. model names).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl SelectionRequirements {
    /// No requirements: any provider of the protocol/method qualifies.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether a record satisfies every requested tag and capability.
    pub fn matches(&self, record: &ProviderRecord) -> bool {
        self.tags.is_subset(&record.tags) && self.capabilities.is_subset(&record.capabilities)
    }
}

impl From<&TaskRequirements> for SelectionRequirements {
    fn from(requirements: &TaskRequirements) -> Self {
        Self {
            tags: requirements.tags.clone(),
            capabilities: requirements.capabilities.clone(),
        }
    }
}

/// Public snapshot of one registered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Provider id.
    pub provider_id: String,

    /// Protocol the provider implements.
    pub protocol_id: String,

    /// Methods the provider supports (subset of the protocol's methods).
    pub supported_methods: BTreeSet<String>,

    /// Current health classification.
    pub health: ProviderHealth,

    /// Timestamp of the last heartbeat or probe.
    pub last_health_check: Option<DateTime<Utc>>,

    /// Invocations currently in flight.
    pub current_load: u32,

    /// Declared concurrent capacity (>= 1).
    pub capacity: u32,

    /// Selection tags.
    pub tags: BTreeSet<String>,

    /// Declared capabilities.
    pub capabilities: BTreeSet<String>,
}

impl ProviderRecord {
    /// Load as a fraction of capacity, used as the selection tie-break.
    pub fn load_ratio(&self) -> f64 {
        self.current_load as f64 / self.capacity.max(1) as f64
    }
}

/// Registration request for one provider.
pub struct ProviderRegistration {
    /// Provider id; must be unused.
    pub provider_id: String,

    /// Protocol the provider implements; must be registered.
    pub protocol_id: String,

    /// Invocation handle.
    pub handle: ProviderHandle,

    /// Methods the provider supports.
    pub supported_methods: BTreeSet<String>,

    /// Selection tags.
    pub tags: BTreeSet<String>,

    /// Declared capabilities.
    pub capabilities: BTreeSet<String>,

    /// Concurrent capacity (>= 1).
    pub capacity: u32,
}

impl ProviderRegistration {
    /// Creates a registration with defaults (no tags, capacity 1).
    pub fn new(
        provider_id: impl Into<String>,
        protocol_id: impl Into<String>,
        handle: ProviderHandle,
        supported_methods: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            protocol_id: protocol_id.into(),
            handle,
            supported_methods: supported_methods.into_iter().collect(),
            tags: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            capacity: 1,
        }
    }

    /// Adds selection tags.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Adds capabilities.
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = String>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Sets the concurrent capacity.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}
