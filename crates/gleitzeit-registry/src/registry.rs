//! The protocol/provider catalog with health-aware routing.

use dashmap::DashMap;
use gleitzeit_core::{
    ErrorKind, InvocationError, InvocationRequest, InvocationResponse, ProtocolSpec,
    ProviderHealth,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::health::{HealthConfig, HealthState};
use crate::provider::{
    HubTransport, ProviderHandle, ProviderRecord, ProviderRegistration, SelectionRequirements,
};

struct ProviderEntry {
    protocol_id: String,
    handle: ProviderHandle,
    supported_methods: BTreeSet<String>,
    tags: BTreeSet<String>,
    capabilities: BTreeSet<String>,
    capacity: u32,
    load: AtomicU32,
    health: Mutex<HealthState>,
}

impl ProviderEntry {
    fn record(&self, provider_id: &str, config: &HealthConfig) -> ProviderRecord {
        let health = self.health.lock();
        ProviderRecord {
            provider_id: provider_id.to_string(),
            protocol_id: self.protocol_id.clone(),
            supported_methods: self.supported_methods.clone(),
            health: health.health(config, Instant::now()),
            last_health_check: health.last_health_check(),
            current_load: self.load.load(Ordering::Relaxed),
            capacity: self.capacity,
            tags: self.tags.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Catalog of protocols and the providers implementing them.
///
/// Health counters may be updated concurrently; updates are commutative
/// and reads are allowed to be slightly stale.
pub struct ProviderRegistry {
    config: HealthConfig,
    protocols: DashMap<String, ProtocolSpec>,
    providers: DashMap<String, Arc<ProviderEntry>>,
    hub_transport: RwLock<Option<Arc<dyn HubTransport>>>,
    round_robin: AtomicUsize,
}

impl ProviderRegistry {
    /// Creates a registry with the given health configuration.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            protocols: DashMap::new(),
            providers: DashMap::new(),
            hub_transport: RwLock::new(None),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Health configuration in effect.
    pub fn health_config(&self) -> &HealthConfig {
        &self.config
    }

    /// Installs the transport used by `Hub` handles.
    pub fn set_hub_transport(&self, transport: Arc<dyn HubTransport>) {
        *self.hub_transport.write() = Some(transport);
    }

    /// Registers a protocol specification.
    pub fn register_protocol(&self, spec: ProtocolSpec) -> RegistryResult<()> {
        if self.protocols.contains_key(&spec.id) {
            return Err(RegistryError::ProtocolAlreadyExists(spec.id));
        }
        info!("registered protocol {}", spec.id);
        self.protocols.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Looks up a protocol specification.
    pub fn get_protocol(&self, protocol_id: &str) -> Option<ProtocolSpec> {
        self.protocols.get(protocol_id).map(|p| p.value().clone())
    }

    /// Registers a provider for an already-registered protocol.
    ///
    /// Every declared method must be part of the protocol specification.
    pub fn register_provider(&self, registration: ProviderRegistration) -> RegistryResult<()> {
        let protocol = self
            .protocols
            .get(&registration.protocol_id)
            .ok_or_else(|| RegistryError::ProtocolNotFound(registration.protocol_id.clone()))?;

        if self.providers.contains_key(&registration.provider_id) {
            return Err(RegistryError::ProviderAlreadyExists(
                registration.provider_id,
            ));
        }

        for method in &registration.supported_methods {
            if !protocol.has_method(method) {
                return Err(RegistryError::UnsupportedMethod {
                    protocol: registration.protocol_id.clone(),
                    method: method.clone(),
                });
            }
        }
        drop(protocol);

        info!(
            "registered provider {} for {} ({} methods)",
            registration.provider_id,
            registration.protocol_id,
            registration.supported_methods.len()
        );

        self.providers.insert(
            registration.provider_id,
            Arc::new(ProviderEntry {
                protocol_id: registration.protocol_id,
                handle: registration.handle,
                supported_methods: registration.supported_methods,
                tags: registration.tags,
                capabilities: registration.capabilities,
                capacity: registration.capacity.max(1),
                load: AtomicU32::new(0),
                health: Mutex::new(HealthState::new()),
            }),
        );
        Ok(())
    }

    /// Removes a provider from the catalog.
    pub fn unregister_provider(&self, provider_id: &str) -> RegistryResult<()> {
        self.providers
            .remove(provider_id)
            .ok_or_else(|| RegistryError::ProviderNotFound(provider_id.to_string()))?;
        info!("unregistered provider {}", provider_id);
        Ok(())
    }

    /// Selects one provider for a protocol method.
    ///
    /// Tie-break order: healthy before unknown before degraded (half-open),
    /// then lowest load/capacity ratio, then round-robin among the
    /// remaining candidates. Unhealthy providers never qualify.
    pub fn select_provider(
        &self,
        protocol_id: &str,
        method: &str,
        requirements: &SelectionRequirements,
    ) -> RegistryResult<(String, ProviderHandle)> {
        let mut candidates: Vec<(String, Arc<ProviderEntry>, u8, f64)> = Vec::new();

        for item in self.providers.iter() {
            let entry = item.value();
            if entry.protocol_id != protocol_id || !entry.supported_methods.contains(method) {
                continue;
            }

            let record = entry.record(item.key(), &self.config);
            if !record.health.is_selectable() || !requirements.matches(&record) {
                continue;
            }

            let rank = match record.health {
                ProviderHealth::Healthy => 0,
                ProviderHealth::Unknown => 1,
                ProviderHealth::Degraded => 2,
                ProviderHealth::Unhealthy => unreachable!(),
            };
            candidates.push((
                item.key().clone(),
                Arc::clone(entry),
                rank,
                record.load_ratio(),
            ));
        }

        if candidates.is_empty() {
            return Err(RegistryError::NoProviderAvailable {
                protocol: protocol_id.to_string(),
                method: method.to_string(),
            });
        }

        let best = candidates
            .iter()
            .map(|(_, _, rank, ratio)| (*rank, *ratio))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap();

        let mut tied: Vec<&(String, Arc<ProviderEntry>, u8, f64)> = candidates
            .iter()
            .filter(|(_, _, rank, ratio)| (*rank, *ratio) == best)
            .collect();
        tied.sort_by(|a, b| a.0.cmp(&b.0));

        let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) % tied.len();
        let (provider_id, entry, _, _) = tied[pick];

        debug!("selected provider {} for {} {}", provider_id, protocol_id, method);
        Ok((provider_id.clone(), entry.handle.clone()))
    }

    /// Dispatches an invocation through a handle.
    ///
    /// The handle abstracts local call vs hub-mediated call; a hub handle
    /// without a configured transport fails with a transport error.
    pub async fn invoke(
        &self,
        handle: &ProviderHandle,
        request: InvocationRequest,
    ) -> InvocationResponse {
        match handle {
            ProviderHandle::Local(client) => client.invoke(request).await,
            ProviderHandle::Hub { endpoint } => {
                let transport = self.hub_transport.read().clone();
                match transport {
                    Some(transport) => transport.invoke(endpoint, request).await,
                    None => InvocationResponse::failure(
                        request.id.clone(),
                        InvocationError::new(
                            ErrorKind::Transport,
                            format!("no hub transport configured for endpoint {}", endpoint),
                        ),
                    ),
                }
            }
        }
    }

    /// Marks the start of an invocation on a provider.
    pub fn acquire_slot(&self, provider_id: &str) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.load.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Marks the end of an invocation on a provider.
    pub fn release_slot(&self, provider_id: &str) {
        if let Some(entry) = self.providers.get(provider_id) {
            let _ = entry
                .load
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(1))
                });
        }
    }

    /// Feeds a successful invocation into the health estimator.
    pub fn record_success(&self, provider_id: &str, latency: Duration) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.health.lock().record_success();
            debug!("provider {} ok in {:?}", provider_id, latency);
        }
    }

    /// Feeds a failed invocation into the health estimator. Only
    /// transport-level kinds count toward the circuit.
    pub fn record_failure(&self, provider_id: &str, kind: ErrorKind) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.health.lock().record_failure(kind, &self.config);
            warn!("provider {} failed with {:?}", provider_id, kind);
        }
    }

    /// Records an externally observed heartbeat.
    pub fn record_heartbeat(&self, provider_id: &str, alive: bool) {
        if let Some(entry) = self.providers.get(provider_id) {
            entry.health.lock().record_heartbeat(alive);
        }
    }

    /// Actively probes a provider and records the outcome. Returns the
    /// probe result; unknown providers report `false`.
    pub async fn probe(&self, provider_id: &str) -> bool {
        let Some(entry) = self
            .providers
            .get(provider_id)
            .map(|e| Arc::clone(e.value()))
        else {
            return false;
        };

        let alive = match &entry.handle {
            ProviderHandle::Local(client) => client.health_check().await,
            ProviderHandle::Hub { endpoint } => {
                let transport = self.hub_transport.read().clone();
                match transport {
                    Some(transport) => transport.health_check(endpoint).await,
                    None => false,
                }
            }
        };

        entry.health.lock().record_heartbeat(alive);
        alive
    }

    /// Current health classification of one provider.
    pub fn provider_health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.providers.get(provider_id).map(|entry| {
            entry
                .health
                .lock()
                .health(&self.config, Instant::now())
        })
    }

    /// Snapshot of one provider record.
    pub fn get_record(&self, provider_id: &str) -> Option<ProviderRecord> {
        self.providers
            .get(provider_id)
            .map(|entry| entry.record(provider_id, &self.config))
    }

    /// Snapshot of every provider record, ordered by id.
    pub fn list_providers(&self) -> Vec<ProviderRecord> {
        let mut records: Vec<ProviderRecord> = self
            .providers
            .iter()
            .map(|item| item.value().record(item.key(), &self.config))
            .collect();
        records.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        records
    }

    /// Ids of every provider, for health-probe scheduling.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|item| item.key().clone()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoProvider;
    use gleitzeit_core::MethodSpec;

    fn echo_protocol() -> ProtocolSpec {
        EchoProvider::protocol_spec()
    }

    fn registry_with_echo(ids: &[&str]) -> ProviderRegistry {
        let registry = ProviderRegistry::default();
        registry.register_protocol(echo_protocol()).unwrap();
        for id in ids {
            let provider = Arc::new(EchoProvider::new(*id));
            registry
                .register_provider(ProviderRegistration::new(
                    id.to_string(),
                    "echo/v1",
                    ProviderHandle::Local(provider),
                    EchoProvider::methods(),
                ))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_protocol_rejected() {
        let registry = ProviderRegistry::default();
        registry.register_protocol(echo_protocol()).unwrap();
        assert!(matches!(
            registry.register_protocol(echo_protocol()),
            Err(RegistryError::ProtocolAlreadyExists(_))
        ));
    }

    #[test]
    fn test_provider_requires_known_protocol() {
        let registry = ProviderRegistry::default();
        let provider = Arc::new(EchoProvider::new("echo-1"));
        let err = registry.register_provider(ProviderRegistration::new(
            "echo-1",
            "echo/v1",
            ProviderHandle::Local(provider),
            EchoProvider::methods(),
        ));
        assert!(matches!(err, Err(RegistryError::ProtocolNotFound(_))));
    }

    #[test]
    fn test_undeclared_method_rejected() {
        let registry = ProviderRegistry::default();
        registry.register_protocol(echo_protocol()).unwrap();

        let provider = Arc::new(EchoProvider::new("echo-1"));
        let err = registry.register_provider(ProviderRegistration::new(
            "echo-1",
            "echo/v1",
            ProviderHandle::Local(provider),
            vec!["echo/shout".to_string()],
        ));
        assert!(matches!(err, Err(RegistryError::UnsupportedMethod { .. })));
    }

    #[test]
    fn test_selection_no_provider() {
        let registry = registry_with_echo(&[]);
        let err = registry.select_provider("echo/v1", "echo/ping", &SelectionRequirements::none());
        assert!(matches!(err, Err(RegistryError::NoProviderAvailable { .. })));
    }

    #[test]
    fn test_selection_prefers_healthy() {
        let registry = registry_with_echo(&["a", "b"]);

        // Trip b's circuit.
        for _ in 0..registry.health_config().consecutive_failures {
            registry.record_failure("b", ErrorKind::Transport);
        }
        registry.record_success("a", Duration::from_millis(5));

        for _ in 0..10 {
            let (id, _) = registry
                .select_provider("echo/v1", "echo/ping", &SelectionRequirements::none())
                .unwrap();
            assert_eq!(id, "a");
        }
    }

    #[test]
    fn test_selection_prefers_lower_load() {
        let registry = registry_with_echo(&["a", "b"]);
        registry.record_success("a", Duration::from_millis(1));
        registry.record_success("b", Duration::from_millis(1));

        registry.acquire_slot("a");

        let (id, _) = registry
            .select_provider("echo/v1", "echo/ping", &SelectionRequirements::none())
            .unwrap();
        assert_eq!(id, "b");

        registry.release_slot("a");
    }

    #[test]
    fn test_round_robin_among_ties() {
        let registry = registry_with_echo(&["a", "b", "c"]);
        for id in ["a", "b", "c"] {
            registry.record_success(id, Duration::from_millis(1));
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let (id, _) = registry
                .select_provider("echo/v1", "echo/ping", &SelectionRequirements::none())
                .unwrap();
            seen.insert(id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_requirements_filter() {
        let registry = ProviderRegistry::default();
        registry.register_protocol(echo_protocol()).unwrap();
        registry
            .register_provider(
                ProviderRegistration::new(
                    "tagged",
                    "echo/v1",
                    ProviderHandle::Local(Arc::new(EchoProvider::new("tagged"))),
                    EchoProvider::methods(),
                )
                .with_tags(vec!["gpu".to_string()]),
            )
            .unwrap();

        let mut reqs = SelectionRequirements::none();
        reqs.tags.insert("tpu".to_string());
        assert!(registry
            .select_provider("echo/v1", "echo/ping", &reqs)
            .is_err());

        let mut reqs = SelectionRequirements::none();
        reqs.tags.insert("gpu".to_string());
        assert!(registry
            .select_provider("echo/v1", "echo/ping", &reqs)
            .is_ok());
    }

    #[tokio::test]
    async fn test_hub_handle_without_transport_fails() {
        let registry = ProviderRegistry::default();
        let mut spec = echo_protocol();
        spec.id = "remote/v1".to_string();
        spec.methods
            .insert("remote/run".into(), MethodSpec::new("remote/run", ""));
        registry.register_protocol(spec).unwrap();

        let handle = ProviderHandle::Hub {
            endpoint: "provider-7".to_string(),
        };
        let request = InvocationRequest::new(
            "remote/run",
            serde_json::Map::new(),
            chrono::Utc::now() + chrono::Duration::seconds(5),
        );

        let response = registry.invoke(&handle, request).await;
        match response {
            InvocationResponse::Failure { error, .. } => {
                assert_eq!(error.kind(), ErrorKind::Transport);
            }
            _ => panic!("expected transport failure"),
        }
    }

    #[tokio::test]
    async fn test_probe_records_heartbeat() {
        let registry = registry_with_echo(&["a"]);
        assert!(registry.probe("a").await);
        assert_eq!(
            registry.provider_health("a"),
            Some(ProviderHealth::Healthy)
        );
        assert!(!registry.probe("missing").await);
    }
}
