//! # Gleitzeit Registry
//!
//! Catalog of protocols and their providers, with health-aware routing.
//!
//! Protocols are named/versioned sets of method specifications; providers
//! are running implementations of one protocol, registered under a tagged
//! [`ProviderHandle`] (in-process client or hub endpoint). The registry
//! selects a provider per invocation — healthy before degraded, lowest
//! load ratio, round-robin among ties — and feeds invocation outcomes and
//! heartbeats into a per-provider health estimator with circuit-breaker
//! semantics.

pub mod echo;
pub mod error;
pub mod health;
pub mod provider;
pub mod registry;

pub use echo::EchoProvider;
pub use error::{RegistryError, RegistryResult};
pub use health::{HealthConfig, HealthState};
pub use provider::{
    HubTransport, ProviderClient, ProviderHandle, ProviderRecord, ProviderRegistration,
    SelectionRequirements,
};
pub use registry::ProviderRegistry;
