//! Per-provider health estimation: heartbeats plus a failure circuit.

use chrono::{DateTime, Utc};
use gleitzeit_core::{ErrorKind, ProviderHealth};
use std::time::{Duration, Instant};

/// Health estimator configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Expected heartbeat interval.
    pub heartbeat_window: Duration,

    /// Heartbeats that may be missed before the provider is unhealthy.
    pub missed_heartbeats: u32,

    /// Consecutive transport-level failures that open the circuit.
    pub consecutive_failures: u32,

    /// How long an open circuit blocks traffic before going half-open.
    pub cooldown: Duration,

    /// Interval between scheduled health probes.
    pub probe_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_window: Duration::from_secs(30),
            missed_heartbeats: 3,
            consecutive_failures: 5,
            cooldown: Duration::from_secs(30),
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Mutable health state of one provider.
///
/// Transitions: consecutive transport failures open the circuit; after the
/// cooldown it is half-open (eligible again, deprioritized) and one
/// success closes it. Independently, a heartbeat gap past the allowance
/// rules the provider unhealthy.
#[derive(Debug)]
pub struct HealthState {
    consecutive_failures: u32,
    circuit_opened_at: Option<Instant>,
    last_heartbeat: Option<Instant>,
    last_health_check: Option<DateTime<Utc>>,
    has_signal: bool,
}

impl HealthState {
    /// Fresh state with no signal.
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            circuit_opened_at: None,
            last_heartbeat: None,
            last_health_check: None,
            has_signal: false,
        }
    }

    /// Records a successful invocation or probe. One success closes an
    /// open circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.circuit_opened_at = None;
        self.has_signal = true;
    }

    /// Records a failed invocation. Transport and Timeout failures count
    /// toward the circuit; semantic provider errors say nothing about
    /// reachability.
    pub fn record_failure(&mut self, kind: ErrorKind, config: &HealthConfig) {
        self.has_signal = true;
        if !matches!(kind, ErrorKind::Transport | ErrorKind::Timeout) {
            return;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= config.consecutive_failures
            && self.circuit_opened_at.is_none()
        {
            self.circuit_opened_at = Some(Instant::now());
        }
    }

    /// Records a heartbeat or probe result.
    pub fn record_heartbeat(&mut self, alive: bool) {
        self.last_health_check = Some(Utc::now());
        self.has_signal = true;
        if alive {
            self.last_heartbeat = Some(Instant::now());
        }
    }

    /// Timestamp of the last heartbeat or probe.
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.last_health_check
    }

    /// Current classification.
    pub fn health(&self, config: &HealthConfig, now: Instant) -> ProviderHealth {
        if let Some(opened_at) = self.circuit_opened_at {
            return if now.duration_since(opened_at) >= config.cooldown {
                // Half-open: eligible again, behind healthy providers.
                ProviderHealth::Degraded
            } else {
                ProviderHealth::Unhealthy
            };
        }

        if let Some(last) = self.last_heartbeat {
            let allowance = config.heartbeat_window * config.missed_heartbeats;
            if now.duration_since(last) > allowance {
                return ProviderHealth::Unhealthy;
            }
        }

        if !self.has_signal {
            ProviderHealth::Unknown
        } else if self.consecutive_failures > 0 {
            ProviderHealth::Degraded
        } else {
            ProviderHealth::Healthy
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthConfig {
        HealthConfig {
            heartbeat_window: Duration::from_millis(50),
            missed_heartbeats: 2,
            consecutive_failures: 3,
            cooldown: Duration::from_millis(100),
            probe_interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_unknown_until_signal() {
        let state = HealthState::new();
        assert_eq!(state.health(&config(), Instant::now()), ProviderHealth::Unknown);
    }

    #[test]
    fn test_success_marks_healthy() {
        let mut state = HealthState::new();
        state.record_success();
        assert_eq!(state.health(&config(), Instant::now()), ProviderHealth::Healthy);
    }

    #[test]
    fn test_circuit_opens_after_consecutive_failures() {
        let cfg = config();
        let mut state = HealthState::new();

        state.record_failure(ErrorKind::Transport, &cfg);
        state.record_failure(ErrorKind::Transport, &cfg);
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Degraded);

        state.record_failure(ErrorKind::Transport, &cfg);
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Unhealthy);
    }

    #[test]
    fn test_semantic_failures_do_not_trip_circuit() {
        let cfg = config();
        let mut state = HealthState::new();

        for _ in 0..10 {
            state.record_failure(ErrorKind::ProviderError, &cfg);
        }
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Healthy);
    }

    #[test]
    fn test_half_open_then_close() {
        let cfg = config();
        let mut state = HealthState::new();

        for _ in 0..3 {
            state.record_failure(ErrorKind::Transport, &cfg);
        }
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Unhealthy);

        // After the cooldown the provider is eligible again.
        std::thread::sleep(cfg.cooldown + Duration::from_millis(10));
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Degraded);

        // One success closes the circuit.
        state.record_success();
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Healthy);
    }

    #[test]
    fn test_missed_heartbeats() {
        let cfg = config();
        let mut state = HealthState::new();

        state.record_heartbeat(true);
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Healthy);

        // Past the allowance the provider is unhealthy.
        std::thread::sleep(cfg.heartbeat_window * cfg.missed_heartbeats + Duration::from_millis(20));
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Unhealthy);

        // A fresh heartbeat restores it.
        state.record_heartbeat(true);
        assert_eq!(state.health(&cfg, Instant::now()), ProviderHealth::Healthy);
    }
}
