//! Health Monitor: drives `HealthState` transitions.
//!
//! Every long-running probe loop runs on its own task; this module
//! contains the pure state-machine function plus the task that calls it,
//! separated so the transition logic is unit-testable without a clock or a
//! network.

use crate::config::HealthConfig;
use crate::event_bus::EventPublisher;
use crate::registry::{Endpoint, HealthState, HealthStatus, Prober, ServiceKind, ServiceRegistry};
use crate::types::InstanceId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Pure transition function for the state machine. `current`
/// is the status *before* this probe; `state` has already had the probe
/// outcome folded into its rolling counters.
pub fn compute_transition(current: HealthStatus, state: &HealthState, config: &HealthConfig) -> HealthStatus {
    match current {
        HealthStatus::Quarantined => HealthStatus::Quarantined,
        HealthStatus::Starting => {
            if state.consecutive_successes >= config.starting_to_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Starting
            }
        }
        HealthStatus::Healthy => {
            if state.error_rate() > config.degrade_error_rate
                || state.latency_p95_ms() > config.degrade_latency_p95_ms
            {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
        HealthStatus::Degraded => {
            if state.error_rate() > config.unhealthy_error_rate
                || state.consecutive_failures >= config.unhealthy_after_failures
            {
                HealthStatus::Unhealthy
            } else if state.consecutive_successes >= config.starting_to_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            }
        }
        HealthStatus::Unhealthy => {
            if state.consecutive_successes >= 1 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            }
        }
    }
}

/// Resolves the configured probe interval for a given instance kind.
pub fn probe_interval(kind: ServiceKind, config: &HealthConfig) -> Duration {
    let secs = match kind {
        ServiceKind::Domain => config.domain_probe_interval_secs,
        ServiceKind::Kernel => config.kernel_probe_interval_secs,
        ServiceKind::External => config.external_probe_interval_secs,
    };
    Duration::from_secs(secs)
}

/// Drives probe loops for registered instances.
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    prober: Arc<dyn Prober>,
    publisher: Arc<dyn EventPublisher>,
    config: HealthConfig,
    /// Per-instance probe loop handles, reconciled against the registry's
    /// instance list so every registered instance ends up probed exactly
    /// once and deregistered instances stop being probed.
    loops: RwLock<HashMap<InstanceId, JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        prober: Arc<dyn Prober>,
        publisher: Arc<dyn EventPublisher>,
        config: HealthConfig,
    ) -> Self {
        Self { registry, prober, publisher, config, loops: RwLock::new(HashMap::new()) }
    }

    /// Probe a single instance once and apply the resulting transition.
    /// Exposed separately from the loop so tests can drive individual ticks.
    pub async fn probe_once(&self, id: &InstanceId, endpoint: &Endpoint, health_path: &str) -> crate::error::CoreResult<()> {
        let outcome = self.prober.probe(endpoint, health_path, self.config.probe_timeout_ms).await;
        let (success, latency_ms) = match outcome {
            Ok(latency) => (true, Some(latency)),
            Err(_) => (false, None),
        };

        self.registry.record_probe_outcome(id, success, latency_ms).await?;

        if let Some(state) = self.registry.health_of(id).await {
            let next = compute_transition(state.status, &state, &self.config);
            if next != state.status {
                // `set_status` publishes `health.changed` with old/new state.
                self.registry.set_status(id, next).await?;
            }
        }
        Ok(())
    }

    /// Spawn the per-instance probe loop. Runs until the process shuts down;
    /// cooperative suspension happens at the probe's network await point and
    /// the sleep between probes.
    pub fn spawn_probe_loop(
        self: Arc<Self>,
        id: InstanceId,
        endpoint: Endpoint,
        kind: ServiceKind,
        health_path: String,
    ) -> JoinHandle<()> {
        let interval = probe_interval(kind, &self.config);
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.probe_once(&id, &endpoint, &health_path).await {
                    tracing::warn!("probe of {id} failed: {e}");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Spawn the reconciliation loop: on every tick, start a probe loop for
    /// any registered instance that doesn't have one yet and abort the loop
    /// of any instance no longer in the registry. This is how registration
    /// (direct or via discovery) ends up probed without the registry holding
    /// a direct handle back into the monitor.
    pub fn spawn_reconcile_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.clone().reconcile().await;
            }
        })
    }

    async fn reconcile(self: Arc<Self>) {
        let instances = self.registry.list_all().await;
        let known_ids: std::collections::HashSet<InstanceId> =
            instances.iter().map(|i| i.id.clone()).collect();

        let stale: Vec<InstanceId> = {
            let loops = self.loops.read().await;
            loops.keys().filter(|id| !known_ids.contains(*id)).cloned().collect()
        };
        if !stale.is_empty() {
            let mut loops = self.loops.write().await;
            for id in stale {
                if let Some(handle) = loops.remove(&id) {
                    handle.abort();
                }
            }
        }

        for instance in instances {
            if self.loops.read().await.contains_key(&instance.id) {
                continue;
            }
            let health_path = self.config.health_path.clone();
            let handle = self.clone().spawn_probe_loop(
                instance.id.clone(),
                instance.endpoint.clone(),
                instance.kind,
                health_path,
            );
            self.loops.write().await.insert(instance.id, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthConfig {
        HealthConfig::default()
    }

    fn state_with(successes: u32, failures: u32, outcomes: &[bool]) -> HealthState {
        let mut state = HealthState::default();
        for ok in outcomes {
            state.record_outcome(*ok, Some(10));
        }
        state.consecutive_successes = successes;
        state.consecutive_failures = failures;
        state
    }

    #[test]
    fn starting_to_healthy_after_k_successes() {
        let cfg = config();
        let state = state_with(2, 0, &[true, true]);
        assert_eq!(compute_transition(HealthStatus::Starting, &state, &cfg), HealthStatus::Healthy);
    }

    #[test]
    fn starting_stays_starting_below_k() {
        let cfg = config();
        let state = state_with(1, 0, &[true]);
        assert_eq!(compute_transition(HealthStatus::Starting, &state, &cfg), HealthStatus::Starting);
    }

    #[test]
    fn healthy_degrades_on_error_rate() {
        let cfg = config();
        let outcomes = [false, false, true, true, true, true, true, true, true, true];
        let state = state_with(4, 0, &outcomes);
        assert_eq!(compute_transition(HealthStatus::Healthy, &state, &cfg), HealthStatus::Degraded);
    }

    #[test]
    fn degraded_escalates_to_unhealthy_after_consecutive_failures() {
        let cfg = config();
        let state = state_with(0, 3, &[false, false, false]);
        assert_eq!(compute_transition(HealthStatus::Degraded, &state, &cfg), HealthStatus::Unhealthy);
    }

    #[test]
    fn unhealthy_recovers_to_degraded_after_one_success() {
        let cfg = config();
        let state = state_with(1, 0, &[false, false, false, true]);
        assert_eq!(compute_transition(HealthStatus::Unhealthy, &state, &cfg), HealthStatus::Degraded);
    }

    #[test]
    fn quarantined_never_auto_transitions() {
        let cfg = config();
        let state = state_with(5, 0, &[true, true, true, true, true]);
        assert_eq!(compute_transition(HealthStatus::Quarantined, &state, &cfg), HealthStatus::Quarantined);
    }

    struct AlwaysOkProber;

    #[async_trait::async_trait]
    impl Prober for AlwaysOkProber {
        async fn probe(&self, _endpoint: &Endpoint, _health_path: &str, _timeout_ms: u64) -> crate::error::CoreResult<u64> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn reconcile_starts_a_probe_loop_for_every_registered_instance() {
        let bus = Arc::new(crate::event_bus::EventBus::new(crate::config::EventBusConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(bus.clone()));
        let id = registry
            .register(
                ServiceKind::Domain,
                Endpoint { host: "127.0.0.1".into(), port: 9500, path_prefix: None },
                Default::default(),
                100,
                std::collections::HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let monitor = Arc::new(HealthMonitor::new(registry, Arc::new(AlwaysOkProber), bus, config()));
        monitor.clone().reconcile().await;

        assert!(monitor.loops.read().await.contains_key(&id));
    }

    #[tokio::test]
    async fn reconcile_aborts_the_loop_of_a_deregistered_instance() {
        let bus = Arc::new(crate::event_bus::EventBus::new(crate::config::EventBusConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(bus.clone()));
        let id = registry
            .register(
                ServiceKind::Domain,
                Endpoint { host: "127.0.0.1".into(), port: 9501, path_prefix: None },
                Default::default(),
                100,
                std::collections::HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let monitor = Arc::new(HealthMonitor::new(registry.clone(), Arc::new(AlwaysOkProber), bus, config()));
        monitor.clone().reconcile().await;
        assert!(monitor.loops.read().await.contains_key(&id));

        registry.deregister(&id).await.unwrap();
        monitor.clone().reconcile().await;
        assert!(!monitor.loops.read().await.contains_key(&id));
    }
}
