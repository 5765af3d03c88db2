//! Load Balancer: picks one healthy instance for a capability.
//!
//! In-flight counters are owned here, not on `ServiceRegistry` — the
//! balancer tracks load, the registry tracks identity and health, and
//! neither holds a field pointing at the other (composition over
//! inheritance: a `Strategy` enum plus a thin `Picker` rather than a class
//! hierarchy of balancers).

use crate::error::{CoreError, CoreResult};
use crate::registry::{HealthState, HealthStatus, ServiceInstance, ServiceRegistry};
use crate::types::InstanceId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Strategy {
    RoundRobin,
    LeastOutstanding,
    HealthAware,
    Sticky,
}

/// Per-instance counters the balancer maintains independently of the
/// registry's `HealthState` (separate ownership).
#[derive(Debug, Default)]
struct InstanceStats {
    in_flight: AtomicU64,
}

/// A completed pick; callers must report completion so `in_flight` decays.
pub struct Lease {
    pub instance: ServiceInstance,
    balancer: Arc<LoadBalancerInner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.balancer.release(&self.instance.id);
    }
}

struct LoadBalancerInner {
    registry: Arc<ServiceRegistry>,
    // A std::sync::RwLock, not tokio's, so `Lease::drop` can release the
    // in-flight slot synchronously instead of skipping it when an async
    // read lock isn't immediately available.
    stats: std::sync::RwLock<HashMap<InstanceId, Arc<InstanceStats>>>,
    round_robin_counter: AtomicUsize,
    sticky_table: RwLock<HashMap<String, InstanceId>>,
}

impl LoadBalancerInner {
    fn release(&self, id: &InstanceId) {
        let stats = self.stats.read().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = stats.get(id) {
            s.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Selects a `ServiceInstance` for a capability per the configured strategy.
pub struct LoadBalancer {
    inner: Arc<LoadBalancerInner>,
    strategy: Strategy,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, strategy: Strategy) -> Self {
        Self {
            inner: Arc::new(LoadBalancerInner {
                registry,
                stats: std::sync::RwLock::new(HashMap::new()),
                round_robin_counter: AtomicUsize::new(0),
                sticky_table: RwLock::new(HashMap::new()),
            }),
            strategy,
        }
    }

    /// Picks an instance for `capability`, optionally pinned by `sticky_key`
    /// for the `Sticky` strategy (ignored otherwise). Returns
    /// `CoreError::Unavailable` when no healthy or degraded instance carries
    /// the capability ("NoCapacity" boundary).
    pub async fn pick(&self, capability: &str, sticky_key: Option<&str>) -> CoreResult<Lease> {
        let candidates = self.inner.registry.find_by_capability(capability).await;
        if candidates.is_empty() {
            return Err(CoreError::Unavailable(format!(
                "no capacity for capability '{capability}'"
            )));
        }

        let instance = match self.strategy {
            Strategy::RoundRobin => self.pick_round_robin(&candidates),
            Strategy::LeastOutstanding => self.pick_least_outstanding(&candidates).await,
            Strategy::HealthAware => self.pick_health_aware(&candidates).await,
            Strategy::Sticky => self.pick_sticky(&candidates, sticky_key).await,
        };

        self.reserve(&instance.id).await;
        Ok(Lease { instance, balancer: self.inner.clone() })
    }

    async fn reserve(&self, id: &InstanceId) {
        let mut stats = self.inner.stats.write().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(id.clone()).or_insert_with(|| Arc::new(InstanceStats::default()));
        entry.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    async fn in_flight_of(&self, id: &InstanceId) -> u64 {
        let stats = self.inner.stats.read().unwrap_or_else(|e| e.into_inner());
        stats.get(id).map(|s| s.in_flight.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn pick_round_robin(&self, candidates: &[ServiceInstance]) -> ServiceInstance {
        let idx = self.inner.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[idx].clone()
    }

    async fn pick_least_outstanding(&self, candidates: &[ServiceInstance]) -> ServiceInstance {
        let mut best = candidates[0].clone();
        let mut best_load = self.in_flight_of(&best.id).await;
        for candidate in &candidates[1..] {
            let load = self.in_flight_of(&candidate.id).await;
            if load < best_load {
                best = candidate.clone();
                best_load = load;
            }
        }
        best
    }

    async fn pick_sticky(&self, candidates: &[ServiceInstance], sticky_key: Option<&str>) -> ServiceInstance {
        let Some(key) = sticky_key else {
            return self.pick_round_robin(candidates);
        };

        {
            let table = self.inner.sticky_table.read().await;
            if let Some(pinned) = table.get(key) {
                if let Some(instance) = candidates.iter().find(|i| &i.id == pinned) {
                    return instance.clone();
                }
            }
        }

        let chosen = self.pick_round_robin(candidates);
        self.inner.sticky_table.write().await.insert(key.to_string(), chosen.id.clone());
        chosen
    }

    async fn pick_health_aware(&self, candidates: &[ServiceInstance]) -> ServiceInstance {
        let mut best = candidates[0].clone();
        let mut best_score = f64::MIN;
        for candidate in candidates {
            let health = self.inner.registry.health_of(&candidate.id).await;
            let in_flight = self.in_flight_of(&candidate.id).await;
            let score = health_aware_score(candidate, health.as_ref(), in_flight);
            if score > best_score {
                best = candidate.clone();
                best_score = score;
            }
        }
        best
    }
}

/// Composite scoring formula:
/// `0.3*(1-load_ratio) + 0.3*health_score + 0.25*(1-normalized_latency) + 0.15*success_rate`
fn health_aware_score(instance: &ServiceInstance, health: Option<&HealthState>, in_flight: u64) -> f64 {
    let capacity = (instance.weight as f64).max(1.0);
    let load_ratio = (in_flight as f64 / capacity).min(1.0);

    let health_score = match health.map(|h| h.status) {
        Some(HealthStatus::Healthy) => 1.0,
        Some(HealthStatus::Degraded) => 0.5,
        Some(HealthStatus::Starting) => 0.25,
        Some(HealthStatus::Unhealthy) | Some(HealthStatus::Quarantined) | None => 0.0,
    };

    const LATENCY_CEILING_MS: f64 = 2000.0;
    let normalized_latency = health
        .map(|h| (h.latency_p95_ms() as f64 / LATENCY_CEILING_MS).min(1.0))
        .unwrap_or(0.0);

    let success_rate = health.map(|h| 1.0 - h.error_rate()).unwrap_or(1.0);

    0.3 * (1.0 - load_ratio) + 0.3 * health_score + 0.25 * (1.0 - normalized_latency) + 0.15 * success_rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::registry::{Endpoint, ServiceKind};
    use std::collections::{BTreeSet, HashMap as Map};

    async fn registry_with_two_healthy(capability: &str) -> (Arc<ServiceRegistry>, InstanceId, InstanceId) {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(bus));
        let caps: BTreeSet<String> = [capability.to_string()].into_iter().collect();

        let a = registry
            .register(ServiceKind::Domain, Endpoint { host: "a".into(), port: 1, path_prefix: None }, caps.clone(), 100, Map::new(), None)
            .await
            .unwrap();
        let b = registry
            .register(ServiceKind::Domain, Endpoint { host: "b".into(), port: 2, path_prefix: None }, caps, 100, Map::new(), None)
            .await
            .unwrap();

        registry.set_status(&a, HealthStatus::Healthy).await.unwrap();
        registry.set_status(&b, HealthStatus::Healthy).await.unwrap();
        (registry, a, b)
    }

    #[tokio::test]
    async fn no_capacity_when_capability_has_no_healthy_instance() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(bus));
        let balancer = LoadBalancer::new(registry, Strategy::RoundRobin);
        let err = balancer.pick("missing-capability", None).await.unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn round_robin_alternates_between_candidates() {
        let (registry, a, b) = registry_with_two_healthy("chat").await;
        let balancer = LoadBalancer::new(registry, Strategy::RoundRobin);

        let first = balancer.pick("chat", None).await.unwrap().instance.id.clone();
        let second = balancer.pick("chat", None).await.unwrap().instance.id.clone();
        assert_ne!(first, second);
        assert!([&a, &b].contains(&&first));
        assert!([&a, &b].contains(&&second));
    }

    #[tokio::test]
    async fn least_outstanding_prefers_the_idle_instance() {
        let (registry, _a, _b) = registry_with_two_healthy("chat").await;
        let balancer = LoadBalancer::new(registry, Strategy::LeastOutstanding);

        // With equal (zero) load, the tie-break picks the first candidate;
        // holding its lease open should push the next pick to the other one.
        let held = balancer.pick("chat", None).await.unwrap();
        let next = balancer.pick("chat", None).await.unwrap();
        assert_ne!(next.instance.id, held.instance.id);
    }

    #[tokio::test]
    async fn sticky_key_pins_to_the_same_instance() {
        let (registry, _a, _b) = registry_with_two_healthy("chat").await;
        let balancer = LoadBalancer::new(registry, Strategy::Sticky);

        let first = balancer.pick("chat", Some("session-42")).await.unwrap().instance.id.clone();
        for _ in 0..5 {
            let again = balancer.pick("chat", Some("session-42")).await.unwrap().instance.id.clone();
            assert_eq!(first, again);
        }
    }

    #[tokio::test]
    async fn health_aware_prefers_healthy_over_degraded() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(bus));
        let caps: BTreeSet<String> = ["chat".to_string()].into_iter().collect();

        let healthy = registry
            .register(ServiceKind::Domain, Endpoint { host: "h".into(), port: 1, path_prefix: None }, caps.clone(), 100, Map::new(), None)
            .await
            .unwrap();
        let degraded = registry
            .register(ServiceKind::Domain, Endpoint { host: "d".into(), port: 2, path_prefix: None }, caps, 100, Map::new(), None)
            .await
            .unwrap();

        registry.set_status(&healthy, HealthStatus::Healthy).await.unwrap();
        registry.set_status(&degraded, HealthStatus::Degraded).await.unwrap();

        let balancer = LoadBalancer::new(registry, Strategy::HealthAware);
        let picked = balancer.pick("chat", None).await.unwrap().instance.id;
        assert_eq!(picked, healthy);
    }

    #[tokio::test]
    async fn lease_drop_releases_in_flight_slot() {
        let (registry, _a, _b) = registry_with_two_healthy("chat").await;
        let balancer = LoadBalancer::new(registry, Strategy::LeastOutstanding);

        let lease = balancer.pick("chat", None).await.unwrap();
        let held_id = lease.instance.id.clone();
        assert_eq!(balancer.in_flight_of(&held_id).await, 1);
        drop(lease);
        assert_eq!(balancer.in_flight_of(&held_id).await, 0);
    }
}
