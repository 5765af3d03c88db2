//! Service Registry & Discovery.
//!
//! Owns `ServiceInstance` and `HealthState` ("Ownership"); the
//! Health Monitor drives state transitions through the methods here rather
//! than mutating a shared struct directly, keeping registry mutation behind
//! a single writer lock per the concurrency model.

use crate::error::{CoreError, CoreResult};
use crate::event_bus::{event_types, EventPublisher};
use crate::types::{validate_capability, InstanceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Logical kind of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    Domain,
    Kernel,
    External,
}

/// Network address of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path_prefix: Option<String>,
}

impl Endpoint {
    pub fn health_url(&self, health_path: &str) -> String {
        let prefix = self.path_prefix.as_deref().unwrap_or("");
        format!("http://{}:{}{}{}", self.host, self.port, prefix, health_path)
    }
}

/// A registered addressable unit (ServiceInstance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub kind: ServiceKind,
    pub endpoint: Endpoint,
    pub capabilities: BTreeSet<String>,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub signing_key_ref: Option<String>,
}

/// Health status of an instance (state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Quarantined,
}

/// Per-instance health tracking (HealthState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub last_probe: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(skip, default)]
    latency_window_ms: VecDeque<u64>,
    /// Rolling window of recent probe outcomes (true = success), last 100 samples.
    #[serde(skip, default)]
    outcome_window: VecDeque<bool>,
}

const LATENCY_WINDOW_SIZE: usize = 100;
const OUTCOME_WINDOW_SIZE: usize = 100;

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Starting,
            last_probe: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            latency_window_ms: VecDeque::with_capacity(LATENCY_WINDOW_SIZE),
            outcome_window: VecDeque::with_capacity(OUTCOME_WINDOW_SIZE),
        }
    }
}

impl HealthState {
    /// Rolling error rate over the last 100 probe outcomes.
    pub fn error_rate(&self) -> f64 {
        if self.outcome_window.is_empty() {
            return 0.0;
        }
        let failures = self.outcome_window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcome_window.len() as f64
    }

    pub fn latency_p95_ms(&self) -> u64 {
        if self.latency_window_ms.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.latency_window_ms.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }

    fn record_latency(&mut self, latency_ms: u64) {
        if self.latency_window_ms.len() == LATENCY_WINDOW_SIZE {
            self.latency_window_ms.pop_front();
        }
        self.latency_window_ms.push_back(latency_ms);
    }

    pub(crate) fn record_outcome(&mut self, success: bool, latency_ms: Option<u64>) {
        self.last_probe = Some(Utc::now());
        if let Some(latency) = latency_ms {
            self.record_latency(latency);
        }
        if self.outcome_window.len() == OUTCOME_WINDOW_SIZE {
            self.outcome_window.pop_front();
        }
        self.outcome_window.push_back(success);
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }
    }
}

/// Probe seam shared by discovery and health monitoring (a narrow
/// interface to a collaborator rather than a direct network call inline).
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint, health_path: &str, timeout_ms: u64) -> CoreResult<u64>;
}

/// Default prober issuing a real HTTP GET against the instance's health path.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &Endpoint, health_path: &str, timeout_ms: u64) -> CoreResult<u64> {
        let url = endpoint.health_url(health_path);
        let started = std::time::Instant::now();
        let response = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.client.get(&url).send(),
        )
        .await
        .map_err(|_| CoreError::Timeout(format!("probe of {url} timed out")))?
        .map_err(|e| CoreError::Unavailable(format!("probe of {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Unavailable(format!("probe of {url} returned {}", response.status())));
        }
        Ok(started.elapsed().as_millis() as u64)
    }
}

/// A candidate endpoint for discovery sweeps, before it is a known instance.
#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub kind: ServiceKind,
    pub endpoint: Endpoint,
    pub capabilities: BTreeSet<String>,
}

/// Authoritative set of `ServiceInstance`s plus the capability index.
pub struct ServiceRegistry {
    instances: RwLock<HashMap<InstanceId, ServiceInstance>>,
    health: RwLock<HashMap<InstanceId, HealthState>>,
    capability_index: RwLock<HashMap<String, BTreeSet<InstanceId>>>,
    publisher: Arc<dyn EventPublisher>,
    discovery_targets: RwLock<Vec<DiscoveryTarget>>,
    discovery_failures: RwLock<HashMap<Endpoint, u32>>,
}

impl ServiceRegistry {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            capability_index: RwLock::new(HashMap::new()),
            publisher,
            discovery_targets: RwLock::new(Vec::new()),
            discovery_failures: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the set of candidate endpoints probed by the discovery sweep.
    pub async fn set_discovery_targets(&self, targets: Vec<DiscoveryTarget>) {
        *self.discovery_targets.write().await = targets;
    }

    pub async fn add_discovery_target(&self, target: DiscoveryTarget) {
        self.discovery_targets.write().await.push(target);
    }

    /// Register a new instance. Rejects duplicate (kind, endpoint) and
    /// invalid capability strings. Starts in `Starting` status.
    pub async fn register(
        &self,
        kind: ServiceKind,
        endpoint: Endpoint,
        capabilities: BTreeSet<String>,
        weight: u32,
        metadata: HashMap<String, String>,
        signing_key_ref: Option<String>,
    ) -> CoreResult<InstanceId> {
        for cap in &capabilities {
            validate_capability(cap).map_err(CoreError::ConfigError)?;
        }

        {
            let instances = self.instances.read().await;
            if instances
                .values()
                .any(|i| i.kind == kind && i.endpoint == endpoint)
            {
                return Err(CoreError::ConfigError(format!(
                    "instance already registered at {}:{}",
                    endpoint.host, endpoint.port
                )));
            }
        }

        let id = InstanceId::new();
        let instance = ServiceInstance {
            id: id.clone(),
            kind,
            endpoint,
            capabilities,
            weight: if weight == 0 { 100 } else { weight },
            metadata,
            registered_at: Utc::now(),
            signing_key_ref,
        };

        self.instances.write().await.insert(id.clone(), instance);
        self.health.write().await.insert(id.clone(), HealthState::default());

        self.publisher
            .publish(event_types::REGISTRY_ADDED, "registry", serde_json::json!({"instance_id": id.0}), None)
            .await?;

        Ok(id)
    }

    /// Remove an instance and its health/index entries. Idempotent.
    pub async fn deregister(&self, id: &InstanceId) -> CoreResult<()> {
        let removed = self.instances.write().await.remove(id);
        self.health.write().await.remove(id);
        if removed.is_some() {
            self.rebuild_capability_index().await;
            self.publisher
                .publish(event_types::REGISTRY_REMOVED, "registry", serde_json::json!({"instance_id": id.0}), None)
                .await?;
        }
        Ok(())
    }

    /// Returns all instances where status is healthy or degraded and the
    /// capability is present. Ordering is unspecified; callers defer
    /// selection to the load balancer.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<ServiceInstance> {
        let index = self.capability_index.read().await;
        let Some(ids) = index.get(capability) else {
            return Vec::new();
        };
        let instances = self.instances.read().await;
        ids.iter().filter_map(|id| instances.get(id).cloned()).collect()
    }

    pub async fn find_by_id(&self, id: &InstanceId) -> Option<ServiceInstance> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn list_all(&self) -> Vec<ServiceInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn health_of(&self, id: &InstanceId) -> Option<HealthState> {
        self.health.read().await.get(id).cloned()
    }

    pub async fn health_summary(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for state in self.health.read().await.values() {
            let key = match state.status {
                HealthStatus::Starting => "starting",
                HealthStatus::Healthy => "healthy",
                HealthStatus::Degraded => "degraded",
                HealthStatus::Unhealthy => "unhealthy",
                HealthStatus::Quarantined => "quarantined",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    /// Rebuild the capability index from scratch: an instance appears iff
    /// its status is healthy or degraded (CapabilityIndex invariant).
    pub async fn rebuild_capability_index(&self) {
        let instances = self.instances.read().await;
        let health = self.health.read().await;
        let mut index: HashMap<String, BTreeSet<InstanceId>> = HashMap::new();
        for instance in instances.values() {
            let eligible = matches!(
                health.get(&instance.id).map(|h| h.status),
                Some(HealthStatus::Healthy) | Some(HealthStatus::Degraded)
            );
            if !eligible {
                continue;
            }
            for cap in &instance.capabilities {
                index.entry(cap.clone()).or_default().insert(instance.id.clone());
            }
        }
        *self.capability_index.write().await = index;
    }

    /// Fold a probe outcome into an instance's rolling counters. Does not
    /// itself decide the next `HealthStatus` — the Health Monitor reads the
    /// updated state back via `health_of`, applies the transition
    /// function, and calls `set_status` if it changed.
    pub async fn record_probe_outcome(
        &self,
        id: &InstanceId,
        success: bool,
        latency_ms: Option<u64>,
    ) -> CoreResult<()> {
        let mut health = self.health.write().await;
        let state = health
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("no health state for {id}")))?;
        state.record_outcome(success, latency_ms);
        Ok(())
    }

    /// Directly set status (used for explicit quarantine/unquarantine and
    /// by the Health Monitor after computing a transition). Publishes
    /// `health.changed` carrying old and new state.
    pub async fn set_status(&self, id: &InstanceId, status: HealthStatus) -> CoreResult<()> {
        let mut health = self.health.write().await;
        let state = health
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("no health state for {id}")))?;
        let old_status = state.status;
        state.status = status;
        drop(health);
        self.rebuild_capability_index().await;
        self.publisher
            .publish(
                event_types::HEALTH_CHANGED,
                "registry",
                serde_json::json!({
                    "instance_id": id.0,
                    "old_status": format!("{:?}", old_status),
                    "new_status": format!("{:?}", status),
                }),
                None,
            )
            .await?;
        Ok(())
    }

    /// One pass of the discovery sweep: probe every candidate endpoint.
    /// A successful probe of an endpoint with no matching instance triggers
    /// `register`; a failed probe of an endpoint that already has a known
    /// instance counts toward demotion after `demote_after_failures`
    /// consecutive failures. Known instances are demoted, never
    /// deregistered, per the discovery contract.
    pub async fn discovery_sweep_once(
        &self,
        prober: &dyn Prober,
        health_path: &str,
        probe_timeout_ms: u64,
        demote_after_failures: u32,
    ) {
        let targets = self.discovery_targets.read().await.clone();
        for target in targets {
            let outcome = prober.probe(&target.endpoint, health_path, probe_timeout_ms).await;
            let existing_id = {
                let instances = self.instances.read().await;
                instances
                    .values()
                    .find(|i| i.kind == target.kind && i.endpoint == target.endpoint)
                    .map(|i| i.id.clone())
            };

            match (outcome.is_ok(), existing_id) {
                (true, None) => {
                    self.discovery_failures.write().await.remove(&target.endpoint);
                    if let Err(e) = self
                        .register(
                            target.kind,
                            target.endpoint.clone(),
                            target.capabilities.clone(),
                            100,
                            HashMap::new(),
                            None,
                        )
                        .await
                    {
                        tracing::warn!("discovery register failed for {:?}: {e}", target.endpoint);
                    }
                }
                (true, Some(_)) => {
                    self.discovery_failures.write().await.remove(&target.endpoint);
                }
                (false, Some(id)) => {
                    let demote = {
                        let mut failures = self.discovery_failures.write().await;
                        let count = failures.entry(target.endpoint.clone()).or_insert(0);
                        *count += 1;
                        *count >= demote_after_failures
                    };
                    if demote {
                        if let Some(state) = self.health_of(&id).await {
                            let next = match state.status {
                                HealthStatus::Healthy => Some(HealthStatus::Degraded),
                                HealthStatus::Degraded => Some(HealthStatus::Unhealthy),
                                HealthStatus::Starting => Some(HealthStatus::Unhealthy),
                                HealthStatus::Unhealthy | HealthStatus::Quarantined => None,
                            };
                            if let Some(next) = next {
                                if let Err(e) = self.set_status(&id, next).await {
                                    tracing::warn!("discovery demotion of {id} failed: {e}");
                                }
                            }
                        }
                    }
                }
                (false, None) => {
                    // Not yet a known instance; keep counting so a later
                    // success after flapping doesn't look like an instant
                    // first contact skipping the failure count.
                    let mut failures = self.discovery_failures.write().await;
                    *failures.entry(target.endpoint.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    /// Spawn the discovery sweep as its own task, probing all configured
    /// targets every `interval_secs`.
    pub fn spawn_discovery_sweep(
        self: Arc<Self>,
        prober: Arc<dyn Prober>,
        health_path: String,
        probe_timeout_ms: u64,
        interval_secs: u64,
        demote_after_failures: u32,
    ) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.discovery_sweep_once(prober.as_ref(), &health_path, probe_timeout_ms, demote_after_failures)
                    .await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::config::EventBusConfig;

    fn test_registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(EventBus::new(EventBusConfig::default())))
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint { host: "127.0.0.1".into(), port, path_prefix: None }
    }

    #[tokio::test]
    async fn register_rejects_duplicate_endpoint() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["chat".to_string()].into_iter().collect();
        registry.register(ServiceKind::Kernel, endpoint(9000), caps.clone(), 100, HashMap::new(), None).await.unwrap();
        let result = registry.register(ServiceKind::Kernel, endpoint(9000), caps, 100, HashMap::new(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn register_rejects_bad_capability_name() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["Not Kebab".to_string()].into_iter().collect();
        let result = registry.register(ServiceKind::Kernel, endpoint(9001), caps, 100, HashMap::new(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn starting_instance_is_absent_from_capability_index() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["chat".to_string()].into_iter().collect();
        registry.register(ServiceKind::Kernel, endpoint(9002), caps, 100, HashMap::new(), None).await.unwrap();
        assert!(registry.find_by_capability("chat").await.is_empty());
    }

    #[tokio::test]
    async fn healthy_instance_appears_in_capability_index() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["chat".to_string()].into_iter().collect();
        let id = registry.register(ServiceKind::Kernel, endpoint(9003), caps, 100, HashMap::new(), None).await.unwrap();
        registry.set_status(&id, HealthStatus::Healthy).await.unwrap();
        let found = registry.find_by_capability("chat").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[tokio::test]
    async fn deregister_then_register_yields_equivalent_index() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["search".to_string()].into_iter().collect();
        let id = registry.register(ServiceKind::External, endpoint(9004), caps.clone(), 100, HashMap::new(), None).await.unwrap();
        registry.set_status(&id, HealthStatus::Healthy).await.unwrap();
        registry.deregister(&id).await.unwrap();
        let id2 = registry.register(ServiceKind::External, endpoint(9004), caps, 100, HashMap::new(), None).await.unwrap();
        registry.set_status(&id2, HealthStatus::Healthy).await.unwrap();
        assert_eq!(registry.find_by_capability("search").await.len(), 1);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = test_registry();
        let id = InstanceId::new();
        registry.deregister(&id).await.unwrap();
        registry.deregister(&id).await.unwrap();
    }

    struct FixedOutcomeProber {
        succeeds: bool,
    }

    #[async_trait]
    impl Prober for FixedOutcomeProber {
        async fn probe(&self, _endpoint: &Endpoint, _health_path: &str, _timeout_ms: u64) -> CoreResult<u64> {
            if self.succeeds {
                Ok(1)
            } else {
                Err(CoreError::Unavailable("probe failed".into()))
            }
        }
    }

    #[tokio::test]
    async fn discovery_sweep_registers_unknown_instance_on_success() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["chat".to_string()].into_iter().collect();
        registry
            .set_discovery_targets(vec![DiscoveryTarget { kind: ServiceKind::Domain, endpoint: endpoint(9100), capabilities: caps }])
            .await;
        let prober = FixedOutcomeProber { succeeds: true };
        registry.discovery_sweep_once(&prober, "/health", 1000, 3).await;
        assert_eq!(registry.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn discovery_sweep_demotes_known_instance_after_consecutive_failures() {
        let registry = test_registry();
        let caps: BTreeSet<String> = ["chat".to_string()].into_iter().collect();
        let id = registry.register(ServiceKind::Domain, endpoint(9101), caps.clone(), 100, HashMap::new(), None).await.unwrap();
        registry.set_status(&id, HealthStatus::Healthy).await.unwrap();
        registry.set_discovery_targets(vec![DiscoveryTarget { kind: ServiceKind::Domain, endpoint: endpoint(9101), capabilities: caps }]).await;

        let prober = FixedOutcomeProber { succeeds: false };
        for _ in 0..3 {
            registry.discovery_sweep_once(&prober, "/health", 1000, 3).await;
        }

        let state = registry.health_of(&id).await.unwrap();
        assert_eq!(state.status, HealthStatus::Degraded);
        assert!(registry.find_by_id(&id).await.is_some(), "demotion must not deregister");
    }
}
