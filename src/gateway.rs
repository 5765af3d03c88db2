//! API Gateway: the only path for cross-service calls.
//!
//! Owns the `CircuitBreaker` table and `RateLimiter` buckets — neither the
//! registry nor the balancer sees either of these. Locking granularity
//! follows the shared-resource policy: one bucket lock per (instance,
//! capability) or (caller, capability) key, never a single lock over the
//! whole table.

use crate::balancer::LoadBalancer;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{event_types, EventPublisher};
use crate::registry::ServiceInstance;
use crate::types::InstanceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;

/// Narrow seam for the actual remote call — a collaborator trait, not a
/// direct network dependency baked into the gateway.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn call(&self, instance: &ServiceInstance, request: serde_json::Value) -> CoreResult<serde_json::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    state: CircuitState,
    window: std::collections::VecDeque<bool>,
    opened_at: Option<DateTime<Utc>>,
    half_open_consecutive_successes: u32,
    half_open_in_flight: bool,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: std::collections::VecDeque::new(),
            opened_at: None,
            half_open_consecutive_successes: 0,
            half_open_in_flight: false,
        }
    }

    fn failure_pct(&self) -> u32 {
        if self.window.is_empty() {
            return 0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        ((failures as f64 / self.window.len() as f64) * 100.0).round() as u32
    }

    /// Returns `Ok(probe)` if a call may proceed (`probe = true` means this
    /// call is the single admitted half-open probe), or an error if refused.
    fn admit(&mut self, cfg: &crate::config::GatewayConfig) -> CoreResult<bool> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooldown = Duration::from_secs(cfg.circuit_cooldown_secs);
                let elapsed = self.opened_at.map(|t| Utc::now() - t).unwrap_or_default();
                if elapsed.to_std().unwrap_or(Duration::ZERO) >= cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_consecutive_successes = 0;
                    self.half_open_in_flight = true;
                    Ok(true)
                } else {
                    Err(CoreError::Busy("circuit open".into()))
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight {
                    Err(CoreError::Busy("circuit half_open: probe in flight".into()))
                } else {
                    self.half_open_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Records the outcome of a dispatched (non-cancelled) call. Returns the
    /// transition to publish, if the state changed.
    fn record(&mut self, success: bool, cfg: &crate::config::GatewayConfig) -> Option<(CircuitState, CircuitState)> {
        let before = self.state;
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_in_flight = false;
                if success {
                    self.half_open_consecutive_successes += 1;
                    if self.half_open_consecutive_successes >= cfg.circuit_close_successes {
                        self.state = CircuitState::Closed;
                        self.window.clear();
                    }
                } else {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Utc::now());
                }
            }
            CircuitState::Closed => {
                if self.window.len() == cfg.circuit_window as usize {
                    self.window.pop_front();
                }
                self.window.push_back(success);
                if self.window.len() >= cfg.circuit_min_samples as usize && self.failure_pct() > cfg.circuit_failure_pct {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Utc::now());
                }
            }
            CircuitState::Open => {}
        }
        if before == self.state {
            None
        } else {
            Some((before, self.state))
        }
    }

    /// Cancelled calls count as neither success nor failure.
    fn record_cancelled(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_in_flight = false;
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: std::time::Instant,
    rate_per_sec: f64,
    burst: u32,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self { tokens: burst as f64, last_refill: std::time::Instant::now(), rate_per_sec, burst }
    }

    fn try_acquire(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst as f64);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type CircuitKey = (InstanceId, String);
type RateKey = (String, String, String);

/// Enforces rate limits, circuit breakers, and retries around a single
/// cross-service call.
pub struct ApiGateway {
    balancer: Arc<LoadBalancer>,
    dispatcher: Arc<dyn Dispatcher>,
    publisher: Arc<dyn EventPublisher>,
    config: crate::config::GatewayConfig,
    circuits: RwLock<HashMap<CircuitKey, Arc<AsyncMutex<CircuitBreaker>>>>,
    limiters: RwLock<HashMap<RateKey, Arc<AsyncMutex<TokenBucket>>>>,
}

impl ApiGateway {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        dispatcher: Arc<dyn Dispatcher>,
        publisher: Arc<dyn EventPublisher>,
        config: crate::config::GatewayConfig,
    ) -> Self {
        Self {
            balancer,
            dispatcher,
            publisher,
            config,
            circuits: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
        }
    }

    async fn circuit_for(&self, key: &CircuitKey) -> Arc<AsyncMutex<CircuitBreaker>> {
        if let Some(existing) = self.circuits.read().await.get(key) {
            return existing.clone();
        }
        let mut circuits = self.circuits.write().await;
        circuits
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(CircuitBreaker::new())))
            .clone()
    }

    async fn limiter_for(&self, key: &RateKey) -> Arc<AsyncMutex<TokenBucket>> {
        if let Some(existing) = self.limiters.read().await.get(key) {
            return existing.clone();
        }
        let mut limiters = self.limiters.write().await;
        limiters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(TokenBucket::new(self.config.default_rate_per_sec, self.config.default_burst))))
            .clone()
    }

    /// Routes one call through rate limiting, circuit breaking, load
    /// balancing and retries.
    pub async fn route(
        &self,
        caller: &str,
        capability: &str,
        request: serde_json::Value,
        deadline: Duration,
    ) -> CoreResult<serde_json::Value> {
        let rate_key = (caller.to_string(), capability.to_string(), capability.to_string());
        let limiter = self.limiter_for(&rate_key).await;
        if !limiter.lock().await.try_acquire() {
            self.publisher
                .publish(event_types::RATE_LIMITED, "gateway", serde_json::json!({"caller": caller, "capability": capability}), None)
                .await?;
            return Err(CoreError::Busy(format!("rate limit exceeded for {caller} -> {capability}")));
        }

        let started = std::time::Instant::now();
        let mut last_err: Option<CoreError> = None;

        for attempt in 0..=self.config.retry_max_attempts {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                break;
            }
            let remaining = deadline - elapsed;

            let lease = match self.balancer.pick(capability, None).await {
                Ok(lease) => lease,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };
            let instance = lease.instance.clone();
            let circuit_key = (instance.id.clone(), capability.to_string());
            let circuit = self.circuit_for(&circuit_key).await;

            let admitted = {
                let mut guard = circuit.lock().await;
                guard.admit(&self.config)
            };
            let probe = match admitted {
                Ok(probe) => probe,
                Err(e) => {
                    self.publisher
                        .publish(event_types::HEALING_NEEDED, "gateway", serde_json::json!({"instance_id": instance.id.0, "capability": capability}), None)
                        .await?;
                    last_err = Some(e);
                    if attempt < self.config.retry_max_attempts {
                        backoff(attempt, self.config.retry_base_backoff_ms).await;
                        continue;
                    }
                    break;
                }
            };
            let _ = probe;

            let call_timeout = Duration::from_millis(self.config.dispatch_timeout_ms).min(remaining);
            let outcome = tokio::time::timeout(call_timeout, self.dispatcher.call(&instance, request.clone())).await;

            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CoreError::Timeout(format!("dispatch to {} timed out", instance.id))),
            };

            let success = result.is_ok();
            let transition = circuit.lock().await.record(success, &self.config);
            if let Some((from, to)) = transition {
                self.publish_circuit_transition(&instance.id, capability, from, to).await?;
            }

            self.publisher
                .publish(
                    event_types::GATEWAY_REQUEST_ROUTED,
                    "gateway",
                    serde_json::json!({
                        "caller": caller,
                        "capability": capability,
                        "instance_id": instance.id.0,
                        "attempt": attempt,
                        "success": success,
                    }),
                    None,
                )
                .await?;

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable || attempt >= self.config.retry_max_attempts {
                        break;
                    }
                    backoff(attempt, self.config.retry_base_backoff_ms).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::Unavailable(format!("no instances available for {capability}"))))
    }

    async fn publish_circuit_transition(&self, id: &InstanceId, capability: &str, from: CircuitState, to: CircuitState) -> CoreResult<()> {
        let event_type = match to {
            CircuitState::Open => event_types::CIRCUIT_OPENED,
            CircuitState::Closed => event_types::CIRCUIT_CLOSED,
            CircuitState::HalfOpen => return Ok(()),
        };
        self.publisher
            .publish(
                event_type,
                "gateway",
                serde_json::json!({
                    "instance_id": id.0,
                    "capability": capability,
                    "from": format!("{from:?}"),
                    "to": format!("{to:?}"),
                }),
                None,
            )
            .await?;
        Ok(())
    }

    /// Current circuit breaker states for introspection (`GET
    /// /api/gateway/circuit-breakers`).
    pub async fn circuit_snapshot(&self) -> Vec<(InstanceId, String, CircuitState)> {
        let circuits = self.circuits.read().await;
        let mut out = Vec::with_capacity(circuits.len());
        for ((id, capability), breaker) in circuits.iter() {
            out.push((id.clone(), capability.clone(), breaker.lock().await.state));
        }
        out
    }
}

async fn backoff(attempt: u32, base_ms: u64) {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10));
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.max(1) / 2);
    tokio::time::sleep(Duration::from_millis(exp + jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::event_bus::EventBus;
    use crate::registry::{Endpoint, HealthStatus, ServiceKind, ServiceRegistry};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysFail;
    #[async_trait]
    impl Dispatcher for AlwaysFail {
        async fn call(&self, _instance: &ServiceInstance, _request: serde_json::Value) -> CoreResult<serde_json::Value> {
            Err(CoreError::Unavailable("down".into()))
        }
    }

    struct AlwaysOk;
    #[async_trait]
    impl Dispatcher for AlwaysOk {
        async fn call(&self, _instance: &ServiceInstance, _request: serde_json::Value) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct CountingDispatcher {
        calls: AtomicU32,
    }
    #[async_trait]
    impl Dispatcher for CountingDispatcher {
        async fn call(&self, _instance: &ServiceInstance, _request: serde_json::Value) -> CoreResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Unavailable("down".into()))
        }
    }

    async fn single_healthy_instance(capability: &str) -> (Arc<ServiceRegistry>, InstanceId) {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let registry = Arc::new(ServiceRegistry::new(bus));
        let caps: BTreeSet<String> = [capability.to_string()].into_iter().collect();
        let id = registry
            .register(ServiceKind::Domain, Endpoint { host: "h".into(), port: 1, path_prefix: None }, caps, 100, HashMap::new(), None)
            .await
            .unwrap();
        registry.set_status(&id, HealthStatus::Healthy).await.unwrap();
        (registry, id)
    }

    fn fast_gateway_config() -> GatewayConfig {
        GatewayConfig {
            circuit_window: 4,
            circuit_failure_pct: 50,
            circuit_min_samples: 2,
            circuit_cooldown_secs: 0,
            circuit_close_successes: 1,
            retry_max_attempts: 2,
            retry_base_backoff_ms: 1,
            dispatch_timeout_ms: 1000,
            default_rate_per_sec: 1000.0,
            default_burst: 1000,
        }
    }

    #[tokio::test]
    async fn rate_limit_refuses_the_burst_plus_one_call() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let (registry, _id) = single_healthy_instance("chat").await;
        let balancer = Arc::new(LoadBalancer::new(registry, crate::balancer::Strategy::RoundRobin));
        let mut cfg = fast_gateway_config();
        cfg.default_rate_per_sec = 0.0;
        cfg.default_burst = 2;
        let gateway = ApiGateway::new(balancer, Arc::new(AlwaysOk), bus, cfg);

        assert!(gateway.route("caller", "chat", serde_json::json!({}), Duration::from_millis(500)).await.is_ok());
        assert!(gateway.route("caller", "chat", serde_json::json!({}), Duration::from_millis(500)).await.is_ok());
        let refused = gateway.route("caller", "chat", serde_json::json!({}), Duration::from_millis(500)).await;
        assert!(matches!(refused, Err(CoreError::Busy(_))));
    }

    #[tokio::test]
    async fn repeated_failures_open_the_circuit_then_refuse_without_dispatch() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let (registry, _id) = single_healthy_instance("chat").await;
        let balancer = Arc::new(LoadBalancer::new(registry, crate::balancer::Strategy::RoundRobin));
        let dispatcher = Arc::new(CountingDispatcher { calls: AtomicU32::new(0) });
        let gateway = ApiGateway::new(balancer, dispatcher.clone(), bus, fast_gateway_config());

        let _ = gateway.route("caller", "chat", serde_json::json!({}), Duration::from_secs(1)).await;
        let calls_after_first = dispatcher.calls.load(Ordering::SeqCst);
        assert!(calls_after_first >= 2);

        let _ = gateway.route("caller", "chat", serde_json::json!({}), Duration::from_secs(1)).await;

        let snapshot = gateway.circuit_snapshot().await;
        assert!(snapshot.iter().any(|(_, _, state)| *state == CircuitState::Open));

        let calls_before = dispatcher.calls.load(Ordering::SeqCst);
        let refused = gateway.route("caller", "chat", serde_json::json!({}), Duration::from_secs(1)).await;
        assert!(matches!(refused, Err(CoreError::Busy(_)) | Err(CoreError::Unavailable(_))));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), calls_before, "open circuit must not dispatch");
    }

    #[tokio::test]
    async fn half_open_probe_is_admitted_once_cooldown_elapses() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let (registry, _id) = single_healthy_instance("chat").await;
        let balancer = Arc::new(LoadBalancer::new(registry, crate::balancer::Strategy::RoundRobin));
        let mut cfg = fast_gateway_config();
        cfg.retry_max_attempts = 0;
        let gateway = ApiGateway::new(balancer, Arc::new(AlwaysFail), bus, cfg.clone());

        let _ = gateway.route("caller", "chat", serde_json::json!({}), Duration::from_secs(1)).await;
        let _ = gateway.route("caller", "chat", serde_json::json!({}), Duration::from_secs(1)).await;
        assert!(gateway.circuit_snapshot().await.iter().any(|(_, _, s)| *s == CircuitState::Open));

        // `circuit_cooldown_secs` is 0 in `fast_gateway_config`, so the open
        // breaker must admit exactly one half-open probe on the next check.
        let key = gateway.circuits.read().await.keys().next().cloned().unwrap();
        let breaker = gateway.circuit_for(&key).await;
        let first_probe = breaker.lock().await.admit(&cfg);
        assert_eq!(first_probe.unwrap(), true);
        let second_probe = breaker.lock().await.admit(&cfg);
        assert!(matches!(second_probe, Err(CoreError::Busy(_))));
    }
}
