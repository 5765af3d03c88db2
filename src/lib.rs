//! Grace Core — the in-process service mesh and governed action pipeline
//! underlying a self-managing agent platform.
//!
//! # Architecture
//!
//! Three tightly-coupled subsystems, wired leaf-first by [`CoreRuntime`]:
//!
//! - **Service Mesh** — [`registry`] (auto-discovering registry),
//! [`balancer`] (load balancing), [`health`] (health state machine) and
//! [`gateway`] (circuit breakers, rate limits, retries).
//! - **Event Bus & Domain Coordination** — [`event_bus`], a typed pub/sub
//! fabric with per-source sequencing and optional cryptographic signing.
//! - **Governed Action Pipeline** — [`action`] (tiered approval and
//! contracts), [`snapshot`] (capture/restore), [`playbook`] (remediation
//! lifecycle), [`incident`] (append-only MTTR log) and [`meta`] (the
//! proactive metrics loop).
//!
//! # Core Principles
//!
//! - Cross-component references are by id, never by direct handle.
//! - Every background loop is its own task; no component polls another's
//! internals.
//! - Retries, circuit breaking and rate limiting are invisible to callers
//! beyond the error taxonomy in [`error`].

pub mod action;
pub mod api;
pub mod balancer;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod gateway;
pub mod health;
pub mod incident;
pub mod meta;
pub mod playbook;
pub mod registry;
pub mod snapshot;
pub mod types;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};

use std::collections::HashMap;
use std::sync::Arc;

use action::{ActionGateway, DenyAllPolicy, EmptyWorldState, PolicyEvaluator, WorldStateProvider};
use balancer::{LoadBalancer, Strategy};
use event_bus::EventBus;
use gateway::{ApiGateway, Dispatcher};
use health::HealthMonitor;
use incident::IncidentLog;
use meta::{MetricsCollector, ThresholdRule};
use playbook::PlaybookExecutor;
use registry::{HttpProber, Prober, ServiceRegistry};
use snapshot::{SnapshotManager, SnapshotSource};

/// Dispatcher that always reports the target unreachable. Used when no
/// collaborator-specific `Dispatcher` is wired — the distilled spec treats
/// the actual cross-domain RPC transport as an external concern .
pub struct UnimplementedDispatcher;
#[async_trait::async_trait]
impl Dispatcher for UnimplementedDispatcher {
    async fn call(&self, instance: &registry::ServiceInstance, _request: serde_json::Value) -> CoreResult<serde_json::Value> {
        Err(CoreError::Unavailable(format!("no dispatcher wired for instance {}", instance.id)))
    }
}

/// Snapshot source that captures/restores nothing. A real deployment wires
/// a collaborator-specific `SnapshotSource` per action kind .
pub struct NullSnapshotSource;
#[async_trait::async_trait]
impl SnapshotSource for NullSnapshotSource {
    async fn capture_blob(&self, _kind: &str) -> CoreResult<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn restore_blob(&self, _kind: &str, _blob: &[u8]) -> CoreResult<()> {
        Ok(())
    }
}

/// Metrics collector with nothing to report. Real deployments wire a
/// collaborator that samples CPU, queue depth, approval backlog, etc.
pub struct NullMetricsCollector;
#[async_trait::async_trait]
impl MetricsCollector for NullMetricsCollector {
    async fn sample(&self) -> CoreResult<Vec<meta::MetricSample>> {
        Ok(Vec::new())
    }
}

/// The fully-wired core runtime: every component constructed in the
/// dependency order from (Event Bus → Incident Log → Service
/// Registry → Health Monitor → Load Balancer → Snapshot Manager →
/// Contract Verifier → Action Gateway → API Gateway → Playbook Executor →
/// Proactive Intelligence → Meta Loop), each wired to its collaborators by
/// narrow trait object rather than a direct field into another component's
/// internals .
pub struct CoreRuntime {
    pub config: CoreConfig,
    pub event_bus: Arc<EventBus>,
    pub incidents: Arc<IncidentLog>,
    pub registry: Arc<ServiceRegistry>,
    pub health: Arc<HealthMonitor>,
    pub balancer: Arc<LoadBalancer>,
    pub snapshots: Arc<SnapshotManager>,
    pub actions: Arc<ActionGateway>,
    pub api_gateway: Arc<ApiGateway>,
    pub playbooks: Arc<PlaybookExecutor>,
    pub meta_loop: Arc<meta::MetaLoop>,
    discovery_targets: Vec<registry::DiscoveryTarget>,
    discovery_prober: Arc<dyn Prober>,
}

/// Everything a caller can override when assembling a runtime; anything
/// left `None` falls back to a conservative default (— "narrow
/// interface to its collaborators", supplied at construction time).
#[derive(Default)]
pub struct RuntimeOverrides {
    pub prober: Option<Arc<dyn Prober>>,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    pub snapshot_source: Option<Arc<dyn SnapshotSource>>,
    pub policy: Option<Arc<dyn PolicyEvaluator>>,
    pub world_state: Option<Arc<dyn WorldStateProvider>>,
    pub metrics_collector: Option<Arc<dyn MetricsCollector>>,
    pub load_balancer_strategy: Option<Strategy>,
    pub meta_rules: Vec<ThresholdRule>,
    pub tier_overrides: HashMap<String, types::Tier>,
    /// Candidate endpoints probed by the discovery sweep; empty means
    /// discovery is disabled and only explicit registration populates the
    /// registry.
    pub discovery_targets: Vec<registry::DiscoveryTarget>,
}

impl CoreRuntime {
    /// Constructs every component leaf-first and wires collaborators by
    /// trait object. Does not start any background task — call
    /// [`CoreRuntime::spawn_background_tasks`] once the caller has finished
    /// registering action handlers and playbooks.
    pub fn new(config: CoreConfig, overrides: RuntimeOverrides) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let incidents = Arc::new(IncidentLog::new(config.incident.clone(), event_bus.clone()));
        let registry = Arc::new(ServiceRegistry::new(event_bus.clone()));

        let prober = overrides.prober.unwrap_or_else(|| Arc::new(HttpProber::new()));
        let health = Arc::new(HealthMonitor::new(registry.clone(), prober.clone(), event_bus.clone(), config.health.clone()));

        let strategy = overrides.load_balancer_strategy.unwrap_or(Strategy::RoundRobin);
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), strategy));

        let snapshot_source = overrides.snapshot_source.unwrap_or_else(|| Arc::new(NullSnapshotSource));
        let snapshots = Arc::new(SnapshotManager::new(config.snapshot.clone(), snapshot_source));

        let policy = overrides.policy.unwrap_or_else(|| Arc::new(DenyAllPolicy));
        let world_state = overrides.world_state.unwrap_or_else(|| Arc::new(EmptyWorldState));

        let mut actions = ActionGateway::new(
            config.action.clone(),
            policy,
            world_state,
            snapshots.clone(),
            incidents.clone(),
            event_bus.clone(),
        );
        for (action_type, tier) in &overrides.tier_overrides {
            actions.set_minimum_tier(action_type, *tier);
        }
        let actions = Arc::new(actions);

        let dispatcher = overrides.dispatcher.unwrap_or_else(|| Arc::new(UnimplementedDispatcher));
        let api_gateway = Arc::new(ApiGateway::new(balancer.clone(), dispatcher, event_bus.clone(), config.gateway.clone()));

        let playbooks = Arc::new(PlaybookExecutor::new(config.playbook.clone()));

        let collector = overrides.metrics_collector.unwrap_or_else(|| Arc::new(NullMetricsCollector));
        let meta_loop = Arc::new(meta::MetaLoop::new(
            config.meta.clone(),
            collector,
            event_bus.clone(),
            actions.clone(),
            overrides.meta_rules,
        ));

        Self {
            config,
            event_bus,
            incidents,
            registry,
            health,
            balancer,
            snapshots,
            actions,
            api_gateway,
            playbooks,
            meta_loop,
            discovery_targets: overrides.discovery_targets,
            discovery_prober: prober,
        }
    }

    /// Registers the minimum playbook catalogue , backed by
    /// `steps` where the deployer has wired a real `RemediationStep` and by
    /// a not-configured stub everywhere else, so the admin surface always
    /// lists the full catalogue.
    pub async fn register_default_playbooks(&self, steps: HashMap<types::PlaybookId, Arc<dyn playbook::RemediationStep>>) {
        playbook::register_catalogue(&self.playbooks, steps).await;
    }

    /// Spawns the long-running tasks owned directly by the runtime: the
    /// meta loop, the health monitor's reconciliation loop (which starts and
    /// stops per-instance probe loops as instances register and deregister),
    /// and — when discovery targets are configured — the discovery sweep.
    /// Suppressed under `CI_MODE` / explicit config .
    pub fn spawn_background_tasks(&self) {
        if self.config.general.suppress_background_workers {
            tracing::info!("background workers suppressed (CI_MODE or explicit config)");
            return;
        }
        self.meta_loop.clone().spawn();
        self.health.clone().spawn_reconcile_loop();

        if !self.discovery_targets.is_empty() {
            let registry = self.registry.clone();
            let prober = self.discovery_prober.clone();
            let targets = self.discovery_targets.clone();
            let health_path = self.config.health.health_path.clone();
            let probe_timeout_ms = self.config.health.probe_timeout_ms;
            let interval_secs = self.config.registry.discovery_interval_secs;
            let demote_after_failures = self.config.registry.demote_after_failures;
            tokio::spawn(async move {
                registry.set_discovery_targets(targets).await;
                registry.spawn_discovery_sweep(
                    prober,
                    health_path,
                    probe_timeout_ms,
                    interval_secs,
                    demote_after_failures,
                );
            });
        }
    }

    /// Builds the HTTP router for the ingress API .
    pub fn router(&self) -> axum::Router {
        api::router(api::AppState {
            registry: self.registry.clone(),
            gateway: self.api_gateway.clone(),
            actions: self.actions.clone(),
            incidents: self.incidents.clone(),
            events: self.event_bus.clone(),
        })
    }

    /// Begins a graceful shutdown: stop admitting new action requests,
    /// allow in-flight executes to finish up to `grace_period`, then return
    /// (— "install signal handlers that drain the Action Gateway
    /// ... before stopping the event bus").
    pub async fn shutdown(&self, grace_period: std::time::Duration) {
        tracing::info!("beginning graceful shutdown, grace period {grace_period:?}");
        let deadline = tokio::time::Instant::now() + grace_period;
        while self.actions.pending_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        tracing::info!("shutdown complete");
    }
}

/// Initialize logging with the default level.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with an explicit default level, overridable by `RUST_LOG`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("grace_core={level},hyper=warn"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_file(false))
        .init();
}
