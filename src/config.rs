//! Configuration for the core runtime.
//!
//! Every configurable threshold named in the component sections is a field
//! here, loaded once at startup from a TOML file (or defaults). No hot
//! reload in v1.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, one sub-struct per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub general: GeneralConfig,
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub balancer: BalancerConfig,
    pub gateway: GatewayConfig,
    pub event_bus: EventBusConfig,
    pub action: ActionConfig,
    pub snapshot: SnapshotConfig,
    pub playbook: PlaybookConfig,
    pub incident: IncidentConfig,
    pub meta: MetaConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
            balancer: BalancerConfig::default(),
            gateway: GatewayConfig::default(),
            event_bus: EventBusConfig::default(),
            action: ActionConfig::default(),
            snapshot: SnapshotConfig::default(),
            playbook: PlaybookConfig::default(),
            incident: IncidentConfig::default(),
            meta: MetaConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file, creating a default one if absent.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| CoreError::ConfigError(format!("failed to parse config: {e}")))
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::ConfigError(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides (`GRACE_PORT`, `OFFLINE_MODE`, `DRY_RUN`,
    /// `CI_MODE`, `SEARCH_PROVIDER`). `CI_MODE` implies offline + dry-run and suppresses
    /// background workers.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("GRACE_PORT") {
            if let Ok(port) = port.parse() {
                self.general.port = port;
            }
        }
        if env_truthy("CI_MODE") {
            self.general.offline_mode = true;
            self.general.dry_run = true;
            self.general.suppress_background_workers = true;
        } else {
            if env_truthy("OFFLINE_MODE") {
                self.general.offline_mode = true;
            }
            if env_truthy("DRY_RUN") {
                self.general.dry_run = true;
            }
        }
        if let Ok(provider) = std::env::var("SEARCH_PROVIDER") {
            self.general.search_provider = provider;
        }
    }
}

fn env_truthy(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

/// General process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub data_dir: String,
    pub log_level: String,
    pub port: u16,
    #[serde(default)]
    pub offline_mode: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub suppress_background_workers: bool,
    #[serde(default = "default_search_provider")]
    pub search_provider: String,
}

fn default_search_provider() -> String {
    "default".into()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "grace_data".into(),
            log_level: "info".into(),
            port: 8000,
            offline_mode: false,
            dry_run: false,
            suppress_background_workers: false,
            search_provider: default_search_provider(),
        }
    }
}

/// Service Registry & Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Discovery sweep interval in seconds (default 30).
    pub discovery_interval_secs: u64,
    /// Consecutive failed probes before a known instance is demoted rather than deregistered.
    pub demote_after_failures: u32,
    /// Path to the warm-start registry snapshot file.
    pub persistence_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: 30,
            demote_after_failures: 3,
            persistence_path: "registry/services.json".into(),
        }
    }
}

/// Health Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive successful probes required to move starting -> healthy.
    pub starting_to_healthy: u32,
    /// Error rate threshold (0.0-1.0) for healthy -> degraded.
    pub degrade_error_rate: f64,
    /// p95 latency threshold (ms) for healthy -> degraded.
    pub degrade_latency_p95_ms: u64,
    /// Error rate threshold for degraded -> unhealthy.
    pub unhealthy_error_rate: f64,
    /// Consecutive probe failures for degraded -> unhealthy.
    pub unhealthy_after_failures: u32,
    /// Default probe timeout.
    pub probe_timeout_ms: u64,
    /// Default probe interval per kind (domain, kernel, external), seconds.
    pub domain_probe_interval_secs: u64,
    pub kernel_probe_interval_secs: u64,
    pub external_probe_interval_secs: u64,
    /// HTTP path probed on every instance's endpoint (default "/health").
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// How often the monitor reconciles its running probe loops against the
    /// registry's instance list, seconds (default 5).
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_health_path() -> String {
    "/health".into()
}

fn default_reconcile_interval_secs() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            starting_to_healthy: 2,
            degrade_error_rate: 0.10,
            degrade_latency_p95_ms: 1000,
            unhealthy_error_rate: 0.50,
            unhealthy_after_failures: 3,
            probe_timeout_ms: 2000,
            domain_probe_interval_secs: 15,
            kernel_probe_interval_secs: 30,
            external_probe_interval_secs: 60,
            health_path: default_health_path(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

/// Load Balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Default strategy name: "round_robin" | "least_outstanding" | "health_aware" | "sticky".
    pub default_strategy: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round_robin".into(),
        }
    }
}

/// API Gateway configuration: circuit breaker, rate limiter, retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Circuit breaker rolling window size (W).
    pub circuit_window: usize,
    /// Failure percentage threshold to open (F), 0-100.
    pub circuit_failure_pct: u32,
    /// Minimum samples before the breaker can open (M).
    pub circuit_min_samples: usize,
    /// Cooldown before half_open, seconds (C).
    pub circuit_cooldown_secs: u64,
    /// Consecutive half-open successes required to close (K).
    pub circuit_close_successes: u32,
    /// Maximum retry attempts (R).
    pub retry_max_attempts: u32,
    /// Base backoff in milliseconds.
    pub retry_base_backoff_ms: u64,
    /// Per-call dispatch timeout in milliseconds.
    pub dispatch_timeout_ms: u64,
    /// Default rate limiter rate (tokens/sec).
    pub default_rate_per_sec: f64,
    /// Default rate limiter burst.
    pub default_burst: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            circuit_window: 20,
            circuit_failure_pct: 50,
            circuit_min_samples: 5,
            circuit_cooldown_secs: 30,
            circuit_close_successes: 3,
            retry_max_attempts: 3,
            retry_base_backoff_ms: 50,
            dispatch_timeout_ms: 5000,
            default_rate_per_sec: 50.0,
            default_burst: 100,
        }
    }
}

/// Event Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Bounded ring capacity per subscription.
    pub ring_capacity: usize,
    /// Watermark (events behind cursor) at which at_least_once backpressure kicks in.
    pub backpressure_watermark: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            backpressure_watermark: 512,
        }
    }
}

/// Action Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Idempotency window in minutes (T, default 10).
    pub idempotency_window_minutes: u64,
    /// Pending-approval backpressure watermark.
    pub pending_approval_watermark: usize,
    /// Default contract expiry, seconds.
    pub contract_expiry_secs: u64,
    /// Default action execution deadline, milliseconds.
    pub execute_deadline_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            idempotency_window_minutes: 10,
            pending_approval_watermark: 50,
            contract_expiry_secs: 300,
            execute_deadline_ms: 30_000,
        }
    }
}

/// Snapshot / Rollback Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Retention window, hours (default 24).
    pub retention_hours: u64,
    /// Storage root for snapshot blobs.
    pub storage_path: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            storage_path: "snapshots".into(),
        }
    }
}

/// Playbook Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookConfig {
    /// Cooldown after a recent failure before the same playbook is retried, seconds.
    pub failure_cooldown_secs: u64,
    /// Max attempts per incident before escalating.
    pub max_attempts: u32,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            failure_cooldown_secs: 60,
            max_attempts: 3,
        }
    }
}

/// Incident Log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    /// Directory holding `YYYY-MM-DD.jsonl` incident logs.
    pub log_dir: String,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            log_dir: "incidents".into(),
        }
    }
}

/// Proactive Intelligence / Meta Loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Metric sampling interval, seconds (default 30).
    pub sample_interval_secs: u64,
    /// Aggregation window, seconds (default 300 = 5 minutes).
    pub aggregation_window_secs: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 30,
            aggregation_window_secs: 300,
        }
    }
}
