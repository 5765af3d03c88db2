//! Playbook Executor & Registry.
//!
//! Every playbook exposes the same four-operation lifecycle; the concrete
//! remediation steps are domain-specific, so `ScriptedPlaybook` delegates
//! them to a `RemediationStep` collaborator rather than hard-coding 18
//! near-identical structs.

use crate::error::{CoreError, CoreResult};
use crate::types::PlaybookId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Stable playbook ids for the minimum catalogue.
pub mod catalogue {
    pub const RESTART_COMPONENT: &str = "restart-component";
    pub const CLEAR_PORT: &str = "clear-port";
    pub const DIAGNOSE_NETWORK: &str = "diagnose-network";
    pub const REBIND_PORT: &str = "rebind-port";

    pub const CLEAR_LOCKS: &str = "clear-locks";
    pub const CHECKPOINT_WAL: &str = "checkpoint-wal";
    pub const RESTORE_FROM_BACKUP: &str = "restore-from-backup";
    pub const CREATE_FRESH: &str = "create-fresh";

    pub const KILL_HUNG_REQUESTS: &str = "kill-hung-requests";
    pub const OPTIMIZE_PERFORMANCE: &str = "optimize-performance";
    pub const SCALE_UP: &str = "scale-up";
    pub const RESTART_SERVICE: &str = "restart-service";

    pub const SCALE_WORKERS: &str = "scale-workers";
    pub const THROTTLE_LEARNING: &str = "throttle-learning";
    pub const SHIFT_LOAD: &str = "shift-load";

    pub const TIGHTEN_GUARDRAILS: &str = "tighten-guardrails";
    pub const DOWNGRADE_AUTONOMY_TIER: &str = "downgrade-autonomy-tier";
    pub const LOCK_SUPERVISED: &str = "lock-supervised";

    pub const NETWORK_HEALING: &[&str] = &[RESTART_COMPONENT, CLEAR_PORT, DIAGNOSE_NETWORK, REBIND_PORT];
    pub const DATABASE: &[&str] = &[CLEAR_LOCKS, CHECKPOINT_WAL, RESTORE_FROM_BACKUP, CREATE_FRESH];
    pub const API_TIMEOUT: &[&str] = &[KILL_HUNG_REQUESTS, OPTIMIZE_PERFORMANCE, SCALE_UP, RESTART_SERVICE];
    pub const RESOURCE: &[&str] = &[SCALE_WORKERS, THROTTLE_LEARNING, SHIFT_LOAD];
    pub const SAFETY: &[&str] = &[TIGHTEN_GUARDRAILS, DOWNGRADE_AUTONOMY_TIER, LOCK_SUPERVISED];
}

/// A detected failure a playbook might remediate.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: String,
    pub context: serde_json::Value,
}

/// All stable catalogue ids in declaration order, for bulk registration.
pub fn all_catalogue_ids() -> Vec<PlaybookId> {
    catalogue::NETWORK_HEALING
        .iter()
        .chain(catalogue::DATABASE)
        .chain(catalogue::API_TIMEOUT)
        .chain(catalogue::RESOURCE)
        .chain(catalogue::SAFETY)
        .map(|id| PlaybookId::from(*id))
        .collect()
}

/// Narrow seam for the domain-specific remediation steps.
#[async_trait]
pub trait RemediationStep: Send + Sync {
    async fn dry_run(&self, failure: &Failure) -> CoreResult<serde_json::Value>;
    async fn execute(&self, failure: &Failure) -> CoreResult<serde_json::Value>;
    async fn verify(&self, failure: &Failure, outcome: &serde_json::Value) -> CoreResult<bool>;
    async fn rollback(&self, failure: &Failure, outcome: &serde_json::Value) -> CoreResult<bool>;
}

/// Uniform playbook lifecycle.
#[async_trait]
pub trait Playbook: Send + Sync {
    fn id(&self) -> &PlaybookId;
    fn applicable(&self, failure: &Failure) -> bool;
    async fn dry_run(&self, failure: &Failure) -> CoreResult<serde_json::Value>;
    async fn execute(&self, failure: &Failure) -> CoreResult<serde_json::Value>;
    async fn verify(&self, failure: &Failure, outcome: &serde_json::Value) -> bool;
    async fn rollback(&self, failure: &Failure, outcome: &serde_json::Value) -> CoreResult<bool>;
}

/// A playbook built from a declared set of applicable failure kinds plus a
/// `RemediationStep` collaborator carrying the actual logic.
pub struct ScriptedPlaybook {
    id: PlaybookId,
    applicable_kinds: HashSet<String>,
    step: Arc<dyn RemediationStep>,
}

impl ScriptedPlaybook {
    pub fn new(id: impl Into<PlaybookId>, applicable_kinds: impl IntoIterator<Item = String>, step: Arc<dyn RemediationStep>) -> Self {
        Self { id: id.into(), applicable_kinds: applicable_kinds.into_iter().collect(), step }
    }
}

/// Placeholder step for a catalogue entry the deployer hasn't wired a real
/// `RemediationStep` for yet. `verify` always reports failure so selection
/// ("highest recent success rate") never prefers an unconfigured playbook
/// over a real one applicable to the same failure kind.
pub struct NotConfiguredStep;
#[async_trait]
impl RemediationStep for NotConfiguredStep {
    async fn dry_run(&self, _failure: &Failure) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({"configured": false}))
    }
    async fn execute(&self, _failure: &Failure) -> CoreResult<serde_json::Value> {
        Err(CoreError::ConfigError("playbook has no RemediationStep configured".into()))
    }
    async fn verify(&self, _failure: &Failure, _outcome: &serde_json::Value) -> CoreResult<bool> {
        Ok(false)
    }
    async fn rollback(&self, _failure: &Failure, _outcome: &serde_json::Value) -> CoreResult<bool> {
        Ok(true)
    }
}

/// Registers the full minimum catalogue against `executor`, one
/// `ScriptedPlaybook` per stable id, applicable to a failure kind equal to
/// its own id by default. `steps` supplies the real `RemediationStep` per
/// id the deployer has wired; anything missing gets `NotConfiguredStep` so
/// the admin surface always lists the full catalogue.
pub async fn register_catalogue(executor: &PlaybookExecutor, mut steps: HashMap<PlaybookId, Arc<dyn RemediationStep>>) {
    for id in all_catalogue_ids() {
        let step = steps.remove(&id).unwrap_or_else(|| Arc::new(NotConfiguredStep) as Arc<dyn RemediationStep>);
        executor.register(Arc::new(ScriptedPlaybook::new(id.0.clone(), [id.0.clone()], step))).await;
    }
}

#[async_trait]
impl Playbook for ScriptedPlaybook {
    fn id(&self) -> &PlaybookId {
        &self.id
    }

    fn applicable(&self, failure: &Failure) -> bool {
        self.applicable_kinds.contains(&failure.kind)
    }

    async fn dry_run(&self, failure: &Failure) -> CoreResult<serde_json::Value> {
        self.step.dry_run(failure).await
    }

    async fn execute(&self, failure: &Failure) -> CoreResult<serde_json::Value> {
        self.step.execute(failure).await
    }

    async fn verify(&self, failure: &Failure, outcome: &serde_json::Value) -> bool {
        self.step.verify(failure, outcome).await.unwrap_or(false)
    }

    async fn rollback(&self, failure: &Failure, outcome: &serde_json::Value) -> CoreResult<bool> {
        self.step.rollback(failure, outcome).await
    }
}

/// Running counters for one playbook, readable through the admin API.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PlaybookStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    #[serde(skip)]
    last_failure_at: Option<DateTime<Utc>>,
}

impl PlaybookStats {
    fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            1.0
        } else {
            self.success_count as f64 / self.execution_count as f64
        }
    }

    fn in_cooldown(&self, cooldown_secs: u64) -> bool {
        match self.last_failure_at {
            Some(at) => Utc::now() - at < chrono::Duration::seconds(cooldown_secs as i64),
            None => false,
        }
    }
}

struct Registered {
    playbook: Arc<dyn Playbook>,
    stats: RwLock<PlaybookStats>,
}

/// Outcome of one `PlaybookExecutor::run` call.
pub enum RunOutcome {
    DryRun(serde_json::Value),
    Succeeded(serde_json::Value),
    RolledBack { error: String },
}

/// Selects and runs playbooks against detected failures.
pub struct PlaybookExecutor {
    config: crate::config::PlaybookConfig,
    playbooks: RwLock<HashMap<PlaybookId, Registered>>,
}

impl PlaybookExecutor {
    pub fn new(config: crate::config::PlaybookConfig) -> Self {
        Self { config, playbooks: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, playbook: Arc<dyn Playbook>) {
        let id = playbook.id().clone();
        self.playbooks.write().await.insert(id, Registered { playbook, stats: RwLock::new(PlaybookStats::default()) });
    }

    /// Picks the applicable playbook with the highest recent success rate,
    /// skipping any still in its post-failure cooldown.
    pub async fn select(&self, failure: &Failure) -> Option<PlaybookId> {
        let playbooks = self.playbooks.read().await;
        let mut best: Option<(PlaybookId, f64)> = None;
        for (id, registered) in playbooks.iter() {
            if !registered.playbook.applicable(failure) {
                continue;
            }
            let stats = registered.stats.read().await;
            if stats.in_cooldown(self.config.failure_cooldown_secs) {
                continue;
            }
            let rate = stats.success_rate();
            if best.as_ref().map(|(_, best_rate)| rate > *best_rate).unwrap_or(true) {
                best = Some((id.clone(), rate));
            }
        }
        best.map(|(id, _)| id)
    }

    pub async fn stats_of(&self, id: &PlaybookId) -> Option<PlaybookStats> {
        let playbooks = self.playbooks.read().await;
        let registered = playbooks.get(id)?;
        Some(registered.stats.read().await.clone())
    }

    /// Runs the given playbook's execute/verify (or dry_run) cycle and
    /// updates its counters. Holds the registry's read lock for the
    /// duration — it only ever blocks `register`, never `select`.
    pub async fn run(&self, id: &PlaybookId, failure: &Failure, dry_run: bool) -> CoreResult<RunOutcome> {
        let playbooks = self.playbooks.read().await;
        let registered = playbooks.get(id).ok_or_else(|| CoreError::ConfigError(format!("unknown playbook {id}")))?;
        let playbook = registered.playbook.clone();

        if dry_run {
            return Ok(RunOutcome::DryRun(playbook.dry_run(failure).await?));
        }

        let started = std::time::Instant::now();
        let outcome = match playbook.execute(failure).await {
            Ok(value) => value,
            Err(e) => {
                let mut stats = registered.stats.write().await;
                stats.execution_count += 1;
                stats.failure_count += 1;
                stats.last_error = Some(e.to_string());
                stats.last_failure_at = Some(Utc::now());
                stats.last_duration_ms = Some(started.elapsed().as_millis() as u64);
                return Err(e);
            }
        };

        let verified = playbook.verify(failure, &outcome).await;
        let mut stats = registered.stats.write().await;
        stats.execution_count += 1;
        stats.last_duration_ms = Some(started.elapsed().as_millis() as u64);

        if verified {
            stats.success_count += 1;
            drop(stats);
            Ok(RunOutcome::Succeeded(outcome))
        } else {
            stats.failure_count += 1;
            stats.last_error = Some("verify failed".to_string());
            stats.last_failure_at = Some(Utc::now());
            drop(stats);
            playbook.rollback(failure, &outcome).await?;
            Ok(RunOutcome::RolledBack { error: "verify failed".to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStep {
        verify_result: bool,
    }

    #[async_trait]
    impl RemediationStep for FixedStep {
        async fn dry_run(&self, _failure: &Failure) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({"plan": "noop"}))
        }
        async fn execute(&self, _failure: &Failure) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({"done": true}))
        }
        async fn verify(&self, _failure: &Failure, _outcome: &serde_json::Value) -> CoreResult<bool> {
            Ok(self.verify_result)
        }
        async fn rollback(&self, _failure: &Failure, _outcome: &serde_json::Value) -> CoreResult<bool> {
            Ok(true)
        }
    }

    fn failure(kind: &str) -> Failure {
        Failure { kind: kind.to_string(), context: serde_json::json!({}) }
    }

    #[tokio::test]
    async fn select_prefers_applicable_playbook_with_higher_success_rate() {
        let executor = PlaybookExecutor::new(crate::config::PlaybookConfig::default());
        executor
            .register(Arc::new(ScriptedPlaybook::new(
                catalogue::RESTART_COMPONENT,
                [catalogue::RESTART_COMPONENT.to_string()],
                Arc::new(FixedStep { verify_result: true }),
            )))
            .await;
        executor
            .register(Arc::new(ScriptedPlaybook::new(
                catalogue::CLEAR_PORT,
                [catalogue::RESTART_COMPONENT.to_string()],
                Arc::new(FixedStep { verify_result: false }),
            )))
            .await;

        let f = failure(catalogue::RESTART_COMPONENT);
        executor.run(&PlaybookId::from(catalogue::CLEAR_PORT), &f, false).await.unwrap();

        let selected = executor.select(&f).await.unwrap();
        assert_eq!(selected, PlaybookId::from(catalogue::RESTART_COMPONENT));
    }

    #[tokio::test]
    async fn verify_failure_triggers_rollback_and_records_failure() {
        let executor = PlaybookExecutor::new(crate::config::PlaybookConfig::default());
        let id = PlaybookId::from(catalogue::REBIND_PORT);
        executor
            .register(Arc::new(ScriptedPlaybook::new(catalogue::REBIND_PORT, [catalogue::REBIND_PORT.to_string()], Arc::new(FixedStep { verify_result: false }))))
            .await;

        let outcome = executor.run(&id, &failure(catalogue::REBIND_PORT), false).await.unwrap();
        assert!(matches!(outcome, RunOutcome::RolledBack { .. }));

        let stats = executor.stats_of(&id).await.unwrap();
        assert_eq!(stats.execution_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn failed_playbook_enters_cooldown_and_is_skipped_by_selection() {
        let mut cfg = crate::config::PlaybookConfig::default();
        cfg.failure_cooldown_secs = 3600;
        let executor = PlaybookExecutor::new(cfg);
        let id = PlaybookId::from(catalogue::CLEAR_LOCKS);
        executor
            .register(Arc::new(ScriptedPlaybook::new(catalogue::CLEAR_LOCKS, [catalogue::CLEAR_LOCKS.to_string()], Arc::new(FixedStep { verify_result: false }))))
            .await;

        let f = failure(catalogue::CLEAR_LOCKS);
        executor.run(&id, &f, false).await.unwrap();
        assert!(executor.select(&f).await.is_none());
    }

    #[tokio::test]
    async fn dry_run_does_not_touch_stats() {
        let executor = PlaybookExecutor::new(crate::config::PlaybookConfig::default());
        let id = PlaybookId::from(catalogue::CREATE_FRESH);
        executor
            .register(Arc::new(ScriptedPlaybook::new(catalogue::CREATE_FRESH, [catalogue::CREATE_FRESH.to_string()], Arc::new(FixedStep { verify_result: true }))))
            .await;

        let outcome = executor.run(&id, &failure(catalogue::CREATE_FRESH), true).await.unwrap();
        assert!(matches!(outcome, RunOutcome::DryRun(_)));
        assert_eq!(executor.stats_of(&id).await.unwrap().execution_count, 0);
    }
}
