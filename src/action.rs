//! Action Gateway & Contract/Verification layer.
//!
//! Owns `ActionRequest`, `ActionContract`, and the open-incident set
//! ("Ownership"). Collaborators it needs — snapshot capture, incident
//! recording, the actual domain execution — are narrow traits,
//! never direct references into those components' state.

use crate::error::{CoreError, CoreResult};
use crate::event_bus::{event_types, EventPublisher};
use crate::types::{IncidentId, SnapshotId, Tier, TraceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A proposed state-changing action. Immutable once accepted.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub trace_id: TraceId,
    pub action_type: String,
    pub proposer: String,
    pub params: serde_json::Value,
    pub declared_tier: Tier,
    pub justification: String,
    pub risk_tag: Option<String>,
}

/// A predicate over a world-state snapshot, used for pre/postconditions.
pub type Predicate = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// How to reverse a committed action if verification later fails.
#[derive(Clone)]
pub enum ReversalHint {
    Snapshot(SnapshotId),
    Playbook(crate::types::PlaybookId),
    None,
}

/// Derived from an `ActionRequest`. Bound 1:1 to the request.
#[derive(Clone)]
pub struct ActionContract {
    pub trace_id: TraceId,
    pub preconditions: Vec<Predicate>,
    pub postconditions: Vec<Predicate>,
    pub reversal_hint: ReversalHint,
    pub expiry: DateTime<Utc>,
}

/// Builds contracts per action type. Actions with no registered factory get
/// an empty contract (no preconditions/postconditions beyond tiering).
pub trait ContractFactory: Send + Sync {
    fn build(&self, request: &ActionRequest, expiry: DateTime<Utc>) -> ActionContract;
}

struct DefaultContractFactory;
impl ContractFactory for DefaultContractFactory {
    fn build(&self, request: &ActionRequest, expiry: DateTime<Utc>) -> ActionContract {
        ActionContract {
            trace_id: request.trace_id,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            reversal_hint: ReversalHint::None,
            expiry,
        }
    }
}

/// Executes the domain-specific side effect for one action type.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> CoreResult<serde_json::Value>;
}

/// Supplies the world-state snapshot contracts evaluate predicates against.
#[async_trait]
pub trait WorldStateProvider: Send + Sync {
    async fn snapshot(&self) -> serde_json::Value;
}

/// Default provider for action types with no registered contract (and thus
/// no predicates that would ever inspect the snapshot).
pub struct EmptyWorldState;
#[async_trait]
impl WorldStateProvider for EmptyWorldState {
    async fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Decides whether a tier-2 request can skip explicit approval.
pub trait PolicyEvaluator: Send + Sync {
    fn auto_approve(&self, request: &ActionRequest) -> bool;
}

/// Conservative default: nothing above tier 1 is auto-approved.
pub struct DenyAllPolicy;
impl PolicyEvaluator for DenyAllPolicy {
    fn auto_approve(&self, _request: &ActionRequest) -> bool {
        false
    }
}

#[async_trait]
pub trait SnapshotCapture: Send + Sync {
    async fn capture(&self, trace_id: TraceId, kind: &str) -> CoreResult<SnapshotId>;
    async fn restore(&self, snapshot_id: &SnapshotId) -> CoreResult<()>;
}

#[async_trait]
pub trait IncidentRecorder: Send + Sync {
    async fn open(&self, failure_kind: &str) -> CoreResult<IncidentId>;
    async fn attach_action(&self, incident_id: IncidentId, trace_id: TraceId) -> CoreResult<()>;
    async fn close(&self, incident_id: IncidentId, outcome: &str) -> CoreResult<()>;
}

/// Terminal or in-progress state of a submitted action, returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ActionState {
    PendingApproval,
    Rejected,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionResult {
    pub trace_id: TraceId,
    pub state: ActionState,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

struct PendingApproval {
    request: ActionRequest,
    tier: Tier,
    contract: ActionContract,
}

/// Governs every state-changing action proposed in the system.
pub struct ActionGateway {
    pub config: crate::config::ActionConfig,
    tier_overrides: HashMap<String, Tier>,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    contract_factories: RwLock<HashMap<String, Arc<dyn ContractFactory>>>,
    default_factory: Arc<dyn ContractFactory>,
    policy: Arc<dyn PolicyEvaluator>,
    world: Arc<dyn WorldStateProvider>,
    snapshots: Arc<dyn SnapshotCapture>,
    incidents: Arc<dyn IncidentRecorder>,
    publisher: Arc<dyn EventPublisher>,
    pending: RwLock<HashMap<TraceId, PendingApproval>>,
    resolved: RwLock<HashMap<TraceId, (DateTime<Utc>, ActionResult)>>,
    open_incidents: RwLock<HashMap<TraceId, IncidentId>>,
}

impl ActionGateway {
    pub fn new(
        config: crate::config::ActionConfig,
        policy: Arc<dyn PolicyEvaluator>,
        world: Arc<dyn WorldStateProvider>,
        snapshots: Arc<dyn SnapshotCapture>,
        incidents: Arc<dyn IncidentRecorder>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            tier_overrides: HashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            contract_factories: RwLock::new(HashMap::new()),
            default_factory: Arc::new(DefaultContractFactory),
            policy,
            world,
            snapshots,
            incidents,
            publisher,
            pending: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
            open_incidents: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the minimum tier an action type is promoted to regardless
    /// of what the caller declares (tier promotion).
    pub fn set_minimum_tier(&mut self, action_type: &str, tier: Tier) {
        self.tier_overrides.insert(action_type.to_string(), tier);
    }

    pub async fn register_handler(&self, action_type: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().await.insert(action_type.to_string(), handler);
    }

    pub async fn register_contract_factory(&self, action_type: &str, factory: Arc<dyn ContractFactory>) {
        self.contract_factories.write().await.insert(action_type.to_string(), factory);
    }

    fn effective_tier(&self, request: &ActionRequest) -> Tier {
        match self.tier_overrides.get(&request.action_type) {
            Some(min) if *min > request.declared_tier => *min,
            _ => request.declared_tier,
        }
    }

    /// Submits an action request. Idempotent on `trace_id` within the
    /// configured window.
    pub async fn submit(&self, request: ActionRequest) -> CoreResult<ActionResult> {
        if let Some(result) = self.lookup_idempotent(&request.trace_id).await {
            return Ok(result);
        }
        if self.pending.read().await.contains_key(&request.trace_id) {
            return Ok(ActionResult {
                trace_id: request.trace_id,
                state: ActionState::PendingApproval,
                output: None,
                error: None,
            });
        }

        let tier = self.effective_tier(&request);
        let requires_approval = match tier {
            Tier::Tier1 => false,
            Tier::Tier2 => !self.policy.auto_approve(&request),
            Tier::Tier3 => true,
        };

        let expiry = Utc::now() + chrono::Duration::seconds(self.config.contract_expiry_secs as i64);
        let contract = {
            let factories = self.contract_factories.read().await;
            factories
                .get(&request.action_type)
                .cloned()
                .unwrap_or_else(|| self.default_factory.clone())
                .build(&request, expiry)
        };

        if requires_approval {
            let mut pending = self.pending.write().await;
            if pending.len() >= self.config.pending_approval_watermark {
                return Err(CoreError::Busy("pending-approval watermark exceeded".into()));
            }
            let trace_id = request.trace_id;
            pending.insert(trace_id, PendingApproval { request, tier, contract });
            drop(pending);
            self.publisher
                .publish(event_types::APPROVAL_REQUESTED, "action_gateway", serde_json::json!({"trace_id": trace_id.0}), None)
                .await?;
            return Ok(ActionResult { trace_id, state: ActionState::PendingApproval, output: None, error: None });
        }

        self.run(request, tier, contract, None).await
    }

    /// Approves a pending tier-2/3 action. Tier 3 requires a distinct
    /// principal from the proposer.
    pub async fn approve(&self, trace_id: TraceId, approver: &str) -> CoreResult<ActionResult> {
        if let Some((_, result)) = self.resolved.read().await.get(&trace_id) {
            let _ = result;
            return Err(CoreError::Busy(format!("action {trace_id} already resolved")));
        }
        let pending = {
            let mut pending = self.pending.write().await;
            pending.remove(&trace_id).ok_or_else(|| CoreError::NotFound(format!("no pending action {trace_id}")))?
        };

        if Utc::now() > pending.contract.expiry {
            self.mark_resolved(trace_id, ActionState::Rejected, None, Some("approval window expired".into())).await;
            return Err(CoreError::Busy(format!("approval window for {trace_id} expired")));
        }
        if pending.tier == Tier::Tier3 && approver == pending.request.proposer {
            return Err(CoreError::Denied("tier-3 approval must come from a distinct principal".into()));
        }

        self.publisher
            .publish(event_types::APPROVAL_GRANTED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "approver": approver}), None)
            .await?;

        self.run(pending.request, pending.tier, pending.contract, Some(approver.to_string())).await
    }

    pub async fn reject(&self, trace_id: TraceId, approver: &str) -> CoreResult<ActionResult> {
        if self.resolved.read().await.contains_key(&trace_id) {
            return Err(CoreError::Busy(format!("action {trace_id} already resolved")));
        }
        self.pending
            .write()
            .await
            .remove(&trace_id)
            .ok_or_else(|| CoreError::NotFound(format!("no pending action {trace_id}")))?;

        self.publisher
            .publish(event_types::APPROVAL_REJECTED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "by": approver}), None)
            .await?;

        let result = ActionResult { trace_id, state: ActionState::Rejected, output: None, error: None };
        self.resolved.write().await.insert(trace_id, (Utc::now(), result.clone()));
        Ok(result)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    async fn lookup_idempotent(&self, trace_id: &TraceId) -> Option<ActionResult> {
        let resolved = self.resolved.read().await;
        let (recorded_at, result) = resolved.get(trace_id)?;
        let window = chrono::Duration::minutes(self.config.idempotency_window_minutes as i64);
        if Utc::now() - *recorded_at <= window {
            Some(result.clone())
        } else {
            None
        }
    }

    async fn mark_resolved(&self, trace_id: TraceId, state: ActionState, output: Option<serde_json::Value>, error: Option<String>) -> ActionResult {
        let result = ActionResult { trace_id, state, output, error };
        self.resolved.write().await.insert(trace_id, (Utc::now(), result.clone()));
        result
    }

    /// Snapshot → execute → verify → (commit | rollback), strictly
    /// sequential and atomic from the caller's view.
    async fn run(&self, request: ActionRequest, tier: Tier, contract: ActionContract, _approver: Option<String>) -> CoreResult<ActionResult> {
        let trace_id = request.trace_id;

        let pre_state = self.world.snapshot().await;
        if !contract.preconditions.iter().all(|p| p(&pre_state)) {
            let err = "precondition failed".to_string();
            self.publisher
                .publish(event_types::ACTION_FAILED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "reason": "precondition"}), None)
                .await?;
            return Ok(self.mark_resolved(trace_id, ActionState::Failed, None, Some(err)).await);
        }

        let snapshot_id = if tier.requires_snapshot() {
            Some(self.snapshots.capture(trace_id, &request.action_type).await?)
        } else {
            None
        };

        self.publisher
            .publish(event_types::ACTION_STARTED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "action_type": request.action_type}), None)
            .await?;

        let handler = self.handlers.read().await.get(&request.action_type).cloned();
        let Some(handler) = handler else {
            return Ok(self.fail_and_maybe_rollback(trace_id, snapshot_id, "no handler registered for action type".into()).await?);
        };

        let deadline = Duration::from_millis(self.config.execute_deadline_ms);
        let outcome = tokio::time::timeout(deadline, handler.execute(&request)).await;

        let output = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Ok(self.fail_and_maybe_rollback(trace_id, snapshot_id, e.to_string()).await?),
            Err(_) => return Ok(self.fail_and_maybe_rollback(trace_id, snapshot_id, "execute deadline exceeded".into()).await?),
        };

        let post_state = self.world.snapshot().await;
        if !contract.postconditions.iter().all(|p| p(&post_state)) {
            return Ok(self.fail_and_maybe_rollback(trace_id, snapshot_id, "postcondition failed".into()).await?);
        }

        self.publisher
            .publish(event_types::ACTION_COMPLETED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "output": output}), None)
            .await?;

        if request.risk_tag.as_deref() == Some("remediation") {
            if let Some(incident_id) = self.open_incidents.write().await.remove(&trace_id) {
                self.incidents.attach_action(incident_id, trace_id).await?;
                self.incidents.close(incident_id, "resolved").await?;
            }
        }

        Ok(self.mark_resolved(trace_id, ActionState::Completed, Some(output), None).await)
    }

    async fn fail_and_maybe_rollback(&self, trace_id: TraceId, snapshot_id: Option<SnapshotId>, error: String) -> CoreResult<ActionResult> {
        self.publisher
            .publish(event_types::ACTION_FAILED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "error": error}), None)
            .await?;

        let Some(snapshot_id) = snapshot_id else {
            return Ok(self.mark_resolved(trace_id, ActionState::Failed, None, Some(error)).await);
        };

        self.publisher
            .publish(event_types::ROLLBACK_ATTEMPTED, "action_gateway", serde_json::json!({"trace_id": trace_id.0, "snapshot_id": snapshot_id.0}), None)
            .await?;

        match self.snapshots.restore(&snapshot_id).await {
            Ok(()) => Ok(self.mark_resolved(trace_id, ActionState::RolledBack, None, Some(error)).await),
            Err(rollback_err) => {
                self.publisher
                    .publish(
                        event_types::ROLLBACK_FAILED,
                        "action_gateway",
                        serde_json::json!({"trace_id": trace_id.0, "error": rollback_err.to_string()}),
                        None,
                    )
                    .await?;
                Err(CoreError::RollbackFailed(format!("{error}; rollback also failed: {rollback_err}")))
            }
        }
    }
}
