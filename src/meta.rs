//! Proactive Intelligence & Meta Loop.
//!
//! Samples metrics on a ticker, aggregates over a rolling window, and
//! routes threshold-crossing `Directive`s through the Action Gateway like
//! any other action — background loops are dedicated tasks, not code woven
//! into request handling.

use crate::action::{ActionGateway, ActionHandler, ActionRequest};
use crate::error::CoreResult;
use crate::event_bus::{event_types, EventPublisher};
use crate::types::{DirectiveId, PlaybookId, Tier, TraceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One named metric reading (CPU, queue depth, approval backlog, ...).
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
}

/// Narrow seam over whatever exposes runtime metrics.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn sample(&self) -> CoreResult<Vec<MetricSample>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    GreaterThan,
    LessThan,
}

/// A configured threshold that, once crossed on the rolling aggregate,
/// produces a `Directive`.
#[derive(Clone)]
pub struct ThresholdRule {
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub target_playbook: PlaybookId,
    pub urgency: String,
    pub required_tier: Tier,
}

/// A proactive recommendation from the meta loop.
#[derive(Debug, Clone)]
pub struct Directive {
    pub id: DirectiveId,
    pub target_playbook: PlaybookId,
    pub rationale: String,
    pub urgency: String,
    pub required_tier: Tier,
    pub expires_at: DateTime<Utc>,
}

struct MetricWindow {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl MetricWindow {
    fn new() -> Self {
        Self { samples: VecDeque::new() }
    }

    fn push(&mut self, value: f64, window: chrono::Duration) {
        let now = Utc::now();
        self.samples.push_back((now, value));
        while let Some((at, _)) = self.samples.front() {
            if now - *at > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64
    }
}

/// Submits directives as actions through the gateway they govern.
pub struct DirectiveActionHandler;
#[async_trait]
impl ActionHandler for DirectiveActionHandler {
    async fn execute(&self, request: &ActionRequest) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({"accepted_directive_for": request.params.get("target_playbook")}))
    }
}

/// Samples, aggregates, and reacts to metrics.
pub struct MetaLoop {
    config: crate::config::MetaConfig,
    collector: Arc<dyn MetricsCollector>,
    publisher: Arc<dyn EventPublisher>,
    action_gateway: Arc<ActionGateway>,
    rules: Vec<ThresholdRule>,
    windows: RwLock<HashMap<String, MetricWindow>>,
    triggered: RwLock<HashMap<String, bool>>,
    trigger_counts: RwLock<HashMap<String, u32>>,
}

impl MetaLoop {
    pub fn new(
        config: crate::config::MetaConfig,
        collector: Arc<dyn MetricsCollector>,
        publisher: Arc<dyn EventPublisher>,
        action_gateway: Arc<ActionGateway>,
        rules: Vec<ThresholdRule>,
    ) -> Self {
        Self {
            config,
            collector,
            publisher,
            action_gateway,
            rules,
            windows: RwLock::new(HashMap::new()),
            triggered: RwLock::new(HashMap::new()),
            trigger_counts: RwLock::new(HashMap::new()),
        }
    }

    fn rule_key(rule: &ThresholdRule) -> String {
        format!("{}::{}", rule.metric, rule.target_playbook)
    }

    /// Runs one sample-aggregate-evaluate cycle. Exposed separately from
    /// the spawned loop so tests can drive individual ticks.
    pub async fn tick(&self) -> CoreResult<Vec<Directive>> {
        let samples = self.collector.sample().await?;
        let window = chrono::Duration::seconds(self.config.aggregation_window_secs as i64);

        {
            let mut windows = self.windows.write().await;
            for sample in &samples {
                windows.entry(sample.name.clone()).or_insert_with(MetricWindow::new).push(sample.value, window);
            }
        }

        self.publisher
            .publish(
                event_types::METRICS_SNAPSHOT,
                "meta_loop",
                serde_json::json!({"samples": samples.iter().map(|s| (s.name.clone(), s.value)).collect::<HashMap<_, _>>()}),
                None,
            )
            .await?;

        let mut directives = Vec::new();
        for rule in &self.rules {
            let average = {
                let windows = self.windows.read().await;
                windows.get(&rule.metric).map(|w| w.average()).unwrap_or(0.0)
            };
            let crossed = match rule.comparator {
                Comparator::GreaterThan => average > rule.threshold,
                Comparator::LessThan => average < rule.threshold,
            };

            let key = Self::rule_key(rule);
            let mut triggered = self.triggered.write().await;
            let was_triggered = *triggered.get(&key).unwrap_or(&false);

            if crossed && !was_triggered {
                *self.trigger_counts.write().await.entry(key.clone()).or_insert(0) += 1;
                let directive = self.issue_directive(rule, average).await?;
                directives.push(directive);
            }
            triggered.insert(key, crossed);
        }

        Ok(directives)
    }

    async fn issue_directive(&self, rule: &ThresholdRule, observed: f64) -> CoreResult<Directive> {
        let directive = Directive {
            id: DirectiveId::new(),
            target_playbook: rule.target_playbook.clone(),
            rationale: format!("metric '{}' averaged {observed:.2}, crossing threshold {}", rule.metric, rule.threshold),
            urgency: rule.urgency.clone(),
            required_tier: rule.required_tier,
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        };

        self.publisher
            .publish(
                event_types::DIRECTIVE_ISSUED,
                "meta_loop",
                serde_json::json!({
                    "directive_id": directive.id.0,
                    "target_playbook": directive.target_playbook.0,
                    "rationale": directive.rationale,
                    "urgency": directive.urgency,
                }),
                None,
            )
            .await?;

        self.action_gateway
            .submit(ActionRequest {
                trace_id: TraceId::new(),
                action_type: "apply-directive".to_string(),
                proposer: "meta_loop".to_string(),
                params: serde_json::json!({"target_playbook": directive.target_playbook.0, "urgency": directive.urgency}),
                declared_tier: directive.required_tier,
                justification: directive.rationale.clone(),
                risk_tag: Some("remediation".to_string()),
            })
            .await?;

        Ok(directive)
    }

    /// Reviews how often each rule has fired and proposes a tier-3
    /// threshold update for rules that fire excessively.
    pub async fn propose_threshold_updates(&self, fires_per_window_ceiling: u32) -> Vec<ActionRequest> {
        let counts = self.trigger_counts.read().await;
        let mut proposals = Vec::new();
        for rule in &self.rules {
            let key = Self::rule_key(rule);
            if counts.get(&key).copied().unwrap_or(0) > fires_per_window_ceiling {
                proposals.push(ActionRequest {
                    trace_id: TraceId::new(),
                    action_type: "update-threshold".to_string(),
                    proposer: "meta_loop".to_string(),
                    params: serde_json::json!({"metric": rule.metric, "current_threshold": rule.threshold}),
                    declared_tier: Tier::Tier3,
                    justification: format!("'{}' has crossed its threshold more than {fires_per_window_ceiling} times this cycle", rule.metric),
                    risk_tag: None,
                });
            }
        }
        proposals
    }

    /// Spawns the periodic sampling loop — each long-running component
    /// runs on its own task.
    pub fn spawn(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.sample_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    tracing::warn!("meta loop tick failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionConfig;
    use crate::event_bus::EventBus;

    struct FixedCollector {
        value: f64,
    }
    #[async_trait]
    impl MetricsCollector for FixedCollector {
        async fn sample(&self) -> CoreResult<Vec<MetricSample>> {
            Ok(vec![MetricSample { name: "approval_backlog".to_string(), value: self.value }])
        }
    }

    async fn gateway_with_directive_handler(bus: Arc<EventBus>) -> Arc<ActionGateway> {
        let gateway = ActionGateway::new(
            ActionConfig::default(),
            Arc::new(crate::action::DenyAllPolicy),
            Arc::new(crate::action::EmptyWorldState),
            Arc::new(NoopSnapshots),
            Arc::new(NoopIncidents),
            bus,
        );
        gateway.register_handler("apply-directive", Arc::new(DirectiveActionHandler)).await;
        Arc::new(gateway)
    }

    struct NoopSnapshots;
    #[async_trait]
    impl crate::action::SnapshotCapture for NoopSnapshots {
        async fn capture(&self, trace_id: TraceId, _kind: &str) -> CoreResult<crate::types::SnapshotId> {
            Ok(crate::types::SnapshotId(format!("snap-{trace_id}")))
        }
        async fn restore(&self, _snapshot_id: &crate::types::SnapshotId) -> CoreResult<()> {
            Ok(())
        }
    }

    struct NoopIncidents;
    #[async_trait]
    impl crate::action::IncidentRecorder for NoopIncidents {
        async fn open(&self, _failure_kind: &str) -> CoreResult<crate::types::IncidentId> {
            Ok(crate::types::IncidentId::new())
        }
        async fn attach_action(&self, _incident_id: crate::types::IncidentId, _trace_id: TraceId) -> CoreResult<()> {
            Ok(())
        }
        async fn close(&self, _incident_id: crate::types::IncidentId, _outcome: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    fn rule() -> ThresholdRule {
        ThresholdRule {
            metric: "approval_backlog".to_string(),
            comparator: Comparator::GreaterThan,
            threshold: 40.0,
            target_playbook: PlaybookId::from("scale-workers"),
            urgency: "high".to_string(),
            required_tier: Tier::Tier2,
        }
    }

    #[tokio::test]
    async fn tick_issues_a_directive_exactly_once_on_the_crossing_edge() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let gateway = gateway_with_directive_handler(bus.clone()).await;
        let meta = MetaLoop::new(crate::config::MetaConfig::default(), Arc::new(FixedCollector { value: 90.0 }), bus, gateway, vec![rule()]);

        let first = meta.tick().await.unwrap();
        assert_eq!(first.len(), 1);

        let second = meta.tick().await.unwrap();
        assert!(second.is_empty(), "must not re-fire while still above threshold");
    }

    #[tokio::test]
    async fn tick_produces_no_directive_below_threshold() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let gateway = gateway_with_directive_handler(bus.clone()).await;
        let meta = MetaLoop::new(crate::config::MetaConfig::default(), Arc::new(FixedCollector { value: 5.0 }), bus, gateway, vec![rule()]);

        let directives = meta.tick().await.unwrap();
        assert!(directives.is_empty());
    }

    #[tokio::test]
    async fn repeated_crossings_propose_a_threshold_update() {
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let gateway = gateway_with_directive_handler(bus.clone()).await;
        let meta = MetaLoop::new(crate::config::MetaConfig::default(), Arc::new(FixedCollector { value: 90.0 }), bus, gateway, vec![rule()]);

        // Cross once, drop below, cross again: two distinct rising edges.
        meta.tick().await.unwrap();
        {
            let mut triggered = meta.triggered.write().await;
            triggered.insert(MetaLoop::rule_key(&rule()), false);
        }
        meta.tick().await.unwrap();

        let proposals = meta.propose_threshold_updates(1).await;
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].declared_tier, Tier::Tier3);
    }
}
