//! Typed publish/subscribe event bus.
//!
//! Per-source sequence numbers are strictly increasing; cross-source
//! ordering is not guaranteed. Each subscriber is driven by its own
//! dispatch task reading from a bounded channel (— "model each
//! background loop as a task reading from a channel"), so handlers for
//! different subscribers run concurrently while a single subscriber never
//! sees its events reordered.

use crate::config::EventBusConfig;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Stable event type names ("Event catalogue").
pub mod event_types {
    pub const REGISTRY_ADDED: &str = "registry.added";
    pub const REGISTRY_REMOVED: &str = "registry.removed";
    pub const HEALTH_CHANGED: &str = "health.changed";
    pub const GATEWAY_REQUEST_ROUTED: &str = "gateway.request_routed";
    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    pub const CIRCUIT_CLOSED: &str = "circuit.closed";
    pub const RATE_LIMITED: &str = "rate.limited";
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const APPROVAL_GRANTED: &str = "approval.granted";
    pub const APPROVAL_REJECTED: &str = "approval.rejected";
    pub const ACTION_STARTED: &str = "action.started";
    pub const ACTION_COMPLETED: &str = "action.completed";
    pub const ACTION_FAILED: &str = "action.failed";
    pub const ROLLBACK_ATTEMPTED: &str = "rollback.attempted";
    pub const ROLLBACK_FAILED: &str = "rollback.failed";
    pub const INCIDENT_OPENED: &str = "incident.opened";
    pub const INCIDENT_CLOSED: &str = "incident.closed";
    pub const HEALING_NEEDED: &str = "healing.needed";
    pub const DIRECTIVE_ISSUED: &str = "directive.issued";
    pub const METRICS_SNAPSHOT: &str = "metrics.snapshot";
}

/// A typed, sequenced, optionally-signed record (Event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    pub seq: u64,
    pub payload: serde_json::Value,
    pub trace_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub signature: Option<Vec<u8>>,
}

impl Event {
    fn canonical_bytes(event_type: &str, source: &str, seq: u64, payload: &serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&(event_type, source, seq, payload)).unwrap_or_default()
    }

    /// Verify the embedded signature against a known verifying key, if present.
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        match &self.signature {
            None => false,
            Some(sig_bytes) => {
                let Ok(sig) = ed25519_dalek::Signature::from_slice(sig_bytes) else {
                    return false;
                };
                let bytes = Self::canonical_bytes(&self.event_type, &self.source, self.seq, &self.payload);
                key.verify(&bytes, &sig).is_ok()
            }
        }
    }
}

/// Delivery guarantee requested by a subscriber (Subscription).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    AtLeastOnce,
    BestEffort,
}

/// A predicate over event type / source / payload tag.
pub type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handle returned by `Subscribe`.
pub struct Subscription {
    pub id: Uuid,
    pub mode: DeliveryMode,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receive the next event delivered to this subscription, in order.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

struct SubscriptionState {
    id: Uuid,
    predicate: Predicate,
    mode: DeliveryMode,
    sender: mpsc::Sender<Event>,
    cursor: HashMap<String, u64>,
}

/// Typed publish/subscribe fabric joining domains and kernels.
pub struct EventBus {
    config: EventBusConfig,
    sequences: RwLock<HashMap<String, Arc<AtomicU64>>>,
    subscriptions: RwLock<Vec<SubscriptionState>>,
    signing_keys: RwLock<HashMap<String, SigningKey>>,
    /// Bounded in-memory replay log per source, used to serve `Replay` after
    /// a subscriber restart. Durable persistence beyond this is a
    /// collaborator's responsibility (Non-goals).
    replay_log: RwLock<HashMap<String, Vec<Event>>>,
    dropped_best_effort: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            sequences: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            signing_keys: RwLock::new(HashMap::new()),
            replay_log: RwLock::new(HashMap::new()),
            dropped_best_effort: AtomicU64::new(0),
        }
    }

    /// Register a signing key for a source; subsequent `Publish` calls for
    /// that source attach a signature over the canonical encoding.
    pub async fn register_signing_key(&self, source: &str, key: SigningKey) {
        self.signing_keys.write().await.insert(source.to_string(), key);
    }

    /// Assigns the next sequence number for the source, signs if a key is
    /// registered, enqueues for each matching subscription, and returns once
    /// durably enqueued.
    pub async fn publish(&self, event_type: &str, source: &str, payload: serde_json::Value, trace_id: Option<Uuid>) -> CoreResult<Event> {
        let seq_counter = {
            let mut sequences = self.sequences.write().await;
            sequences
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        let seq = seq_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let signature = {
            let keys = self.signing_keys.read().await;
            keys.get(source).map(|key| {
                let bytes = Event::canonical_bytes(event_type, source, seq, &payload);
                key.sign(&bytes).to_bytes().to_vec()
            })
        };

        let event = Event {
            event_type: event_type.to_string(),
            source: source.to_string(),
            seq,
            payload,
            trace_id,
            timestamp: Utc::now(),
            signature,
        };

        self.append_replay_log(&event).await;
        self.dispatch(&event).await?;
        Ok(event)
    }

    async fn append_replay_log(&self, event: &Event) {
        let mut log = self.replay_log.write().await;
        let entries = log.entry(event.source.clone()).or_default();
        entries.push(event.clone());
        if entries.len() > self.config.ring_capacity {
            let excess = entries.len() - self.config.ring_capacity;
            entries.drain(0..excess);
        }
    }

    async fn dispatch(&self, event: &Event) -> CoreResult<()> {
        let mut subs = self.subscriptions.write().await;
        for sub in subs.iter_mut() {
            if !(sub.predicate)(event) {
                continue;
            }
            match sub.mode {
                DeliveryMode::BestEffort => {
                    if sub.sender.try_send(event.clone()).is_err() {
                        self.dropped_best_effort.fetch_add(1, Ordering::Relaxed);
                    } else {
                        sub.cursor.insert(event.source.clone(), event.seq);
                    }
                }
                DeliveryMode::AtLeastOnce => {
                    // Backpressure: block the publisher until the subscriber
                    // drains, rather than silently dropping (see §5).
                    sub.sender
                        .send(event.clone())
                        .await
                        .map_err(|_| CoreError::Internal("subscriber channel closed".into()))?;
                    sub.cursor.insert(event.source.clone(), event.seq);
                }
            }
        }
        Ok(())
    }

    /// Register a new subscription; returns a handle the caller polls with `recv`.
    pub async fn subscribe(&self, predicate: Predicate, mode: DeliveryMode) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.ring_capacity);
        let id = Uuid::new_v4();
        self.subscriptions.write().await.push(SubscriptionState {
            id,
            predicate,
            mode,
            sender: tx,
            cursor: HashMap::new(),
        });
        Subscription { id, mode, receiver: rx }
    }

    /// Replay events from `from_seq` (inclusive) for a given source, for an
    /// at_least_once subscriber recovering after a restart. Duplicates past
    /// the boundary are tolerated but not required, per scenario 5.
    pub async fn replay(&self, source: &str, from_seq: u64) -> Vec<Event> {
        let log = self.replay_log.read().await;
        match log.get(source) {
            Some(entries) => entries.iter().filter(|e| e.seq >= from_seq).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Count of best_effort deliveries dropped due to a full channel.
    pub fn dropped_best_effort_count(&self) -> u64 {
        self.dropped_best_effort.load(Ordering::Relaxed)
    }

    /// Remove a subscription by id.
    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscriptions.write().await.retain(|s| s.id != id);
    }
}

/// Narrow interface exposed to components that only need to publish events,
/// per ("Registry sees an event publisher"): no component holds a
/// full `EventBus` handle if it only ever publishes.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event_type: &str, source: &str, payload: serde_json::Value, trace_id: Option<Uuid>) -> CoreResult<()>;
}

#[async_trait::async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event_type: &str, source: &str, payload: serde_json::Value, trace_id: Option<Uuid>) -> CoreResult<()> {
        EventBus::publish(self, event_type, source, payload, trace_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(EventBusConfig::default())
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase_per_source() {
        let bus = bus();
        let e1 = bus.publish(event_types::REGISTRY_ADDED, "guardian", serde_json::json!({}), None).await.unwrap();
        let e2 = bus.publish(event_types::REGISTRY_ADDED, "guardian", serde_json::json!({}), None).await.unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[tokio::test]
    async fn at_least_once_subscriber_receives_in_order() {
        let bus = bus();
        let mut sub = bus
            .subscribe(Arc::new(|e: &Event| e.source == "guardian"), DeliveryMode::AtLeastOnce)
            .await;
        for _ in 0..5 {
            bus.publish(event_types::METRICS_SNAPSHOT, "guardian", serde_json::json!({}), None).await.unwrap();
        }
        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(sub.recv().await.unwrap().seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn predicate_filters_unrelated_events() {
        let bus = bus();
        let mut sub = bus
            .subscribe(Arc::new(|e: &Event| e.event_type == event_types::INCIDENT_OPENED), DeliveryMode::BestEffort)
            .await;
        bus.publish(event_types::HEALTH_CHANGED, "mesh", serde_json::json!({}), None).await.unwrap();
        bus.publish(event_types::INCIDENT_OPENED, "guardian", serde_json::json!({"k": "v"}), None).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, event_types::INCIDENT_OPENED);
    }

    #[tokio::test]
    async fn replay_after_restart_resumes_from_cursor() {
        let bus = bus();
        for _ in 0..100 {
            bus.publish(event_types::METRICS_SNAPSHOT, "guardian", serde_json::json!({}), None).await.unwrap();
        }
        let replayed = bus.replay("guardian", 41).await;
        assert_eq!(replayed.len(), 60);
        assert_eq!(replayed.first().unwrap().seq, 41);
        assert_eq!(replayed.last().unwrap().seq, 100);
    }

    #[tokio::test]
    async fn signed_events_verify_against_the_registered_key() {
        let bus = bus();
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        bus.register_signing_key("guardian", signing_key).await;
        let event = bus.publish(event_types::HEALTH_CHANGED, "guardian", serde_json::json!({}), None).await.unwrap();
        assert!(event.signature.is_some());
        assert!(event.verify(&verifying_key));
    }
}
