//! Snapshot / Rollback Manager.
//!
//! Owns Snapshots, keyed by action id ("Ownership"). Content is
//! opaque to this module — capture and restore of the actual bytes are
//! delegated to a `SnapshotSource` collaborator, the same pattern
//! as `Prober` in the registry and `Dispatcher` in the gateway.

use crate::action::SnapshotCapture;
use crate::error::{CoreError, CoreResult};
use crate::types::{SnapshotId, TraceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Narrow seam to the domain-specific state a snapshot actually captures.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture_blob(&self, kind: &str) -> CoreResult<Vec<u8>>;
    async fn restore_blob(&self, kind: &str, blob: &[u8]) -> CoreResult<()>;
}

#[derive(Clone)]
struct SnapshotRecord {
    kind: String,
    captured_at: DateTime<Utc>,
    blob: Arc<Vec<u8>>,
}

/// Captures and restores pre-action state, content-addressed by integrity
/// hash so identical captures are deduplicated.
pub struct SnapshotManager {
    config: crate::config::SnapshotConfig,
    source: Arc<dyn SnapshotSource>,
    blobs: RwLock<HashMap<SnapshotId, SnapshotRecord>>,
    by_action: RwLock<HashMap<TraceId, SnapshotId>>,
    referenced_by_incident: RwLock<HashSet<SnapshotId>>,
}

impl SnapshotManager {
    pub fn new(config: crate::config::SnapshotConfig, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            config,
            source,
            blobs: RwLock::new(HashMap::new()),
            by_action: RwLock::new(HashMap::new()),
            referenced_by_incident: RwLock::new(HashSet::new()),
        }
    }

    /// Marks a snapshot as referenced by an open incident, exempting it
    /// from retention eviction until unmarked or the incident closes.
    pub async fn reference_for_incident(&self, snapshot_id: SnapshotId) {
        self.referenced_by_incident.write().await.insert(snapshot_id);
    }

    pub async fn release_incident_reference(&self, snapshot_id: &SnapshotId) {
        self.referenced_by_incident.write().await.remove(snapshot_id);
    }

    /// Evicts snapshots older than the retention window that are not
    /// referenced by an open incident. Returns the evicted ids.
    pub async fn evict_expired(&self) -> Vec<SnapshotId> {
        let retention = chrono::Duration::hours(self.config.retention_hours as i64);
        let referenced = self.referenced_by_incident.read().await;
        let mut blobs = self.blobs.write().await;
        let expired: Vec<SnapshotId> = blobs
            .iter()
            .filter(|(id, record)| Utc::now() - record.captured_at > retention && !referenced.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            blobs.remove(id);
        }
        expired
    }

    pub async fn snapshot_for_action(&self, trace_id: &TraceId) -> Option<SnapshotId> {
        self.by_action.read().await.get(trace_id).cloned()
    }
}

#[async_trait]
impl SnapshotCapture for SnapshotManager {
    async fn capture(&self, trace_id: TraceId, kind: &str) -> CoreResult<SnapshotId> {
        let bytes = self.source.capture_blob(kind).await?;
        let hash = blake3::hash(&bytes);
        let id = SnapshotId(hash.to_hex().to_string());

        let mut blobs = self.blobs.write().await;
        blobs.entry(id.clone()).or_insert_with(|| SnapshotRecord {
            kind: kind.to_string(),
            captured_at: Utc::now(),
            blob: Arc::new(bytes),
        });
        drop(blobs);

        self.by_action.write().await.insert(trace_id, id.clone());
        Ok(id)
    }

    async fn restore(&self, snapshot_id: &SnapshotId) -> CoreResult<()> {
        let record = self
            .blobs
            .read()
            .await
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no snapshot {snapshot_id}")))?;
        self.source.restore_blob(&record.kind, &record.blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct InMemorySource {
        state: Mutex<Vec<u8>>,
        restore_calls: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource for InMemorySource {
        async fn capture_blob(&self, _kind: &str) -> CoreResult<Vec<u8>> {
            Ok(self.state.lock().await.clone())
        }
        async fn restore_blob(&self, _kind: &str, blob: &[u8]) -> CoreResult<()> {
            self.restore_calls.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().await = blob.to_vec();
            Ok(())
        }
    }

    fn manager(source: Arc<InMemorySource>) -> SnapshotManager {
        SnapshotManager::new(crate::config::SnapshotConfig::default(), source)
    }

    #[tokio::test]
    async fn capture_then_restore_round_trips_the_original_state() {
        let source = Arc::new(InMemorySource { state: Mutex::new(b"original".to_vec()), restore_calls: AtomicU32::new(0) });
        let mgr = manager(source.clone());

        let trace_id = TraceId::new();
        let snapshot_id = mgr.capture(trace_id, "port-binding").await.unwrap();

        *source.state.lock().await = b"mutated".to_vec();
        mgr.restore(&snapshot_id).await.unwrap();

        assert_eq!(*source.state.lock().await, b"original".to_vec());
        assert_eq!(source.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identical_captures_are_deduplicated_by_content_hash() {
        let source = Arc::new(InMemorySource { state: Mutex::new(b"same".to_vec()), restore_calls: AtomicU32::new(0) });
        let mgr = manager(source);

        let a = mgr.capture(TraceId::new(), "x").await.unwrap();
        let b = mgr.capture(TraceId::new(), "x").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mgr.blobs.read().await.len(), 1);
    }

    #[tokio::test]
    async fn restore_of_unknown_snapshot_is_not_found() {
        let source = Arc::new(InMemorySource { state: Mutex::new(Vec::new()), restore_calls: AtomicU32::new(0) });
        let mgr = manager(source);
        let err = mgr.restore(&SnapshotId("missing".into())).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn eviction_skips_snapshots_referenced_by_an_open_incident() {
        let source = Arc::new(InMemorySource { state: Mutex::new(b"data".to_vec()), restore_calls: AtomicU32::new(0) });
        let mut cfg = crate::config::SnapshotConfig::default();
        cfg.retention_hours = 0;
        let mgr = SnapshotManager::new(cfg, source);

        let id = mgr.capture(TraceId::new(), "x").await.unwrap();
        mgr.reference_for_incident(id.clone()).await;
        let evicted = mgr.evict_expired().await;
        assert!(evicted.is_empty());

        mgr.release_incident_reference(&id).await;
        let evicted = mgr.evict_expired().await;
        assert_eq!(evicted, vec![id]);
    }
}
