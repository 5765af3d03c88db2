//! Incident Log & MTTR Tracker.
//!
//! Append-only: every state change is written as a new JSONL line rather
//! than rewriting history. Once `resolved_at` is set a record is frozen;
//! corrections are new records that reference the original.

use crate::action::IncidentRecorder;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{event_types, EventPublisher};
use crate::types::{IncidentId, TraceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One append-only incident record (persisted-state layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: IncidentId,
    pub failure_kind: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub actions: Vec<TraceId>,
    pub mttr_seconds: Option<i64>,
    pub outcome: Option<String>,
    pub correction_of: Option<IncidentId>,
}

impl IncidentRecord {
    fn opened(id: IncidentId, failure_kind: &str) -> Self {
        Self {
            id,
            failure_kind: failure_kind.to_string(),
            detected_at: Utc::now(),
            resolved_at: None,
            actions: Vec::new(),
            mttr_seconds: None,
            outcome: None,
            correction_of: None,
        }
    }
}

/// Rolling aggregate over a time window (`GET /api/guardian/incidents`).
#[derive(Debug, Clone, Serialize)]
pub struct IncidentAggregate {
    pub count: usize,
    pub avg_mttr_seconds: f64,
    pub success_ratio: f64,
}

pub struct IncidentLog {
    config: crate::config::IncidentConfig,
    publisher: Arc<dyn EventPublisher>,
    open_incidents: RwLock<HashMap<IncidentId, IncidentRecord>>,
    closed_incidents: RwLock<Vec<IncidentRecord>>,
    write_lock: Mutex<()>,
}

impl IncidentLog {
    pub fn new(config: crate::config::IncidentConfig, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            config,
            publisher,
            open_incidents: RwLock::new(HashMap::new()),
            closed_incidents: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.config.log_dir).join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")))
    }

    async fn append_line(&self, record: &IncidentRecord) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.log_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Opens a new incident for an observed failure. Publishes
    /// `incident.opened`.
    pub async fn open(&self, failure_kind: &str) -> CoreResult<IncidentId> {
        let record = IncidentRecord::opened(IncidentId::new(), failure_kind);
        let id = record.id.clone();
        self.append_line(&record).await?;
        self.open_incidents.write().await.insert(id.clone(), record);
        self.publisher
            .publish(event_types::INCIDENT_OPENED, "incident_log", serde_json::json!({"incident_id": id.0, "failure_kind": failure_kind}), None)
            .await?;
        Ok(id)
    }

    /// Attaches an action id to an open incident.
    pub async fn attach_action(&self, incident_id: IncidentId, trace_id: TraceId) -> CoreResult<()> {
        let mut open = self.open_incidents.write().await;
        let record = open
            .get_mut(&incident_id)
            .ok_or_else(|| CoreError::NotFound(format!("no open incident {incident_id}")))?;
        record.actions.push(trace_id);
        let snapshot = record.clone();
        drop(open);
        self.append_line(&snapshot).await
    }

    /// Closes an incident, freezing it and deriving `mttr_seconds`.
    /// Publishes `incident.closed`.
    pub async fn close(&self, incident_id: IncidentId, outcome: &str) -> CoreResult<()> {
        let mut record = {
            let mut open = self.open_incidents.write().await;
            open.remove(&incident_id)
                .ok_or_else(|| CoreError::NotFound(format!("no open incident {incident_id}")))?
        };
        let resolved_at = Utc::now();
        record.resolved_at = Some(resolved_at);
        record.mttr_seconds = Some((resolved_at - record.detected_at).num_seconds());
        record.outcome = Some(outcome.to_string());

        self.append_line(&record).await?;
        self.closed_incidents.write().await.push(record);

        self.publisher
            .publish(event_types::INCIDENT_CLOSED, "incident_log", serde_json::json!({"incident_id": incident_id.0, "outcome": outcome}), None)
            .await?;
        Ok(())
    }

    /// Appends a correction record referencing an already-closed incident
    /// (closed records are never edited in place).
    pub async fn correct(&self, original: IncidentId, failure_kind: &str, outcome: &str) -> CoreResult<IncidentId> {
        let mut record = IncidentRecord::opened(IncidentId::new(), failure_kind);
        record.correction_of = Some(original);
        record.resolved_at = Some(Utc::now());
        record.mttr_seconds = Some(0);
        record.outcome = Some(outcome.to_string());
        let id = record.id.clone();
        self.append_line(&record).await?;
        self.closed_incidents.write().await.push(record);
        Ok(id)
    }

    /// Rolling aggregate over incidents resolved within `window` of now
    /// ("last 1h, 24h, 7d").
    pub async fn aggregate(&self, window: chrono::Duration) -> IncidentAggregate {
        let cutoff = Utc::now() - window;
        let closed = self.closed_incidents.read().await;
        let recent: Vec<&IncidentRecord> = closed
            .iter()
            .filter(|r| r.resolved_at.map(|at| at >= cutoff).unwrap_or(false))
            .collect();

        if recent.is_empty() {
            return IncidentAggregate { count: 0, avg_mttr_seconds: 0.0, success_ratio: 0.0 };
        }

        let total_mttr: i64 = recent.iter().filter_map(|r| r.mttr_seconds).sum();
        let successes = recent.iter().filter(|r| r.outcome.as_deref() == Some("resolved")).count();

        IncidentAggregate {
            count: recent.len(),
            avg_mttr_seconds: total_mttr as f64 / recent.len() as f64,
            success_ratio: successes as f64 / recent.len() as f64,
        }
    }

    pub async fn list_open(&self) -> Vec<IncidentRecord> {
        self.open_incidents.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl IncidentRecorder for IncidentLog {
    async fn open(&self, failure_kind: &str) -> CoreResult<IncidentId> {
        IncidentLog::open(self, failure_kind).await
    }

    async fn attach_action(&self, incident_id: IncidentId, trace_id: TraceId) -> CoreResult<()> {
        IncidentLog::attach_action(self, incident_id, trace_id).await
    }

    async fn close(&self, incident_id: IncidentId, outcome: &str) -> CoreResult<()> {
        IncidentLog::close(self, incident_id, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;

    fn log_with_tempdir() -> (IncidentLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(crate::config::EventBusConfig::default()));
        let config = crate::config::IncidentConfig { log_dir: dir.path().to_string_lossy().to_string() };
        (IncidentLog::new(config, bus), dir)
    }

    #[tokio::test]
    async fn open_then_close_derives_mttr_from_the_same_record() {
        let (log, _dir) = log_with_tempdir();
        let id = log.open("port-conflict").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        log.close(id, "resolved").await.unwrap();

        let aggregate = log.aggregate(chrono::Duration::hours(1)).await;
        assert_eq!(aggregate.count, 1);
        assert!(aggregate.avg_mttr_seconds >= 0.0);
        assert_eq!(aggregate.success_ratio, 1.0);
    }

    #[tokio::test]
    async fn closed_incident_cannot_receive_further_attached_actions() {
        let (log, _dir) = log_with_tempdir();
        let id = log.open("db-lock").await.unwrap();
        log.close(id, "resolved").await.unwrap();

        let err = log.attach_action(id, TraceId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn appended_lines_are_valid_jsonl() {
        let (log, dir) = log_with_tempdir();
        let id = log.open("api-timeout").await.unwrap();
        log.attach_action(id, TraceId::new()).await.unwrap();
        log.close(id, "resolved").await.unwrap();

        let path = dir.path().join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: IncidentRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.id, id);
        }
    }

    #[tokio::test]
    async fn aggregate_window_excludes_incidents_resolved_before_the_cutoff() {
        let (log, _dir) = log_with_tempdir();
        let id = log.open("resource-exhaustion").await.unwrap();
        log.close(id, "resolved").await.unwrap();

        let aggregate = log.aggregate(chrono::Duration::seconds(-1)).await;
        assert_eq!(aggregate.count, 0);
    }
}
