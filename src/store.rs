use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::model::{CallStatus, ClarifiesStepRecord, ConversationTurn, ObjectionEvent, RiskFlag};
use crate::pipeline::analytics::RunningAnalytics;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Where call records go. The bridge is the only writer for a live call.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append_turn(&self, call_id: &str, turn: &ConversationTurn) -> Result<(), StoreError>;
    async fn record_objection(&self, call_id: &str, objection: &ObjectionEvent) -> Result<(), StoreError>;
    async fn record_clarifies_step(&self, call_id: &str, step: &ClarifiesStepRecord) -> Result<(), StoreError>;
    async fn upsert_running_analytics(&self, call_id: &str, analytics: &RunningAnalytics) -> Result<(), StoreError>;
    async fn record_risk_flag(&self, call_id: &str, flag: &RiskFlag) -> Result<(), StoreError>;
    async fn record_call_status(&self, call_id: &str, status: CallStatus) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub status: CallStatus,
    pub at: DateTime<Utc>,
}

/// One write queued by a bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRecord {
    Turn(ConversationTurn),
    Objection(ObjectionEvent),
    Step(ClarifiesStepRecord),
    Analytics(RunningAnalytics),
    Risk(RiskFlag),
    Status(CallStatus),
}

impl StoreRecord {
    fn kind(&self) -> &'static str {
        match self {
            StoreRecord::Turn(_) => "turn",
            StoreRecord::Objection(_) => "objection",
            StoreRecord::Step(_) => "clarifies_step",
            StoreRecord::Analytics(_) => "running_analytics",
            StoreRecord::Risk(_) => "risk_flag",
            StoreRecord::Status(_) => "call_status",
        }
    }

    async fn write(&self, sink: &dyn PersistenceSink, call_id: &str) -> Result<(), StoreError> {
        match self {
            StoreRecord::Turn(turn) => sink.append_turn(call_id, turn).await,
            StoreRecord::Objection(o) => sink.record_objection(call_id, o).await,
            StoreRecord::Step(s) => sink.record_clarifies_step(call_id, s).await,
            StoreRecord::Analytics(a) => sink.upsert_running_analytics(call_id, a).await,
            StoreRecord::Risk(r) => sink.record_risk_flag(call_id, r).await,
            StoreRecord::Status(s) => sink.record_call_status(call_id, *s).await,
        }
    }
}

/// Bounded per-call write queue drained by a single writer task, so records
/// land in the order the bridge produced them.
pub struct RecordQueue {
    call_id: String,
    tx: mpsc::Sender<StoreRecord>,
    failures: Arc<AtomicU64>,
    writer: JoinHandle<()>,
}

impl RecordQueue {
    pub fn spawn(sink: Arc<dyn PersistenceSink>, call_id: &str, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreRecord>(capacity.max(1));
        let failures = Arc::new(AtomicU64::new(0));

        let writer = {
            let call_id = call_id.to_string();
            let failures = failures.clone();
            tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    if let Err(e) = record.write(sink.as_ref(), &call_id).await {
                        failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(call_id = %call_id, kind = record.kind(), "Failed to persist record: {e}");
                    }
                }
            })
        };

        Self {
            call_id: call_id.to_string(),
            tx,
            failures,
            writer,
        }
    }

    /// Never blocks the bridge loop. A full or closed queue loses the record,
    /// which is logged and counted.
    pub fn push(&self, record: StoreRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) | Err(TrySendError::Closed(record)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(call_id = %self.call_id, kind = record.kind(), "Persistence queue unavailable, record dropped");
            }
        }
    }

    /// Stop accepting records, wait up to `drain` for queued writes, and
    /// return the number of records lost.
    pub async fn close(self, drain: Duration) -> u64 {
        let Self {
            call_id,
            tx,
            failures,
            writer,
        } = self;
        drop(tx);
        if tokio::time::timeout(drain, writer).await.is_err() {
            tracing::error!(call_id = %call_id, "Persistence writer did not drain in time");
        }
        failures.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct JsonlLine<'a, T: Serialize> {
    call_id: &'a str,
    kind: &'a str,
    recorded_at: DateTime<Utc>,
    data: &'a T,
}

/// Append-only JSON-lines file per call under `dir`.
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, call_id: &str) -> PathBuf {
        let safe: String = call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    async fn append<T: Serialize + Sync>(&self, call_id: &str, kind: &str, data: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&JsonlLine {
            call_id,
            kind,
            recorded_at: Utc::now(),
            data,
        })?;
        line.push(b'\n');

        ensure_dir(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(call_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[async_trait]
impl PersistenceSink for JsonlStore {
    async fn append_turn(&self, call_id: &str, turn: &ConversationTurn) -> Result<(), StoreError> {
        self.append(call_id, "turn", turn).await
    }

    async fn record_objection(&self, call_id: &str, objection: &ObjectionEvent) -> Result<(), StoreError> {
        self.append(call_id, "objection", objection).await
    }

    async fn record_clarifies_step(&self, call_id: &str, step: &ClarifiesStepRecord) -> Result<(), StoreError> {
        self.append(call_id, "clarifies_step", step).await
    }

    async fn upsert_running_analytics(&self, call_id: &str, analytics: &RunningAnalytics) -> Result<(), StoreError> {
        // Readers take the last running_analytics line as current.
        self.append(call_id, "running_analytics", analytics).await
    }

    async fn record_risk_flag(&self, call_id: &str, flag: &RiskFlag) -> Result<(), StoreError> {
        self.append(call_id, "risk_flag", flag).await
    }

    async fn record_call_status(&self, call_id: &str, status: CallStatus) -> Result<(), StoreError> {
        let change = StatusChange { status, at: Utc::now() };
        self.append(call_id, "call_status", &change).await
    }
}

/// CRM persistence API: one endpoint per record kind under `/calls/{id}`.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, call_id: &str, path: &str, body: &T) -> Result<(), StoreError> {
        let url = format!("{}/calls/{call_id}/{path}", self.base_url);
        self.client.post(&url).json(body).send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for HttpStore {
    async fn append_turn(&self, call_id: &str, turn: &ConversationTurn) -> Result<(), StoreError> {
        self.post(call_id, "turns", turn).await
    }

    async fn record_objection(&self, call_id: &str, objection: &ObjectionEvent) -> Result<(), StoreError> {
        self.post(call_id, "objections", objection).await
    }

    async fn record_clarifies_step(&self, call_id: &str, step: &ClarifiesStepRecord) -> Result<(), StoreError> {
        self.post(call_id, "clarifies-steps", step).await
    }

    async fn upsert_running_analytics(&self, call_id: &str, analytics: &RunningAnalytics) -> Result<(), StoreError> {
        let url = format!("{}/calls/{call_id}/analytics", self.base_url);
        self.client.put(&url).json(analytics).send().await?.error_for_status()?;
        Ok(())
    }

    async fn record_risk_flag(&self, call_id: &str, flag: &RiskFlag) -> Result<(), StoreError> {
        self.post(call_id, "risk-flags", flag).await
    }

    async fn record_call_status(&self, call_id: &str, status: CallStatus) -> Result<(), StoreError> {
        self.post(call_id, "status", &StatusChange { status, at: Utc::now() }).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::model::Role;

    #[tokio::test]
    async fn queue_preserves_order() {
        let store = Arc::new(MemoryStore::default());
        let queue = RecordQueue::spawn(store.clone(), "CA1", 16);

        queue.push(StoreRecord::Turn(ConversationTurn::new(Role::Customer, "one")));
        queue.push(StoreRecord::Turn(ConversationTurn::new(Role::Agent, "two")));
        queue.push(StoreRecord::Status(CallStatus::Completed));
        assert_eq!(queue.close(Duration::from_secs(5)).await, 0);

        let texts: Vec<_> = store.turns().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(store.statuses(), vec![CallStatus::Completed]);
    }

    #[tokio::test]
    async fn failed_writes_are_counted() {
        let store = Arc::new(MemoryStore::default());
        store.fail.store(true, Ordering::Relaxed);
        let queue = RecordQueue::spawn(store.clone(), "CA1", 16);

        queue.push(StoreRecord::Status(CallStatus::InProgress));
        queue.push(StoreRecord::Status(CallStatus::Completed));

        assert_eq!(queue.close(Duration::from_secs(5)).await, 2);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn jsonl_store_appends_lines() {
        let dir = std::env::temp_dir().join(format!("voice-bridge-store-{}", std::process::id()));
        let store = JsonlStore::new(&dir);

        store
            .append_turn("CA/1", &ConversationTurn::new(Role::Customer, "hello"))
            .await
            .unwrap();
        store.record_call_status("CA/1", CallStatus::Completed).await.unwrap();

        let path = store.path_for("CA/1");
        assert!(path.ends_with("CA_1.jsonl"));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "turn");
        assert_eq!(lines[0]["data"]["text"], "hello");
        assert_eq!(lines[1]["data"]["status"], "completed");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
