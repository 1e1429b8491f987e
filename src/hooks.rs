use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CallStatus, Provider, QaPair};
use crate::pipeline::analytics::Outcome;

/// Emitted once per bridged call on `Ending -> Closed`, for downstream
/// learning and scheduling consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub call_id: String,
    pub provider: Provider,
    pub status: CallStatus,
    pub outcome_classification: Outcome,
    pub qa_pairs: Vec<QaPair>,
    pub duration_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("completion webhook failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn call_completed(&self, report: &CompletionReport) -> Result<(), HookError>;
}

/// POSTs the report as JSON.
pub struct WebhookHook {
    client: reqwest::Client,
    url: String,
}

impl WebhookHook {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CompletionHook for WebhookHook {
    async fn call_completed(&self, report: &CompletionReport) -> Result<(), HookError> {
        self.client
            .post(&self.url)
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(call_id = %report.call_id, url = %self.url, "Completion report delivered");
        Ok(())
    }
}

/// Used when no completion webhook is configured.
pub struct LogHook;

#[async_trait]
impl CompletionHook for LogHook {
    async fn call_completed(&self, report: &CompletionReport) -> Result<(), HookError> {
        tracing::info!(
            call_id = %report.call_id,
            provider = %report.provider,
            outcome = ?report.outcome_classification,
            qa_pairs = report.qa_pairs.len(),
            duration_seconds = report.duration_seconds,
            "Call completed"
        );
        Ok(())
    }
}
