use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::model::{CallStatus, Provider};

/// A live bridge, keyed by call id in [`ActiveCalls`].
struct ActiveCall {
    provider: Provider,
    stream_id: String,
    cancel: CancellationToken,
    status: CallStatus,
}

/// How many calls without a live bridge keep their last status.
const RECENT_STATUSES: usize = 1024;

#[derive(Default)]
struct Calls {
    live: HashMap<String, ActiveCall>,
    recent: VecDeque<(String, CallStatus)>,
}

impl Calls {
    fn last_status(&self, call_id: &str) -> Option<CallStatus> {
        match self.live.get(call_id) {
            Some(call) => Some(call.status),
            None => self
                .recent
                .iter()
                .rev()
                .find(|(id, _)| id == call_id)
                .map(|(_, status)| *status),
        }
    }

    fn forget(&mut self, call_id: &str) {
        self.recent.retain(|(id, _)| id != call_id);
    }

    fn remember(&mut self, call_id: &str, status: CallStatus) {
        self.forget(call_id);
        if self.recent.len() == RECENT_STATUSES {
            self.recent.pop_front();
        }
        self.recent.push_back((call_id.to_string(), status));
    }
}

/// Registry of live bridges. At most one per call id.
///
/// Status webhooks use it to end a call whose media socket is still open.
/// Every recorded status passes through [`ActiveCalls::advance`], which
/// keeps a call's status moving forward only.
#[derive(Clone, Default)]
pub struct ActiveCalls {
    inner: Arc<Mutex<Calls>>,
}

impl ActiveCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new live call. Returns the token that ends it, or `None`
    /// when a bridge for this call id is already running.
    pub async fn register(&self, call_id: &str, stream_id: &str, provider: Provider) -> Option<CancellationToken> {
        let mut calls = self.inner.lock().await;
        if calls.live.contains_key(call_id) {
            tracing::warn!(call_id, stream_id, %provider, "Call already has a live bridge");
            return None;
        }
        let status = calls.last_status(call_id).unwrap_or(CallStatus::Initiated);
        calls.forget(call_id);

        let cancel = CancellationToken::new();
        calls.live.insert(
            call_id.to_string(),
            ActiveCall {
                provider,
                stream_id: stream_id.to_string(),
                cancel: cancel.clone(),
                status,
            },
        );
        tracing::info!(call_id, stream_id, %provider, "Call registered");
        Some(cancel)
    }

    /// Deregister a call when it ends.
    pub async fn deregister(&self, call_id: &str) {
        let mut calls = self.inner.lock().await;
        if let Some(call) = calls.live.remove(call_id) {
            calls.remember(call_id, call.status);
            tracing::info!(call_id, stream_id = %call.stream_id, provider = %call.provider, status = ?call.status, "Call deregistered");
        }
    }

    /// Note a status for `call_id`. Returns false when it would move the
    /// call backwards or repeat a terminal status; the caller must not
    /// record it then.
    pub async fn advance(&self, call_id: &str, status: CallStatus) -> bool {
        let mut calls = self.inner.lock().await;
        if calls.last_status(call_id).is_some_and(|current| !status.follows(current)) {
            return false;
        }
        match calls.live.get_mut(call_id) {
            Some(call) => call.status = status,
            None => calls.remember(call_id, status),
        }
        true
    }

    /// Ask the live bridge for `call_id` to end. Returns whether one was running.
    pub async fn end(&self, call_id: &str) -> bool {
        match self.inner.lock().await.live.get(call_id) {
            Some(call) => {
                call.cancel.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn is_active(&self, call_id: &str) -> bool {
        self.inner.lock().await.live.contains_key(call_id)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }
}

/// Earlier call with the same customer, as kept by the CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorCall {
    pub call_id: String,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// What the call directory knows about a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Voice config of the assigned agent persona.
    #[serde(default)]
    pub agent_voice_config_id: Option<String>,
    /// Voice config set directly on the call.
    #[serde(default)]
    pub call_voice_config_id: Option<String>,
    #[serde(default)]
    pub assigned_agent_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub prior_call_history: Vec<PriorCall>,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("call {0} not found")]
    NotFound(String),
    #[error("call directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("call directory lookup timed out")]
    Timeout,
}

/// External call registry (CRM).
#[async_trait]
pub trait CallDirectory: Send + Sync {
    async fn get_call_by_external_id(&self, call_id: &str) -> Result<CallRecord, DirectoryError>;
}

/// `GET {base}/calls/{call_id}`; 404 means not found.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CallDirectory for HttpDirectory {
    async fn get_call_by_external_id(&self, call_id: &str) -> Result<CallRecord, DirectoryError> {
        let url = format!("{}/calls/{call_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(call_id.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }
}

/// Where the resolved voice config came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Agent,
    Call,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub config_id: String,
    pub source: ConfigSource,
    pub record: CallRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum Unresolved {
    #[error("call not found in directory")]
    NotFound,
    #[error("call has no agent or voice configuration")]
    Unconfigured,
    #[error(transparent)]
    Lookup(DirectoryError),
}

/// Pick the voice config for a call record. Precedence: the assigned
/// agent's config, then the call's own config. The process-wide default is
/// not consulted here; it is only a fallback after a failed session open.
pub fn resolve_voice_config(record: CallRecord) -> Result<ResolvedCall, Unresolved> {
    let non_empty = |id: &Option<String>| id.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from);

    let (config_id, source) = if let Some(id) = non_empty(&record.agent_voice_config_id) {
        (id, ConfigSource::Agent)
    } else if let Some(id) = non_empty(&record.call_voice_config_id) {
        (id, ConfigSource::Call)
    } else {
        return Err(Unresolved::Unconfigured);
    };

    Ok(ResolvedCall {
        config_id,
        source,
        record,
    })
}

/// Look the call up and resolve its voice config within `timeout`.
pub async fn resolve_call(
    directory: &dyn CallDirectory,
    call_id: &str,
    timeout: Duration,
) -> Result<ResolvedCall, Unresolved> {
    let record = match tokio::time::timeout(timeout, directory.get_call_by_external_id(call_id)).await {
        Ok(Ok(record)) => record,
        Ok(Err(DirectoryError::NotFound(_))) => return Err(Unresolved::NotFound),
        Ok(Err(e)) => return Err(Unresolved::Lookup(e)),
        Err(_) => return Err(Unresolved::Lookup(DirectoryError::Timeout)),
    };
    resolve_voice_config(record)
}
