pub mod twilio;
pub mod vonage;

use bytes::Bytes;

use crate::bridge::BridgeDeps;
use crate::model::{CallStatus, Provider};

/// Sample encoding of an inbound telephony frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Mulaw,
    Linear16,
}

/// Provider-independent view of what arrives on a media socket or status webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyEvent {
    StreamStart {
        call_id: String,
        stream_id: String,
        /// Rate of the socket's audio in both directions.
        sample_rate: u32,
    },
    AudioFrame {
        payload: Bytes,
        encoding: AudioEncoding,
        sample_rate: u32,
    },
    StreamStop {
        stream_id: String,
    },
    StatusUpdate {
        call_id: String,
        provider_status: CallStatus,
    },
}

/// Raw message as read off a provider WebSocket.
#[derive(Debug, Clone, Copy)]
pub enum WireInbound<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Message to write to a provider WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("malformed {provider} message: {source}")]
    Json {
        provider: Provider,
        #[source]
        source: serde_json::Error,
    },
    #[error("bad base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{provider} does not send binary frames")]
    UnexpectedBinary { provider: Provider },
    #[error("{provider} start event without a call id")]
    MissingCallId { provider: Provider },
}

/// Why the bridge closes a telephony socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    CallNotFound,
    Unconfigured,
    AlreadyActive,
    VoiceUnavailable,
    StreamStartTimeout,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "call ended",
            CloseReason::CallNotFound => "call not found",
            CloseReason::Unconfigured => "no voice configuration for call",
            CloseReason::AlreadyActive => "call already bridged",
            CloseReason::VoiceUnavailable => "voice service unavailable",
            CloseReason::StreamStartTimeout => "stream start timeout",
        }
    }
}

impl Provider {
    /// WebSocket close code used when the bridge ends a stream.
    ///
    /// Twilio surfaces application codes (4xxx) in its debugger; Vonage only
    /// distinguishes the standard policy/internal-error codes.
    pub fn close_code(self, reason: CloseReason) -> u16 {
        match (self, reason) {
            (_, CloseReason::Normal) => 1000,
            (Provider::Twilio, CloseReason::CallNotFound) => 4004,
            (Provider::Twilio, CloseReason::Unconfigured) => 4003,
            (Provider::Twilio, CloseReason::AlreadyActive) => 4009,
            (Provider::Twilio, CloseReason::VoiceUnavailable) => 4502,
            (Provider::Twilio, CloseReason::StreamStartTimeout) => 4008,
            (Provider::Vonage, CloseReason::VoiceUnavailable) => 1011,
            (Provider::Vonage, _) => 1008,
        }
    }

    pub fn close_frame(self, reason: CloseReason) -> ProviderFrame {
        ProviderFrame::Close {
            code: self.close_code(reason),
            reason: reason.as_str().to_string(),
        }
    }

    /// Sample rate the provider's media socket carries.
    pub fn media_sample_rate(self, vonage_rate: u32) -> u32 {
        match self {
            Provider::Twilio => crate::pipeline::audio::MULAW_SAMPLE_RATE,
            Provider::Vonage => vonage_rate,
        }
    }
}

/// Map a provider call status onto the internal lifecycle.
///
/// | Provider event | Internal status |
/// |---|---|
/// | started/ringing | ringing |
/// | answered | in_progress |
/// | completed | completed |
/// | failed/busy/cancelled/timeout | failed |
///
/// Twilio spellings (`queued`, `initiated`, `in-progress`, `no-answer`,
/// `canceled`) and Vonage's `rejected`/`unanswered` fold onto the same rows.
pub fn map_provider_status(raw: &str) -> Option<CallStatus> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "started" | "ringing" | "queued" | "initiated" => Some(CallStatus::Ringing),
        "answered" | "in_progress" => Some(CallStatus::InProgress),
        "completed" => Some(CallStatus::Completed),
        "failed" | "busy" | "cancelled" | "canceled" | "timeout" | "no_answer" | "rejected"
        | "unanswered" => Some(CallStatus::Failed),
        _ => None,
    }
}

/// Per-connection normaliser. Vonage announces its sample rate once in the
/// connect message, so the normaliser remembers it for later binary frames.
#[derive(Debug)]
pub struct Normalizer {
    provider: Provider,
    sample_rate: u32,
}

impl Normalizer {
    pub fn new(provider: Provider, vonage_rate: u32) -> Self {
        Self {
            provider,
            sample_rate: provider.media_sample_rate(vonage_rate),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// `Ok(None)` for messages that carry nothing the bridge acts on.
    pub fn normalize(&mut self, msg: WireInbound<'_>) -> Result<Option<TelephonyEvent>, NormalizeError> {
        match self.provider {
            Provider::Twilio => match msg {
                WireInbound::Text(text) => twilio::normalize(text),
                WireInbound::Binary(_) => Err(NormalizeError::UnexpectedBinary {
                    provider: Provider::Twilio,
                }),
            },
            Provider::Vonage => vonage::normalize(msg, &mut self.sample_rate),
        }
    }
}

/// Wrap outbound audio in the provider's media envelope: Twilio takes a JSON
/// `media` event with base64 mu-law, Vonage takes the raw linear16 bytes.
pub fn create_provider_frame(provider: Provider, payload: &[u8], stream_id: &str) -> ProviderFrame {
    match provider {
        Provider::Twilio => ProviderFrame::Text(twilio::media_message(stream_id, payload)),
        Provider::Vonage => ProviderFrame::Binary(Bytes::copy_from_slice(payload)),
    }
}

fn media_stream_url(external_url: &str, path: &str) -> String {
    format!(
        "{}{path}",
        external_url
            .trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    )
}

/// Persist a webhook status and end the live bridge when the call is over.
/// Statuses that would move the call backwards are dropped.
pub async fn apply_status_update(deps: &BridgeDeps, provider: Provider, call_id: &str, raw_status: &str) {
    let Some(status) = map_provider_status(raw_status) else {
        tracing::debug!(%provider, call_id, raw_status, "Ignoring unmapped call status");
        return;
    };

    if !deps.active.advance(call_id, status).await {
        tracing::debug!(%provider, call_id, status = ?status, "Ignoring stale call status");
        return;
    }

    tracing::info!(%provider, call_id, status = ?status, "Call status update");

    if let Err(e) = deps.sink.record_call_status(call_id, status).await {
        tracing::error!(call_id, "Failed to persist call status: {e}");
    }

    if status.is_terminal() && deps.active.end(call_id).await {
        tracing::info!(call_id, "Ending live bridge after terminal status");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge;
    use crate::store::testing::MemoryStore;

    #[test]
    fn status_table_is_reproduced() {
        let rows = [
            ("started", CallStatus::Ringing),
            ("ringing", CallStatus::Ringing),
            ("answered", CallStatus::InProgress),
            ("completed", CallStatus::Completed),
            ("failed", CallStatus::Failed),
            ("busy", CallStatus::Failed),
            ("cancelled", CallStatus::Failed),
            ("timeout", CallStatus::Failed),
        ];
        for (raw, expected) in rows {
            assert_eq!(map_provider_status(raw), Some(expected), "{raw}");
        }
    }

    #[test]
    fn twilio_spellings_fold_onto_table() {
        assert_eq!(map_provider_status("in-progress"), Some(CallStatus::InProgress));
        assert_eq!(map_provider_status("no-answer"), Some(CallStatus::Failed));
        assert_eq!(map_provider_status("canceled"), Some(CallStatus::Failed));
        assert_eq!(map_provider_status("Ringing"), Some(CallStatus::Ringing));
        assert_eq!(map_provider_status("machine"), None);
    }

    #[test]
    fn provider_frames_keep_protocol_asymmetry() {
        let twilio = create_provider_frame(Provider::Twilio, &[0xFF, 0x7F], "MZ1");
        let ProviderFrame::Text(json) = twilio else {
            panic!("twilio frame must be text");
        };
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["event"], "media");
        assert_eq!(v["streamSid"], "MZ1");
        assert_eq!(v["media"]["payload"], "/38=");

        let vonage = create_provider_frame(Provider::Vonage, &[1, 2, 3, 4], "uuid");
        assert_eq!(vonage, ProviderFrame::Binary(Bytes::from_static(&[1, 2, 3, 4])));
    }

    #[test]
    fn twilio_rejects_binary() {
        let mut n = Normalizer::new(Provider::Twilio, 16000);
        assert!(matches!(
            n.normalize(WireInbound::Binary(&[0, 1])),
            Err(NormalizeError::UnexpectedBinary { .. })
        ));
    }

    #[test]
    fn close_codes_differ_by_provider() {
        assert_eq!(Provider::Twilio.close_code(CloseReason::CallNotFound), 4004);
        assert_eq!(Provider::Vonage.close_code(CloseReason::CallNotFound), 1008);
        assert_eq!(Provider::Vonage.close_code(CloseReason::Normal), 1000);
    }

    #[tokio::test]
    async fn webhook_statuses_only_move_forward() {
        let store = Arc::new(MemoryStore::default());
        let deps = bridge::testing::deps(store.clone());
        let cancel = deps.active.register("CA1", "MZ1", Provider::Twilio).await.unwrap();
        assert!(deps.active.advance("CA1", CallStatus::InProgress).await);

        apply_status_update(&deps, Provider::Twilio, "CA1", "ringing").await;
        apply_status_update(&deps, Provider::Twilio, "CA1", "in-progress").await;
        assert!(store.statuses().is_empty());

        apply_status_update(&deps, Provider::Twilio, "CA1", "completed").await;
        assert!(cancel.is_cancelled());
        deps.active.deregister("CA1").await;

        apply_status_update(&deps, Provider::Twilio, "CA1", "completed").await;
        apply_status_update(&deps, Provider::Twilio, "CA1", "failed").await;
        assert_eq!(store.statuses(), vec![CallStatus::Completed]);

        apply_status_update(&deps, Provider::Twilio, "CA2", "ringing").await;
        assert_eq!(store.statuses(), vec![CallStatus::Completed, CallStatus::Ringing]);
    }
}
