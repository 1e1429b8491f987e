use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::connector::{VoiceConnector, VoiceLink};
use super::messages::{self, InboundEvent, ServerEvent, SessionSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Configuring,
    Active,
    Closing,
    Closed,
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("voice connection failed: {0}")]
    Connect(String),
    #[error("voice service rejected the session (HTTP {status})")]
    Rejected { status: u16 },
    #[error("voice session not ready after {0:?}")]
    Timeout(Duration),
    #[error("voice service error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("voice connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("voice session is {0:?}")]
    NotActive(SessionState),
    #[error("voice send queue full")]
    Backpressure,
    #[error("fallback to default config failed: {0}")]
    FallbackFailed(Box<SessionError>),
}

/// What the bridge asks for when it opens a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub call_id: String,
    pub config_id: String,
    pub settings: SessionSettings,
}

/// Send half of an open voice session. Owned by the bridge loop.
#[derive(Debug)]
pub struct VoiceSession {
    call_id: String,
    config_id: String,
    fell_back: bool,
    state: SessionState,
    outgoing: Option<mpsc::Sender<String>>,
}

impl VoiceSession {
    fn new(call_id: &str, config_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            config_id: config_id.to_string(),
            fell_back: false,
            state: SessionState::Disconnected,
            outgoing: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Config id the session actually runs with.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// Whether the default config was used after the requested one failed.
    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(call_id = %self.call_id, from = ?self.state, to = ?next, "Voice session state");
        self.state = next;
    }

    /// Push the session configuration. Must precede any audio.
    pub async fn send_config(&mut self, settings: &SessionSettings) -> Result<(), SessionError> {
        let text = serde_json::to_string(settings).map_err(|e| SessionError::Connect(e.to_string()))?;
        let Some(tx) = &self.outgoing else {
            return Err(SessionError::NotActive(self.state));
        };
        if tx.send(text).await.is_err() {
            self.transition(SessionState::Error);
            return Err(SessionError::ClosedDuringHandshake);
        }
        self.transition(SessionState::Configuring);
        Ok(())
    }

    /// Forward one linear16 frame. Outside `Active` this sends nothing and
    /// moves the session to `Error` so callers stop retrying per frame.
    pub fn send_audio(&mut self, pcm: &[u8]) -> Result<(), SessionError> {
        let state = self.state;
        let tx = match &self.outgoing {
            Some(tx) if state == SessionState::Active => tx.clone(),
            _ => {
                if state != SessionState::Error {
                    self.transition(SessionState::Error);
                }
                return Err(SessionError::NotActive(state));
            }
        };

        let sent = tx.try_send(messages::audio_input_message(pcm));
        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SessionError::Backpressure),
            Err(TrySendError::Closed(_)) => {
                self.transition(SessionState::Error);
                Err(SessionError::NotActive(SessionState::Closed))
            }
        }
    }

    /// Idempotent. Dropping the sender lets the socket task close the connection.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closing);
        self.outgoing = None;
        self.transition(SessionState::Closed);
    }
}

/// Receive half of a voice session. Ends when the connection closes.
#[derive(Debug)]
pub struct VoiceEvents {
    call_id: String,
    incoming: mpsc::Receiver<String>,
    pending: VecDeque<InboundEvent>,
    fallback_rate: u32,
}

impl VoiceEvents {
    pub async fn next(&mut self) -> Option<InboundEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let text = self.incoming.recv().await?;
            match messages::parse_server_message(&text, self.fallback_rate) {
                Ok(ServerEvent::Events(events)) => self.pending.extend(events),
                Ok(ServerEvent::Ready { .. }) | Ok(ServerEvent::Ignored) => {}
                Err(e) => tracing::warn!(call_id = %self.call_id, "Skipping voice message: {e}"),
            }
        }
    }
}

/// Opens voice sessions with a bounded handshake and one fallback retry.
pub struct SessionManager {
    connector: Arc<dyn VoiceConnector>,
    default_config_id: Option<String>,
    connect_timeout: Duration,
    voice_sample_rate: u32,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn VoiceConnector>,
        default_config_id: Option<String>,
        connect_timeout: Duration,
        voice_sample_rate: u32,
    ) -> Self {
        Self {
            connector,
            default_config_id: default_config_id.filter(|id| !id.is_empty()),
            connect_timeout,
            voice_sample_rate,
        }
    }

    /// Open the session for `request.config_id`, falling back once to the
    /// default config id on timeout, rejection or handshake error.
    pub async fn open(&self, request: &SessionRequest) -> Result<(VoiceSession, VoiceEvents), SessionError> {
        let first = match self.attempt(request, &request.config_id).await {
            Ok(opened) => return Ok(opened),
            Err(e) => e,
        };

        let fallback = match self.default_config_id.as_deref() {
            Some(id) if id != request.config_id => id,
            _ => {
                tracing::error!(call_id = %request.call_id, config_id = %request.config_id, "Voice session failed, no fallback: {first}");
                return Err(first);
            }
        };

        tracing::warn!(
            call_id = %request.call_id,
            config_id = %request.config_id,
            fallback = fallback,
            "Voice session failed, retrying with default config: {first}"
        );

        match self.attempt(request, fallback).await {
            Ok((mut session, events)) => {
                session.fell_back = true;
                Ok((session, events))
            }
            Err(e) => {
                tracing::error!(call_id = %request.call_id, config_id = fallback, "Fallback voice session failed: {e}");
                Err(SessionError::FallbackFailed(Box::new(e)))
            }
        }
    }

    async fn attempt(&self, request: &SessionRequest, config_id: &str) -> Result<(VoiceSession, VoiceEvents), SessionError> {
        let mut session = VoiceSession::new(&request.call_id, config_id);
        let timeout = self.connect_timeout;

        let handshake = async {
            session.transition(SessionState::Connecting);
            let VoiceLink { outgoing, incoming } = self.connector.connect(config_id).await?;
            session.outgoing = Some(outgoing);
            session.send_config(&request.settings).await?;

            let mut events = VoiceEvents {
                call_id: request.call_id.clone(),
                incoming,
                pending: VecDeque::new(),
                fallback_rate: self.voice_sample_rate,
            };
            await_ready(&mut events).await?;
            Ok::<_, SessionError>(events)
        };

        let result = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        };

        match result {
            Ok(events) => {
                session.transition(SessionState::Active);
                tracing::info!(call_id = %request.call_id, config_id, "Voice session active");
                Ok((session, events))
            }
            Err(e) => {
                session.transition(SessionState::Error);
                session.close();
                Err(e)
            }
        }
    }
}

/// Wait for the first server message after `session_settings`. Anything other
/// than an error counts as ready and is kept for delivery.
async fn await_ready(events: &mut VoiceEvents) -> Result<(), SessionError> {
    loop {
        let Some(text) = events.incoming.recv().await else {
            return Err(SessionError::ClosedDuringHandshake);
        };
        match messages::parse_server_message(&text, events.fallback_rate) {
            Ok(ServerEvent::Ready { chat_id }) => {
                tracing::debug!(call_id = %events.call_id, ?chat_id, "Voice chat ready");
                return Ok(());
            }
            Ok(ServerEvent::Events(batch)) => {
                if let Some(InboundEvent::ProviderError { code, message }) = batch
                    .iter()
                    .find(|e| matches!(e, InboundEvent::ProviderError { .. }))
                    .cloned()
                {
                    return Err(SessionError::Provider { code, message });
                }
                events.pending.extend(batch);
                return Ok(());
            }
            Ok(ServerEvent::Ignored) => {}
            Err(e) => tracing::warn!(call_id = %events.call_id, "Skipping handshake message: {e}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::SessionError;
    use crate::hume::connector::{VoiceConnector, VoiceLink};

    pub const READY: &str = r#"{"type":"chat_metadata","chat_id":"chat-1"}"#;

    /// How the next `connect` behaves.
    pub enum Script {
        Reject,
        /// Accepts the socket but never answers `session_settings`.
        Silent,
        /// Answers with `chat_metadata` and hands the far end to the test.
        Accept,
        /// Answers with an `error` message.
        ProviderError,
    }

    /// Far end of an accepted mock connection.
    pub struct Remote {
        pub config_id: String,
        pub sent: mpsc::Receiver<String>,
        pub push: mpsc::Sender<String>,
    }

    pub struct MockConnector {
        scripts: Mutex<VecDeque<Script>>,
        remotes: mpsc::UnboundedSender<Remote>,
        held: Mutex<Vec<(mpsc::Sender<String>, mpsc::Receiver<String>)>>,
        attempts: Mutex<Vec<String>>,
    }

    impl MockConnector {
        pub fn new(scripts: Vec<Script>) -> (Self, mpsc::UnboundedReceiver<Remote>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Self {
                scripts: Mutex::new(scripts.into()),
                remotes: tx,
                held: Mutex::new(Vec::new()),
                attempts: Mutex::new(Vec::new()),
            };
            (connector, rx)
        }

        pub fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VoiceConnector for MockConnector {
        async fn connect(&self, config_id: &str) -> Result<VoiceLink, SessionError> {
            self.attempts.lock().unwrap().push(config_id.to_string());
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::Reject);

            let (out_tx, out_rx) = mpsc::channel(1024);
            let (in_tx, in_rx) = mpsc::channel(1024);

            match script {
                Script::Reject => return Err(SessionError::Rejected { status: 400 }),
                Script::Silent => {
                    self.held.lock().unwrap().push((in_tx, out_rx));
                }
                Script::ProviderError => {
                    in_tx
                        .send(r#"{"type":"error","code":"E0710","message":"config not found"}"#.into())
                        .await
                        .unwrap();
                    self.held.lock().unwrap().push((in_tx, out_rx));
                }
                Script::Accept => {
                    in_tx.send(READY.into()).await.unwrap();
                    let _ = self.remotes.send(Remote {
                        config_id: config_id.to_string(),
                        sent: out_rx,
                        push: in_tx,
                    });
                }
            }

            Ok(VoiceLink {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockConnector, Script};
    use super::*;
    use crate::config::{AudioConfig, SessionConfig};

    fn request(config_id: &str) -> SessionRequest {
        SessionRequest {
            call_id: "CA1".into(),
            config_id: config_id.into(),
            settings: SessionSettings::new(&SessionConfig::default(), &AudioConfig::default(), Some("Hello".into())),
        }
    }

    fn manager(connector: MockConnector, default: Option<&str>) -> (SessionManager, Arc<MockConnector>) {
        let connector = Arc::new(connector);
        let manager = SessionManager::new(
            connector.clone(),
            default.map(String::from),
            Duration::from_secs(10),
            48000,
        );
        (manager, connector)
    }

    #[tokio::test]
    async fn open_sends_settings_first_then_audio() {
        let (mock, mut remotes) = MockConnector::new(vec![Script::Accept]);
        let (manager, _) = manager(mock, None);

        let (mut session, _events) = manager.open(&request("cfg-agent")).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.fell_back());

        session.send_audio(&[1, 0]).unwrap();
        let mut remote = remotes.recv().await.unwrap();
        let first: serde_json::Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "session_settings");
        let second: serde_json::Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "audio_input");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back_to_default_config() {
        let (mock, _remotes) = MockConnector::new(vec![Script::Silent, Script::Accept]);
        let (manager, connector) = manager(mock, Some("cfg-default"));

        let (session, _events) = manager.open(&request("cfg-agent")).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.fell_back());
        assert_eq!(session.config_id(), "cfg-default");
        assert_eq!(connector.attempts(), vec!["cfg-agent", "cfg-default"]);
    }

    #[tokio::test]
    async fn provider_error_in_handshake_falls_back() {
        let (mock, _remotes) = MockConnector::new(vec![Script::ProviderError, Script::Accept]);
        let (manager, _) = manager(mock, Some("cfg-default"));
        let (session, _events) = manager.open(&request("cfg-bad")).await.unwrap();
        assert!(session.fell_back());
    }

    #[tokio::test]
    async fn only_one_retry() {
        let (mock, _remotes) = MockConnector::new(vec![Script::Reject, Script::Reject, Script::Accept]);
        let (manager, connector) = manager(mock, Some("cfg-default"));
        let err = manager.open(&request("cfg-agent")).await.unwrap_err();
        assert!(matches!(err, SessionError::FallbackFailed(_)));
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test]
    async fn no_retry_when_request_already_uses_default() {
        let (mock, _remotes) = MockConnector::new(vec![Script::Reject, Script::Accept]);
        let (manager, connector) = manager(mock, Some("cfg-default"));
        let err = manager.open(&request("cfg-default")).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected { status: 400 }));
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn send_after_close_flips_to_error_and_close_is_idempotent() {
        let (mock, _remotes) = MockConnector::new(vec![Script::Accept]);
        let (manager, _) = manager(mock, None);
        let (mut session, _events) = manager.open(&request("cfg")).await.unwrap();

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        assert!(matches!(
            session.send_audio(&[0, 0]),
            Err(SessionError::NotActive(SessionState::Closed))
        ));
        assert_eq!(session.state(), SessionState::Error);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn events_stream_demultiplexes_and_ends_on_close() {
        let (mock, mut remotes) = MockConnector::new(vec![Script::Accept]);
        let (manager, _) = manager(mock, None);
        let (_session, mut events) = manager.open(&request("cfg")).await.unwrap();
        let remote = remotes.recv().await.unwrap();

        remote
            .push
            .send(r#"{"type":"assistant_message","message":{"role":"assistant","content":"Hi!"}}"#.into())
            .await
            .unwrap();
        remote.push.send("garbage".into()).await.unwrap();
        remote.push.send(r#"{"type":"user_interruption"}"#.into()).await.unwrap();
        drop(remote);

        assert_eq!(
            events.next().await,
            Some(InboundEvent::AssistantTranscript { text: "Hi!".into() })
        );
        assert_eq!(events.next().await, Some(InboundEvent::UserInterruption));
        assert_eq!(events.next().await, None);
    }
}
