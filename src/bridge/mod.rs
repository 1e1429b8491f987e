//! Per-call bridge between a telephony media stream and a voice-AI session.
//!
//! One [`CallBridge`] runs per media socket. Its loop is the single writer
//! for the call's transcript, step machine and running analytics: telephony
//! frames and voice events are handled one at a time from two channels.

pub mod socket;
pub mod transcript;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hooks::{CompletionHook, CompletionReport};
use crate::hume::{InboundEvent, SessionError, SessionManager, SessionRequest, SessionSettings, VoiceEvents, VoiceSession};
use crate::model::{CallStatus, ConversationTurn, Provider, ReviewStatus, RiskFlag, Role};
use crate::pipeline::analytics::AnalyticsAggregator;
use crate::pipeline::audio::{self, LINEAR16_BYTES, MULAW_SAMPLE_RATE};
use crate::pipeline::clarifies::ClarifiesTracker;
use crate::pipeline::risk::{RiskCheck, RiskFilter};
use crate::registry::{self, ActiveCalls, CallDirectory, ResolvedCall, Unresolved};
use crate::store::{PersistenceSink, RecordQueue, StoreRecord};
use crate::telephony::{self, twilio, vonage, AudioEncoding, CloseReason, ProviderFrame, TelephonyEvent};
use transcript::Transcript;

/// How long the ending sequence waits for queued records to be written.
const PERSIST_DRAIN: Duration = Duration::from_secs(10);

/// Shared collaborators, constructed once at startup.
#[derive(Clone)]
pub struct BridgeDeps {
    pub config: Arc<Config>,
    pub directory: Arc<dyn CallDirectory>,
    pub sessions: Arc<SessionManager>,
    pub sink: Arc<dyn PersistenceSink>,
    pub hook: Arc<dyn CompletionHook>,
    pub risk: Arc<RiskFilter>,
    pub active: ActiveCalls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Accepted,
    AwaitingStreamStart,
    Bridging,
    Ending,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    StreamStartTimeout,
    CallNotFound,
    Unconfigured,
    LookupFailed,
    AlreadyActive,
    VoiceUnavailable,
    StreamStopped,
    TelephonyClosed,
    VoiceEnded,
    /// A status webhook reported the call over.
    StatusTerminal,
    MaxDuration,
}

impl EndReason {
    fn close_reason(self) -> CloseReason {
        match self {
            EndReason::StreamStartTimeout => CloseReason::StreamStartTimeout,
            EndReason::CallNotFound => CloseReason::CallNotFound,
            EndReason::Unconfigured => CloseReason::Unconfigured,
            EndReason::AlreadyActive => CloseReason::AlreadyActive,
            EndReason::LookupFailed | EndReason::VoiceUnavailable => CloseReason::VoiceUnavailable,
            EndReason::StreamStopped
            | EndReason::TelephonyClosed
            | EndReason::VoiceEnded
            | EndReason::StatusTerminal
            | EndReason::MaxDuration => CloseReason::Normal,
        }
    }

    /// Status the bridge records on the way out. `None` when someone else
    /// already recorded the final status.
    fn final_status(self) -> Option<CallStatus> {
        match self {
            EndReason::VoiceUnavailable => Some(CallStatus::Failed),
            EndReason::StatusTerminal => None,
            _ => Some(CallStatus::Completed),
        }
    }
}

/// Per-call counters, reported in the final log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub frames_forwarded: u64,
    pub frames_dropped_not_ready: u64,
    pub frames_dropped_backpressure: u64,
    pub frames_sent: u64,
    pub codec_failures: u64,
    pub turns: u64,
    pub risk_flags: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone)]
pub struct BridgeReport {
    pub call_id: Option<String>,
    pub history: Vec<BridgeState>,
    pub end_reason: EndReason,
    pub counters: CallCounters,
}

/// Telephony side of a bridge, already normalised.
pub struct TelephonyLink {
    pub inbound: mpsc::Receiver<TelephonyEvent>,
    pub outbound: mpsc::Sender<ProviderFrame>,
}

/// State that exists once the call is identified and registered.
struct LiveCall {
    call_id: String,
    stream_id: String,
    /// Rate agreed on the telephony socket.
    media_rate: u32,
    outbound: mpsc::Sender<ProviderFrame>,
    queue: RecordQueue,
    tracker: ClarifiesTracker,
    analytics: AnalyticsAggregator,
    transcript: Transcript,
    started_at: DateTime<Utc>,
}

impl LiveCall {
    fn new(deps: &BridgeDeps, start: StreamStarted, outbound: mpsc::Sender<ProviderFrame>) -> Self {
        let StreamStarted {
            call_id,
            stream_id,
            sample_rate,
        } = start;
        let config = &deps.config;
        Self {
            queue: RecordQueue::spawn(deps.sink.clone(), &call_id, config.bridge.event_queue),
            tracker: ClarifiesTracker::new(config.intelligence.long_message_words),
            analytics: AnalyticsAggregator::new(config.intelligence.analytics()),
            transcript: Transcript::new(),
            started_at: Utc::now(),
            call_id,
            stream_id,
            media_rate: sample_rate,
            outbound,
        }
    }

    fn push_analytics(&self) {
        if let Some(snapshot) = self.analytics.snapshot() {
            self.queue.push(StoreRecord::Analytics(snapshot.clone()));
        }
    }
}

struct StreamStarted {
    call_id: String,
    stream_id: String,
    sample_rate: u32,
}

enum Opened {
    Ready(VoiceSession, VoiceEvents),
    Failed,
    Interrupted(EndReason),
}

pub struct CallBridge {
    deps: BridgeDeps,
    provider: Provider,
    call_id: Option<String>,
    history: Vec<BridgeState>,
    counters: CallCounters,
}

impl CallBridge {
    pub fn new(deps: BridgeDeps, provider: Provider) -> Self {
        let mut bridge = Self {
            deps,
            provider,
            call_id: None,
            history: Vec::with_capacity(5),
            counters: CallCounters::default(),
        };
        bridge.enter(BridgeState::Accepted);
        bridge
    }

    fn enter(&mut self, state: BridgeState) {
        tracing::debug!(call_id = ?self.call_id, provider = %self.provider, ?state, "Bridge state");
        self.history.push(state);
    }

    pub async fn run(mut self, link: TelephonyLink) -> BridgeReport {
        let TelephonyLink { mut inbound, outbound } = link;
        self.enter(BridgeState::AwaitingStreamStart);

        let started = match self.await_stream_start(&mut inbound).await {
            Ok(started) => started,
            Err(reason) => return self.reject(reason, &outbound, None).await,
        };
        let call_id = started.call_id.clone();
        self.call_id = Some(call_id.clone());
        tracing::info!(
            call_id = %call_id,
            stream_id = %started.stream_id,
            sample_rate = started.sample_rate,
            provider = %self.provider,
            "Stream started"
        );

        let lookup_timeout = self.deps.config.bridge.lookup_timeout();
        let resolved = match registry::resolve_call(self.deps.directory.as_ref(), &call_id, lookup_timeout).await {
            Ok(resolved) => resolved,
            Err(Unresolved::NotFound) => {
                tracing::warn!(call_id = %call_id, "Call not found in directory");
                return self.reject(EndReason::CallNotFound, &outbound, None).await;
            }
            Err(Unresolved::Unconfigured) => {
                tracing::error!(call_id = %call_id, "Call has no agent voice configuration");
                return self
                    .reject(EndReason::Unconfigured, &outbound, Some(CallStatus::Failed))
                    .await;
            }
            Err(Unresolved::Lookup(e)) => {
                tracing::error!(call_id = %call_id, "Call lookup failed: {e}");
                return self.reject(EndReason::LookupFailed, &outbound, None).await;
            }
        };
        tracing::info!(
            call_id = %call_id,
            config_id = %resolved.config_id,
            source = ?resolved.source,
            agent = ?resolved.record.assigned_agent_name,
            prior_calls = resolved.record.prior_call_history.len(),
            "Voice configuration resolved"
        );

        let Some(cancel) = self.deps.active.register(&call_id, &started.stream_id, self.provider).await else {
            return self.reject(EndReason::AlreadyActive, &outbound, None).await;
        };

        let mut call = LiveCall::new(&self.deps, started, outbound);
        self.record_status(&call, CallStatus::InProgress).await;

        let request = self.session_request(&call, &resolved);
        let (mut session, events) = match self.open_session(&request, &mut inbound, &cancel).await {
            Opened::Ready(session, events) => (session, events),
            Opened::Failed => return self.finish(call, EndReason::VoiceUnavailable).await,
            Opened::Interrupted(reason) => return self.finish(call, reason).await,
        };

        self.enter(BridgeState::Bridging);
        tracing::info!(
            call_id = %call.call_id,
            config_id = session.config_id(),
            fell_back = session.fell_back(),
            "Call bridged"
        );

        let (voice_tx, mut voice_rx) = mpsc::channel(self.deps.config.bridge.event_queue.max(1));
        let listener = tokio::spawn(listen(events, voice_tx));

        let max_call = self.deps.config.bridge.max_call();
        let deadline = async move {
            match max_call {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(TelephonyEvent::AudioFrame { payload, encoding, sample_rate }) => {
                        if !self.forward_audio(&mut session, &payload, encoding, sample_rate) {
                            break EndReason::VoiceEnded;
                        }
                    }
                    Some(TelephonyEvent::StreamStop { stream_id }) => {
                        tracing::info!(call_id = %call.call_id, stream_id = %stream_id, "Stream stopped");
                        break EndReason::StreamStopped;
                    }
                    Some(TelephonyEvent::StatusUpdate { call_id, provider_status }) => {
                        tracing::info!(call_id = %call_id, status = ?provider_status, "Call status from media socket");
                        self.record_status(&call, provider_status).await;
                        if provider_status.is_terminal() {
                            break EndReason::StatusTerminal;
                        }
                    }
                    Some(TelephonyEvent::StreamStart { stream_id, .. }) => {
                        tracing::warn!(call_id = %call.call_id, stream_id = %stream_id, "Ignoring repeated stream start");
                    }
                    None => break EndReason::TelephonyClosed,
                },
                event = voice_rx.recv() => match event {
                    Some(event) => {
                        if !self.on_voice_event(&mut call, event).await {
                            break EndReason::TelephonyClosed;
                        }
                    }
                    None => {
                        tracing::info!(call_id = %call.call_id, "Voice session ended");
                        break EndReason::VoiceEnded;
                    }
                },
                _ = cancel.cancelled() => break EndReason::StatusTerminal,
                _ = &mut deadline => {
                    tracing::warn!(call_id = %call.call_id, "Maximum call duration reached");
                    break EndReason::MaxDuration;
                }
            }
        };

        session.close();
        listener.abort();
        self.finish(call, reason).await
    }

    async fn await_stream_start(
        &mut self,
        inbound: &mut mpsc::Receiver<TelephonyEvent>,
    ) -> Result<StreamStarted, EndReason> {
        let grace = self.deps.config.bridge.stream_start_grace();
        let counters = &mut self.counters;
        let wait = async {
            loop {
                match inbound.recv().await {
                    Some(TelephonyEvent::StreamStart {
                        call_id,
                        stream_id,
                        sample_rate,
                    }) => {
                        return Ok(StreamStarted {
                            call_id,
                            stream_id,
                            sample_rate,
                        })
                    }
                    Some(TelephonyEvent::AudioFrame { .. }) => counters.frames_dropped_not_ready += 1,
                    Some(TelephonyEvent::StreamStop { .. }) | None => return Err(EndReason::TelephonyClosed),
                    Some(TelephonyEvent::StatusUpdate { .. }) => {}
                }
            }
        };

        match tokio::time::timeout(grace, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(provider = %self.provider, grace_secs = grace.as_secs(), "No stream start received");
                Err(EndReason::StreamStartTimeout)
            }
        }
    }

    /// Build the session request. The greeting is spoken by the voice
    /// service, so it is vetted here before it leaves the process.
    fn session_request(&mut self, call: &LiveCall, resolved: &ResolvedCall) -> SessionRequest {
        let config = self.deps.config.clone();
        let greeting = resolved
            .record
            .greeting
            .clone()
            .or_else(|| config.session.greeting.clone())
            .map(|greeting| {
                let check = self.deps.risk.check(&greeting);
                self.flag_risk(call, &greeting, &check);
                if check.should_block {
                    tracing::warn!(call_id = %call.call_id, "Greeting blocked by risk filter, using replacement");
                }
                check.safe_text
            });

        SessionRequest {
            call_id: call.call_id.clone(),
            config_id: resolved.config_id.clone(),
            settings: SessionSettings::new(&config.session, &config.audio, greeting),
        }
    }

    /// Open the voice session while still draining the telephony side.
    /// Audio that arrives before the session is ready is dropped.
    async fn open_session(
        &mut self,
        request: &SessionRequest,
        inbound: &mut mpsc::Receiver<TelephonyEvent>,
        cancel: &CancellationToken,
    ) -> Opened {
        let sessions = self.deps.sessions.clone();
        let open = sessions.open(request);
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => {
                    return match result {
                        Ok((session, events)) => Opened::Ready(session, events),
                        Err(e) => {
                            tracing::error!(call_id = %request.call_id, "Voice session unavailable: {e}");
                            Opened::Failed
                        }
                    };
                }
                event = inbound.recv() => match event {
                    Some(TelephonyEvent::AudioFrame { .. }) => self.counters.frames_dropped_not_ready += 1,
                    Some(TelephonyEvent::StreamStop { .. }) => return Opened::Interrupted(EndReason::StreamStopped),
                    Some(TelephonyEvent::StatusUpdate { provider_status, .. }) if provider_status.is_terminal() => {
                        return Opened::Interrupted(EndReason::StatusTerminal);
                    }
                    Some(_) => {}
                    None => return Opened::Interrupted(EndReason::TelephonyClosed),
                },
                _ = cancel.cancelled() => return Opened::Interrupted(EndReason::StatusTerminal),
            }
        }
    }

    /// Convert one caller frame and send it on. Returns false once the voice
    /// session no longer accepts audio.
    fn forward_audio(
        &mut self,
        session: &mut VoiceSession,
        payload: &[u8],
        encoding: AudioEncoding,
        sample_rate: u32,
    ) -> bool {
        let audio_config = &self.deps.config.audio;
        let voice_rate = audio_config.voice_sample_rate;

        let pcm = match encoding {
            AudioEncoding::Mulaw => {
                audio::decode_mulaw_to_linear16(payload, audio_config.inbound_boost, sample_rate, voice_rate)
            }
            AudioEncoding::Linear16 => match audio::resample_linear16(payload, sample_rate, voice_rate) {
                Ok(pcm) => pcm,
                Err(e) => {
                    tracing::warn!(call_id = ?self.call_id, "Resample failed, keeping source rate: {e}");
                    self.counters.codec_failures += 1;
                    payload.to_vec()
                }
            },
        };
        if pcm.is_empty() {
            if !payload.is_empty() {
                self.counters.codec_failures += 1;
            }
            return true;
        }

        match session.send_audio(&pcm) {
            Ok(()) => {
                self.counters.frames_forwarded += 1;
                true
            }
            Err(SessionError::Backpressure) => {
                self.counters.frames_dropped_backpressure += 1;
                true
            }
            Err(e) => {
                tracing::warn!(call_id = ?self.call_id, state = ?session.state(), "Voice session stopped accepting audio: {e}");
                false
            }
        }
    }

    /// Returns false when the telephony socket is gone.
    async fn on_voice_event(&mut self, call: &mut LiveCall, event: InboundEvent) -> bool {
        match event {
            InboundEvent::AudioOutput { pcm, sample_rate } => return self.play(call, &pcm, sample_rate).await,
            InboundEvent::UserTranscript { text } => {
                if let Some(turn) = call.transcript.begin(Role::Customer, text) {
                    self.finish_turn(call, turn);
                }
            }
            InboundEvent::AssistantTranscript { text } => {
                if let Some(turn) = call.transcript.begin(Role::Agent, text) {
                    self.finish_turn(call, turn);
                }
            }
            InboundEvent::EmotionUpdate { role, scores } => match call.transcript.enrich(role, scores.clone()) {
                Some(turn) => self.finish_turn(call, turn),
                None if role == Role::Customer => {
                    if call.analytics.record_emotions(&scores) {
                        call.push_analytics();
                    }
                }
                None => {}
            },
            InboundEvent::UserInterruption => {
                tracing::debug!(call_id = %call.call_id, "Caller interrupted agent");
                if self.provider == Provider::Twilio {
                    let clear = ProviderFrame::Text(twilio::clear_message(&call.stream_id));
                    if call.outbound.send(clear).await.is_err() {
                        return false;
                    }
                }
            }
            InboundEvent::ProviderError { code, message } => {
                tracing::error!(call_id = %call.call_id, code = %code, "Voice service error: {message}");
            }
        }
        true
    }

    /// Convert agent audio to the provider's format and emit it in frames.
    async fn play(&mut self, call: &LiveCall, pcm: &[u8], sample_rate: u32) -> bool {
        let audio_config = self.deps.config.audio.clone();

        let pcm = if audio_config.output_volume != 1.0 {
            let samples = audio::apply_gain(&audio::bytes_to_samples(pcm), audio_config.output_volume);
            audio::samples_to_bytes(&samples)
        } else {
            pcm.to_vec()
        };
        let pcm = audio::speed_up_linear16(&pcm, audio_config.playback_speed);

        let (encoded, frame_size) = match self.provider {
            Provider::Twilio => (
                audio::encode_linear16_to_mulaw(&pcm, sample_rate, MULAW_SAMPLE_RATE),
                audio::chunk_size_for(audio_config.chunk_ms, MULAW_SAMPLE_RATE, 1),
            ),
            Provider::Vonage => {
                let rate = call.media_rate;
                let resampled = match audio::resample_linear16(&pcm, sample_rate, rate) {
                    Ok(resampled) => resampled,
                    Err(e) => {
                        tracing::warn!(call_id = %call.call_id, "Resample failed, keeping source rate: {e}");
                        self.counters.codec_failures += 1;
                        pcm.clone()
                    }
                };
                (resampled, audio::chunk_size_for(vonage::FRAME_MS, rate, LINEAR16_BYTES))
            }
        };
        if encoded.is_empty() {
            if !pcm.is_empty() {
                self.counters.codec_failures += 1;
            }
            return true;
        }

        for chunk in audio::chunk_audio(&encoded, frame_size) {
            let frame = if self.provider == Provider::Vonage && chunk.len() < frame_size {
                let mut padded = chunk.to_vec();
                padded.resize(frame_size, 0);
                telephony::create_provider_frame(self.provider, &padded, &call.stream_id)
            } else {
                telephony::create_provider_frame(self.provider, chunk, &call.stream_id)
            };
            if call.outbound.send(frame).await.is_err() {
                return false;
            }
            self.counters.frames_sent += 1;
        }
        true
    }

    /// Classify, persist and count one final turn.
    fn finish_turn(&mut self, call: &mut LiveCall, mut turn: ConversationTurn) {
        self.counters.turns += 1;
        call.analytics.record_turn();

        match turn.role {
            Role::Customer => {
                let insight = call.tracker.observe_customer_turn(&turn.text);
                if let Some(insight) = &insight {
                    turn.sentiment = Some(insight.sentiment.label);
                    call.transcript.set_last_sentiment(&turn);
                }
                call.queue.push(StoreRecord::Turn(turn.clone()));

                if let Some(scores) = &turn.emotions {
                    call.analytics.record_emotions(scores);
                }
                if let Some(insight) = insight {
                    call.analytics.record_sentiment(insight.sentiment.score());
                    if let Some(objection) = insight.objection {
                        tracing::info!(
                            call_id = %call.call_id,
                            category = %objection.category,
                            confidence = objection.confidence,
                            "Objection detected"
                        );
                        call.analytics.record_objection();
                        call.queue.push(StoreRecord::Objection(objection));
                    }
                    call.analytics.record_resolved(insight.resolved_objections);
                    tracing::debug!(
                        call_id = %call.call_id,
                        step = %insight.step.step,
                        sequence = insight.step.sequence,
                        reasoning = %insight.step.reasoning,
                        "CLARIFIES step"
                    );
                    call.queue.push(StoreRecord::Step(insight.step));
                }
            }
            Role::Agent => {
                call.queue.push(StoreRecord::Turn(turn.clone()));
                let check = self.deps.risk.check(&turn.text);
                self.flag_risk(call, &turn.text, &check);
                if check.should_block {
                    tracing::warn!(
                        call_id = %call.call_id,
                        "Agent text matched a blocking risk rule after the voice service already spoke it; flagged for review"
                    );
                }
            }
            Role::System => call.queue.push(StoreRecord::Turn(turn.clone())),
        }

        call.push_analytics();
    }

    /// Queue a status change unless it would move the call backwards.
    /// Returns whether it was recorded.
    async fn record_status(&self, call: &LiveCall, status: CallStatus) -> bool {
        if !self.deps.active.advance(&call.call_id, status).await {
            tracing::debug!(call_id = %call.call_id, status = ?status, "Status already superseded");
            return false;
        }
        call.queue.push(StoreRecord::Status(status));
        true
    }

    fn flag_risk(&mut self, call: &LiveCall, text: &str, check: &RiskCheck) {
        for matched in &check.matched {
            self.counters.risk_flags += 1;
            tracing::info!(
                call_id = %call.call_id,
                category = %matched.category,
                severity = ?matched.severity,
                blocked = matched.blocked,
                "Risk flag"
            );
            call.queue.push(StoreRecord::Risk(RiskFlag {
                text: text.to_string(),
                category: matched.category.clone(),
                severity: matched.severity,
                blocked: matched.blocked,
                replacement: matched.blocked.then(|| check.safe_text.clone()),
                review_status: ReviewStatus::PendingReview,
                flagged_at: Utc::now(),
            }));
        }
    }

    /// Ending sequence for a registered call.
    async fn finish(mut self, mut call: LiveCall, reason: EndReason) -> BridgeReport {
        self.enter(BridgeState::Ending);

        if let Some(turn) = call.transcript.flush() {
            self.finish_turn(&mut call, turn);
        }

        let outcome = call.analytics.finalize(&call.transcript.customer_messages());
        call.push_analytics();

        let mut status = reason.final_status();
        if let Some(final_status) = status {
            if !self.record_status(&call, final_status).await {
                status = None;
            }
        }

        let _ = call
            .outbound
            .send(self.provider.close_frame(reason.close_reason()))
            .await;

        self.deps.active.deregister(&call.call_id).await;

        if self.history.contains(&BridgeState::Bridging) {
            let ended_at = Utc::now();
            let report = CompletionReport {
                call_id: call.call_id.clone(),
                provider: self.provider,
                status: status.unwrap_or(CallStatus::Completed),
                outcome_classification: outcome,
                qa_pairs: call.transcript.qa_pairs(),
                duration_seconds: (ended_at - call.started_at).num_seconds(),
                started_at: call.started_at,
                ended_at,
            };
            let hook_timeout = self.deps.config.hooks.timeout();
            match tokio::time::timeout(hook_timeout, self.deps.hook.call_completed(&report)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(call_id = %call.call_id, "Completion hook failed: {e}"),
                Err(_) => tracing::error!(
                    call_id = %call.call_id,
                    timeout_secs = hook_timeout.as_secs(),
                    "Completion hook timed out"
                ),
            }
        }

        let LiveCall { call_id, queue, tracker, .. } = call;
        let tracker_step = tracker.current();
        self.counters.persistence_failures = queue.close(PERSIST_DRAIN).await;
        self.enter(BridgeState::Closed);

        let c = self.counters;
        tracing::info!(
            call_id = %call_id,
            provider = %self.provider,
            reason = ?reason,
            outcome = ?outcome,
            final_step = %tracker_step,
            frames_forwarded = c.frames_forwarded,
            frames_dropped_not_ready = c.frames_dropped_not_ready,
            frames_dropped_backpressure = c.frames_dropped_backpressure,
            frames_sent = c.frames_sent,
            codec_failures = c.codec_failures,
            turns = c.turns,
            risk_flags = c.risk_flags,
            persistence_failures = c.persistence_failures,
            "Call closed"
        );

        self.report(reason)
    }

    /// Close a stream that never became a live call.
    async fn reject(
        mut self,
        reason: EndReason,
        outbound: &mpsc::Sender<ProviderFrame>,
        status: Option<CallStatus>,
    ) -> BridgeReport {
        if let (Some(call_id), Some(status)) = (&self.call_id, status) {
            if !self.deps.active.advance(call_id, status).await {
                tracing::debug!(call_id = %call_id, status = ?status, "Status already superseded");
            } else if let Err(e) = self.deps.sink.record_call_status(call_id, status).await {
                self.counters.persistence_failures += 1;
                tracing::error!(call_id = %call_id, "Failed to persist call status: {e}");
            }
        }

        let _ = outbound.send(self.provider.close_frame(reason.close_reason())).await;
        self.enter(BridgeState::Closed);
        tracing::warn!(
            call_id = ?self.call_id,
            provider = %self.provider,
            reason = ?reason,
            frames_dropped_not_ready = self.counters.frames_dropped_not_ready,
            "Call closed without bridging"
        );
        self.report(reason)
    }

    fn report(self, end_reason: EndReason) -> BridgeReport {
        BridgeReport {
            call_id: self.call_id,
            history: self.history,
            end_reason,
            counters: self.counters,
        }
    }
}

/// Listen task: forwards voice events to the bridge loop until either side ends.
async fn listen(mut events: VoiceEvents, tx: mpsc::Sender<InboundEvent>) {
    while let Some(event) = events.next().await {
        if tx.send(event).await.is_err() {
            break;
        }
    }
}


#[cfg(test)]
mod tests {
    use base64::Engine;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::hooks::testing::{HangingHook, RecordingHook};
    use crate::hume::session::testing::{MockConnector, Remote, Script};
    use crate::model::Resolution;
    use crate::pipeline::analytics::Outcome;
    use crate::pipeline::objection::ObjectionCategory;
    use crate::registry::testing::MemoryDirectory;
    use crate::registry::CallRecord;
    use crate::store::testing::MemoryStore;

    struct Harness {
        inbound: mpsc::Sender<TelephonyEvent>,
        outbound: mpsc::Receiver<ProviderFrame>,
        remotes: mpsc::UnboundedReceiver<Remote>,
        handle: JoinHandle<BridgeReport>,
        store: Arc<MemoryStore>,
        hook: Arc<RecordingHook>,
        connector: Arc<MockConnector>,
    }

    fn configured(call_id: &str) -> MemoryDirectory {
        MemoryDirectory::with(
            call_id,
            CallRecord {
                agent_voice_config_id: Some("cfg-agent".into()),
                assigned_agent_name: Some("Ava".into()),
                greeting: Some("Hi, this is Ava from Acme.".into()),
                ..Default::default()
            },
        )
    }

    fn start(provider: Provider, scripts: Vec<Script>, directory: MemoryDirectory, active: ActiveCalls) -> Harness {
        start_with(provider, scripts, directory, active, |_| {}, None)
    }

    fn start_with(
        provider: Provider,
        scripts: Vec<Script>,
        directory: MemoryDirectory,
        active: ActiveCalls,
        configure: impl FnOnce(&mut Config),
        hook_override: Option<Arc<dyn CompletionHook>>,
    ) -> Harness {
        let mut config = Config::default();
        config.bridge.max_call_secs = 0;
        config.hume.default_config_id = Some("cfg-default".into());
        configure(&mut config);
        let config = Arc::new(config);

        let (mock, remotes) = MockConnector::new(scripts);
        let connector = Arc::new(mock);
        let sessions = SessionManager::new(
            connector.clone(),
            config.hume.default_config_id.clone(),
            config.hume.connect_timeout(),
            config.audio.voice_sample_rate,
        );
        let store = Arc::new(MemoryStore::default());
        let hook = Arc::new(RecordingHook::default());

        let deps = BridgeDeps {
            config,
            directory: Arc::new(directory),
            sessions: Arc::new(sessions),
            sink: store.clone(),
            hook: hook_override.unwrap_or_else(|| hook.clone()),
            risk: Arc::new(RiskFilter::default()),
            active,
        };

        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let handle = tokio::spawn(CallBridge::new(deps, provider).run(TelephonyLink {
            inbound: in_rx,
            outbound: out_tx,
        }));

        Harness {
            inbound: in_tx,
            outbound: out_rx,
            remotes,
            handle,
            store,
            hook,
            connector,
        }
    }

    fn stream_start(call_id: &str) -> TelephonyEvent {
        stream_start_at(call_id, 8000)
    }

    fn stream_start_at(call_id: &str, sample_rate: u32) -> TelephonyEvent {
        TelephonyEvent::StreamStart {
            call_id: call_id.into(),
            stream_id: "MZ1".into(),
            sample_rate,
        }
    }

    fn stream_stop() -> TelephonyEvent {
        TelephonyEvent::StreamStop { stream_id: "MZ1".into() }
    }

    fn mulaw_frame() -> TelephonyEvent {
        TelephonyEvent::AudioFrame {
            payload: Bytes::from(vec![0xFFu8; 160]),
            encoding: AudioEncoding::Mulaw,
            sample_rate: 8000,
        }
    }

    fn audio_output(bytes: usize) -> String {
        let data = base64::engine::general_purpose::STANDARD.encode(vec![0u8; bytes]);
        format!(r#"{{"type":"audio_output","data":"{data}"}}"#)
    }

    async fn expect_close(outbound: &mut mpsc::Receiver<ProviderFrame>) -> u16 {
        loop {
            match outbound.recv().await {
                Some(ProviderFrame::Close { code, .. }) => return code,
                Some(_) => continue,
                None => panic!("outbound closed without close frame"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closes_when_stream_never_starts() {
        let mut h = start(Provider::Twilio, vec![], MemoryDirectory::default(), ActiveCalls::new());
        h.inbound.send(mulaw_frame()).await.unwrap();

        let report = h.handle.await.unwrap();
        assert_eq!(report.end_reason, EndReason::StreamStartTimeout);
        assert_eq!(
            report.history,
            vec![BridgeState::Accepted, BridgeState::AwaitingStreamStart, BridgeState::Closed]
        );
        assert_eq!(report.counters.frames_dropped_not_ready, 1);
        assert_eq!(expect_close(&mut h.outbound).await, 4008);
        assert!(h.connector.attempts().is_empty());
    }

    #[tokio::test]
    async fn unknown_call_is_rejected_without_fallback() {
        let mut h = start(Provider::Twilio, vec![Script::Accept], MemoryDirectory::default(), ActiveCalls::new());
        h.inbound.send(stream_start("CA404")).await.unwrap();

        let report = h.handle.await.unwrap();
        assert_eq!(report.end_reason, EndReason::CallNotFound);
        assert!(!report.history.contains(&BridgeState::Bridging));
        assert_eq!(expect_close(&mut h.outbound).await, 4004);
        assert!(h.connector.attempts().is_empty());
        assert!(h.store.records().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_call_is_failed() {
        let directory = MemoryDirectory::with("CA1", CallRecord::default());
        let mut h = start(Provider::Vonage, vec![Script::Accept], directory, ActiveCalls::new());
        h.inbound.send(stream_start("CA1")).await.unwrap();

        let report = h.handle.await.unwrap();
        assert_eq!(report.end_reason, EndReason::Unconfigured);
        assert_eq!(expect_close(&mut h.outbound).await, 1008);
        assert_eq!(h.store.statuses(), vec![CallStatus::Failed]);
        assert!(h.connector.attempts().is_empty());
    }

    #[tokio::test]
    async fn second_stream_for_live_call_is_rejected() {
        let active = ActiveCalls::new();
        active.register("CA1", "MZ0", Provider::Twilio).await.unwrap();
        let mut h = start(Provider::Twilio, vec![Script::Accept], configured("CA1"), active.clone());
        h.inbound.send(stream_start("CA1")).await.unwrap();

        let report = h.handle.await.unwrap();
        assert_eq!(report.end_reason, EndReason::AlreadyActive);
        assert_eq!(expect_close(&mut h.outbound).await, 4009);
        assert!(active.is_active("CA1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn open_timeout_falls_back_and_reaches_bridging() {
        let mut h = start(
            Provider::Twilio,
            vec![Script::Silent, Script::Accept],
            configured("CA1"),
            ActiveCalls::new(),
        );
        h.inbound.send(stream_start("CA1")).await.unwrap();
        for _ in 0..3 {
            h.inbound.send(mulaw_frame()).await.unwrap();
        }

        let mut remote = h.remotes.recv().await.unwrap();
        assert_eq!(remote.config_id, "cfg-default");
        assert_eq!(h.connector.attempts(), vec!["cfg-agent", "cfg-default"]);

        // Agent audio reaching the caller proves the bridge is live.
        remote.push.send(audio_output(960)).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ProviderFrame::Text(json) => {
                let v: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(v["event"], "media");
                assert_eq!(v["streamSid"], "MZ1");
            }
            other => panic!("unexpected {other:?}"),
        }

        h.inbound.send(mulaw_frame()).await.unwrap();
        h.inbound
            .send(TelephonyEvent::StreamStop { stream_id: "MZ1".into() })
            .await
            .unwrap();
        let report = h.handle.await.unwrap();

        assert_eq!(report.end_reason, EndReason::StreamStopped);
        assert_eq!(
            report.history,
            vec![
                BridgeState::Accepted,
                BridgeState::AwaitingStreamStart,
                BridgeState::Bridging,
                BridgeState::Ending,
                BridgeState::Closed,
            ]
        );
        assert_eq!(report.counters.frames_dropped_not_ready, 3);
        assert_eq!(report.counters.frames_forwarded, 1);

        let settings: serde_json::Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
        assert_eq!(settings["type"], "session_settings");
        assert_eq!(settings["greeting"], "Hi, this is Ava from Acme.");
        let audio: serde_json::Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
        assert_eq!(audio["type"], "audio_input");

        assert_eq!(h.store.statuses(), vec![CallStatus::InProgress, CallStatus::Completed]);
        assert_eq!(h.hook.reports().len(), 1);
    }

    #[tokio::test]
    async fn conversation_is_classified_persisted_and_reported() {
        let mut h = start(Provider::Twilio, vec![Script::Accept], configured("CA1"), ActiveCalls::new());
        h.inbound.send(stream_start("CA1")).await.unwrap();
        let remote = h.remotes.recv().await.unwrap();

        let messages = [
            r#"{"type":"user_message","message":{"role":"user","content":"this seems too expensive for our budget"},
                "models":{"prosody":{"scores":{"Anxiety":0.7,"Calmness":0.2}}}}"#,
            r#"{"type":"assistant_message","message":{"role":"assistant","content":"This plan is guaranteed to pay for itself."}}"#,
            r#"{"type":"user_message","message":{"role":"user","content":"That sounds great, sign me up"}}"#,
            r#"{"type":"assistant_message","message":{"role":"assistant","content":"Wonderful, welcome aboard."}}"#,
        ];
        for msg in messages {
            remote.push.send(msg.to_string()).await.unwrap();
        }
        remote.push.send(audio_output(960)).await.unwrap();
        assert!(matches!(h.outbound.recv().await, Some(ProviderFrame::Text(_))));

        h.inbound
            .send(TelephonyEvent::StreamStop { stream_id: "MZ1".into() })
            .await
            .unwrap();
        let report = h.handle.await.unwrap();
        assert_eq!(report.counters.turns, 4);

        let turns = h.store.turns();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Customer, Role::Agent, Role::Customer, Role::Agent]);
        assert_eq!(turns[0].emotions.as_ref().unwrap()["Anxiety"], 0.7);
        assert!(turns[0].sentiment.is_some());

        let records = h.store.records();
        let objections: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                StoreRecord::Objection(o) => Some(o),
                _ => None,
            })
            .collect();
        assert_eq!(objections.len(), 1);
        assert_eq!(objections[0].category, ObjectionCategory::Price);
        assert_eq!(objections[0].resolution, Resolution::Pending);

        let flags: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                StoreRecord::Risk(f) => Some(f),
                _ => None,
            })
            .collect();
        assert!(flags.iter().any(|f| f.category == "guarantee" && f.blocked && f.replacement.is_some()));

        let steps: Vec<u32> = records
            .iter()
            .filter_map(|r| match r {
                StoreRecord::Step(s) => Some(s.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![1, 2]);

        let analytics = records
            .iter()
            .rev()
            .find_map(|r| match r {
                StoreRecord::Analytics(a) => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(analytics.total_turns, 4);
        assert_eq!(analytics.total_objections, 1);
        assert_eq!(analytics.dominant_emotion.as_deref(), Some("Anxiety"));
        assert_eq!(analytics.outcome, Some(Outcome::Won));

        let reports = h.hook.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].call_id, "CA1");
        assert_eq!(reports[0].outcome_classification, Outcome::Won);
        assert_eq!(reports[0].qa_pairs.len(), 2);
        assert_eq!(reports[0].qa_pairs[0].question, "this seems too expensive for our budget");
    }

    #[tokio::test]
    async fn terminal_status_ends_live_call_and_interruption_clears_twilio() {
        let active = ActiveCalls::new();
        let mut h = start(Provider::Twilio, vec![Script::Accept], configured("CA1"), active.clone());
        h.inbound.send(stream_start("CA1")).await.unwrap();
        let remote = h.remotes.recv().await.unwrap();

        remote.push.send(r#"{"type":"user_interruption"}"#.into()).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ProviderFrame::Text(json) => assert!(json.contains("\"clear\"")),
            other => panic!("unexpected {other:?}"),
        }

        assert!(active.end("CA1").await);
        let report = h.handle.await.unwrap();
        assert_eq!(report.end_reason, EndReason::StatusTerminal);
        assert_eq!(h.store.statuses(), vec![CallStatus::InProgress]);
        assert!(!active.is_active("CA1").await);
        drop(remote);
    }

    #[tokio::test]
    async fn voice_unavailable_fails_call_without_streaming() {
        let mut h = start(
            Provider::Twilio,
            vec![Script::Reject, Script::Reject],
            configured("CA1"),
            ActiveCalls::new(),
        );
        h.inbound.send(stream_start("CA1")).await.unwrap();

        let report = h.handle.await.unwrap();
        assert_eq!(report.end_reason, EndReason::VoiceUnavailable);
        assert!(!report.history.contains(&BridgeState::Bridging));
        assert_eq!(report.counters.frames_forwarded, 0);
        assert_eq!(expect_close(&mut h.outbound).await, 4502);
        assert_eq!(h.store.statuses(), vec![CallStatus::InProgress, CallStatus::Failed]);
        assert!(h.hook.reports().is_empty());
    }

    #[tokio::test]
    async fn vonage_audio_goes_out_in_fixed_binary_frames() {
        let mut h = start(Provider::Vonage, vec![Script::Accept], configured("CA1"), ActiveCalls::new());
        h.inbound.send(stream_start_at("CA1", 16000)).await.unwrap();
        let remote = h.remotes.recv().await.unwrap();

        // 30 ms at 48 kHz -> 960 bytes at 16 kHz -> one full and one padded frame
        remote.push.send(audio_output(2880)).await.unwrap();
        for _ in 0..2 {
            match h.outbound.recv().await.unwrap() {
                ProviderFrame::Binary(frame) => assert_eq!(frame.len(), 640),
                other => panic!("unexpected {other:?}"),
            }
        }

        h.inbound
            .send(TelephonyEvent::StreamStop { stream_id: "CA1".into() })
            .await
            .unwrap();
        let report = h.handle.await.unwrap();
        assert_eq!(report.counters.frames_sent, 2);
        assert_eq!(expect_close(&mut h.outbound).await, 1000);
    }

    #[tokio::test]
    async fn vonage_frames_follow_the_socket_rate() {
        let mut h = start(Provider::Vonage, vec![Script::Accept], configured("CA1"), ActiveCalls::new());
        h.inbound.send(stream_start_at("CA1", 8000)).await.unwrap();
        let remote = h.remotes.recv().await.unwrap();

        // 20 ms at 48 kHz -> 160 samples at 8 kHz
        remote.push.send(audio_output(1920)).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ProviderFrame::Binary(frame) => assert_eq!(frame.len(), 320),
            other => panic!("unexpected {other:?}"),
        }

        h.inbound.send(stream_stop()).await.unwrap();
        let report = h.handle.await.unwrap();
        assert_eq!(report.counters.frames_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_completion_hook_does_not_hold_the_call() {
        let active = ActiveCalls::new();
        let mut h = start_with(
            Provider::Twilio,
            vec![Script::Accept],
            configured("CA1"),
            active.clone(),
            |config| config.hooks.timeout_secs = 5,
            Some(Arc::new(HangingHook)),
        );
        h.inbound.send(stream_start("CA1")).await.unwrap();
        let _remote = h.remotes.recv().await.unwrap();

        h.inbound.send(stream_stop()).await.unwrap();
        let report = h.handle.await.unwrap();

        assert_eq!(report.end_reason, EndReason::StreamStopped);
        assert_eq!(report.history.last(), Some(&BridgeState::Closed));
        assert_eq!(expect_close(&mut h.outbound).await, 1000);
        assert!(!active.is_active("CA1").await);
        assert_eq!(h.store.statuses(), vec![CallStatus::InProgress, CallStatus::Completed]);
        assert!(h.hook.reports().is_empty());
    }

    #[tokio::test]
    async fn voice_session_ending_ends_the_call() {
        let mut h = start(Provider::Twilio, vec![Script::Accept], configured("CA1"), ActiveCalls::new());
        h.inbound.send(stream_start("CA1")).await.unwrap();
        let remote = h.remotes.recv().await.unwrap();

        drop(remote);
        let report = h.handle.await.unwrap();

        assert_eq!(report.end_reason, EndReason::VoiceEnded);
        assert!(report.history.contains(&BridgeState::Bridging));
        assert_eq!(expect_close(&mut h.outbound).await, 1000);
        assert_eq!(h.store.statuses(), vec![CallStatus::InProgress, CallStatus::Completed]);
        assert_eq!(h.hook.reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_is_cut_at_maximum_duration() {
        let mut h = start_with(
            Provider::Twilio,
            vec![Script::Accept],
            configured("CA1"),
            ActiveCalls::new(),
            |config| config.bridge.max_call_secs = 30,
            None,
        );
        h.inbound.send(stream_start("CA1")).await.unwrap();
        let _remote = h.remotes.recv().await.unwrap();

        let report = h.handle.await.unwrap();

        assert_eq!(report.end_reason, EndReason::MaxDuration);
        assert_eq!(expect_close(&mut h.outbound).await, 1000);
        assert_eq!(h.store.statuses(), vec![CallStatus::InProgress, CallStatus::Completed]);
        assert_eq!(h.hook.reports().len(), 1);
    }

    #[tokio::test]
    async fn blocked_greeting_is_replaced_before_it_is_spoken() {
        let directory = MemoryDirectory::with(
            "CA1",
            CallRecord {
                agent_voice_config_id: Some("cfg-agent".into()),
                greeting: Some("Hi! Our plan is guaranteed to double your sales.".into()),
                ..Default::default()
            },
        );
        let mut h = start(Provider::Twilio, vec![Script::Accept], directory, ActiveCalls::new());
        h.inbound.send(stream_start("CA1")).await.unwrap();
        let mut remote = h.remotes.recv().await.unwrap();

        let settings: serde_json::Value = serde_json::from_str(&remote.sent.recv().await.unwrap()).unwrap();
        assert_eq!(settings["type"], "session_settings");
        let greeting = settings["greeting"].as_str().unwrap();
        assert!(greeting.starts_with("I can't promise"), "{greeting}");
        assert!(!greeting.contains("guaranteed"));

        h.inbound.send(stream_stop()).await.unwrap();
        let report = h.handle.await.unwrap();
        assert_eq!(report.counters.risk_flags, 1);

        let flags: Vec<RiskFlag> = h
            .store
            .records()
            .into_iter()
            .filter_map(|r| match r {
                StoreRecord::Risk(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].category, "guarantee");
        assert!(flags[0].blocked);
        assert_eq!(flags[0].replacement.as_deref(), Some(greeting));
    }
}
