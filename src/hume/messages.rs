use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::{AudioConfig, SessionConfig};
use crate::model::{EmotionScores, Role};
use crate::pipeline::audio::{self, CodecError};

/// `session_settings` message. Field names are fixed by the EVI API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    #[serde(rename = "type")]
    kind: &'static str,
    pub audio: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<Voice>,
    pub turn_taking: TurnTaking,
    pub audio_input: AudioInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub silence_handling: SilenceHandling,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFormat {
    pub encoding: &'static str,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Voice {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnTaking {
    pub silence_duration_ms: u32,
    pub interruption_threshold_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioInput {
    pub gain: f32,
    pub noise_suppression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SilenceHandling {
    pub timeout_ms: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl SessionSettings {
    /// Settings for one call. `greeting` has already been through the risk filter.
    pub fn new(session: &SessionConfig, audio: &AudioConfig, greeting: Option<String>) -> Self {
        Self {
            kind: "session_settings",
            audio: AudioFormat {
                encoding: "linear16",
                sample_rate: audio.voice_sample_rate,
                channels: 1,
            },
            voice: session.voice_name.clone().map(|name| Voice { name }),
            turn_taking: TurnTaking {
                silence_duration_ms: session.silence_duration_ms,
                interruption_threshold_ms: session.interruption_threshold_ms,
            },
            audio_input: AudioInput {
                gain: session.input_gain,
                noise_suppression: session.noise_suppression,
            },
            greeting: greeting.filter(|g| !g.trim().is_empty()),
            silence_handling: SilenceHandling {
                timeout_ms: session.silence_timeout_ms,
                prompt: session.silence_prompt.clone(),
            },
        }
    }
}

#[derive(Serialize)]
struct AudioInputMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: String,
}

/// `audio_input` message carrying one linear16 frame.
pub fn audio_input_message(pcm: &[u8]) -> String {
    let msg = AudioInputMessage {
        kind: "audio_input",
        data: base64::engine::general_purpose::STANDARD.encode(pcm),
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

/// Events the bridge consumes from the voice session.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    AudioOutput { pcm: Bytes, sample_rate: u32 },
    UserTranscript { text: String },
    AssistantTranscript { text: String },
    EmotionUpdate { role: Role, scores: EmotionScores },
    /// Caller barged in while the agent was speaking.
    UserInterruption,
    ProviderError { code: String, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ChatMetadata {
        #[serde(default)]
        chat_id: Option<String>,
    },
    AudioOutput {
        data: String,
    },
    UserMessage {
        message: ChatMessage,
        #[serde(default)]
        models: Inference,
        #[serde(default)]
        interim: bool,
    },
    AssistantMessage {
        message: ChatMessage,
        #[serde(default)]
        models: Inference,
    },
    UserInterruption {},
    Error {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct Inference {
    #[serde(default)]
    prosody: Option<Prosody>,
}

#[derive(Debug, Deserialize)]
struct Prosody {
    #[serde(default)]
    scores: EmotionScores,
}

/// What one server message means to the session.
#[derive(Debug, PartialEq)]
pub enum ServerEvent {
    /// `chat_metadata`: the handshake is complete.
    Ready { chat_id: Option<String> },
    Events(Vec<InboundEvent>),
    /// Interim transcripts and message types the bridge does not use.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed voice message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("undecodable voice audio: {0}")]
    Audio(#[from] CodecError),
}

pub fn parse_server_message(text: &str, fallback_rate: u32) -> Result<ServerEvent, MessageError> {
    let msg: ServerMessage = serde_json::from_str(text)?;

    Ok(match msg {
        ServerMessage::ChatMetadata { chat_id } => ServerEvent::Ready { chat_id },
        ServerMessage::AudioOutput { data } => {
            let raw = base64::engine::general_purpose::STANDARD.decode(data)?;
            let decoded = audio::decode_voice_audio(&raw, fallback_rate)?;
            ServerEvent::Events(vec![InboundEvent::AudioOutput {
                pcm: Bytes::from(decoded.pcm),
                sample_rate: decoded.sample_rate,
            }])
        }
        ServerMessage::UserMessage { interim: true, .. } => ServerEvent::Ignored,
        ServerMessage::UserMessage { message, models, .. } => ServerEvent::Events(transcript_events(
            Role::Customer,
            InboundEvent::UserTranscript { text: message.content },
            models,
        )),
        ServerMessage::AssistantMessage { message, models } => ServerEvent::Events(transcript_events(
            Role::Agent,
            InboundEvent::AssistantTranscript { text: message.content },
            models,
        )),
        ServerMessage::UserInterruption {} => ServerEvent::Events(vec![InboundEvent::UserInterruption]),
        ServerMessage::Error { code, message } => {
            ServerEvent::Events(vec![InboundEvent::ProviderError { code, message }])
        }
        ServerMessage::Other => ServerEvent::Ignored,
    })
}

fn transcript_events(role: Role, transcript: InboundEvent, models: Inference) -> Vec<InboundEvent> {
    let mut events = vec![transcript];
    if let Some(prosody) = models.prosody.filter(|p| !p.scores.is_empty()) {
        events.push(InboundEvent::EmotionUpdate {
            role,
            scores: prosody.scores,
        });
    }
    events
}
