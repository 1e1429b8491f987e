use axum::extract::{Form, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{AudioEncoding, NormalizeError, TelephonyEvent};
use crate::bridge::socket;
use crate::model::Provider;
use crate::pipeline::audio::MULAW_SAMPLE_RATE;
use crate::AppState;

/// Twilio Media Stream WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
enum StreamEvent {
    Connected {},
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {},
    Dtmf {},
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMetadata {
    call_sid: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    #[serde(default)]
    track: Option<String>,
    payload: String, // base64-encoded mu-law audio
}

/// Outbound messages written to the Twilio media socket.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundEvent<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: OutboundMedia,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
}

#[derive(Debug, Serialize)]
struct OutboundMedia {
    payload: String,
}

pub(super) fn normalize(text: &str) -> Result<Option<TelephonyEvent>, NormalizeError> {
    let event: StreamEvent = serde_json::from_str(text).map_err(|source| NormalizeError::Json {
        provider: Provider::Twilio,
        source,
    })?;

    Ok(match event {
        StreamEvent::Connected {} | StreamEvent::Mark {} | StreamEvent::Dtmf {} => None,
        StreamEvent::Start { stream_sid, start } => Some(TelephonyEvent::StreamStart {
            call_id: start.call_sid,
            stream_id: stream_sid,
            sample_rate: MULAW_SAMPLE_RATE,
        }),
        StreamEvent::Media { media } => {
            if media.track.as_deref().is_some_and(|t| t != "inbound") {
                return Ok(None);
            }
            let payload = base64::engine::general_purpose::STANDARD.decode(media.payload)?;
            Some(TelephonyEvent::AudioFrame {
                payload: Bytes::from(payload),
                encoding: AudioEncoding::Mulaw,
                sample_rate: MULAW_SAMPLE_RATE,
            })
        }
        StreamEvent::Stop { stream_sid } => Some(TelephonyEvent::StreamStop { stream_id: stream_sid }),
    })
}

pub(super) fn media_message(stream_sid: &str, mulaw: &[u8]) -> String {
    let event = OutboundEvent::Media {
        stream_sid,
        media: OutboundMedia {
            payload: base64::engine::general_purpose::STANDARD.encode(mulaw),
        },
    };
    serde_json::to_string(&event).unwrap_or_default()
}

/// `clear` drops agent audio Twilio has buffered but not yet played.
pub fn clear_message(stream_sid: &str) -> String {
    serde_json::to_string(&OutboundEvent::Clear { stream_sid }).unwrap_or_default()
}

/// Handle POST /twilio/voice (incoming call webhook).
///
/// Responds with TwiML that connects the call to the bidirectional media
/// stream on /twilio/media.
pub async fn handle_voice(State(state): State<AppState>) -> Response {
    let ws_url = super::media_stream_url(&state.config.server.external_url, "/twilio/media");

    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_url}" />
    </Connect>
</Response>"#
    );

    ([("Content-Type", "text/xml")], twiml).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusCallback {
    call_sid: String,
    call_status: String,
}

/// Handle POST /twilio/status (call progress callbacks).
pub async fn handle_status(
    State(state): State<AppState>,
    Form(form): Form<StatusCallback>,
) -> StatusCode {
    super::apply_status_update(&state.bridge, Provider::Twilio, &form.call_sid, &form.call_status).await;
    StatusCode::NO_CONTENT
}

/// WebSocket upgrade handler for GET /twilio/media.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |ws| socket::serve(ws, state, Provider::Twilio))
}
