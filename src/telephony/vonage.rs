use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{map_provider_status, AudioEncoding, NormalizeError, TelephonyEvent, WireInbound};
use crate::bridge::socket;
use crate::model::Provider;
use crate::AppState;

/// Vonage accepts 20 ms linear16 frames on the media socket and nothing else.
pub const FRAME_MS: u32 = 20;

/// Text message on the Vonage media socket. Custom NCCO headers (our
/// `call_id`) are flattened into the top level by Vonage.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(default)]
    event: Option<String>,
    #[serde(default, rename = "content-type")]
    content_type: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    digit: Option<String>,
}

impl ControlMessage {
    fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref().or(self.uuid.as_deref())
    }
}

pub(super) fn normalize(
    msg: WireInbound<'_>,
    sample_rate: &mut u32,
) -> Result<Option<TelephonyEvent>, NormalizeError> {
    let text = match msg {
        WireInbound::Binary(audio) => {
            return Ok(Some(TelephonyEvent::AudioFrame {
                payload: Bytes::copy_from_slice(audio),
                encoding: AudioEncoding::Linear16,
                sample_rate: *sample_rate,
            }))
        }
        WireInbound::Text(text) => text,
    };

    let control: ControlMessage = serde_json::from_str(text).map_err(|source| NormalizeError::Json {
        provider: Provider::Vonage,
        source,
    })?;

    match control.event.as_deref() {
        Some("websocket:connected") | Some("start") => {
            if let Some(rate) = control.content_type.as_deref().and_then(content_type_rate) {
                *sample_rate = rate;
            }
            let call_id = control.call_id().ok_or(NormalizeError::MissingCallId {
                provider: Provider::Vonage,
            })?;
            Ok(Some(TelephonyEvent::StreamStart {
                call_id: call_id.to_string(),
                stream_id: call_id.to_string(),
                sample_rate: *sample_rate,
            }))
        }
        Some("websocket:disconnected") | Some("stop") => Ok(Some(TelephonyEvent::StreamStop {
            stream_id: control.call_id().unwrap_or_default().to_string(),
        })),
        Some("websocket:dtmf") => {
            tracing::info!(call_id = ?control.call_id(), digit = ?control.digit, "Caller pressed a key");
            Ok(None)
        }
        Some(other) => {
            tracing::debug!(event = other, "Ignoring Vonage socket event");
            Ok(None)
        }
        None => Ok(status_update(&control)),
    }
}

fn status_update(control: &ControlMessage) -> Option<TelephonyEvent> {
    let provider_status = map_provider_status(control.status.as_deref()?)?;
    Some(TelephonyEvent::StatusUpdate {
        call_id: control.call_id()?.to_string(),
        provider_status,
    })
}

/// `audio/l16;rate=16000` -> 16000
fn content_type_rate(content_type: &str) -> Option<u32> {
    content_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Build the NCCO answering a Vonage call: optional ringback audio, then a
/// websocket `connect` to our media endpoint carrying the call uuid, then
/// optionally an `input` action whose digits are posted to `dtmf_event_url`.
pub fn answer_ncco(
    ws_url: &str,
    call_id: &str,
    sample_rate: u32,
    ringback_url: Option<&str>,
    dtmf_event_url: Option<&str>,
) -> Value {
    let mut actions = Vec::with_capacity(3);
    if let Some(url) = ringback_url {
        actions.push(json!({
            "action": "stream",
            "streamUrl": [url],
        }));
    }
    actions.push(json!({
        "action": "connect",
        "endpoint": [{
            "type": "websocket",
            "uri": ws_url,
            "content-type": format!("audio/l16;rate={sample_rate}"),
            "headers": { "call_id": call_id },
        }],
    }));
    if let Some(url) = dtmf_event_url {
        actions.push(json!({
            "action": "input",
            "type": ["dtmf"],
            "dtmf": { "maxDigits": 1 },
            "eventUrl": [url],
        }));
    }
    Value::Array(actions)
}

#[derive(Debug, Deserialize)]
pub struct AnswerParams {
    #[serde(default)]
    uuid: String,
}

fn answer(state: &AppState, uuid: &str) -> Json<Value> {
    let external_url = &state.config.server.external_url;
    let ws_url = super::media_stream_url(external_url, "/vonage/media");
    let event_url = state
        .config
        .vonage
        .dtmf_input
        .then(|| format!("{}/vonage/event", external_url.trim_end_matches('/')));
    tracing::info!(call_id = uuid, "Answering Vonage call");
    Json(answer_ncco(
        &ws_url,
        uuid,
        state.config.audio.vonage_sample_rate,
        state.config.vonage.ringback_url.as_deref(),
        event_url.as_deref(),
    ))
}

/// Handle GET /vonage/answer.
pub async fn handle_answer(
    State(state): State<AppState>,
    Query(params): Query<AnswerParams>,
) -> Json<Value> {
    answer(&state, &params.uuid)
}

/// Handle POST /vonage/answer (signed-webhook mode sends the params as JSON).
pub async fn handle_answer_post(
    State(state): State<AppState>,
    Json(params): Json<AnswerParams>,
) -> Json<Value> {
    answer(&state, &params.uuid)
}

#[derive(Debug, Deserialize)]
pub struct EventCallback {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    dtmf: Option<DtmfResult>,
}

/// Result of an NCCO `input` action.
#[derive(Debug, Deserialize)]
pub struct DtmfResult {
    #[serde(default)]
    digits: String,
    #[serde(default)]
    timed_out: bool,
}

/// Handle POST /vonage/event (call progress and `input` results).
pub async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<EventCallback>,
) -> StatusCode {
    if let Some(dtmf) = &event.dtmf {
        tracing::info!(call_id = ?event.uuid, digits = %dtmf.digits, timed_out = dtmf.timed_out, "Keypad input");
    }
    if let (Some(uuid), Some(status)) = (event.uuid.as_deref(), event.status.as_deref()) {
        super::apply_status_update(&state.bridge, Provider::Vonage, uuid, status).await;
    }
    StatusCode::NO_CONTENT
}

/// WebSocket upgrade handler for GET /vonage/media.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |ws| socket::serve(ws, state, Provider::Vonage))
}
