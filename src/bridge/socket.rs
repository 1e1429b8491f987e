use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::{CallBridge, TelephonyLink};
use crate::model::Provider;
use crate::telephony::{Normalizer, ProviderFrame, TelephonyEvent, WireInbound};
use crate::AppState;

/// Run one telephony media socket through a [`CallBridge`].
///
/// The socket is split: a reader task normalises provider messages into
/// [`TelephonyEvent`]s, a writer task turns [`ProviderFrame`]s back into
/// websocket messages. The bridge owns everything in between.
pub async fn serve(socket: WebSocket, state: AppState, provider: Provider) {
    tracing::info!(%provider, "Media stream connected");

    let (sink, stream) = socket.split();
    let queue = state.config.bridge.event_queue.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(queue);
    let (outbound_tx, outbound_rx) = mpsc::channel(queue);

    let normalizer = Normalizer::new(provider, state.config.audio.vonage_sample_rate);
    let reader = tokio::spawn(read_provider(stream, normalizer, inbound_tx));
    let writer = tokio::spawn(write_provider(sink, outbound_rx));

    let report = CallBridge::new(state.bridge.clone(), provider)
        .run(TelephonyLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
        .await;

    // The bridge dropped its sender, so the writer flushes and exits.
    if let Err(e) = writer.await {
        tracing::warn!(%provider, "Media writer task failed: {e}");
    }
    reader.abort();

    tracing::info!(
        %provider,
        call_id = ?report.call_id,
        reason = ?report.end_reason,
        states = ?report.history,
        frames_forwarded = report.counters.frames_forwarded,
        frames_sent = report.counters.frames_sent,
        "Media stream disconnected"
    );
}

async fn read_provider(
    mut stream: SplitStream<WebSocket>,
    mut normalizer: Normalizer,
    tx: mpsc::Sender<TelephonyEvent>,
) {
    while let Some(msg) = stream.next().await {
        let normalized = match &msg {
            Ok(Message::Text(text)) => normalizer.normalize(WireInbound::Text(text.as_str())),
            Ok(Message::Binary(data)) => normalizer.normalize(WireInbound::Binary(data)),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(provider = %normalizer.provider(), "Media socket error: {e}");
                break;
            }
        };

        match normalized {
            Ok(Some(event)) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(provider = %normalizer.provider(), "Dropping media message: {e}"),
        }
    }
}

async fn write_provider(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<ProviderFrame>) {
    while let Some(frame) = rx.recv().await {
        let (msg, closing) = match frame {
            ProviderFrame::Text(text) => (Message::Text(text.into()), false),
            ProviderFrame::Binary(data) => (Message::Binary(data), false),
            ProviderFrame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        if let Err(e) = sink.send(msg).await {
            tracing::debug!("Media socket send failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
}
