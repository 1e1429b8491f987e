use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use super::session::SessionError;

/// Channel capacity between the bridge and a socket pump task.
const LINK_BUFFER: usize = 256;

/// Raw text channel pair for one voice-AI connection. Dropping `outgoing`
/// closes the socket; `incoming` ends when the far side closes.
#[derive(Debug)]
pub struct VoiceLink {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// Opens transport connections to the voice-AI provider.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, config_id: &str) -> Result<VoiceLink, SessionError>;
}

/// HumeAI EVI chat socket.
pub struct HumeConnector {
    url: String,
    api_key: String,
}

impl HumeConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl VoiceConnector for HumeConnector {
    async fn connect(&self, config_id: &str) -> Result<VoiceLink, SessionError> {
        let url = format!("{}?config_id={config_id}", self.url);
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| SessionError::Connect(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("X-Hume-Api-Key", key);

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => SessionError::Rejected {
                    status: response.status().as_u16(),
                },
                other => SessionError::Connect(other.to_string()),
            })?;

        tracing::debug!(config_id, "Voice socket connected");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::warn!("Voice socket write failed: {e}");
                    return;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "Voice socket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Voice socket read failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(VoiceLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
