//! WebSocket push channel to a ComfyUI instance.
//!
//! ComfyUI addresses push frames by the `clientId` query parameter given
//! during the handshake, so the channel must be opened with the same
//! session id the workflow was submitted under.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::{parse_frame, PushFrame};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A live WebSocket connection keyed by a session id.
pub struct PushChannel {
    client_id: String,
    ws_stream: WsStream,
}

/// Errors that can occur on the push channel.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A text frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// Derive the WebSocket base URL from an HTTP base URL
/// (`http://host:8188` -> `ws://host:8188`).
pub fn ws_url_for(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

impl PushChannel {
    /// Connect to `{ws_url}/ws?clientId={client_id}`.
    pub async fn connect(ws_url: &str, client_id: &str) -> Result<Self, ComfyUIClientError> {
        let url = format!(
            "{}/ws?clientId={}",
            ws_url.trim_end_matches('/'),
            client_id
        );

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!("Failed to connect to ComfyUI at {ws_url}: {e}"))
        })?;

        tracing::info!(client_id, "Push channel connected to {ws_url}");

        Ok(Self {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }

    /// Wait for the next decoded frame.
    ///
    /// Binary frames (preview images) and control frames are skipped.
    /// Returns `None` once the server closes the connection.
    pub async fn next_frame(&mut self) -> Option<Result<PushFrame, ComfyUIClientError>> {
        while let Some(msg_result) = self.ws_stream.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    return Some(
                        parse_frame(&text)
                            .map_err(|e| ComfyUIClientError::MalformedFrame(format!("{e}: {text}"))),
                    );
                }
                Ok(Message::Binary(_)) => {
                    tracing::trace!(client_id = %self.client_id, "Ignoring binary frame");
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::info!(client_id = %self.client_id, ?frame, "Push channel closed");
                    return None;
                }
                Err(e) => return Some(Err(ComfyUIClientError::Protocol(e.to_string()))),
            }
        }
        None
    }
}
