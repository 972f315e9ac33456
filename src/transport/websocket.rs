//! WebSocket transport: one JSON-RPC frame per text message.

use futures::future::ready;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::Transport;
use crate::error::LinkError;

/// Perform the WebSocket handshake with `endpoint`.
///
/// `wss://` needs one of tokio-tungstenite's TLS features; without it the
/// handshake fails with a connection error.
pub async fn connect(endpoint: &Url) -> Result<Transport, LinkError> {
    let (ws, response) = connect_async(endpoint.as_str())
        .await
        .map_err(|e| LinkError::ConnectionFailed(format!("WebSocket connect to {}: {}", endpoint, e)))?;
    info!(%endpoint, status = %response.status(), "WebSocket connected");
    Ok(websocket_transport(ws))
}

/// Adapt an established WebSocket (client or server side) into a
/// [`Transport`].
///
/// Only text messages carry frames. Binary, ping and pong messages are
/// skipped; a close message ends the stream.
pub fn websocket_transport<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let outbound = sink
        .sink_map_err(send_error)
        .with(|frame: String| ready(Ok::<_, LinkError>(Message::text(frame))));

    let inbound = stream
        .take_while(|message| ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(other) => {
                    debug!(kind = message_kind(&other), "Ignoring non-text WebSocket message");
                    None
                }
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    Some(Err(LinkError::ConnectionLost))
                }
            })
        });

    Transport::new(outbound, inbound)
}

fn send_error(err: tungstenite::Error) -> LinkError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            LinkError::ConnectionLost
        }
        tungstenite::Error::Io(e) => LinkError::from(e),
        other => LinkError::ConnectionFailed(other.to_string()),
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}
