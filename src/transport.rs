//! Physical transports carrying JSON-RPC frames.
//!
//! A [`Transport`] is a sink of outbound text frames paired with a stream of
//! inbound ones. The connection manager neither knows nor cares how frames
//! travel; it asks a [`Connector`] to open a transport for an endpoint.
//!
//! # Schemes
//!
//! ```text
//! ws://host:port/path    WebSocket text frames
//! wss://host:port/path   WebSocket over TLS
//! tcp://host:port        Content-Length framing over TCP
//! unix:///path/to.sock   Content-Length framing over a Unix socket
//! ```

pub mod framing;
pub mod websocket;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::LinkError;

/// Outbound half: accepts one serialized frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;

/// Inbound half: yields one frame per item. The stream ends when the peer
/// closes the connection; an error item means the connection broke.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, LinkError>> + Send>>;

/// An open, bidirectional frame channel.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = LinkError> + Send + 'static,
        R: Stream<Item = Result<String, LinkError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens transports. Implemented by [`DefaultConnector`] and by tests that
/// need an in-memory server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Url) -> Result<Transport, LinkError>;
}

/// Connector dispatching on the endpoint scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, endpoint: &Url) -> Result<Transport, LinkError> {
        debug!(%endpoint, "Opening transport");
        match endpoint.scheme() {
            "ws" | "wss" => websocket::connect(endpoint).await,
            "tcp" => open_tcp(endpoint).await,
            "unix" => open_unix(endpoint).await,
            other => Err(LinkError::Configuration(format!(
                "Unsupported endpoint scheme: {}",
                other
            ))),
        }
    }
}

async fn open_tcp(endpoint: &Url) -> Result<Transport, LinkError> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| LinkError::Configuration(format!("Endpoint has no host: {}", endpoint)))?;
    let port = endpoint
        .port()
        .ok_or_else(|| LinkError::Configuration(format!("Endpoint has no port: {}", endpoint)))?;

    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    Ok(framing::framed_transport(read_half, write_half))
}

#[cfg(unix)]
async fn open_unix(endpoint: &Url) -> Result<Transport, LinkError> {
    use tokio::net::UnixStream;

    let path = endpoint.path();
    if path.is_empty() {
        return Err(LinkError::Configuration(format!(
            "Endpoint has no socket path: {}",
            endpoint
        )));
    }

    let stream = UnixStream::connect(path).await?;
    let (read_half, write_half) = stream.into_split();
    Ok(framing::framed_transport(read_half, write_half))
}

#[cfg(not(unix))]
async fn open_unix(_endpoint: &Url) -> Result<Transport, LinkError> {
    Err(LinkError::Configuration(
        "Unix sockets are not supported on this platform".to_string(),
    ))
}
