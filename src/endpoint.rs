//! Endpoint resolution.
//!
//! The link never reads configuration itself; it asks an
//! [`EndpointResolver`] for the server address each time it (re)connects.
//! The connection manager bounds every resolution with its own timeout.

use async_trait::async_trait;
use tokio::sync::watch;
use url::Url;

use crate::error::LinkError;

/// Supplies the server endpoint, possibly after waiting for it.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self) -> Result<Url, LinkError>;
}

/// Parse and validate an endpoint string.
pub fn parse_endpoint(raw: &str) -> Result<Url, LinkError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(LinkError::Configuration("Endpoint is empty".to_string()));
    }
    Url::parse(raw).map_err(|e| LinkError::Configuration(format!("Invalid endpoint {:?}: {}", raw, e)))
}

/// A fixed endpoint known up front.
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
    url: Url,
}

impl StaticEndpoint {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        parse_endpoint(raw).map(Self::new)
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpoint {
    async fn resolve(&self) -> Result<Url, LinkError> {
        Ok(self.url.clone())
    }
}

/// Reads the endpoint from an environment variable at every resolution.
#[derive(Debug, Clone)]
pub struct EnvEndpoint {
    var: String,
}

impl EnvEndpoint {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl EndpointResolver for EnvEndpoint {
    async fn resolve(&self) -> Result<Url, LinkError> {
        let raw = std::env::var(&self.var).map_err(|_| {
            LinkError::Configuration(format!("Endpoint not configured: set {}", self.var))
        })?;
        parse_endpoint(&raw)
    }
}

/// An endpoint that becomes available later, once the configuration
/// provider publishes it through the paired [`EndpointPublisher`].
///
/// Resolution waits on a watch channel; the connection manager's resolve
/// timeout bounds the wait.
#[derive(Debug, Clone)]
pub struct DeferredEndpoint {
    rx: watch::Receiver<Option<Url>>,
}

/// Producer side of a [`DeferredEndpoint`].
#[derive(Debug)]
pub struct EndpointPublisher {
    tx: watch::Sender<Option<Url>>,
}

impl DeferredEndpoint {
    pub fn new() -> (Self, EndpointPublisher) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, EndpointPublisher { tx })
    }
}

impl EndpointPublisher {
    /// Publish (or replace) the endpoint. Waiting resolvers wake up.
    pub fn publish(&self, url: Url) {
        self.tx.send_replace(Some(url));
    }

    pub fn publish_str(&self, raw: &str) -> Result<(), LinkError> {
        self.publish(parse_endpoint(raw)?);
        Ok(())
    }

    /// Withdraw the endpoint; later resolutions wait again.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

#[async_trait]
impl EndpointResolver for DeferredEndpoint {
    async fn resolve(&self) -> Result<Url, LinkError> {
        let mut rx = self.rx.clone();
        let url = {
            let value = rx.wait_for(Option::is_some).await.map_err(|_| {
                LinkError::Configuration(
                    "Endpoint provider went away before supplying an endpoint".to_string(),
                )
            })?;
            value.clone()
        };
        url.ok_or_else(|| LinkError::Configuration("Endpoint not configured".to_string()))
    }
}
