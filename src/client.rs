//! RPC client facade.
//!
//! `RpcClient` is what application code holds. It forwards lifecycle calls
//! to the [`ConnectionManager`] and turns each `call` into a request frame
//! plus a wait on the pending-call table.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ClientConfig, ENV_URL};
use crate::connection::ConnectionManager;
use crate::endpoint::{EndpointResolver, EnvEndpoint, StaticEndpoint};
use crate::error::LinkError;
use crate::state::{ConnectionState, Subscription};
use crate::transport::{Connector, DefaultConnector};

/// Pause between tearing the link down and bringing it back in
/// [`RpcClient::reconnect`].
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// JSON-RPC 2.0 client over a persistent, self-healing connection.
///
/// Cheap to clone; all clones share one connection and one pending-call
/// table. Construct one per server and pass it to whatever needs it.
///
/// # Connection Lifecycle
///
/// - `connect()` - Establish the connection (idempotent, coalesces
///   concurrent callers)
/// - `call()` - Send a request and wait for its response or timeout
/// - `disconnect()` - Close and suppress automatic reconnection
///
/// # Example
///
/// ```ignore
/// use jsonrpc_link::{ClientConfig, RpcClient, StaticEndpoint};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let endpoint = Arc::new(StaticEndpoint::parse("ws://localhost:8765/rpc")?);
/// let client = RpcClient::new(&ClientConfig::default(), endpoint);
/// client.connect().await?;
///
/// let jobs = client.call("jobs.list", json!({"limit": 100})).await?;
/// ```
#[derive(Clone)]
pub struct RpcClient {
    manager: ConnectionManager,
}

impl RpcClient {
    /// Client using the default scheme-dispatching connector.
    pub fn new(config: &ClientConfig, resolver: Arc<dyn EndpointResolver>) -> Self {
        Self::with_connector(config, resolver, Arc::new(DefaultConnector))
    }

    /// Client opening its transports through `connector`.
    pub fn with_connector(
        config: &ClientConfig,
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(config, resolver, connector),
        }
    }

    /// Client whose endpoint comes from `config.endpoint`, or from the
    /// `JSONRPC_LINK_URL` environment variable at connect time when the
    /// config has none.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Configuration` if `config.endpoint` is not a
    /// valid URL or the reconnect policy fails
    /// [`ReconnectPolicy::validate`](crate::ReconnectPolicy::validate).
    pub fn from_config(config: &ClientConfig) -> Result<Self, LinkError> {
        config.reconnect.validate()?;
        let resolver: Arc<dyn EndpointResolver> = match config.endpoint.as_deref() {
            Some(endpoint) => Arc::new(StaticEndpoint::parse(endpoint)?),
            None => Arc::new(EnvEndpoint::new(ENV_URL)),
        };
        Ok(Self::new(config, resolver))
    }

    /// Establish the connection. See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.manager.connect().await
    }

    /// Close the connection; pending calls fail and no reconnection follows.
    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    /// Tear the connection down, pause briefly, and connect again.
    pub async fn reconnect(&self) -> Result<(), LinkError> {
        self.manager.disconnect();
        tokio::time::sleep(RECONNECT_PAUSE).await;
        self.manager.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Listen for connection-state changes. The listener is called right
    /// away with the current state; dropping the returned [`Subscription`]
    /// unsubscribes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.manager.subscribe(listener)
    }

    /// Send a JSON-RPC 2.0 request and wait for the response.
    ///
    /// `Value::Null` params are sent as `{}`.
    ///
    /// # Errors
    ///
    /// - `LinkError::Protocol` if `params` is neither an object nor null;
    ///   nothing is sent
    /// - `LinkError::NotConnected` if the connection is not up; nothing is
    ///   sent
    /// - `LinkError::Timeout` if no response arrives within the call timeout
    /// - `LinkError::ConnectionLost` if the connection drops or is closed
    ///   first
    /// - `LinkError::ServerError` if the server answers with an error object
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = client.call("jobs.get", json!({"pk": 42})).await?;
    /// ```
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        let receiver = self.manager.submit(method, params)?;
        receiver.await.unwrap_or(Err(LinkError::ConnectionLost))
    }

    /// [`call`](Self::call) with typed parameters and result.
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R, LinkError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| LinkError::Protocol(format!("Failed to serialize params: {}", e)))?;
        let result = self.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| LinkError::Protocol(format!("Unexpected result for {}: {}", method, e)))
    }

    /// The underlying connection manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}
