//! jsonrpc-link
//!
//! A persistent JSON-RPC 2.0 client link:
//!
//! - `client` - `RpcClient`, the facade application code holds
//! - `connection` - connection lifecycle, bounded reconnection
//! - `pending` - request/response correlation and per-call timeouts
//! - `state` - connection-state broadcasting to listeners
//! - `codec` - JSON-RPC 2.0 envelopes on the wire
//! - `transport` - WebSocket, TCP and Unix socket transports
//! - `endpoint` - where the server address comes from
//! - `auth` - typed `login` / `register` calls
//!
//! # Usage
//!
//! ```ignore
//! use jsonrpc_link::{ClientConfig, RpcClient};
//! use serde_json::json;
//!
//! let client = RpcClient::from_config(&ClientConfig::discover()?)?;
//! let _watch = client.subscribe(|state| tracing::info!("link is {}", state));
//! client.connect().await?;
//! let result = client.call("system.ping", json!({})).await?;
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod pending;
pub mod reconnect;
pub mod state;
pub mod transport;

pub use client::RpcClient;
pub use config::ClientConfig;
pub use connection::ConnectionManager;
pub use endpoint::{DeferredEndpoint, EndpointPublisher, EndpointResolver, EnvEndpoint, StaticEndpoint};
pub use error::LinkError;
pub use reconnect::{Backoff, ReconnectPolicy};
pub use state::{ConnectionState, Subscription};
