//! jsonrpc-link - issue one JSON-RPC call from the command line.
//!
//! Connects, performs the call, prints the result as pretty JSON and
//! disconnects. Connection-state transitions are logged to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jsonrpc_link::{ClientConfig, RpcClient};

#[derive(Parser, Debug)]
#[command(name = "jsonrpc-link")]
#[command(version, about = "Send a JSON-RPC 2.0 request over a persistent link")]
struct Args {
    /// Server endpoint (ws://, wss://, tcp://host:port, unix:///path)
    #[arg(long)]
    url: Option<String>,

    /// Config file (defaults to <config dir>/jsonrpc-link/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Method name, e.g. system.ping
    method: String,

    /// Parameters as a JSON object
    params: Option<String>,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?.with_env()?,
            None => ClientConfig::discover()?,
        };
        if let Some(url) = &self.url {
            config.endpoint = Some(url.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config.call_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    fn params(&self) -> Result<Value> {
        match self.params.as_deref() {
            Some(raw) => serde_json::from_str(raw).context("Params are not valid JSON"),
            None => Ok(Value::Null),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jsonrpc_link=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = args.client_config()?;
    let params = args.params()?;

    let client = RpcClient::from_config(&config)?;
    client
        .subscribe(|state| info!("Connection {}", state))
        .detach();

    client.connect().await.context("Failed to connect")?;
    let result = client.call(&args.method, params).await;
    client.disconnect();

    let value = result.with_context(|| format!("Call to {} failed", args.method))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
