//! Integration tests for the real transports: a WebSocket server built on
//! `tokio-tungstenite` and a Content-Length framed TCP server, both running
//! in-process on an ephemeral port.
//!
//! # Running
//!
//! ```bash
//! cargo test --test transport_integration -- --nocapture
//! ```

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use jsonrpc_link::transport::framing::{read_message, write_message};
use jsonrpc_link::{ClientConfig, ConnectionState, LinkError, ReconnectPolicy, RpcClient};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Answer a request with `{"echo": <method>, "params": <params>}`.
fn echo_reply(request: &str) -> String {
    let request: Value = serde_json::from_str(request).expect("request is not JSON");
    json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {"echo": request["method"], "params": request["params"]}
    })
    .to_string()
}

fn config(endpoint: String) -> ClientConfig {
    ClientConfig {
        endpoint: Some(endpoint),
        reconnect: ReconnectPolicy::disabled(),
        ..ClientConfig::default()
    }
}

/// WebSocket server echoing every text frame once, then hanging up after
/// `replies` answers.
async fn spawn_ws_server(replies: usize) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(socket).await.unwrap();
        let mut answered = 0;
        while answered < replies {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    ws.send(Message::text(echo_reply(text.as_str()))).await.unwrap();
                    answered += 1;
                }
                Some(Ok(_)) => continue,
                _ => return,
            }
        }
        let _ = ws.close(None).await;
    });

    (format!("ws://{}/rpc", addr), handle)
}

#[tokio::test]
async fn test_websocket_call_roundtrip() {
    let (url, server) = spawn_ws_server(2).await;
    let client = RpcClient::from_config(&config(url)).unwrap();

    timeout(TEST_TIMEOUT, client.connect()).await.unwrap().unwrap();
    assert!(client.is_connected());

    let result = client.call("system.ping", json!({})).await.unwrap();
    assert_eq!(result, json!({"echo": "system.ping", "params": {}}));

    let result = client.call("jobs.get", json!({"pk": 42})).await.unwrap();
    assert_eq!(result["params"], json!({"pk": 42}));

    // Server closes after two answers.
    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, async {
        while client.state() != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("close was not noticed");
    assert!(matches!(
        client.call("system.ping", json!({})).await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test]
async fn test_websocket_close_fails_pending_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(socket).await.unwrap();
        // Read the request, never answer, hang up.
        let _ = ws.next().await;
        let _ = ws.close(None).await;
    });

    let client = RpcClient::from_config(&config(format!("ws://{}", addr))).unwrap();
    client.connect().await.unwrap();

    let result = timeout(TEST_TIMEOUT, client.call("slow", json!({})))
        .await
        .expect("call should fail when the server hangs up");
    assert!(matches!(result, Err(LinkError::ConnectionLost)));
}

#[tokio::test]
async fn test_refused_websocket_connect_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RpcClient::from_config(&config(format!("ws://{}", addr))).unwrap();
    let result = timeout(TEST_TIMEOUT, client.connect()).await.unwrap();
    assert!(matches!(result, Err(LinkError::ConnectionFailed(_))));
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_tcp_content_length_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        while let Ok(Some(request)) = read_message(&mut reader).await {
            write_message(&mut write_half, &echo_reply(&request)).await.unwrap();
        }
    });

    let client = RpcClient::from_config(&config(format!("tcp://{}", addr))).unwrap();
    client.connect().await.unwrap();

    let calls = (0..4).map(|n| {
        let client = client.clone();
        async move { client.call("jobs.get", json!({"pk": n})).await }
    });
    let results = futures::future::join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["params"], json!({"pk": n}));
    }

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_roundtrip() {
    use tokio::net::UnixListener;

    let path = std::env::temp_dir().join(format!("jsonrpc-link-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        while let Ok(Some(request)) = read_message(&mut reader).await {
            write_message(&mut write_half, &echo_reply(&request)).await.unwrap();
        }
    });

    let client = RpcClient::from_config(&config(format!("unix://{}", path.display()))).unwrap();
    client.connect().await.unwrap();
    let result = client.call("system.ping", json!(null)).await.unwrap();
    assert_eq!(result, json!({"echo": "system.ping", "params": {}}));

    client.disconnect();
    let _ = std::fs::remove_file(&path);
}
