//! JSON-RPC 2.0 envelope types and the wire codec.
//!
//! One JSON object per frame. Requests always carry an id (every call expects
//! a response); responses carry exactly one of `result` or `error`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LinkError;

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation identifier of a request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    /// Build a request. `Null` params are sent as an empty object; any other
    /// non-object params are rejected.
    pub fn new(method: &str, params: Value, id: impl Into<RequestId>) -> Result<Self, LinkError> {
        let params = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(LinkError::Protocol(format!(
                    "Params for {} must be a JSON object, got {}",
                    method,
                    value_kind(&other)
                )))
            }
        };
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params: Value::Object(params),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Structured error object of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Decoded response: the correlation id and the call outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub outcome: Result<Value, JsonRpcError>,
}

/// Anything the server may push down the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Reply carrying a usable id but a malformed body. The call with that
    /// id fails with `reason`.
    Invalid { id: RequestId, reason: String },
    /// Server-initiated message without an id.
    Notification { method: String, params: Option<Value> },
}

/// Serialize a request into a single text frame.
pub fn encode_request(request: &JsonRpcRequest) -> Result<String, LinkError> {
    serde_json::to_string(request)
        .map_err(|e| LinkError::Protocol(format!("Failed to serialize request: {}", e)))
}

/// Decode one inbound text frame.
///
/// Frames that cannot be correlated are rejected: non-objects, batches,
/// missing or null ids. Once a response id parses, any other defect (wrong
/// version tag, both or neither of `result` / `error`, a malformed error
/// object) yields [`Inbound::Invalid`] so the waiting call can be failed.
pub fn decode_inbound(frame: &str) -> Result<Inbound, LinkError> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| LinkError::Protocol(format!("Failed to parse frame: {}", e)))?;

    let mut object = match value {
        Value::Object(map) => map,
        Value::Array(_) => {
            return Err(LinkError::Protocol("Batch frames are not supported".to_string()))
        }
        _ => return Err(LinkError::Protocol("Frame is not a JSON object".to_string())),
    };

    if let Some(method) = object.remove("method") {
        check_version(&object).map_err(LinkError::Protocol)?;
        let method = method
            .as_str()
            .ok_or_else(|| LinkError::Protocol("Method is not a string".to_string()))?
            .to_string();
        if object.contains_key("id") {
            return Err(LinkError::Protocol(format!(
                "Unexpected request from server: {}",
                method
            )));
        }
        return Ok(Inbound::Notification {
            method,
            params: object.remove("params"),
        });
    }

    let id = match object.remove("id") {
        None => return Err(LinkError::Protocol("Response missing id".to_string())),
        Some(Value::Null) => {
            // Servers answer unparseable requests with a null id.
            let detail = object
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(LinkError::Protocol(format!(
                "Response with null id: {}",
                detail
            )));
        }
        Some(raw) => serde_json::from_value::<RequestId>(raw)
            .map_err(|_| LinkError::Protocol("Response id must be a string or integer".to_string()))?,
    };

    let decoded = check_version(&object).and_then(|()| response_outcome(object));
    Ok(match decoded {
        Ok(outcome) => Inbound::Response(JsonRpcResponse { id, outcome }),
        Err(reason) => Inbound::Invalid { id, reason },
    })
}

fn check_version(object: &Map<String, Value>) -> Result<(), String> {
    match object.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => Ok(()),
        Some(other) => Err(format!("Unsupported jsonrpc version: {}", other)),
        None => Err("Missing jsonrpc version".to_string()),
    }
}

fn response_outcome(mut object: Map<String, Value>) -> Result<Result<Value, JsonRpcError>, String> {
    match (object.remove("result"), object.remove("error")) {
        (Some(result), None) => Ok(Ok(result)),
        (None, Some(error)) => serde_json::from_value::<JsonRpcError>(error)
            .map(Err)
            .map_err(|e| format!("Malformed error object: {}", e)),
        (Some(_), Some(_)) => Err("Response carries both result and error".to_string()),
        (None, None) => Err("Response missing both result and error".to_string()),
    }
}
