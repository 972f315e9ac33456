//! Typed `login` / `register` calls.
//!
//! Thin wrappers over [`RpcClient::call`]; storing the returned tokens is
//! up to the application.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::client::RpcClient;
use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub username: String,
    pub password: String,
    pub email: String,
}

/// An authenticated user as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// Username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// The server logged the new user in right away.
    LoggedIn(AuthUser),
    /// Account created; the user still has to log in.
    Registered { message: String },
}

/// Log in with a username and password.
///
/// # Errors
///
/// Any [`RpcClient::call`] error unchanged (`NotConnected` when the link is
/// down), or `LinkError::Protocol` when the reply carries no access token.
pub async fn login(client: &RpcClient, request: &LoginRequest) -> Result<AuthUser, LinkError> {
    let reply = client.call("login", to_params(request)?).await?;
    let user = parse_user(reply)
        .ok_or_else(|| LinkError::Protocol("Invalid response from server".to_string()))?;
    info!("Logged in as {}", user.user.as_deref().unwrap_or(&request.username));
    Ok(user)
}

/// Create an account.
///
/// The server either logs the new user in (reply carries an access token)
/// or acknowledges with a `message`.
pub async fn register(
    client: &RpcClient,
    request: &RegisterRequest,
) -> Result<RegisterOutcome, LinkError> {
    let reply = client.call("register", to_params(request)?).await?;

    if let Some(user) = parse_user(reply.clone()) {
        return Ok(RegisterOutcome::LoggedIn(user));
    }
    match reply.get("message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() => Ok(RegisterOutcome::Registered {
            message: message.to_string(),
        }),
        _ => Err(LinkError::Protocol("Invalid response from server".to_string())),
    }
}

fn to_params<T: Serialize>(request: &T) -> Result<Value, LinkError> {
    serde_json::to_value(request)
        .map_err(|e| LinkError::Protocol(format!("Failed to serialize params: {}", e)))
}

/// A reply counts as a login only when it has a non-empty access token.
fn parse_user(reply: Value) -> Option<AuthUser> {
    let user: AuthUser = serde_json::from_value(reply).ok()?;
    (!user.access_token.is_empty()).then_some(user)
}
