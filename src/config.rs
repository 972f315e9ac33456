//! Client configuration.
//!
//! Values come from built-in defaults, optionally overridden by a JSON file,
//! then by environment variables:
//!
//! ```text
//! JSONRPC_LINK_URL                 endpoint (ws://, wss://, tcp://, unix://)
//! JSONRPC_LINK_CALL_TIMEOUT_MS     per-call deadline
//! JSONRPC_LINK_MAX_RECONNECTS      reconnection attempts before giving up
//! JSONRPC_LINK_RECONNECT_DELAY_MS  base reconnection delay
//! ```
//!
//! Durations are written in milliseconds in the file (`call_timeout_ms`, ...).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pending::DEFAULT_CALL_TIMEOUT;
use crate::reconnect::ReconnectPolicy;

pub const ENV_URL: &str = "JSONRPC_LINK_URL";
pub const ENV_CALL_TIMEOUT_MS: &str = "JSONRPC_LINK_CALL_TIMEOUT_MS";
pub const ENV_MAX_RECONNECTS: &str = "JSONRPC_LINK_MAX_RECONNECTS";
pub const ENV_RECONNECT_DELAY_MS: &str = "JSONRPC_LINK_RECONNECT_DELAY_MS";

/// How long `connect()` waits for the endpoint provider.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long opening the physical connection may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint. When absent the endpoint comes from the resolver
    /// supplied by the application.
    pub endpoint: Option<String>,
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    #[serde(rename = "resolve_timeout_ms", with = "millis")]
    pub resolve_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Defaults, then the default config file if present, then the
    /// environment.
    pub fn discover() -> Result<Self> {
        let base = match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config file: {}", path.display());
                Self::load(&path)?
            }
            _ => Self::default(),
        };
        base.with_env()
    }

    /// Overlay the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` (keyed by the `ENV_*` names).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL) {
            let url = url.trim();
            if !url.is_empty() {
                self.endpoint = Some(url.to_string());
            }
        }
        if let Some(ms) = parse_number::<u64, _>(&lookup, ENV_CALL_TIMEOUT_MS)? {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_number::<u32, _>(&lookup, ENV_MAX_RECONNECTS)? {
            self.reconnect.max_attempts = max;
        }
        if let Some(ms) = parse_number::<u64, _>(&lookup, ENV_RECONNECT_DELAY_MS)? {
            self.reconnect.base_delay = Duration::from_millis(ms);
        }
        Ok(self)
    }
}

fn parse_number<T, L>(lookup: &L, key: &str) -> Result<Option<T>>
where
    L: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}

/// Resolve the default config file location.
///
/// `<config dir>/jsonrpc-link/config.json`, where the config dir is
/// `$XDG_CONFIG_HOME` (or `~/.config`) on Linux and
/// `~/Library/Application Support` on macOS.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("jsonrpc-link").join("config.json"))
}

/// Serde adapter for durations stored as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::Backoff;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, None);
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.resolve_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "endpoint": "ws://localhost:8765",
                "call_timeout_ms": 2500,
                "reconnect": {"max_attempts": 3, "backoff": "exponential"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoint.as_deref(), Some("ws://localhost:8765"));
        assert_eq!(config.call_timeout, Duration::from_millis(2500));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_overrides_apply_on_top() {
        let config = ClientConfig::default()
            .with_overrides(lookup(&[
                (ENV_URL, " tcp://127.0.0.1:9000 "),
                (ENV_CALL_TIMEOUT_MS, "1500"),
                (ENV_MAX_RECONNECTS, "0"),
                (ENV_RECONNECT_DELAY_MS, "250"),
            ]))
            .unwrap();

        assert_eq!(config.endpoint.as_deref(), Some("tcp://127.0.0.1:9000"));
        assert_eq!(config.call_timeout, Duration::from_millis(1500));
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_override_is_reported() {
        let err = ClientConfig::default()
            .with_overrides(lookup(&[(ENV_MAX_RECONNECTS, "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RECONNECTS));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "jsonrpc-link-config-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{"endpoint": "unix:///tmp/app.sock"}"#).unwrap();
        let config = ClientConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.endpoint.as_deref(), Some("unix:///tmp/app.sock"));
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = ClientConfig::load(Path::new("/nonexistent/jsonrpc-link.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_default_config_path_format() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("jsonrpc-link/config.json"));
        }
    }
}
