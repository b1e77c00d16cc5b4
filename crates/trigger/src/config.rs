//! Trigger configuration, read from the node's JSON parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::TriggerError;

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_script_timeout_ms() -> u64 {
    30_000
}

fn default_script_memory_limit() -> usize {
    16 * 1024 * 1024
}

/// Tuning knobs and inputs for one socket trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// Target URI, `ws://` or `wss://`.
    pub uri: String,
    /// Lua run once per successful connection. Empty means no open phase.
    #[serde(default, alias = "open_script", alias = "openEventCode")]
    pub open_script: String,
    /// Fixed delay between an abnormal close and the next connect attempt.
    #[serde(default = "default_reconnect_delay_ms", alias = "reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms", alias = "connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on one open-script run, including time spent awaiting frames.
    #[serde(default = "default_script_timeout_ms", alias = "script_timeout_ms")]
    pub script_timeout_ms: u64,
    #[serde(default = "default_script_memory_limit", alias = "script_memory_limit")]
    pub script_memory_limit: usize,
    /// Send `Authorization: Bearer <access token>` with the handshake.
    #[serde(default, alias = "bearer_auth")]
    pub bearer_auth: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            open_script: String::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            script_timeout_ms: default_script_timeout_ms(),
            script_memory_limit: default_script_memory_limit(),
            bearer_auth: false,
        }
    }
}

impl TriggerConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn with_open_script(mut self, script: impl Into<String>) -> Self {
        self.open_script = script.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Parse and validate the node's parameter object.
    pub fn from_parameters(parameters: &Value) -> Result<Self, TriggerError> {
        let config: Self = serde_json::from_value(parameters.clone())
            .map_err(|err| TriggerError::Config(err.to_string()))?;
        config.target()?;
        Ok(config)
    }

    /// The parsed target URI.
    ///
    /// # Errors
    /// [`TriggerError::Config`] unless the URI parses and uses `ws`/`wss`.
    pub fn target(&self) -> Result<Url, TriggerError> {
        let url = Url::parse(&self.uri)
            .map_err(|err| TriggerError::Config(format!("invalid uri '{}': {err}", self.uri)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(TriggerError::Config(format!(
                "uri must use ws:// or wss://, got {other}://"
            ))),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }
}
