use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Settings of a [`super::Publisher`].
///
/// Every field has a default, so a YAML file only needs the ones it changes:
///
/// ```yaml
/// server_port: 1667
/// max_heartbeat_delay_ms: 5000
/// auth_token: secret
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub bind_address: String,
    /// Request/reply port. 0 picks an ephemeral port.
    pub server_port: u16,
    /// Publish port. Defaults to `server_port + 1`, or ephemeral if `server_port` is 0.
    pub publish_port: Option<u16>,
    /// Without a request for this long, all hooks are disabled so that a
    /// disconnected monitor cannot leave the tree blocked on a breakpoint.
    pub max_heartbeat_delay_ms: u64,
    /// Period of the heartbeat sent on the publish socket.
    pub heartbeat_interval_ms: u64,
    /// Write timeout of every connection, and read timeout of client connections.
    pub io_timeout_ms: u64,
    /// Capacity of the transition queue; the oldest records are dropped first.
    pub max_transitions: usize,
    pub record_transitions: bool,
    /// If set, the tree starts in WAIT_AUTH.
    pub auth_token: Option<String>,
    /// Where an accepted UPDATE_MODE topology is persisted.
    pub topology_path: Option<PathBuf>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_owned(),
            server_port: 1667,
            publish_port: None,
            max_heartbeat_delay_ms: 5000,
            heartbeat_interval_ms: 1000,
            io_timeout_ms: 100,
            max_transitions: 1000,
            record_transitions: true,
            auth_token: None,
            topology_path: None,
        }
    }
}

impl PublisherConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn with_publish_port(mut self, port: u16) -> Self {
        self.publish_port = Some(port);
        self
    }

    pub fn with_max_heartbeat_delay(mut self, delay: Duration) -> Self {
        self.max_heartbeat_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_transitions(mut self, max: usize) -> Self {
        self.max_transitions = max;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_topology_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.topology_path = Some(path.into());
        self
    }

    pub fn resolved_publish_port(&self) -> u16 {
        self.publish_port.unwrap_or(match self.server_port {
            0 => 0,
            port => port.wrapping_add(1),
        })
    }

    pub fn max_heartbeat_delay(&self) -> Duration {
        Duration::from_millis(self.max_heartbeat_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
