pub mod env;

use serde::Deserialize;
use std::time::Duration;

/// Complete relay client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Relay server endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL for `/ping` and `/notifyDisconnect/{memberId}`
    #[serde(default = "default_http_url")]
    pub http_url: String,
    /// WebSocket endpoint the connection query is appended to
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

fn default_http_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
        }
    }
}

/// Network timeouts (milliseconds)
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_probe_ms")]
    pub probe_ms: u64,
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_send_ms")]
    pub send_ms: u64,
    #[serde(default = "default_notify_ms")]
    pub notify_ms: u64,
}

fn default_probe_ms() -> u64 {
    2000
}

fn default_connect_ms() -> u64 {
    5000
}

fn default_send_ms() -> u64 {
    5000
}

fn default_notify_ms() -> u64 {
    2000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_ms: default_probe_ms(),
            connect_ms: default_connect_ms(),
            send_ms: default_send_ms(),
            notify_ms: default_notify_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    pub fn notify(&self) -> Duration {
        Duration::from_millis(self.notify_ms)
    }
}

/// Heartbeat periods (milliseconds)
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Period of the default interval ticker
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Heartbeat period while the connection is healthy and the session settled
    #[serde(default = "default_stable_interval_ms")]
    pub stable_interval_ms: u64,
    /// Heartbeat period during handshakes or with heartbeats outstanding
    #[serde(default = "default_unstable_interval_ms")]
    pub unstable_interval_ms: u64,
}

fn default_tick_ms() -> u64 {
    250
}

fn default_stable_interval_ms() -> u64 {
    5000
}

fn default_unstable_interval_ms() -> u64 {
    1000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            stable_interval_ms: default_stable_interval_ms(),
            unstable_interval_ms: default_unstable_interval_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn stable_interval(&self) -> Duration {
        Duration::from_millis(self.stable_interval_ms)
    }

    pub fn unstable_interval(&self) -> Duration {
        Duration::from_millis(self.unstable_interval_ms)
    }
}

/// Reconnection and disconnect-notification policy
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Ping polling period while waiting for the network to come back
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Retry period of the disconnect notifier
    #[serde(default = "default_notify_period_ms")]
    pub notify_period_ms: u64,
    /// Extra WebSocket open attempts after the first one fails
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Re-check period while waiting for a pending notifier to clear
    #[serde(default = "default_notifier_poll_ms")]
    pub notifier_poll_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_notify_period_ms() -> u64 {
    1000
}

fn default_connect_retries() -> u32 {
    2
}

fn default_notifier_poll_ms() -> u64 {
    100
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            notify_period_ms: default_notify_period_ms(),
            connect_retries: default_connect_retries(),
            notifier_poll_ms: default_notifier_poll_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn notify_period(&self) -> Duration {
        Duration::from_millis(self.notify_period_ms)
    }

    pub fn notifier_poll(&self) -> Duration {
        Duration::from_millis(self.notifier_poll_ms)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<RelayConfig> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: RelayConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.server.http_url, "http://localhost:8080");
        assert_eq!(config.server.ws_url, "ws://localhost:8080/ws");
        assert_eq!(config.timeouts.connect_ms, 5000);
        assert_eq!(config.heartbeat.stable_interval_ms, 5000);
        assert_eq!(config.heartbeat.unstable_interval_ms, 1000);
        assert_eq!(config.reconnect.connect_retries, 2);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            http_url = "https://relay.example.com"
            ws_url = "wss://relay.example.com/ws"

            [timeouts]
            probe_ms = 500
            connect_ms = 3000

            [heartbeat]
            stable_interval_ms = 8000

            [reconnect]
            connect_retries = 4
        "#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.ws_url, "wss://relay.example.com/ws");
        assert_eq!(config.timeouts.probe(), Duration::from_millis(500));
        assert_eq!(config.timeouts.connect(), Duration::from_secs(3));
        assert_eq!(config.timeouts.send_ms, 5000); // Default
        assert_eq!(config.heartbeat.stable_interval(), Duration::from_secs(8));
        assert_eq!(config.reconnect.connect_retries, 4);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [heartbeat]
            tick_ms = 100
        "#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.heartbeat.tick(), Duration::from_millis(100));
        assert_eq!(config.heartbeat.unstable_interval_ms, 1000); // Default
        assert_eq!(config.server.http_url, "http://localhost:8080"); // Default
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhttp_url = \"http://10.0.0.1:9000\"").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.http_url, "http://10.0.0.1:9000");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/relay.toml").is_err());
    }
}
