use super::RelayConfig;

/// Environment variable overrides, applied on top of file/default values.
///
/// Unparseable numeric values are ignored.
pub fn apply_env_overrides(config: &mut RelayConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("RELAY_HTTP_URL") {
        config.server.http_url = v;
    }
    if let Some(v) = lookup("RELAY_WS_URL") {
        config.server.ws_url = v;
    }
    if let Some(n) = lookup("RELAY_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.timeouts.connect_ms = n;
    }
    if let Some(n) = lookup("RELAY_PROBE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.timeouts.probe_ms = n;
    }
    if let Some(n) = lookup("RELAY_STABLE_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
        config.heartbeat.stable_interval_ms = n;
    }
    if let Some(n) = lookup("RELAY_UNSTABLE_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
        config.heartbeat.unstable_interval_ms = n;
    }
}

impl RelayConfig {
    /// Build from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        apply_env_overrides(&mut cfg);
        cfg
    }
}
