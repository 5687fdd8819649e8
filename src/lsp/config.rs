//! Runtime configuration with environment overrides.
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

pub const ENV_REQUEST_TIMEOUT_MS: &str = "LSP_PEER_REQUEST_TIMEOUT_MS";
pub const ENV_STRICT_CAPABILITIES: &str = "LSP_PEER_STRICT_CAPABILITIES";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "LSP_PEER_HEARTBEAT_INTERVAL_MS";
pub const ENV_RECONNECT: &str = "LSP_PEER_RECONNECT";
pub const ENV_RECONNECT_BASE_MS: &str = "LSP_PEER_RECONNECT_BASE_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "LSP_PEER_RECONNECT_MAX_MS";
pub const ENV_RECONNECT_ATTEMPTS: &str = "LSP_PEER_RECONNECT_ATTEMPTS";

/// Exponential backoff for client-mode channel transports:
/// `delay = min(base * multiplier^(attempt-1), max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        ReconnectPolicy {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the 1-based `attempt`. Never below `base_delay` (unless that
    /// exceeds `max_delay`), never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_millis() as f64 * multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn from_env() -> Self {
        let default = Self::default();
        ReconnectPolicy {
            enabled: parse_bool_env(ENV_RECONNECT, default.enabled),
            base_delay: parse_millis_env(ENV_RECONNECT_BASE_MS, default.base_delay),
            multiplier: default.multiplier,
            max_delay: parse_millis_env(ENV_RECONNECT_MAX_MS, default.max_delay),
            max_attempts: parse_u32_env(ENV_RECONNECT_ATTEMPTS, default.max_attempts),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Traffic must have arrived within this window for the peer to count as responsive.
    pub responsiveness_window: Duration,
    /// Notification sent as the ping side-effect; `None` pings nothing and only
    /// watches traffic.
    pub ping_method: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: Duration::from_secs(15),
            responsiveness_window: Duration::from_secs(45),
            ping_method: None,
        }
    }
}

impl HeartbeatConfig {
    /// Period the monitor ticks at. A zero interval cannot drive a timer and
    /// falls back to the default.
    pub fn tick_interval(&self) -> Duration {
        if self.interval.is_zero() {
            let fallback = HeartbeatConfig::default().interval;
            warn!(
                fallback_ms = fallback.as_millis() as u64,
                "Heartbeat interval of zero, using default"
            );
            return fallback;
        }
        self.interval
    }
}

/// Name/version pair advertised during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub name: String,
    pub version: Option<String>,
}

impl Default for PeerInfo {
    fn default() -> Self {
        PeerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub info: PeerInfo,
    /// Capability tree declared to the remote at handshake.
    pub capabilities: Value,
    /// Strict guards abort calls/registrations; non-strict guards log and allow.
    pub strict_capabilities: bool,
    /// Default per-request timeout; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub heartbeat: Option<HeartbeatConfig>,
    /// Sent as `rootUri` by clients.
    pub root_uri: Option<lsp_types::Url>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            info: PeerInfo::default(),
            capabilities: Value::Object(Default::default()),
            strict_capabilities: false,
            request_timeout: Some(Duration::from_secs(30)),
            heartbeat: None,
            root_uri: None,
        }
    }
}

impl PeerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let request_timeout = match std::env::var(ENV_REQUEST_TIMEOUT_MS) {
            Ok(value) if value.trim() == "0" => None,
            Ok(_) => Some(parse_millis_env(
                ENV_REQUEST_TIMEOUT_MS,
                default.request_timeout.unwrap_or(Duration::from_secs(30)),
            )),
            Err(_) => default.request_timeout,
        };
        PeerConfig {
            strict_capabilities: parse_bool_env(ENV_STRICT_CAPABILITIES, default.strict_capabilities),
            request_timeout,
            heartbeat: heartbeat_from_env(ENV_HEARTBEAT_INTERVAL_MS),
            ..default
        }
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_capabilities = strict;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_info(mut self, name: impl Into<String>, version: Option<String>) -> Self {
        self.info = PeerInfo {
            name: name.into(),
            version,
        };
        self
    }
}

fn parse_millis_env(var_name: &str, default: Duration) -> Duration {
    match std::env::var(var_name) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(
                    var = var_name,
                    value = %value,
                    default_ms = default.as_millis() as u64,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// `None` unless the variable is set. Zero is rejected like any other
/// unusable value.
fn heartbeat_from_env(var_name: &str) -> Option<HeartbeatConfig> {
    std::env::var(var_name).ok()?;
    let default = HeartbeatConfig::default();
    let mut interval = parse_millis_env(var_name, default.interval);
    if interval.is_zero() {
        warn!(
            var = var_name,
            default_ms = default.interval.as_millis() as u64,
            "Heartbeat interval must be positive, using default"
        );
        interval = default.interval;
    }
    Some(HeartbeatConfig {
        interval,
        responsiveness_window: interval * 3,
        ping_method: None,
    })
}

fn parse_u32_env(var_name: &str, default: u32) -> u32 {
    match std::env::var(var_name) {
        Ok(value) => value.trim().parse::<u32>().unwrap_or_else(|_| {
            warn!(var = var_name, value = %value, default, "Invalid value for environment variable, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool_env(var_name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(var_name) else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => true,
        "false" | "0" => false,
        _ => {
            warn!(var = var_name, value = %value, default, "Invalid value for environment variable, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        };
        let delays: Vec<u64> = (1..=5).map(|a| policy.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_delay_handles_huge_attempt_counts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_sub_one_multiplier_is_clamped() {
        let policy = ReconnectPolicy {
            multiplier: 0.5,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(3), policy.base_delay);
    }

    #[test]
    fn test_bool_env_falls_back_on_garbage() {
        let var = "LSP_PEER_TEST_BOOL_ENV";
        std::env::set_var(var, "TRUE");
        assert!(parse_bool_env(var, false));
        std::env::set_var(var, "0");
        assert!(!parse_bool_env(var, true));
        std::env::set_var(var, "yes");
        assert!(parse_bool_env(var, true));
        assert!(!parse_bool_env(var, false));
        std::env::remove_var(var);
        assert!(parse_bool_env(var, true));
    }

    #[test]
    fn test_zero_heartbeat_interval_uses_default() {
        let var = "LSP_PEER_TEST_HEARTBEAT_ENV";
        std::env::set_var(var, "0");
        let heartbeat = heartbeat_from_env(var).unwrap();
        assert_eq!(heartbeat.interval, HeartbeatConfig::default().interval);
        std::env::set_var(var, "250");
        let heartbeat = heartbeat_from_env(var).unwrap();
        assert_eq!(heartbeat.interval, Duration::from_millis(250));
        assert_eq!(heartbeat.responsiveness_window, Duration::from_millis(750));
        std::env::remove_var(var);
        assert!(heartbeat_from_env(var).is_none());

        let zero = HeartbeatConfig {
            interval: Duration::ZERO,
            ..HeartbeatConfig::default()
        };
        assert_eq!(zero.tick_interval(), HeartbeatConfig::default().interval);
    }

    #[test]
    fn test_peer_config_defaults() {
        let config = PeerConfig::default();
        assert!(!config.strict_capabilities);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert!(config.capabilities.is_object());
    }
}
