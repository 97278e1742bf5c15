//! Driver timing and size knobs.

use std::time::Duration;

use serde::Deserialize;

/// Protocol defaults, overridable per driver instance (tests shrink the
/// timers; deployments may raise the datagram ceiling toward their MTU).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Silence on a peering before it is declared dead, in ms.
    pub timeout_ms: u64,
    /// Interval between OHAI attempts while a peering is down, in ms.
    pub ohai_ivl_ms: u64,
    /// Interval between request retransmissions, in ms.
    pub resend_ivl_ms: u64,
    /// Interval between TCP reconnect attempts, in ms.
    pub reconnect_ivl_ms: u64,
    /// Largest serialized message a datagram driver will send.
    pub msg_max: usize,
    /// Slots in each peering's pending ring (drop-oldest beyond that).
    pub pending_limit: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            timeout_ms: 10_000,
            ohai_ivl_ms: 1_000,
            resend_ivl_ms: 500,
            reconnect_ivl_ms: 1_000,
            msg_max: 512,
            pending_limit: 100,
        }
    }
}

impl DriverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Keep-alive cadence: a third of the peering timeout.
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.timeout_ms / 3)
    }

    pub fn ohai_ivl(&self) -> Duration {
        Duration::from_millis(self.ohai_ivl_ms)
    }

    pub fn resend_ivl(&self) -> Duration {
        Duration::from_millis(self.resend_ivl_ms)
    }

    pub fn reconnect_ivl(&self) -> Duration {
        Duration::from_millis(self.reconnect_ivl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.keepalive(), Duration::from_millis(3333));
        assert_eq!(config.msg_max, 512);
    }

    #[test]
    fn test_partial_override_from_json() {
        let config: DriverConfig = serde_json::from_str(r#"{"timeout_ms": 600}"#).unwrap();
        assert_eq!(config.timeout_ms, 600);
        assert_eq!(config.msg_max, 512);
    }
}
