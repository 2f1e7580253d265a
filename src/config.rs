use serde::{Deserialize, Serialize};

/// Timeouts and bounds applied to connection establishment and teardown.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Timeout for each TCP connect attempt against a resolved address
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Timeout for the SSH transport handshake (host key verification included)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Keepalive interval passed to the SSH engine
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_seconds: u64,

    /// Timeout for sending the disconnect message when closing a session
    #[serde(default = "default_close_timeout")]
    pub close_timeout_seconds: u64,

    /// Bounded wait between re-checks of the reservation ledger during a
    /// blocking disconnect. Defensive against missed wakeups; the notify
    /// signal remains the primary path.
    #[serde(default = "default_disconnect_poll")]
    pub disconnect_poll_seconds: u64,
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_handshake_timeout() -> u64 {
    30
}

const fn default_keepalive() -> u64 {
    30
}

const fn default_close_timeout() -> u64 {
    5
}

const fn default_disconnect_poll() -> u64 {
    3
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            handshake_timeout_seconds: default_handshake_timeout(),
            keepalive_interval_seconds: default_keepalive(),
            close_timeout_seconds: default_close_timeout(),
            disconnect_poll_seconds: default_disconnect_poll(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reasonable() {
        let limits = LimitsConfig::default();
        assert!(limits.connect_timeout_seconds >= 1);
        assert!(limits.handshake_timeout_seconds >= limits.connect_timeout_seconds);
        assert!(limits.disconnect_poll_seconds >= 1);
    }

    #[test]
    fn test_deserialize_empty_map_uses_defaults() {
        use serde::de::IntoDeserializer;
        let empty: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        let limits = LimitsConfig::deserialize(empty.into_deserializer())
            .unwrap_or_else(|_: serde::de::value::Error| unreachable!());
        assert_eq!(limits.keepalive_interval_seconds, 30);
        assert_eq!(limits.close_timeout_seconds, 5);
    }
}
