use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Peer,
    Relay,
}

impl Default for NodeType {
    fn default() -> Self {
        Self::Peer
    }
}

fn default_channel_closed_timeout_secs() -> u64 {
    5
}

fn default_close_timeout_secs() -> u64 {
    2
}

fn default_seen_cache_ttl_secs() -> u64 {
    30
}

/// Configuration recognised by the transport facade, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub signalling_enabled: bool,
    #[serde(default)]
    pub node_type: NodeType,
    /// Required when `signalling_enabled && node_type == Peer`.
    #[serde(default)]
    pub relay_peer_id: Option<String>,
    #[serde(default = "default_channel_closed_timeout_secs")]
    pub channel_closed_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_seen_cache_ttl_secs")]
    pub seen_cache_ttl_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            signalling_enabled: false,
            node_type: NodeType::default(),
            relay_peer_id: None,
            channel_closed_timeout_secs: default_channel_closed_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            seen_cache_ttl_secs: default_seen_cache_ttl_secs(),
        }
    }
}

impl TransportConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(s)?;
        config.validate();
        Ok(config)
    }

    /// Clamps out-of-range values and disables settings that would leave
    /// the transport unreachable, logging a warning rather than failing to
    /// load — the same style as this workspace's relay configuration.
    pub fn validate(&mut self) {
        if self.channel_closed_timeout_secs == 0 {
            warn!("channel_closed_timeout_secs must be > 0, clamping to 1");
            self.channel_closed_timeout_secs = 1;
        }
        if self.close_timeout_secs == 0 {
            warn!("close_timeout_secs must be > 0, clamping to 1");
            self.close_timeout_secs = 1;
        }
        if self.seen_cache_ttl_secs == 0 {
            warn!("seen_cache_ttl_secs must be > 0, clamping to 1");
            self.seen_cache_ttl_secs = 1;
        }
        if self.signalling_enabled
            && self.node_type == NodeType::Peer
            && self.relay_peer_id.is_none()
        {
            warn!("signalling_enabled requires relay_peer_id for a Peer node, disabling signalling");
            self.signalling_enabled = false;
        }
    }

    pub fn primary_relay_pid(&self) -> Option<Pid> {
        self.relay_peer_id.as_deref().map(Pid::new)
    }

    /// The channel health monitor's scan interval (default 5s).
    pub fn channel_closed_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_closed_timeout_secs)
    }

    /// Graceful-close wait limit before forced teardown (default 2s).
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// The seen-cache's per-entry TTL (default 30s).
    pub fn seen_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_from_empty_toml() {
        let config = TransportConfig::from_toml("").unwrap();
        assert!(!config.signalling_enabled);
        assert_eq!(config.node_type, NodeType::Peer);
        assert_eq!(config.channel_closed_timeout_secs, 5);
    }

    #[test]
    fn disables_signalling_when_peer_has_no_relay_pid() {
        let mut config = TransportConfig {
            signalling_enabled: true,
            ..TransportConfig::default()
        };
        config.validate();
        assert!(!config.signalling_enabled);
    }

    #[test]
    fn clamps_zero_timeouts() {
        let mut config = TransportConfig {
            channel_closed_timeout_secs: 0,
            ..TransportConfig::default()
        };
        config.validate();
        assert_eq!(config.channel_closed_timeout_secs, 1);
    }
}
