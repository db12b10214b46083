//! Runtime configuration for discovery and transports.
//!
//! Every section uses `#[serde(default)]`, so a config file only needs the
//! keys it wants to override.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Reference UADP multicast group.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Reference UADP port.
pub const DEFAULT_UADP_PORT: u16 = 1900;
/// Default registry TTL in seconds.
pub const DEFAULT_AGENT_TTL_SECS: u64 = 90;

/// Top-level configuration, usually loaded from `~/.ossa/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub discovery: DiscoveryConfig,
    pub rpc: RpcConfig,
    pub websocket: WebSocketSettings,
    pub webrtc: WebRtcSettings,
}

/// UADP discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Multicast group to join. Default: 239.255.255.250.
    pub multicast_group: Ipv4Addr,
    /// UDP port bound for announcements and queries. Default: 1900.
    pub port: u16,
    /// Local interface used to join the group. Default: any.
    pub interface: Ipv4Addr,
    /// IP_MULTICAST_TTL for outgoing datagrams. Default: 1 (link-local).
    pub multicast_ttl: u32,
    /// Deliver our own multicast datagrams back to local sockets. Default: true,
    /// so several agents on one host can see each other.
    pub multicast_loop: bool,
    /// Registry entry TTL in seconds. Default: 90.
    pub ttl_secs: u64,
    /// Overrides the manifest heartbeat interval when set.
    pub heartbeat_interval_secs: Option<u64>,
    /// Pre-shared key for HMAC-SHA256 message signatures. Unsigned mode if None.
    pub shared_secret: Option<String>,
    /// Receive buffer size. Default: 65507.
    pub max_datagram_bytes: usize,
    /// Port advertised to peers for transport connections.
    pub advertised_port: Option<u16>,
    /// Hostname advertised to peers.
    pub hostname: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_UADP_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            multicast_loop: true,
            ttl_secs: DEFAULT_AGENT_TTL_SECS,
            heartbeat_interval_secs: None,
            shared_secret: None,
            max_datagram_bytes: 65_507,
            advertised_port: None,
            hostname: None,
        }
    }
}

impl DiscoveryConfig {
    /// Registry TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }

    /// Interval between TTL sweeps (half the TTL).
    pub fn sweep_interval(&self) -> Duration {
        self.ttl() / 2
    }
}

/// Request/response timing shared by all transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default capability call timeout in milliseconds. Default: 30000.
    pub call_timeout_ms: u64,
    /// Ack wait timeout in milliseconds. Default: 5000.
    pub ack_timeout_ms: u64,
    /// Incomplete chunk buffers older than this are discarded. Default: 60000.
    pub chunk_buffer_max_age_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            ack_timeout_ms: 5_000,
            chunk_buffer_max_age_ms: 60_000,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn chunk_buffer_max_age(&self) -> Duration {
        Duration::from_millis(self.chunk_buffer_max_age_ms)
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Endpoint to connect to, e.g. `ws://127.0.0.1:8080/agents`.
    pub url: Option<String>,
    /// Frames larger than this are chunked. Default: 1 MiB.
    pub max_frame_bytes: usize,
    /// Reconnect policy after an unexpected drop.
    pub reconnect: ReconnectConfig,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_frame_bytes: 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Exponential backoff for transport reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after an unexpected drop. Default: true.
    pub enabled: bool,
    /// First backoff in milliseconds. Default: 1000.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds. Default: 30000.
    pub max_backoff_ms: u64,
    /// Give up after this many failed attempts. Unlimited if None.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before the given attempt (0-indexed): `initial * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        Duration::from_millis(base.min(self.max_backoff_ms))
    }
}

/// WebRTC transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    /// ICE server URLs handed to the peer connection (`stun:` / `turn:`).
    pub ice_servers: Vec<String>,
    /// Data channel messages larger than this are chunked. Default: 16 KiB.
    pub max_message_bytes: usize,
    /// Gather loopback host candidates (same-host peers). Default: false.
    pub include_loopback_candidates: bool,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            max_message_bytes: 16 * 1024,
            include_loopback_candidates: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.discovery.multicast_group, DEFAULT_MULTICAST_GROUP);
        assert_eq!(config.discovery.port, 1900);
        assert_eq!(config.discovery.sweep_interval(), Duration::from_secs(45));
        assert_eq!(config.rpc.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.webrtc.max_message_bytes, 16_384);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [discovery]
            port = 19000
            ttl_secs = 20

            [websocket]
            url = "ws://127.0.0.1:9000"

            [websocket.reconnect]
            max_attempts = 3
        "#;
        let config: MeshConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.discovery.port, 19000);
        assert_eq!(config.discovery.ttl(), Duration::from_secs(20));
        assert_eq!(config.discovery.multicast_ttl, 1);
        assert_eq!(config.websocket.url.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(config.websocket.reconnect.max_attempts, Some(3));
        assert!(config.websocket.reconnect.enabled);
        assert_eq!(config.rpc.ack_timeout_ms, 5_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.backoff(0), Duration::from_secs(1));
        assert_eq!(reconnect.backoff(3), Duration::from_secs(8));
        assert_eq!(reconnect.backoff(10), Duration::from_secs(30));
        assert_eq!(reconnect.backoff(200), Duration::from_secs(30));
    }
}
