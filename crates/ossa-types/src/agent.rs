//! Agent metadata as supplied by the manifest loader.
//!
//! An [`AgentMetadata`] value is immutable for the lifetime of a running
//! agent. Discovery announces it verbatim; transports read the agent id and
//! capability list from it.

use crate::error::MetadataError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default interval between UADP heartbeats, in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Identity and capability description of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Unique agent id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Agent version string.
    pub version: String,
    /// What the agent does.
    #[serde(default)]
    pub description: String,
    /// Capabilities the agent offers.
    pub capabilities: Capabilities,
    /// Interfaces the agent exposes.
    #[serde(default)]
    pub interfaces: Interfaces,
    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

/// Primary and secondary capability names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub primary: Vec<String>,
    #[serde(default)]
    pub secondary: Vec<String>,
}

/// Interfaces exposed by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interfaces {
    /// API style, e.g. `"rest"` or `"grpc"`.
    #[serde(default)]
    pub api: String,
    /// Supported transport protocols, e.g. `["websocket", "webrtc"]`.
    #[serde(default)]
    pub protocols: Vec<String>,
}

/// Discovery section of the agent manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default)]
    pub uadp: UadpSettings,
}

/// UADP-specific discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UadpSettings {
    /// Whether the agent participates in UADP. Must be present for the
    /// discovery service to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Optional registry URL the agent also reports to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

impl Default for UadpSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            registry: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl AgentMetadata {
    /// Create metadata with the given id and primary capabilities and UADP enabled.
    pub fn new(id: impl Into<String>, name: impl Into<String>, primary: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            capabilities: Capabilities {
                primary,
                secondary: Vec::new(),
            },
            interfaces: Interfaces::default(),
            discovery: DiscoverySettings {
                uadp: UadpSettings {
                    enabled: Some(true),
                    ..UadpSettings::default()
                },
            },
        }
    }

    /// All capabilities, primary and secondary.
    pub fn capability_set(&self) -> BTreeSet<&str> {
        self.capabilities
            .primary
            .iter()
            .chain(self.capabilities.secondary.iter())
            .map(String::as_str)
            .collect()
    }

    /// Returns true if every requested capability is offered by this agent.
    ///
    /// An empty request matches every agent.
    pub fn has_capabilities<S: AsRef<str>>(&self, requested: &[S]) -> bool {
        let offered = self.capability_set();
        requested.iter().all(|c| offered.contains(c.as_ref()))
    }

    /// Heartbeat interval as a [`Duration`]; zero is clamped to one second.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.uadp.heartbeat_interval.max(1))
    }

    /// Check the fields the discovery service depends on.
    pub fn validate_for_discovery(&self) -> Result<(), MetadataError> {
        if self.id.trim().is_empty() {
            return Err(MetadataError::MissingField("id"));
        }
        if self.capabilities.primary.is_empty() {
            return Err(MetadataError::MissingField("capabilities.primary"));
        }
        match self.discovery.uadp.enabled {
            None => Err(MetadataError::MissingField("discovery.uadp.enabled")),
            Some(false) => Err(MetadataError::DiscoveryDisabled(self.id.clone())),
            Some(true) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> AgentMetadata {
        let mut meta = AgentMetadata::new("agent-a", "translator", vec!["translate".into()]);
        meta.capabilities.secondary = vec!["summarize".into()];
        meta
    }

    #[test]
    fn test_has_capabilities_superset() {
        let meta = translator();
        assert!(meta.has_capabilities(&["translate"]));
        assert!(meta.has_capabilities(&["translate", "summarize"]));
        assert!(!meta.has_capabilities(&["translate", "ocr"]));
        assert!(meta.has_capabilities::<&str>(&[]));
    }

    #[test]
    fn test_missing_enabled_is_rejected() {
        let json = serde_json::json!({
            "id": "agent-x",
            "name": "x",
            "version": "0.1.0",
            "capabilities": { "primary": ["search"] },
            "discovery": { "uadp": { "heartbeat_interval": 10 } }
        });
        let meta: AgentMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.discovery.uadp.enabled, None);
        assert_eq!(meta.heartbeat_interval(), Duration::from_secs(10));
        match meta.validate_for_discovery() {
            Err(MetadataError::MissingField(field)) => {
                assert_eq!(field, "discovery.uadp.enabled")
            }
            other => panic!("Expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_disabled_is_rejected() {
        let mut meta = translator();
        meta.discovery.uadp.enabled = Some(false);
        assert!(matches!(
            meta.validate_for_discovery(),
            Err(MetadataError::DiscoveryDisabled(_))
        ));
    }

    #[test]
    fn test_default_heartbeat_interval() {
        let meta = translator();
        assert_eq!(meta.heartbeat_interval(), Duration::from_secs(30));
        assert!(meta.validate_for_discovery().is_ok());
    }
}
