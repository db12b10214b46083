//! UADP wire messages.
//!
//! Every datagram is a single JSON object:
//! `{version, message_type, agent_id, timestamp, signature?, payload}`.
//! The `message_type`/`payload` pair is modeled as an adjacently tagged enum
//! so each message kind is matched exhaustively.

use ossa_types::AgentMetadata;
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const UADP_VERSION: &str = "1.0";

/// A UADP datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UadpMessage {
    /// Protocol version.
    pub version: String,
    /// Sender agent id.
    pub agent_id: String,
    /// Send time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Hex HMAC-SHA256 over the message with this field absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Message variant and its payload.
    #[serde(flatten)]
    pub body: UadpBody,
}

/// The different kinds of UADP messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload", rename_all = "snake_case")]
pub enum UadpBody {
    /// Presence announcement with full metadata.
    Announce(AgentAdvert),
    /// Ask peers offering all of the listed capabilities to respond.
    Query(QueryPayload),
    /// Unicast answer to a query.
    Response(AgentAdvert),
    /// Periodic liveness signal.
    Heartbeat(HeartbeatPayload),
    /// The sender is leaving the group.
    Goodbye(GoodbyePayload),
}

/// Metadata plus the endpoint hints a peer needs to reach the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAdvert {
    pub agent: AgentMetadata,
    #[serde(default)]
    pub endpoint: AdvertisedEndpoint,
}

/// Optional endpoint hints; receivers fall back to the datagram source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Capability query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    /// Required capabilities; empty matches every agent.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub health_status: HealthStatus,
    pub uptime_secs: u64,
}

/// Goodbye payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoodbyePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Self-reported health of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    #[default]
    Unknown,
}

impl UadpBody {
    /// The wire name of this message type.
    pub fn message_type(&self) -> &'static str {
        match self {
            UadpBody::Announce(_) => "announce",
            UadpBody::Query(_) => "query",
            UadpBody::Response(_) => "response",
            UadpBody::Heartbeat(_) => "heartbeat",
            UadpBody::Goodbye(_) => "goodbye",
        }
    }
}

impl UadpMessage {
    /// Build an unsigned message stamped with the current time.
    pub fn new(agent_id: impl Into<String>, body: UadpBody) -> Self {
        Self {
            version: UADP_VERSION.to_string(),
            agent_id: agent_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            signature: None,
            body,
        }
    }
}

/// Encode a message as a JSON datagram.
pub fn encode_message(msg: &UadpMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Parse a JSON datagram.
pub fn decode_message(bytes: &[u8]) -> Result<UadpMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}
