//! Transport envelope.
//!
//! Every frame on every carrier is one JSON object:
//! `{type, id, timestamp, payload, metadata}`. Metadata keys are camelCase on
//! the wire (`agentId`, `correlationId`, `requiresAck`, `chunked`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Envelope type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// First frame after a WebSocket connects: `{agentId, capabilities}`.
    Register,
    /// Application message.
    Message,
    /// Capability invocation: `{capability, args}`.
    CapabilityCall,
    /// Successful result of a capability call.
    CapabilityResponse,
    /// Receipt for an envelope sent with `requiresAck`.
    Ack,
    Ping,
    Pong,
    /// Failure: `{code, message}`.
    Error,
    StatusUpdate,
}

/// Delivery priority hint. Carried, not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Position of one part of a chunked envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Id of the envelope being reassembled.
    pub message_id: String,
}

/// Envelope metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    /// Sender identity.
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Time-to-live in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// The receiver must answer with an `ack` carrying the same id.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunked: Option<ChunkInfo>,
}

/// The envelope shared by all transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Unique per send.
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
    pub metadata: EnvelopeMetadata,
}

impl TransportMessage {
    /// Build an envelope with a fresh id and the current time.
    pub fn new(kind: MessageType, payload: Value, agent_id: impl Into<String>) -> Self {
        Self {
            kind,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
            metadata: EnvelopeMetadata {
                agent_id: agent_id.into(),
                ..Default::default()
            },
        }
    }

    /// Apply caller-supplied send options.
    pub fn with_options(mut self, options: &SendOptions) -> Self {
        self.metadata.correlation_id = options.correlation_id.clone();
        self.metadata.priority = options.priority;
        self.metadata.ttl = options.ttl;
        self.metadata.requires_ack = options.wait_for_ack;
        self
    }

    /// Correlation id a response to this envelope should carry.
    ///
    /// Falls back to the envelope id for callers that did not set one.
    pub fn reply_correlation(&self) -> String {
        self.metadata
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }

    /// The `capability` field of a `capability_call` payload.
    pub fn capability(&self) -> Option<&str> {
        self.payload.get("capability").and_then(Value::as_str)
    }
}

/// Options for [`Transport::send`](crate::Transport::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub correlation_id: Option<String>,
    pub priority: Option<Priority>,
    /// Time-to-live in milliseconds.
    pub ttl: Option<u64>,
    /// Resolve only once the receiver acks, or fail after the ack timeout.
    pub wait_for_ack: bool,
}

/// Options for [`Transport::invoke_capability`](crate::Transport::invoke_capability).
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured call timeout.
    pub timeout: Option<Duration>,
    pub priority: Option<Priority>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = TransportMessage::new(MessageType::CapabilityCall, json!({"capability": "translate"}), "agent-a")
            .with_options(&SendOptions {
                correlation_id: Some("c-1".into()),
                priority: Some(Priority::High),
                ttl: Some(5000),
                wait_for_ack: true,
            });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "capability_call");
        assert_eq!(value["metadata"]["agentId"], "agent-a");
        assert_eq!(value["metadata"]["correlationId"], "c-1");
        assert_eq!(value["metadata"]["priority"], "high");
        assert_eq!(value["metadata"]["ttl"], 5000);
        assert_eq!(value["metadata"]["requiresAck"], true);
        assert!(value["metadata"].get("chunked").is_none());
        assert_eq!(msg.capability(), Some("translate"));
    }

    #[test]
    fn test_optional_metadata_omitted() {
        let msg = TransportMessage::new(MessageType::Ping, Value::Null, "agent-a");
        let value = serde_json::to_value(&msg).unwrap();
        let meta = value["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(msg.reply_correlation(), msg.id);
    }

    #[test]
    fn test_decode_foreign_envelope() {
        let raw = r#"{
            "type": "status_update",
            "id": "m-1",
            "timestamp": 1700000000000,
            "metadata": {"agentId": "peer", "chunked": {"chunkIndex": 1, "totalChunks": 3, "messageId": "orig"}}
        }"#;
        let msg: TransportMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, MessageType::StatusUpdate);
        assert_eq!(msg.payload, Value::Null);
        assert!(!msg.metadata.requires_ack);
        let chunk = msg.metadata.chunked.unwrap();
        assert_eq!(chunk.chunk_index, 1);
        assert_eq!(chunk.total_chunks, 3);
        assert_eq!(chunk.message_id, "orig");
    }
}
