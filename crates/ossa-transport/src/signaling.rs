//! Out-of-band signaling for WebRTC negotiation.
//!
//! A [`SignalingChannel`] carries offers, answers and ICE candidates between
//! two agents before their data channel exists. [`InMemorySignaling`] is the
//! in-process hub used by tests and single-process deployments; a networked
//! channel implements the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Errors from a signaling channel.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("No signaling endpoint registered for '{0}'")]
    UnknownPeer(String),
    #[error("Signaling channel closed")]
    Closed,
}

/// An ICE candidate as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Signaling message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingBody {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

/// A routed signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub body: SignalingBody,
}

impl SignalingMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: SignalingBody) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body,
        }
    }
}

/// A bidirectional signaling endpoint owned by one agent.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Identity messages are addressed to.
    fn local_id(&self) -> &str;

    /// Deliver a message to `msg.to`.
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError>;

    /// Next message addressed to this endpoint; `None` once unregistered.
    async fn recv(&self) -> Option<SignalingMessage>;
}

/// In-process signaling hub.
#[derive(Debug, Clone, Default)]
pub struct InMemorySignaling {
    routes: Arc<DashMap<String, mpsc::UnboundedSender<SignalingMessage>>>,
}

impl InMemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent_id` and return its endpoint. Registering an id again
    /// replaces the previous endpoint.
    pub fn register_agent(&self, agent_id: impl Into<String>) -> SignalingEndpoint {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(agent_id.clone(), tx);
        debug!(%agent_id, "Signaling endpoint registered");
        SignalingEndpoint {
            agent_id,
            hub: self.clone(),
            inbox: Mutex::new(rx),
        }
    }

    /// Stop delivering to `agent_id`.
    pub fn unregister_agent(&self, agent_id: &str) {
        self.routes.remove(agent_id);
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.routes.clear();
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.routes.contains_key(agent_id)
    }

    fn route(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        let to = msg.to.clone();
        let Some(tx) = self.routes.get(&to).map(|entry| entry.value().clone()) else {
            return Err(SignalingError::UnknownPeer(to));
        };
        if tx.send(msg).is_err() {
            self.routes.remove(&to);
            return Err(SignalingError::UnknownPeer(to));
        }
        Ok(())
    }
}

/// An agent's endpoint on an [`InMemorySignaling`] hub.
#[derive(Debug)]
pub struct SignalingEndpoint {
    agent_id: String,
    hub: InMemorySignaling,
    inbox: Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
}

#[async_trait]
impl SignalingChannel for SignalingEndpoint {
    fn local_id(&self) -> &str {
        &self.agent_id
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.hub.route(msg)
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        self.inbox.lock().await.recv().await
    }
}
