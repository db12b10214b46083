//! Transport events.

use crate::envelope::TransportMessage;
use std::fmt;

/// Capacity of each transport's event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of a WebRTC peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    /// Offer and answer are both applied.
    Negotiated,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::HaveLocalOffer => "have-local-offer",
            PeerState::HaveRemoteOffer => "have-remote-offer",
            PeerState::Negotiated => "negotiated",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    /// An inbound envelope not consumed by the RPC layer. Chunked envelopes
    /// are delivered once, after reassembly.
    Message(TransportMessage),
    Error(String),
    ConnectionStateChange { peer_id: String, state: PeerState },
}

impl TransportEvent {
    /// Event name as exposed to orchestration code.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Connected => "connected",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::Message(_) => "message",
            TransportEvent::Error(_) => "error",
            TransportEvent::ConnectionStateChange { .. } => "connectionstatechange",
        }
    }
}
