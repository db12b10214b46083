//! OSSA agent transport: envelope, capability RPC and carriers.
//!
//! Every carrier speaks the same JSON envelope and exposes the same
//! [`Transport`] contract, so application code does not care whether a peer
//! is reached over a WebSocket or a WebRTC data channel.
//!
//! ## Architecture
//!
//! - **TransportMessage**: the envelope shared by all carriers
//! - **RpcCore**: correlation of calls, acks, chunk reassembly and inbound dispatch
//! - **WebSocketTransport**: client link with send queue and reconnect replay
//! - **WebRtcTransport**: peer-to-peer data channels negotiated over signaling
//! - **SignalingChannel**: out-of-band offer/answer/ICE exchange

pub mod chunk;
pub mod envelope;
pub mod error;
pub mod event;
pub mod rpc;
pub mod rtc;
pub mod signaling;
pub mod websocket;

pub use envelope::{CallOptions, MessageType, Priority, SendOptions, TransportMessage};
pub use error::TransportError;
pub use event::{PeerState, TransportEvent};
pub use rpc::{CapabilityError, CapabilityHandler, RpcCore, SendMode, Transport};
pub use rtc::{WebRtcTransport, CONTROL_CHANNEL};
pub use signaling::{
    IceCandidate, InMemorySignaling, SignalingBody, SignalingChannel, SignalingEndpoint,
    SignalingError, SignalingMessage,
};
pub use websocket::{ConnectionState, WebSocketTransport};
