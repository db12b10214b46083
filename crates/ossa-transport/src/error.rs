//! Transport errors.

use crate::signaling::SignalingError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Data channel '{0}' is not open")]
    ChannelNotOpen(String),
    #[error("Capability '{capability}' timed out after {timeout:?}")]
    CallTimeout {
        capability: String,
        timeout: Duration,
    },
    #[error("No ack for message {id} within {timeout:?}")]
    AckTimeout { id: String, timeout: Duration },
    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },
    #[error("Transport closed")]
    Closed,
    #[error("Frame limit of {limit} bytes is too small for chunking; need at least {required}")]
    FrameLimit { limit: usize, required: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
