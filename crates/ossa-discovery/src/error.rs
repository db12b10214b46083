//! Discovery service errors.

use ossa_types::MetadataError;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Errors from the UADP discovery service.
///
/// Only startup can fail; runtime socket errors are logged and the service
/// keeps running.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid agent metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Failed to create multicast socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to join multicast group {group} on {interface}: {source}")]
    JoinGroup {
        group: Ipv4Addr,
        interface: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },
    #[error("Discovery service is already running")]
    AlreadyRunning,
}
