//! Universal Agent Discovery Protocol (UADP).
//!
//! Agents announce themselves on a LAN multicast group and discover peers by
//! capability. Discovery feeds agent identities and addresses to the
//! transports but does not depend on them.
//!
//! ## Architecture
//!
//! - **UadpMessage**: JSON datagram exchanged on the multicast group
//! - **AgentRegistry**: Agents seen on the network, keyed by agent id
//! - **UadpDiscoveryService**: Socket loops, heartbeats and TTL sweeps

pub mod error;
pub mod message;
pub mod registry;
pub mod service;
pub mod signing;

pub use error::DiscoveryError;
pub use message::{HealthStatus, UadpBody, UadpMessage};
pub use registry::{AgentRegistry, DiscoveredAgent, NetworkInfo};
pub use service::{DiscoveryEvent, DiscoveryStats, UadpDiscoveryService};
