//! Core types for OSSA agent discovery and transport.
//!
//! This crate defines the data structures shared by the discovery service,
//! the transports, and the node runner. It contains no networking logic.

pub mod agent;
pub mod config;
pub mod error;

pub use agent::{AgentMetadata, Capabilities, DiscoverySettings, Interfaces, UadpSettings};
pub use config::MeshConfig;
pub use error::MetadataError;
