//! Metadata validation errors.

use thiserror::Error;

/// Errors raised when agent metadata cannot be used by discovery or transport.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// A required field is absent or empty.
    #[error("Agent metadata is missing required field: {0}")]
    MissingField(&'static str),

    /// The manifest explicitly disables UADP discovery.
    #[error("UADP discovery is disabled for agent {0}")]
    DiscoveryDisabled(String),
}
