//! Configuration and manifest loading.
//!
//! Configuration comes from `~/.ossa/config.toml` unless a path is given.
//! A missing or unreadable file is not fatal: the node runs on defaults.

use anyhow::Context;
use ossa_types::{AgentMetadata, MeshConfig};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load mesh configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return MeshConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<MeshConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                MeshConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            MeshConfig::default()
        }
    }
}

/// Read an agent manifest (JSON-encoded [`AgentMetadata`]).
///
/// Unlike the config file, a bad manifest is an error: the node has no
/// sensible identity to fall back to.
pub fn load_manifest(path: &Path) -> anyhow::Result<AgentMetadata> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let metadata: AgentMetadata = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid manifest {}", path.display()))?;
    metadata
        .validate_for_discovery()
        .with_context(|| format!("Manifest {} cannot be used for discovery", path.display()))?;
    Ok(metadata)
}

/// Metadata used when no manifest is given.
pub fn default_metadata() -> AgentMetadata {
    let id = format!("ossa-node-{}", std::process::id());
    AgentMetadata::new(id, "ossa-node", vec!["mesh-node".to_string()])
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    ossa_home().join("config.toml")
}

/// Get the default OSSA home directory.
pub fn ossa_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ossa")
}
