//! Discovered-agent registry.
//!
//! The [`AgentRegistry`] records every agent seen on the multicast group,
//! keyed by agent id. It belongs to exactly one discovery service; the
//! service's receive, heartbeat and sweep tasks share it through an `Arc`.

use crate::message::HealthStatus;
use chrono::{DateTime, Utc};
use ossa_types::AgentMetadata;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Where a discovered agent can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Source address of the agent's datagrams.
    pub ip: IpAddr,
    /// Advertised transport port, or the datagram source port.
    pub port: u16,
    /// Advertised hostname, or the textual ip.
    pub hostname: String,
}

/// An agent seen on the network.
#[derive(Debug, Clone)]
pub struct DiscoveredAgent {
    pub metadata: AgentMetadata,
    /// Time of the most recent announce, response or heartbeat.
    pub last_seen: DateTime<Utc>,
    pub network_info: NetworkInfo,
    pub health_status: HealthStatus,
}

impl DiscoveredAgent {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Returns true if the entry is older than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        // Negative age (clock skew between receive and sweep) is never expired.
        match (now - self.last_seen).to_std() {
            Ok(age) => age > ttl,
            Err(_) => false,
        }
    }
}

/// Outcome of an [`AgentRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new entry was created.
    Created,
    /// An existing entry was refreshed.
    Refreshed,
}

/// Thread-safe registry of discovered agents.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, DiscoveredAgent>>>,
}

impl AgentRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh an entry from an announce or response.
    ///
    /// A refresh replaces metadata and network info and keeps the last
    /// heartbeat health status.
    pub fn upsert(
        &self,
        metadata: AgentMetadata,
        network_info: NetworkInfo,
        now: DateTime<Utc>,
    ) -> Upsert {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        match agents.get_mut(&metadata.id) {
            Some(entry) => {
                entry.metadata = metadata;
                entry.network_info = network_info;
                entry.last_seen = now;
                Upsert::Refreshed
            }
            None => {
                agents.insert(
                    metadata.id.clone(),
                    DiscoveredAgent {
                        metadata,
                        last_seen: now,
                        network_info,
                        health_status: HealthStatus::Healthy,
                    },
                );
                Upsert::Created
            }
        }
    }

    /// Refresh an existing entry from a heartbeat. Unknown agents are not
    /// created; returns false in that case.
    pub fn refresh(&self, agent_id: &str, health: HealthStatus, now: DateTime<Utc>) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        match agents.get_mut(agent_id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.health_status = health;
                true
            }
            None => false,
        }
    }

    /// Remove an agent entirely.
    pub fn remove(&self, agent_id: &str) -> Option<DiscoveredAgent> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.remove(agent_id)
    }

    /// Get a snapshot of a specific agent.
    pub fn get(&self, agent_id: &str) -> Option<DiscoveredAgent> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.get(agent_id).cloned()
    }

    /// Get all discovered agents.
    pub fn all(&self) -> Vec<DiscoveredAgent> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.values().cloned().collect()
    }

    /// Agents offering every requested capability (all agents if empty).
    pub fn find_by_capabilities<S: AsRef<str>>(&self, requested: &[S]) -> Vec<DiscoveredAgent> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .values()
            .filter(|a| a.metadata.has_capabilities(requested))
            .cloned()
            .collect()
    }

    /// Remove and return every entry older than `ttl`.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<DiscoveredAgent> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = agents
            .values()
            .filter(|a| a.is_expired(now, ttl))
            .map(|a| a.metadata.id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| agents.remove(&id))
            .collect()
    }

    /// Number of discovered agents.
    pub fn len(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_agent(id: &str, caps: &[&str]) -> AgentMetadata {
        AgentMetadata::new(id, format!("{id}-name"), caps.iter().map(|s| s.to_string()).collect())
    }

    fn net() -> NetworkInfo {
        NetworkInfo {
            ip: "192.168.1.20".parse().unwrap(),
            port: 8080,
            hostname: "host-a".to_string(),
        }
    }

    #[test]
    fn test_upsert_creates_then_refreshes() {
        let registry = AgentRegistry::new();
        let t0 = Utc::now();
        assert_eq!(registry.upsert(make_agent("a1", &["translate"]), net(), t0), Upsert::Created);

        let t1 = t0 + chrono::Duration::seconds(5);
        assert_eq!(registry.upsert(make_agent("a1", &["translate"]), net(), t1), Upsert::Refreshed);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a1").unwrap().last_seen, t1);
    }

    #[test]
    fn test_refresh_never_creates() {
        let registry = AgentRegistry::new();
        assert!(!registry.refresh("ghost", HealthStatus::Healthy, Utc::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_heartbeat_refreshes_once() {
        let registry = AgentRegistry::new();
        let t0 = Utc::now();
        registry.upsert(make_agent("a1", &["translate"]), net(), t0);

        let t1 = t0 + chrono::Duration::seconds(30);
        assert!(registry.refresh("a1", HealthStatus::Degraded, t1));
        assert!(registry.refresh("a1", HealthStatus::Degraded, t1));
        assert_eq!(registry.len(), 1);
        let entry = registry.get("a1").unwrap();
        assert_eq!(entry.last_seen, t1);
        assert_eq!(entry.health_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_find_by_capabilities() {
        let registry = AgentRegistry::new();
        let now = Utc::now();
        registry.upsert(make_agent("a1", &["translate", "summarize"]), net(), now);
        registry.upsert(make_agent("a2", &["translate"]), net(), now);
        registry.upsert(make_agent("a3", &["ocr"]), net(), now);

        assert_eq!(registry.find_by_capabilities(&["translate"]).len(), 2);
        assert_eq!(registry.find_by_capabilities(&["translate", "summarize"]).len(), 1);
        assert_eq!(registry.find_by_capabilities::<&str>(&[]).len(), 3);
        assert!(registry.find_by_capabilities(&["missing"]).is_empty());
    }

    #[test]
    fn test_sweep_expired() {
        let registry = AgentRegistry::new();
        let t0 = Utc::now();
        registry.upsert(make_agent("old", &["x"]), net(), t0);
        registry.upsert(make_agent("fresh", &["x"]), net(), t0 + chrono::Duration::seconds(80));

        let now = t0 + chrono::Duration::seconds(91);
        let expired = registry.sweep_expired(now, Duration::from_secs(90));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), "old");
        assert!(registry.get("old").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn test_converges_after_goodbye() {
        let registry = AgentRegistry::new();
        let now = Utc::now();
        registry.upsert(make_agent("a1", &["x"]), net(), now);
        registry.refresh("a1", HealthStatus::Healthy, now);
        assert!(registry.remove("a1").is_some());
        assert!(registry.remove("a1").is_none());
        assert!(!registry.refresh("a1", HealthStatus::Healthy, now));
        assert!(registry.is_empty());
    }
}
