//! UadpDiscoveryService: multicast presence and capability discovery.
//!
//! On start the service binds the UADP port, joins the multicast group and
//! announces its [`AgentMetadata`]. Three background tasks then run until
//! [`UadpDiscoveryService::stop`]:
//!
//! - the receive loop, which applies incoming datagrams to the registry and
//!   answers matching queries by unicast;
//! - the heartbeat loop, which multicasts health and uptime;
//! - the sweep loop, which removes agents not seen within the TTL.
//!
//! Outgoing datagrams leave from a separate ephemeral socket so that query
//! responses reach the querying agent even when several agents share a host.

use crate::error::DiscoveryError;
use crate::message::*;
use crate::registry::{AgentRegistry, DiscoveredAgent, NetworkInfo, Upsert};
use crate::signing;
use chrono::{DateTime, Utc};
use ossa_types::config::DiscoveryConfig;
use ossa_types::AgentMetadata;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pause after a failed `recv_from` so a persistent socket error cannot spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Events emitted by the discovery service.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// The service joined the group and announced itself.
    Started { agent_id: String },
    /// The service said goodbye and left the group.
    Stopped { agent_id: String },
    /// A new agent announced itself or answered a query.
    AgentDiscovered(DiscoveredAgent),
    /// An agent sent goodbye.
    AgentLeft { agent_id: String },
    /// An agent was not seen within the TTL and was removed.
    AgentTimeout(DiscoveredAgent),
}

impl DiscoveryEvent {
    /// Event name as exposed to orchestration code.
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::Started { .. } => "started",
            DiscoveryEvent::Stopped { .. } => "stopped",
            DiscoveryEvent::AgentDiscovered(_) => "agent_discovered",
            DiscoveryEvent::AgentLeft { .. } => "agent_left",
            DiscoveryEvent::AgentTimeout(_) => "agent_timeout",
        }
    }
}

/// Datagram counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub received: u64,
    pub sent: u64,
    pub send_errors: u64,
    /// Datagrams that were not valid UADP JSON.
    pub dropped_malformed: u64,
    /// Datagrams with a missing or invalid signature (signed mode only).
    pub dropped_unsigned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unsigned: AtomicU64,
}

/// The group socket receives multicast; the unicast socket sends everything
/// and receives query responses.
struct Sockets {
    group: UdpSocket,
    unicast: UdpSocket,
}

struct Running {
    sockets: Arc<Sockets>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    metadata: AgentMetadata,
    config: DiscoveryConfig,
    registry: AgentRegistry,
    events: broadcast::Sender<DiscoveryEvent>,
    health: Mutex<HealthStatus>,
    counters: Counters,
    running: tokio::sync::Mutex<Option<Running>>,
}

/// LAN presence announcement and capability-based peer discovery.
pub struct UadpDiscoveryService {
    inner: Arc<Inner>,
}

impl UadpDiscoveryService {
    /// Create a stopped service for the given agent.
    pub fn new(metadata: AgentMetadata, config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                metadata,
                config,
                registry: AgentRegistry::new(),
                events,
                health: Mutex::new(HealthStatus::Healthy),
                counters: Counters::default(),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// The local agent id.
    pub fn agent_id(&self) -> &str {
        &self.inner.metadata.id
    }

    /// The metadata this service announces.
    pub fn metadata(&self) -> &AgentMetadata {
        &self.inner.metadata
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    /// The registry owned by this service.
    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    /// Whether `start` has succeeded and `stop` has not been called since.
    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Health reported in subsequent heartbeats.
    pub fn set_health_status(&self, status: HealthStatus) {
        *self.inner.health.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Snapshot of the datagram counters.
    pub fn stats(&self) -> DiscoveryStats {
        let c = &self.inner.counters;
        DiscoveryStats {
            received: c.received.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            dropped_malformed: c.dropped_malformed.load(Ordering::Relaxed),
            dropped_unsigned: c.dropped_unsigned.load(Ordering::Relaxed),
        }
    }

    /// Join the multicast group, announce, and start the background tasks.
    ///
    /// Fails if the metadata is unusable for discovery or if the socket cannot
    /// be bound or joined to the group.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        self.inner.metadata.validate_for_discovery()?;

        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let sockets = Arc::new(open_sockets(&self.inner.config)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started_at = Instant::now();

        info!(
            agent_id = %self.inner.metadata.id,
            group = %self.inner.config.multicast_group,
            port = self.inner.config.port,
            "UADP: discovery starting"
        );

        self.inner
            .multicast(&sockets, UadpBody::Announce(self.inner.advert()))
            .await;

        let tasks = vec![
            tokio::spawn(receive_loop(
                Arc::clone(&self.inner),
                Arc::clone(&sockets),
                shutdown_rx.clone(),
            )),
            tokio::spawn(heartbeat_loop(
                Arc::clone(&self.inner),
                Arc::clone(&sockets),
                shutdown_rx.clone(),
                started_at,
            )),
            tokio::spawn(sweep_loop(Arc::clone(&self.inner), shutdown_rx)),
        ];

        *running = Some(Running {
            sockets,
            shutdown: shutdown_tx,
            tasks,
        });
        drop(running);

        self.inner.emit(DiscoveryEvent::Started {
            agent_id: self.inner.metadata.id.clone(),
        });
        Ok(())
    }

    /// Say goodbye, leave the group and stop the background tasks.
    ///
    /// Does nothing if the service is not running.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };

        self.inner
            .multicast(
                &running.sockets,
                UadpBody::Goodbye(GoodbyePayload {
                    reason: Some("shutdown".to_string()),
                }),
            )
            .await;

        if let Err(e) = running
            .sockets
            .group
            .leave_multicast_v4(self.inner.config.multicast_group, self.inner.config.interface)
        {
            warn!(error = %e, "UADP: failed to leave multicast group");
        }

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            let _ = task.await;
        }

        info!(agent_id = %self.inner.metadata.id, "UADP: discovery stopped");
        self.inner.emit(DiscoveryEvent::Stopped {
            agent_id: self.inner.metadata.id.clone(),
        });
    }

    /// Broadcast a capability query and return the currently known agents
    /// offering every requested capability (all agents if empty).
    ///
    /// Responses arrive asynchronously and land in the registry; use
    /// [`discover`](Self::discover) to wait for them.
    pub async fn query_agents(&self, capabilities: &[String]) -> Vec<DiscoveredAgent> {
        let sockets = self
            .inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.sockets));

        match sockets {
            Some(sockets) => {
                let query = UadpBody::Query(QueryPayload {
                    capabilities: capabilities.to_vec(),
                });
                self.inner.multicast(&sockets, query).await;
            }
            None => debug!("UADP: query while stopped, answering from registry only"),
        }

        self.inner.registry.find_by_capabilities(capabilities)
    }

    /// Broadcast a query, wait `window` for responses, then return matches.
    pub async fn discover(&self, capabilities: &[String], window: Duration) -> Vec<DiscoveredAgent> {
        self.query_agents(capabilities).await;
        tokio::time::sleep(window).await;
        self.inner.registry.find_by_capabilities(capabilities)
    }

    /// All agents currently in the registry.
    pub fn discovered_agents(&self) -> Vec<DiscoveredAgent> {
        self.inner.registry.all()
    }

    /// A single agent by id.
    pub fn agent(&self, agent_id: &str) -> Option<DiscoveredAgent> {
        self.inner.registry.get(agent_id)
    }
}

impl Inner {
    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn health(&self) -> HealthStatus {
        *self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn heartbeat_interval(&self) -> Duration {
        self.config
            .heartbeat_interval_secs
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or_else(|| self.metadata.heartbeat_interval())
    }

    fn advert(&self) -> AgentAdvert {
        AgentAdvert {
            agent: self.metadata.clone(),
            endpoint: AdvertisedEndpoint {
                port: self.config.advertised_port,
                hostname: self.config.hostname.clone(),
            },
        }
    }

    /// Build, sign and encode an outgoing datagram.
    fn encode(&self, body: UadpBody) -> Option<Vec<u8>> {
        let mut msg = UadpMessage::new(self.metadata.id.clone(), body);
        let result = match &self.config.shared_secret {
            Some(secret) => signing::sign(&mut msg, secret).and_then(|_| encode_message(&msg)),
            None => encode_message(&msg),
        };
        match result {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "UADP: failed to encode message");
                None
            }
        }
    }

    async fn multicast(&self, sockets: &Sockets, body: UadpBody) {
        let dest = SocketAddrV4::new(self.config.multicast_group, self.config.port);
        self.send_to(sockets, body, SocketAddr::V4(dest)).await;
    }

    async fn send_to(&self, sockets: &Sockets, body: UadpBody, dest: SocketAddr) {
        let message_type = body.message_type();
        let Some(bytes) = self.encode(body) else {
            return;
        };
        match sockets.unicast.send_to(&bytes, dest).await {
            Ok(n) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!(message_type, %dest, bytes = n, "UADP: sent");
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(message_type, %dest, error = %e, "UADP: send failed");
            }
        }
    }

    /// Decode and apply one datagram. Returns a reply to unicast back to
    /// `src`, if any.
    fn handle_datagram(&self, bytes: &[u8], src: SocketAddr, now: DateTime<Utc>) -> Option<UadpBody> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let msg = match decode_message(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                debug!(%src, error = %e, "UADP: dropping malformed datagram");
                return None;
            }
        };

        if let Some(secret) = &self.config.shared_secret {
            if !signing::verify(&msg, secret) {
                self.counters.dropped_unsigned.fetch_add(1, Ordering::Relaxed);
                debug!(%src, agent_id = %msg.agent_id, "UADP: dropping datagram with bad signature");
                return None;
            }
        }

        self.handle_message(msg, src, now)
    }

    fn handle_message(&self, msg: UadpMessage, src: SocketAddr, now: DateTime<Utc>) -> Option<UadpBody> {
        if msg.agent_id == self.metadata.id {
            trace!("UADP: ignoring own message");
            return None;
        }

        match msg.body {
            UadpBody::Announce(advert) | UadpBody::Response(advert) => {
                self.record_advert(&msg.agent_id, advert, src, now);
                None
            }
            UadpBody::Heartbeat(heartbeat) => {
                if !self
                    .registry
                    .refresh(&msg.agent_id, heartbeat.health_status, now)
                {
                    trace!(agent_id = %msg.agent_id, "UADP: heartbeat from unknown agent ignored");
                }
                None
            }
            UadpBody::Query(query) => {
                if self.metadata.has_capabilities(&query.capabilities) {
                    debug!(
                        from = %msg.agent_id,
                        capabilities = ?query.capabilities,
                        "UADP: answering query"
                    );
                    Some(UadpBody::Response(self.advert()))
                } else {
                    None
                }
            }
            UadpBody::Goodbye(goodbye) => {
                if self.registry.remove(&msg.agent_id).is_some() {
                    info!(
                        agent_id = %msg.agent_id,
                        reason = goodbye.reason.as_deref().unwrap_or(""),
                        "UADP: agent left"
                    );
                    self.emit(DiscoveryEvent::AgentLeft {
                        agent_id: msg.agent_id,
                    });
                }
                None
            }
        }
    }

    fn record_advert(&self, sender: &str, advert: AgentAdvert, src: SocketAddr, now: DateTime<Utc>) {
        if advert.agent.id != sender {
            debug!(
                sender,
                advertised = %advert.agent.id,
                "UADP: advert does not match sender id, ignoring"
            );
            return;
        }

        let network_info = NetworkInfo {
            ip: src.ip(),
            port: advert.endpoint.port.unwrap_or(src.port()),
            hostname: advert
                .endpoint
                .hostname
                .clone()
                .unwrap_or_else(|| src.ip().to_string()),
        };

        match self.registry.upsert(advert.agent, network_info, now) {
            Upsert::Created => {
                if let Some(entry) = self.registry.get(sender) {
                    info!(
                        agent_id = sender,
                        name = %entry.metadata.name,
                        addr = %src,
                        "UADP: agent discovered"
                    );
                    self.emit(DiscoveryEvent::AgentDiscovered(entry));
                }
            }
            Upsert::Refreshed => trace!(agent_id = sender, "UADP: agent refreshed"),
        }
    }

    fn sweep(&self, now: DateTime<Utc>) {
        for entry in self.registry.sweep_expired(now, self.config.ttl()) {
            info!(
                agent_id = %entry.metadata.id,
                last_seen = %entry.last_seen,
                "UADP: agent timed out"
            );
            self.emit(DiscoveryEvent::AgentTimeout(entry));
        }
    }

    async fn on_datagram(&self, sockets: &Sockets, bytes: &[u8], src: SocketAddr) {
        if let Some(reply) = self.handle_datagram(bytes, src, Utc::now()) {
            self.send_to(sockets, reply, src).await;
        }
    }
}

async fn receive_loop(inner: Arc<Inner>, sockets: Arc<Sockets>, mut shutdown: watch::Receiver<bool>) {
    let mut group_buf = vec![0u8; inner.config.max_datagram_bytes];
    let mut unicast_buf = vec![0u8; inner.config.max_datagram_bytes];

    loop {
        tokio::select! {
            result = sockets.group.recv_from(&mut group_buf) => match result {
                Ok((len, src)) => inner.on_datagram(&sockets, &group_buf[..len], src).await,
                Err(e) => {
                    warn!(error = %e, "UADP: multicast recv failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            },
            result = sockets.unicast.recv_from(&mut unicast_buf) => match result {
                Ok((len, src)) => inner.on_datagram(&sockets, &unicast_buf[..len], src).await,
                Err(e) => {
                    warn!(error = %e, "UADP: unicast recv failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("UADP: receive loop stopped");
}

async fn heartbeat_loop(
    inner: Arc<Inner>,
    sockets: Arc<Sockets>,
    mut shutdown: watch::Receiver<bool>,
    started_at: Instant,
) {
    let period = inner.heartbeat_interval();
    // The announce already went out; first heartbeat one period later.
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let heartbeat = UadpBody::Heartbeat(HeartbeatPayload {
                    health_status: inner.health(),
                    uptime_secs: started_at.elapsed().as_secs(),
                });
                inner.multicast(&sockets, heartbeat).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.sweep_interval();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = interval.tick() => inner.sweep(Utc::now()),
            _ = shutdown.changed() => break,
        }
    }
}

fn open_sockets(config: &DiscoveryConfig) -> Result<Sockets, DiscoveryError> {
    let group = make_group_socket(config)?;
    let unicast = make_unicast_socket(config)?;
    Ok(Sockets {
        group: UdpSocket::from_std(group).map_err(DiscoveryError::Socket)?,
        unicast: UdpSocket::from_std(unicast).map_err(DiscoveryError::Socket)?,
    })
}

/// Create a UDP socket bound to the UADP port and joined to the group.
fn make_group_socket(config: &DiscoveryConfig) -> Result<std::net::UdpSocket, DiscoveryError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoveryError::Socket)?;

    // Several agents on one host share the port.
    socket.set_reuse_address(true).map_err(DiscoveryError::Socket)?;
    socket.set_nonblocking(true).map_err(DiscoveryError::Socket)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket
        .bind(&bind_addr.into())
        .map_err(|source| DiscoveryError::Bind {
            addr: SocketAddr::V4(bind_addr),
            source,
        })?;

    socket
        .join_multicast_v4(&config.multicast_group, &config.interface)
        .map_err(|source| DiscoveryError::JoinGroup {
            group: config.multicast_group,
            interface: config.interface,
            source,
        })?;

    Ok(socket.into())
}

/// Create the ephemeral socket used for every outgoing datagram.
fn make_unicast_socket(config: &DiscoveryConfig) -> Result<std::net::UdpSocket, DiscoveryError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoveryError::Socket)?;

    socket.set_nonblocking(true).map_err(DiscoveryError::Socket)?;
    let bind_addr = SocketAddrV4::new(config.interface, 0);
    socket
        .bind(&bind_addr.into())
        .map_err(|source| DiscoveryError::Bind {
            addr: SocketAddr::V4(bind_addr),
            source,
        })?;

    socket
        .set_multicast_loop_v4(config.multicast_loop)
        .map_err(DiscoveryError::Socket)?;
    socket
        .set_multicast_ttl_v4(config.multicast_ttl)
        .map_err(DiscoveryError::Socket)?;
    if !config.interface.is_unspecified() {
        socket
            .set_multicast_if_v4(&config.interface)
            .map_err(DiscoveryError::Socket)?;
    }

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ossa_types::MetadataError;

    fn service(id: &str, caps: &[&str]) -> UadpDiscoveryService {
        service_with(id, caps, DiscoveryConfig::default())
    }

    fn service_with(id: &str, caps: &[&str], config: DiscoveryConfig) -> UadpDiscoveryService {
        let meta = AgentMetadata::new(id, format!("{id}-name"), caps.iter().map(|s| s.to_string()).collect());
        UadpDiscoveryService::new(meta, config)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn announce(svc: &UadpDiscoveryService) -> Vec<u8> {
        svc.inner.encode(UadpBody::Announce(svc.inner.advert())).unwrap()
    }

    fn heartbeat(svc: &UadpDiscoveryService) -> Vec<u8> {
        svc.inner
            .encode(UadpBody::Heartbeat(HeartbeatPayload {
                health_status: HealthStatus::Healthy,
                uptime_secs: 1,
            }))
            .unwrap()
    }

    #[test]
    fn test_own_messages_ignored() {
        let a = service("agent-a", &["translate"]);
        let now = Utc::now();
        assert!(a.inner.handle_datagram(&announce(&a), addr("10.0.0.1:1900"), now).is_none());
        let query = a
            .inner
            .encode(UadpBody::Query(QueryPayload::default()))
            .unwrap();
        assert!(a.inner.handle_datagram(&query, addr("10.0.0.1:1900"), now).is_none());
        assert!(a.agent("agent-a").is_none());
        assert!(a.discovered_agents().is_empty());
    }

    #[test]
    fn test_announce_creates_and_emits() {
        let a = service("agent-a", &["translate"]);
        let b = service("agent-b", &["search"]);
        let mut events = b.subscribe();

        b.inner.handle_datagram(&announce(&a), addr("10.0.0.1:40001"), Utc::now());

        let entry = b.agent("agent-a").unwrap();
        assert_eq!(entry.network_info.ip.to_string(), "10.0.0.1");
        assert_eq!(entry.network_info.port, 40001);
        assert_eq!(entry.network_info.hostname, "10.0.0.1");
        match events.try_recv().unwrap() {
            DiscoveryEvent::AgentDiscovered(agent) => assert_eq!(agent.id(), "agent-a"),
            other => panic!("Expected AgentDiscovered, got {other:?}"),
        }

        // A second announce refreshes silently.
        b.inner.handle_datagram(&announce(&a), addr("10.0.0.1:40001"), Utc::now());
        assert!(events.try_recv().is_err());
        assert_eq!(b.discovered_agents().len(), 1);
    }

    #[test]
    fn test_advertised_endpoint_preferred() {
        let config = DiscoveryConfig {
            advertised_port: Some(8443),
            hostname: Some("translator.local".into()),
            ..DiscoveryConfig::default()
        };
        let a = service_with("agent-a", &["translate"], config);
        let b = service("agent-b", &["search"]);
        b.inner.handle_datagram(&announce(&a), addr("10.0.0.1:40001"), Utc::now());
        let entry = b.agent("agent-a").unwrap();
        assert_eq!(entry.network_info.port, 8443);
        assert_eq!(entry.network_info.hostname, "translator.local");
    }

    #[test]
    fn test_heartbeat_requires_prior_announce() {
        let a = service("agent-a", &["translate"]);
        let b = service("agent-b", &["search"]);
        let src = addr("10.0.0.1:40001");
        let t0 = Utc::now();

        b.inner.handle_datagram(&heartbeat(&a), src, t0);
        assert!(b.agent("agent-a").is_none());

        b.inner.handle_datagram(&announce(&a), src, t0);
        let t1 = t0 + chrono::Duration::seconds(30);
        b.inner.handle_datagram(&heartbeat(&a), src, t1);
        b.inner.handle_datagram(&heartbeat(&a), src, t1);
        assert_eq!(b.discovered_agents().len(), 1);
        assert_eq!(b.agent("agent-a").unwrap().last_seen, t1);
    }

    #[test]
    fn test_goodbye_removes_and_emits() {
        let a = service("agent-a", &["translate"]);
        let b = service("agent-b", &["search"]);
        let src = addr("10.0.0.1:40001");
        b.inner.handle_datagram(&announce(&a), src, Utc::now());
        let mut events = b.subscribe();

        let goodbye = a
            .inner
            .encode(UadpBody::Goodbye(GoodbyePayload::default()))
            .unwrap();
        b.inner.handle_datagram(&goodbye, src, Utc::now());

        assert!(b.agent("agent-a").is_none());
        match events.try_recv().unwrap() {
            DiscoveryEvent::AgentLeft { agent_id } => assert_eq!(agent_id, "agent-a"),
            other => panic!("Expected AgentLeft, got {other:?}"),
        }

        // A late heartbeat does not resurrect the entry.
        b.inner.handle_datagram(&heartbeat(&a), src, Utc::now());
        assert!(b.agent("agent-a").is_none());
    }

    #[test]
    fn test_query_answered_only_on_superset() {
        let a = service("agent-a", &["translate", "summarize"]);
        let b = service("agent-b", &["search"]);
        let src = addr("10.0.0.2:40002");
        let now = Utc::now();

        let query = |caps: &[&str]| {
            b.inner
                .encode(UadpBody::Query(QueryPayload {
                    capabilities: caps.iter().map(|s| s.to_string()).collect(),
                }))
                .unwrap()
        };

        assert!(matches!(
            a.inner.handle_datagram(&query(&["translate"]), src, now),
            Some(UadpBody::Response(_))
        ));
        assert!(a.inner.handle_datagram(&query(&["translate", "summarize"]), src, now).is_some());
        assert!(a.inner.handle_datagram(&query(&[]), src, now).is_some());
        assert!(a.inner.handle_datagram(&query(&["translate", "ocr"]), src, now).is_none());
    }

    #[test]
    fn test_query_response_scenario() {
        let a = service("agent-a", &["translate"]);
        let b = service("agent-b", &["search"]);
        let addr_a = addr("10.0.0.1:40001");
        let addr_b = addr("10.0.0.2:40002");
        let mut events = b.subscribe();

        let query = b
            .inner
            .encode(UadpBody::Query(QueryPayload {
                capabilities: vec!["translate".into()],
            }))
            .unwrap();
        let reply = a
            .inner
            .handle_datagram(&query, addr_b, Utc::now())
            .expect("agent-a should answer");
        let reply_bytes = a.inner.encode(reply).unwrap();
        assert!(b.inner.handle_datagram(&reply_bytes, addr_a, Utc::now()).is_none());

        let found = b.registry().find_by_capabilities(&["translate"]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "agent-a");
        assert!(matches!(
            events.try_recv().unwrap(),
            DiscoveryEvent::AgentDiscovered(_)
        ));
    }

    #[test]
    fn test_malformed_datagrams_dropped() {
        let b = service("agent-b", &["search"]);
        let src = addr("10.0.0.9:1900");
        assert!(b.inner.handle_datagram(b"M-SEARCH * HTTP/1.1\r\n", src, Utc::now()).is_none());
        assert!(b.inner.handle_datagram(br#"{"message_type":"announce"}"#, src, Utc::now()).is_none());
        let stats = b.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped_malformed, 2);
        assert!(b.discovered_agents().is_empty());
    }

    #[test]
    fn test_mismatched_advert_ignored() {
        let a = service("agent-a", &["translate"]);
        let b = service("agent-b", &["search"]);
        let spoof = AgentMetadata::new("agent-z", "spoof", vec!["translate".into()]);
        let bytes = a
            .inner
            .encode(UadpBody::Announce(AgentAdvert {
                agent: spoof,
                endpoint: AdvertisedEndpoint::default(),
            }))
            .unwrap();
        b.inner.handle_datagram(&bytes, addr("10.0.0.1:40001"), Utc::now());
        assert!(b.discovered_agents().is_empty());
    }

    #[test]
    fn test_signed_mode() {
        let signed = DiscoveryConfig {
            shared_secret: Some("lan-secret".into()),
            ..DiscoveryConfig::default()
        };
        let a = service_with("agent-a", &["translate"], signed.clone());
        let b = service_with("agent-b", &["search"], signed);
        let unsigned = service("agent-c", &["ocr"]);
        let src = addr("10.0.0.1:40001");

        b.inner.handle_datagram(&announce(&unsigned), src, Utc::now());
        assert!(b.agent("agent-c").is_none());
        assert_eq!(b.stats().dropped_unsigned, 1);

        b.inner.handle_datagram(&announce(&a), src, Utc::now());
        assert!(b.agent("agent-a").is_some());
    }

    #[test]
    fn test_sweep_emits_timeout_not_left() {
        let a = service("agent-a", &["translate"]);
        let b = service("agent-b", &["search"]);
        let t0 = Utc::now();
        b.inner.handle_datagram(&announce(&a), addr("10.0.0.1:40001"), t0);
        let mut events = b.subscribe();

        b.inner.sweep(t0 + chrono::Duration::seconds(60));
        assert!(b.agent("agent-a").is_some());

        b.inner.sweep(t0 + chrono::Duration::seconds(91));
        assert!(b.agent("agent-a").is_none());
        match events.try_recv().unwrap() {
            DiscoveryEvent::AgentTimeout(agent) => assert_eq!(agent.id(), "agent-a"),
            other => panic!("Expected AgentTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_interval_override() {
        let a = service("agent-a", &["translate"]);
        assert_eq!(a.inner.heartbeat_interval(), Duration::from_secs(30));
        let b = service_with(
            "agent-b",
            &["search"],
            DiscoveryConfig {
                heartbeat_interval_secs: Some(5),
                ..DiscoveryConfig::default()
            },
        );
        assert_eq!(b.inner.heartbeat_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_rejects_missing_enabled_flag() {
        let mut meta = AgentMetadata::new("agent-a", "a", vec!["translate".into()]);
        meta.discovery.uadp.enabled = None;
        let svc = UadpDiscoveryService::new(meta, DiscoveryConfig::default());
        match svc.start().await {
            Err(DiscoveryError::Metadata(MetadataError::MissingField(field))) => {
                assert_eq!(field, "discovery.uadp.enabled")
            }
            other => panic!("Expected missing-field error, got {other:?}"),
        }
        assert!(!svc.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let svc = service("agent-a", &["translate"]);
        let mut events = svc.subscribe();
        svc.stop().await;
        assert!(events.try_recv().is_err());
        assert!(svc.query_agents(&[]).await.is_empty());
    }
}
