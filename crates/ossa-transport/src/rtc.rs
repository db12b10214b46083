//! WebRTC data-channel transport.
//!
//! One [`WebRtcTransport`] links the local agent to one remote agent. The
//! offering side opens the `control` channel; envelopes travel on it by
//! default, and further channels can be added with
//! [`WebRtcTransport::create_channel`].
//!
//! Negotiation runs over a [`SignalingChannel`]. A pump task started by
//! [`WebRtcTransport::new`] applies every offer, answer and ICE candidate the
//! remote agent sends. Local candidates are trickled to the remote as they
//! are gathered. Remote candidates that arrive before a remote description is
//! applied are buffered and applied afterwards.

use crate::chunk::chunk_envelope;
use crate::envelope::{MessageType, SendOptions, TransportMessage};
use crate::error::TransportError;
use crate::event::{PeerState, TransportEvent};
use crate::rpc::{Reply, RpcCore, SendMode, Transport};
use crate::signaling::{IceCandidate, SignalingBody, SignalingChannel, SignalingMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use ossa_types::config::{RpcConfig, WebRtcSettings};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the channel opened by the offering side.
pub const CONTROL_CHANNEL: &str = "control";

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

#[derive(Default)]
struct IceState {
    remote_description_set: bool,
    pending: Vec<IceCandidate>,
}

struct Inner {
    remote_id: String,
    settings: WebRtcSettings,
    rpc: RpcCore,
    signaling: Arc<dyn SignalingChannel>,
    pc: Arc<RTCPeerConnection>,
    channels: DashMap<String, Arc<RTCDataChannel>>,
    open_channels: watch::Sender<BTreeSet<String>>,
    state: watch::Sender<PeerState>,
    ice: Mutex<IceState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Envelope transport over WebRTC data channels to one remote agent.
pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

impl WebRtcTransport {
    /// Create a peer connection to `remote_id` and start applying the
    /// signaling messages it sends. The local identity is the signaling
    /// channel's id.
    pub async fn new(
        remote_id: impl Into<String>,
        signaling: Arc<dyn SignalingChannel>,
        settings: WebRtcSettings,
        rpc: RpcConfig,
    ) -> Result<Self, TransportError> {
        let api = build_api(&settings);
        let config = RTCConfiguration {
            ice_servers: ice_servers(&settings),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (state, _) = watch::channel(PeerState::New);
        let (open_channels, _) = watch::channel(BTreeSet::new());
        let inner = Arc::new(Inner {
            remote_id: remote_id.into(),
            settings,
            rpc: RpcCore::new(signaling.local_id(), rpc),
            signaling,
            pc,
            channels: DashMap::new(),
            open_channels,
            state,
            ice: Mutex::new(IceState::default()),
            pump: Mutex::new(None),
        });

        install_callbacks(&inner);
        let pump = tokio::spawn(signaling_pump(
            Arc::downgrade(&inner),
            Arc::clone(&inner.signaling),
        ));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);

        debug!(
            agent_id = %inner.rpc.agent_id(),
            peer = %inner.remote_id,
            "WebRTC: peer connection created"
        );
        Ok(Self { inner })
    }

    pub fn remote_id(&self) -> &str {
        &self.inner.remote_id
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.borrow()
    }

    /// Labels of channels currently open.
    pub fn open_channels(&self) -> BTreeSet<String> {
        self.inner.open_channels.borrow().clone()
    }

    /// Open the `control` channel, apply a local offer and send it to the
    /// remote agent. Returns the offer SDP.
    pub async fn create_offer(&self) -> Result<String, TransportError> {
        let inner = &self.inner;
        if !inner.channels.contains_key(CONTROL_CHANNEL) {
            let dc = inner.pc.create_data_channel(CONTROL_CHANNEL, None).await?;
            attach_channel(inner, dc);
        }

        let offer = inner.pc.create_offer(None).await?;
        inner.pc.set_local_description(offer.clone()).await?;
        inner.set_state(PeerState::HaveLocalOffer);

        inner
            .signal(SignalingBody::Offer {
                sdp: offer.sdp.clone(),
            })
            .await?;
        info!(peer = %inner.remote_id, "WebRTC: offer sent");
        Ok(offer.sdp)
    }

    /// Apply a remote offer and send back an answer. Returns the answer SDP.
    ///
    /// Only needed when offers arrive outside the signaling channel; the
    /// pump calls this for offers it receives.
    pub async fn handle_offer(&self, sdp: String) -> Result<String, TransportError> {
        self.inner.handle_offer(sdp).await
    }

    /// Apply the remote answer to our offer.
    pub async fn handle_answer(&self, sdp: String) -> Result<(), TransportError> {
        self.inner.handle_answer(sdp).await
    }

    /// Apply a remote ICE candidate, or buffer it until a remote description
    /// is set.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.inner.add_ice_candidate(candidate).await
    }

    /// Open an additional data channel.
    pub async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        if self.inner.channels.contains_key(label) {
            return Ok(());
        }
        let dc = self.inner.pc.create_data_channel(label, None).await?;
        attach_channel(&self.inner, dc);
        Ok(())
    }

    /// Send an envelope on a specific channel. Returns its id.
    pub async fn send_on(&self, label: &str, kind: MessageType, payload: Value) -> Result<String, TransportError> {
        let envelope = self.inner.rpc.envelope(kind, payload, &SendOptions::default());
        let id = envelope.id.clone();
        self.inner.send_on(label, &envelope).await?;
        Ok(id)
    }

    /// Wait until the peer connection reaches `target`.
    pub async fn wait_for_state(&self, target: PeerState, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.inner.state.subscribe();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::NotConnected),
        };
        reached
    }

    /// Wait until the channel `label` is open.
    pub async fn wait_for_channel(&self, label: &str, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.inner.open_channels.subscribe();
        let opened = match tokio::time::timeout(timeout, rx.wait_for(|open| open.contains(label))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::ChannelNotOpen(label.to_string())),
        };
        opened
    }

    /// Close every data channel, then the peer connection. Pending calls
    /// are rejected immediately.
    pub async fn close(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        if let Some(pump) = inner.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        inner.rpc.reject_all();

        let channels: Vec<Arc<RTCDataChannel>> = inner
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        inner.channels.clear();
        for dc in channels {
            if let Err(e) = dc.close().await {
                debug!(label = dc.label(), error = %e, "WebRTC: channel close failed");
            }
        }
        inner.open_channels.send_replace(BTreeSet::new());

        inner.pc.close().await?;
        inner.set_state(PeerState::Closed);
        info!(peer = %inner.remote_id, "WebRTC: closed");
        Ok(())
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn rpc(&self) -> &RpcCore {
        &self.inner.rpc
    }

    /// Data channels do not queue; every send needs an open `control`.
    async fn send_envelope(&self, envelope: TransportMessage, _mode: SendMode) -> Result<(), TransportError> {
        self.inner.send_on(CONTROL_CHANNEL, &envelope).await
    }
}

impl Inner {
    fn set_state(&self, state: PeerState) {
        self.transition(|_| Some(state));
    }

    /// Mark negotiation done unless ICE has already moved the state on.
    fn mark_negotiated(&self) {
        self.transition(|current| {
            matches!(current, PeerState::HaveLocalOffer | PeerState::HaveRemoteOffer)
                .then_some(PeerState::Negotiated)
        });
    }

    /// Apply `next` to the current state atomically; emits on change.
    fn transition(&self, next: impl FnOnce(PeerState) -> Option<PeerState>) {
        let mut changed_to = None;
        self.state.send_if_modified(|current| match next(*current) {
            Some(state) if state != *current => {
                *current = state;
                changed_to = Some(state);
                true
            }
            _ => false,
        });
        if let Some(state) = changed_to {
            debug!(peer = %self.remote_id, %state, "WebRTC: state change");
            self.rpc.emit(TransportEvent::ConnectionStateChange {
                peer_id: self.remote_id.clone(),
                state,
            });
        }
    }

    async fn signal(&self, body: SignalingBody) -> Result<(), TransportError> {
        let msg = SignalingMessage::new(self.rpc.agent_id(), self.remote_id.as_str(), body);
        self.signaling.send(msg).await?;
        Ok(())
    }

    async fn handle_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        self.set_state(PeerState::HaveRemoteOffer);
        self.apply_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.mark_negotiated();

        self.signal(SignalingBody::Answer {
            sdp: answer.sdp.clone(),
        })
        .await?;
        info!(peer = %self.remote_id, "WebRTC: answer sent");
        Ok(answer.sdp)
    }

    async fn handle_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        self.mark_negotiated();
        self.apply_pending_candidates().await;
        info!(peer = %self.remote_id, "WebRTC: answer applied");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut ice = self.ice.lock().unwrap_or_else(|e| e.into_inner());
            if !ice.remote_description_set {
                ice.pending.push(candidate);
                debug!(peer = %self.remote_id, buffered = ice.pending.len(), "WebRTC: buffering early ICE candidate");
                return Ok(());
            }
        }
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn apply_pending_candidates(&self) {
        let pending = {
            let mut ice = self.ice.lock().unwrap_or_else(|e| e.into_inner());
            ice.remote_description_set = true;
            std::mem::take(&mut ice.pending)
        };
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate.into()).await {
                warn!(peer = %self.remote_id, error = %e, "WebRTC: buffered ICE candidate rejected");
            }
        }
    }

    async fn send_on(&self, label: &str, envelope: &TransportMessage) -> Result<(), TransportError> {
        let dc = self
            .channels
            .get(label)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .ok_or_else(|| TransportError::ChannelNotOpen(label.to_string()))?;

        for frame in chunk_envelope(envelope, self.settings.max_message_bytes)? {
            dc.send_text(frame).await?;
        }
        Ok(())
    }
}

fn build_api(settings: &WebRtcSettings) -> API {
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_include_loopback_candidate(settings.include_loopback_candidates);
    APIBuilder::new().with_setting_engine(setting_engine).build()
}

fn ice_servers(settings: &WebRtcSettings) -> Vec<RTCIceServer> {
    if settings.ice_servers.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: settings.ice_servers.clone(),
        ..Default::default()
    }]
}

fn install_callbacks(inner: &Arc<Inner>) {
    let weak = Arc::downgrade(inner);
    inner
        .pc
        .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let (Some(inner), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let body = SignalingBody::IceCandidate {
                            candidate: init.into(),
                        };
                        if let Err(e) = inner.signal(body).await {
                            warn!(peer = %inner.remote_id, error = %e, "WebRTC: failed to send ICE candidate");
                        }
                    }
                    Err(e) => warn!(error = %e, "WebRTC: failed to serialize ICE candidate"),
                }
            })
        }));

    let weak = Arc::downgrade(inner);
    inner
        .pc
        .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let state = match state {
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerState::Failed,
                    RTCPeerConnectionState::Closed => PeerState::Closed,
                    _ => return,
                };
                inner.set_state(state);
                if matches!(state, PeerState::Failed | PeerState::Closed) {
                    inner.rpc.reject_all();
                }
            })
        }));

    let weak = Arc::downgrade(inner);
    inner
        .pc
        .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    attach_channel(&inner, dc);
                }
            })
        }));
}

fn attach_channel(inner: &Arc<Inner>, dc: Arc<RTCDataChannel>) {
    let label = dc.label().to_string();
    debug!(peer = %inner.remote_id, %label, "WebRTC: data channel attached");

    let weak = Arc::downgrade(inner);
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let weak = weak.clone();
        let label = open_label.clone();
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                info!(peer = %inner.remote_id, %label, "WebRTC: data channel open");
                inner.open_channels.send_modify(|open| {
                    open.insert(label);
                });
            }
        })
    }));

    let weak = Arc::downgrade(inner);
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let weak = weak.clone();
        let label = close_label.clone();
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                debug!(peer = %inner.remote_id, %label, "WebRTC: data channel closed");
                inner.open_channels.send_modify(|open| {
                    open.remove(&label);
                });
            }
        })
    }));

    let weak = Arc::downgrade(inner);
    let message_label = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let weak = weak.clone();
        let label = message_label.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => handle_frame(&inner, &label, &text).await,
                Err(_) => debug!(%label, "WebRTC: ignoring non-UTF-8 message"),
            }
        })
    }));

    inner.channels.insert(label, dc);
}

/// Replies go back on the channel the frame arrived on.
async fn handle_frame(inner: &Arc<Inner>, label: &str, text: &str) {
    for reply in inner.rpc.on_frame(text) {
        match reply {
            Reply::Send(envelope) => {
                if let Err(e) = inner.send_on(label, &envelope).await {
                    debug!(%label, error = %e, "WebRTC: failed to send reply");
                }
            }
            Reply::Answer { handler, call } => {
                let inner = Arc::clone(inner);
                let label = label.to_string();
                tokio::spawn(async move {
                    let response = inner.rpc.answer_call(handler.as_ref(), &call).await;
                    if let Err(e) = inner.send_on(&label, &response).await {
                        warn!(%label, error = %e, "WebRTC: failed to answer capability call");
                    }
                });
            }
        }
    }
}

async fn signaling_pump(weak: Weak<Inner>, signaling: Arc<dyn SignalingChannel>) {
    while let Some(msg) = signaling.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if msg.from != inner.remote_id {
            debug!(from = %msg.from, expected = %inner.remote_id, "WebRTC: ignoring signaling from other agent");
            continue;
        }

        let result = match msg.body {
            SignalingBody::Offer { sdp } => inner.handle_offer(sdp).await.map(|_| ()),
            SignalingBody::Answer { sdp } => inner.handle_answer(sdp).await,
            SignalingBody::IceCandidate { candidate } => inner.add_ice_candidate(candidate).await,
        };
        if let Err(e) = result {
            warn!(peer = %inner.remote_id, error = %e, "WebRTC: signaling message failed");
            inner.rpc.emit(TransportEvent::Error(e.to_string()));
        }
    }
    debug!("WebRTC: signaling pump stopped");
}
