//! WebSocket transport.
//!
//! A client link to an agent endpoint. After every (re)connect the first
//! frame on the wire is a `register` envelope, followed by anything queued
//! while the link was down, in original order, followed by new sends.
//!
//! Plain sends issued while disconnected are queued. Sends that need the peer
//! now (ack waits, capability calls, responses) fail with `NotConnected`.
//! After an unexpected drop the link reconnects with exponential backoff
//! until [`WebSocketTransport::disconnect`] is called.

use crate::chunk::chunk_envelope;
use crate::envelope::{MessageType, SendOptions, TransportMessage};
use crate::error::TransportError;
use crate::event::TransportEvent;
use crate::rpc::{Reply, RpcCore, SendMode, Transport};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use ossa_types::config::{RpcConfig, WebSocketSettings};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a graceful close waits for the writer to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Open, with `register` already on the wire.
    Connected,
}

struct Outbound {
    /// Feeds the writer task of the current session.
    writer: Option<mpsc::UnboundedSender<Message>>,
    /// Plain sends issued while disconnected.
    queue: VecDeque<TransportMessage>,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Session {
    stream: SplitStream<WsStream>,
    writer: JoinHandle<()>,
}

enum SessionEnd {
    Requested,
    Dropped(String),
}

struct Inner {
    url: Url,
    capabilities: Vec<String>,
    settings: WebSocketSettings,
    rpc: RpcCore,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Outbound>,
    supervisor: Mutex<Option<Supervisor>>,
}

/// Envelope transport over a client WebSocket.
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl WebSocketTransport {
    /// Create a disconnected transport for `agent_id`. `capabilities` are
    /// announced in the `register` frame.
    pub fn new(
        url: &str,
        agent_id: impl Into<String>,
        capabilities: Vec<String>,
        settings: WebSocketSettings,
        rpc: RpcConfig,
    ) -> Result<Self, TransportError> {
        let url = Url::parse(url)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                capabilities,
                settings,
                rpc: RpcCore::new(agent_id, rpc),
                state,
                outbound: Mutex::new(Outbound {
                    writer: None,
                    queue: VecDeque::new(),
                }),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Envelopes waiting for the next connect.
    pub async fn queued_len(&self) -> usize {
        self.inner.outbound.lock().await.queue.len()
    }

    /// Open the socket. Resolves once the link is open and `register` plus
    /// any queued envelopes have been handed to the writer.
    ///
    /// A failed attempt is returned as an error, but with reconnect enabled
    /// the transport keeps retrying in the background and replays the queue
    /// once a later attempt succeeds.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut supervisor = self.inner.supervisor.lock().await;

        if let Some(existing) = supervisor.take() {
            if self.state() == ConnectionState::Connected && !existing.task.is_finished() {
                *supervisor = Some(existing);
                return Ok(());
            }
            // A reconnect loop is backing off; replace it with this attempt.
            let _ = existing.shutdown.send(true);
            let _ = existing.task.await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (session, result) = match open_socket(&self.inner).await {
            Ok(ws) => (Some(start_session(&self.inner, ws).await), Ok(())),
            Err(e) if self.inner.settings.reconnect.enabled => (None, Err(e)),
            Err(e) => return Err(e),
        };
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), session, shutdown_rx));

        *supervisor = Some(Supervisor {
            shutdown: shutdown_tx,
            task,
        });
        result
    }

    /// Close the socket and stop reconnecting. Pending calls and ack waits
    /// are rejected. Queued envelopes are kept for the next `connect`.
    pub async fn disconnect(&self) {
        let supervisor = self.inner.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.shutdown.send(true);
            if let Err(e) = supervisor.task.await {
                warn!(error = %e, "WebSocket: supervisor task failed");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn rpc(&self) -> &RpcCore {
        &self.inner.rpc
    }

    async fn send_envelope(&self, envelope: TransportMessage, mode: SendMode) -> Result<(), TransportError> {
        self.inner.send_envelope(envelope, mode).await
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn register_envelope(&self) -> TransportMessage {
        self.rpc.envelope(
            MessageType::Register,
            json!({
                "agentId": self.rpc.agent_id(),
                "capabilities": self.capabilities,
            }),
            &SendOptions::default(),
        )
    }

    async fn send_envelope(&self, envelope: TransportMessage, mode: SendMode) -> Result<(), TransportError> {
        let mut outbound = self.outbound.lock().await;

        if let Some(writer) = outbound.writer.clone() {
            let frames = chunk_envelope(&envelope, self.settings.max_frame_bytes)?;
            let delivered = frames
                .into_iter()
                .all(|frame| writer.send(Message::Text(frame)).is_ok());
            if delivered {
                return Ok(());
            }
            // The writer task has exited; the session is ending.
            outbound.writer = None;
        }

        match mode {
            SendMode::Queue => {
                outbound.queue.push_back(envelope);
                debug!(queued = outbound.queue.len(), "WebSocket: queued while disconnected");
                Ok(())
            }
            SendMode::Direct => Err(TransportError::NotConnected),
        }
    }
}

async fn open_socket(inner: &Inner) -> Result<WsStream, TransportError> {
    inner.set_state(ConnectionState::Connecting);
    debug!(url = %inner.url, "WebSocket: connecting");

    match tokio_tungstenite::connect_async(inner.url.as_str()).await {
        Ok((ws, _response)) => Ok(ws),
        Err(e) => {
            inner.set_state(ConnectionState::Disconnected);
            warn!(url = %inner.url, error = %e, "WebSocket: connection failed");
            inner.rpc.emit(TransportEvent::Error(e.to_string()));
            Err(e.into())
        }
    }
}

/// Spawn the writer, put `register` and the replay queue on the wire, then
/// publish the writer for new sends.
async fn start_session(inner: &Arc<Inner>, ws: WsStream) -> Session {
    let (mut sink, stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!(error = %e, "WebSocket: write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut outbound = inner.outbound.lock().await;
    let register = inner.register_envelope();
    let replay: Vec<TransportMessage> = outbound.queue.drain(..).collect();
    let replayed = replay.len();

    for envelope in std::iter::once(register).chain(replay) {
        match chunk_envelope(&envelope, inner.settings.max_frame_bytes) {
            Ok(frames) => {
                for frame in frames {
                    let _ = tx.send(Message::Text(frame));
                }
            }
            Err(e) => warn!(id = %envelope.id, error = %e, "WebSocket: failed to encode envelope"),
        }
    }
    outbound.writer = Some(tx);
    drop(outbound);

    inner.set_state(ConnectionState::Connected);
    info!(url = %inner.url, agent_id = %inner.rpc.agent_id(), replayed, "WebSocket: connected");
    inner.rpc.emit(TransportEvent::Connected);

    Session { stream, writer }
}

/// Drive sessions until shutdown. Starts in the reconnect loop when the
/// first attempt failed.
async fn supervise(inner: Arc<Inner>, session: Option<Session>, mut shutdown: watch::Receiver<bool>) {
    let mut session = match session {
        Some(session) => session,
        None => match reconnect(&inner, &mut shutdown).await {
            Some(session) => session,
            None => return,
        },
    };
    loop {
        let end = read_frames(&inner, &mut session.stream, &mut shutdown).await;
        let requested = matches!(end, SessionEnd::Requested);
        end_session(&inner, session, end).await;
        if requested {
            return;
        }
        match reconnect(&inner, &mut shutdown).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

async fn read_frames(
    inner: &Arc<Inner>,
    stream: &mut SplitStream<WsStream>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.changed() => return SessionEnd::Requested,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_frame(inner, &text).await,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => handle_frame(inner, &text).await,
                Err(_) => debug!("WebSocket: ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by peer".to_string());
                return SessionEnd::Dropped(reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
            None => return SessionEnd::Dropped("stream ended".to_string()),
        }
    }
}

async fn handle_frame(inner: &Arc<Inner>, text: &str) {
    for reply in inner.rpc.on_frame(text) {
        match reply {
            Reply::Send(envelope) => {
                if let Err(e) = inner.send_envelope(envelope, SendMode::Direct).await {
                    debug!(error = %e, "WebSocket: failed to send reply");
                }
            }
            Reply::Answer { handler, call } => {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    let response = inner.rpc.answer_call(handler.as_ref(), &call).await;
                    if let Err(e) = inner.send_envelope(response, SendMode::Direct).await {
                        warn!(error = %e, "WebSocket: failed to answer capability call");
                    }
                });
            }
        }
    }
}

async fn end_session(inner: &Inner, session: Session, end: SessionEnd) {
    let writer = inner.outbound.lock().await.writer.take();

    let reason = match end {
        SessionEnd::Requested => {
            if let Some(tx) = writer {
                let _ = tx.send(Message::Close(None));
            }
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.writer).await;
            info!(url = %inner.url, "WebSocket: disconnected");
            None
        }
        SessionEnd::Dropped(reason) => {
            drop(writer);
            session.writer.abort();
            warn!(url = %inner.url, %reason, "WebSocket: connection lost");
            Some(reason)
        }
    };

    inner.set_state(ConnectionState::Disconnected);
    inner.rpc.reject_all();
    inner.rpc.emit(TransportEvent::Disconnected { reason });
}

async fn reconnect(inner: &Arc<Inner>, shutdown: &mut watch::Receiver<bool>) -> Option<Session> {
    let policy = &inner.settings.reconnect;
    if !policy.enabled {
        return None;
    }

    let mut attempt = 0u32;
    loop {
        if let Some(max) = policy.max_attempts {
            if attempt >= max {
                warn!(attempts = attempt, "WebSocket: giving up reconnecting");
                inner.rpc.emit(TransportEvent::Error(format!(
                    "gave up reconnecting after {attempt} attempts"
                )));
                return None;
            }
        }

        let backoff = policy.backoff(attempt);
        info!(attempt = attempt + 1, ?backoff, "WebSocket: reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return None,
        }

        let opened = tokio::select! {
            opened = open_socket(inner) => opened,
            _ = shutdown.changed() => {
                inner.set_state(ConnectionState::Disconnected);
                return None;
            }
        };
        match opened {
            Ok(ws) => return Some(start_session(inner, ws).await),
            Err(_) => attempt += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallOptions;
    use serde_json::Value;

    fn transport() -> WebSocketTransport {
        WebSocketTransport::new(
            "ws://127.0.0.1:9/agents",
            "agent-a",
            vec!["translate".into()],
            WebSocketSettings::default(),
            RpcConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = WebSocketTransport::new(
            "not a url",
            "agent-a",
            Vec::new(),
            WebSocketSettings::default(),
            RpcConfig::default(),
        );
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_plain_send_queues_while_disconnected() {
        let t = transport();
        assert_eq!(t.state(), ConnectionState::Disconnected);
        t.send(MessageType::Message, json!("one"), SendOptions::default())
            .await
            .unwrap();
        t.send(MessageType::StatusUpdate, json!("two"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(t.queued_len().await, 2);
    }

    #[tokio::test]
    async fn test_direct_sends_fail_fast_while_disconnected() {
        let t = transport();
        let ack = t
            .send(
                MessageType::Message,
                Value::Null,
                SendOptions {
                    wait_for_ack: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(ack, Err(TransportError::NotConnected)));

        let call = t
            .invoke_capability("translate", json!({}), CallOptions::default())
            .await;
        assert!(matches!(call, Err(TransportError::NotConnected)));
        assert_eq!(t.rpc().pending_calls(), 0);
        assert_eq!(t.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_register_frame_shape() {
        let t = transport();
        let register = t.inner.register_envelope();
        assert_eq!(register.kind, MessageType::Register);
        assert_eq!(register.payload["agentId"], "agent-a");
        assert_eq!(register.payload["capabilities"][0], "translate");
    }
}
