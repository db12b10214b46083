//! Envelope/RPC contract shared by every carrier.
//!
//! [`RpcCore`] owns the state that does not depend on the carrier: pending
//! capability calls, ack waiters, chunk reassembly, the optional
//! [`CapabilityHandler`] and the event channel. Carriers feed it raw text
//! frames through `on_frame` and put whatever replies it returns back on the
//! wire. The [`Transport`] trait builds the public send/call API on top of a
//! carrier's `send_envelope`.

use crate::chunk::ChunkAssembler;
use crate::envelope::{CallOptions, MessageType, SendOptions, TransportMessage};
use crate::error::TransportError;
use crate::event::{TransportEvent, EVENT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use dashmap::DashMap;
use ossa_types::config::RpcConfig;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

/// How a carrier should treat an envelope it cannot deliver right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Fail with `NotConnected` / `ChannelNotOpen`.
    Direct,
    /// Queue for replay on the next connect, where the carrier supports it.
    Queue,
}

/// Failure returned by a [`CapabilityHandler`]; sent to the caller as an
/// `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityError {
    pub code: String,
    pub message: String,
}

impl CapabilityError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(capability: &str) -> Self {
        Self::new("capability_not_found", format!("Unknown capability: {capability}"))
    }
}

/// Answers inbound capability calls.
///
/// When a transport has a handler, `capability_call` envelopes are answered
/// automatically and never surface as `message` events.
#[async_trait]
pub trait CapabilityHandler: Send + Sync + 'static {
    /// Run `capability` with `args` on behalf of `caller`.
    async fn handle(&self, capability: &str, args: Value, caller: &str) -> Result<Value, CapabilityError>;
}

/// Work a carrier must do after `on_frame`.
pub(crate) enum Reply {
    /// Put this envelope on the wire.
    Send(TransportMessage),
    /// Run the handler for this call and send its result.
    Answer {
        handler: Arc<dyn CapabilityHandler>,
        call: TransportMessage,
    },
}

type CallSlot = oneshot::Sender<Result<Value, TransportError>>;
type AckSlot = oneshot::Sender<Result<(), TransportError>>;

/// Carrier-independent RPC state of one transport.
pub struct RpcCore {
    agent_id: String,
    config: RpcConfig,
    events: broadcast::Sender<TransportEvent>,
    calls: DashMap<String, CallSlot>,
    acks: DashMap<String, AckSlot>,
    assembler: Mutex<ChunkAssembler>,
    handler: RwLock<Option<Arc<dyn CapabilityHandler>>>,
    dropped_frames: AtomicU64,
}

impl RpcCore {
    pub fn new(agent_id: impl Into<String>, config: RpcConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let assembler = ChunkAssembler::new(config.chunk_buffer_max_age());
        Self {
            agent_id: agent_id.into(),
            config,
            events,
            calls: DashMap::new(),
            acks: DashMap::new(),
            assembler: Mutex::new(assembler),
            handler: RwLock::new(None),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Install or remove the capability handler.
    pub fn set_handler(&self, handler: Option<Arc<dyn CapabilityHandler>>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    fn handler(&self) -> Option<Arc<dyn CapabilityHandler>> {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Frames dropped because they could not be decoded.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Build an outgoing envelope from this agent.
    pub fn envelope(&self, kind: MessageType, payload: Value, options: &SendOptions) -> TransportMessage {
        TransportMessage::new(kind, payload, self.agent_id.clone()).with_options(options)
    }

    pub(crate) fn response_envelope(&self, call: &TransportMessage, payload: Value) -> TransportMessage {
        let options = SendOptions {
            correlation_id: Some(call.reply_correlation()),
            ..Default::default()
        };
        self.envelope(MessageType::CapabilityResponse, payload, &options)
    }

    pub(crate) fn error_envelope(&self, call: &TransportMessage, code: &str, message: &str) -> TransportMessage {
        let options = SendOptions {
            correlation_id: Some(call.reply_correlation()),
            ..Default::default()
        };
        self.envelope(
            MessageType::Error,
            json!({ "code": code, "message": message }),
            &options,
        )
    }

    fn ack_for(&self, envelope: &TransportMessage) -> TransportMessage {
        let mut ack = self.envelope(MessageType::Ack, Value::Null, &SendOptions::default());
        ack.id = envelope.id.clone();
        ack.metadata.correlation_id = Some(envelope.id.clone());
        ack
    }

    fn pong_for(&self, ping: &TransportMessage) -> TransportMessage {
        let options = SendOptions {
            correlation_id: Some(ping.id.clone()),
            ..Default::default()
        };
        self.envelope(MessageType::Pong, Value::Null, &options)
    }

    /// Register a pending call under a fresh correlation id.
    pub(crate) fn register_call(&self) -> (String, oneshot::Receiver<Result<Value, TransportError>>) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.calls.insert(correlation_id.clone(), tx);
        (correlation_id, rx)
    }

    pub(crate) fn cancel_call(&self, correlation_id: &str) {
        self.calls.remove(correlation_id);
    }

    /// Wait for the correlated response or reject after `timeout`.
    pub(crate) async fn await_response(
        &self,
        capability: &str,
        correlation_id: &str,
        rx: oneshot::Receiver<Result<Value, TransportError>>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                // Whoever removes the slot first settles the call.
                self.calls.remove(correlation_id);
                debug!(capability, correlation_id, ?timeout, "Capability call timed out");
                Err(TransportError::CallTimeout {
                    capability: capability.to_string(),
                    timeout,
                })
            }
        }
    }

    pub(crate) fn register_ack(&self, id: &str) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(id.to_string(), tx);
        rx
    }

    pub(crate) fn cancel_ack(&self, id: &str) {
        self.acks.remove(id);
    }

    pub(crate) async fn await_ack(
        &self,
        id: &str,
        rx: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        let timeout = self.config.ack_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.acks.remove(id);
                Err(TransportError::AckTimeout {
                    id: id.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Reject every pending call and ack wait with `Closed`.
    pub(crate) fn reject_all(&self) {
        let call_ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for id in call_ids {
            if let Some((_, slot)) = self.calls.remove(&id) {
                let _ = slot.send(Err(TransportError::Closed));
            }
        }
        let ack_ids: Vec<String> = self.acks.iter().map(|e| e.key().clone()).collect();
        for id in ack_ids {
            if let Some((_, slot)) = self.acks.remove(&id) {
                let _ = slot.send(Err(TransportError::Closed));
            }
        }
    }

    /// Process one inbound text frame.
    pub(crate) fn on_frame(&self, text: &str) -> Vec<Reply> {
        let envelope = match serde_json::from_str::<TransportMessage>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Dropping undecodable frame");
                return Vec::new();
            }
        };

        let envelope = match envelope.metadata.chunked.clone() {
            Some(info) => {
                let Value::String(part) = envelope.payload else {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    debug!(message_id = %info.message_id, "Dropping chunk without string payload");
                    return Vec::new();
                };
                let assembled = self
                    .assembler
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(&info, part, Instant::now());
                let Some(text) = assembled else {
                    return Vec::new();
                };
                match serde_json::from_str::<TransportMessage>(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        debug!(message_id = %info.message_id, error = %e, "Dropping unparseable reassembled message");
                        return Vec::new();
                    }
                }
            }
            None => envelope,
        };

        let mut replies = Vec::new();
        self.dispatch(envelope, &mut replies);
        replies
    }

    fn dispatch(&self, envelope: TransportMessage, replies: &mut Vec<Reply>) {
        if envelope.metadata.requires_ack && envelope.kind != MessageType::Ack {
            replies.push(Reply::Send(self.ack_for(&envelope)));
        }

        match envelope.kind {
            MessageType::Ack => match self.acks.remove(&envelope.id) {
                Some((_, slot)) => {
                    let _ = slot.send(Ok(()));
                }
                None => trace!(id = %envelope.id, "Ack for unknown message"),
            },
            MessageType::Ping => replies.push(Reply::Send(self.pong_for(&envelope))),
            MessageType::CapabilityResponse | MessageType::Error
                if envelope.metadata.correlation_id.is_some() =>
            {
                self.resolve(envelope)
            }
            MessageType::CapabilityCall => match self.handler() {
                Some(handler) => replies.push(Reply::Answer {
                    handler,
                    call: envelope,
                }),
                None => self.emit(TransportEvent::Message(envelope)),
            },
            _ => self.emit(TransportEvent::Message(envelope)),
        }
    }

    fn resolve(&self, envelope: TransportMessage) {
        let Some(correlation_id) = envelope.metadata.correlation_id.as_deref() else {
            return;
        };
        let Some((_, slot)) = self.calls.remove(correlation_id) else {
            debug!(correlation_id, "Response for unknown or expired call");
            return;
        };
        let result = match envelope.kind {
            MessageType::Error => Err(remote_error(&envelope.payload)),
            _ => Ok(envelope.payload),
        };
        let _ = slot.send(result);
    }

    /// Run `handler` for an inbound call and build the reply envelope.
    pub(crate) async fn answer_call(
        &self,
        handler: &dyn CapabilityHandler,
        call: &TransportMessage,
    ) -> TransportMessage {
        let Some(capability) = call.capability() else {
            return self.error_envelope(call, "invalid_call", "capability_call payload has no capability");
        };
        let args = call.payload.get("args").cloned().unwrap_or(Value::Null);
        match handler.handle(capability, args, &call.metadata.agent_id).await {
            Ok(result) => self.response_envelope(call, result),
            Err(e) => {
                debug!(capability, code = %e.code, "Capability handler failed");
                self.error_envelope(call, &e.code, &e.message)
            }
        }
    }
}

fn remote_error(payload: &Value) -> TransportError {
    let code = match payload.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    };
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());
    TransportError::Remote { code, message }
}

/// The uniform send/call contract implemented by every carrier.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The carrier's RPC state.
    fn rpc(&self) -> &RpcCore;

    /// Put one envelope on the carrier, chunking it if needed.
    async fn send_envelope(&self, envelope: TransportMessage, mode: SendMode) -> Result<(), TransportError>;

    fn agent_id(&self) -> &str {
        self.rpc().agent_id()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.rpc().subscribe()
    }

    fn set_capability_handler(&self, handler: Arc<dyn CapabilityHandler>) {
        self.rpc().set_handler(Some(handler));
    }

    /// Send an envelope; returns its id.
    ///
    /// With `wait_for_ack` the envelope must go out now, and the call
    /// resolves once the receiver acks it.
    async fn send(&self, kind: MessageType, payload: Value, options: SendOptions) -> Result<String, TransportError> {
        let rpc = self.rpc();
        let envelope = rpc.envelope(kind, payload, &options);
        let id = envelope.id.clone();

        if !options.wait_for_ack {
            self.send_envelope(envelope, SendMode::Queue).await?;
            return Ok(id);
        }

        let rx = rpc.register_ack(&id);
        if let Err(e) = self.send_envelope(envelope, SendMode::Direct).await {
            rpc.cancel_ack(&id);
            return Err(e);
        }
        rpc.await_ack(&id, rx).await?;
        Ok(id)
    }

    /// Invoke a capability on the peer and wait for its result.
    async fn invoke_capability(
        &self,
        capability: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<Value, TransportError> {
        let rpc = self.rpc();
        let (correlation_id, rx) = rpc.register_call();
        let envelope = rpc.envelope(
            MessageType::CapabilityCall,
            json!({ "capability": capability, "args": args }),
            &SendOptions {
                correlation_id: Some(correlation_id.clone()),
                priority: options.priority,
                ..Default::default()
            },
        );

        if let Err(e) = self.send_envelope(envelope, SendMode::Direct).await {
            rpc.cancel_call(&correlation_id);
            return Err(e);
        }

        let timeout = options.timeout.unwrap_or_else(|| rpc.config().call_timeout());
        rpc.await_response(capability, &correlation_id, rx, timeout).await
    }

    /// Answer a `capability_call` received as a `message` event.
    async fn respond(&self, call: &TransportMessage, payload: Value) -> Result<(), TransportError> {
        let response = self.rpc().response_envelope(call, payload);
        self.send_envelope(response, SendMode::Direct).await
    }

    /// Fail a `capability_call` received as a `message` event.
    async fn respond_error(&self, call: &TransportMessage, code: &str, message: &str) -> Result<(), TransportError> {
        let error = self.rpc().error_envelope(call, code, message);
        self.send_envelope(error, SendMode::Direct).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_envelope;
    use crate::envelope::EnvelopeMetadata;

    fn core() -> RpcCore {
        RpcCore::new("agent-a", RpcConfig::default())
    }

    fn frame(kind: MessageType, payload: Value, correlation_id: Option<&str>) -> String {
        let env = TransportMessage {
            kind,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: 0,
            payload,
            metadata: EnvelopeMetadata {
                agent_id: "agent-b".into(),
                correlation_id: correlation_id.map(str::to_string),
                ..Default::default()
            },
        };
        serde_json::to_string(&env).unwrap()
    }

    fn sent(replies: Vec<Reply>) -> Vec<TransportMessage> {
        replies
            .into_iter()
            .map(|r| match r {
                Reply::Send(env) => env,
                Reply::Answer { .. } => panic!("Expected Send reply"),
            })
            .collect()
    }

    struct Upper;

    #[async_trait]
    impl CapabilityHandler for Upper {
        async fn handle(&self, capability: &str, args: Value, _caller: &str) -> Result<Value, CapabilityError> {
            match capability {
                "upper" => Ok(json!(args["text"].as_str().unwrap_or_default().to_uppercase())),
                other => Err(CapabilityError::not_found(other)),
            }
        }
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let core = core();
        let ping: TransportMessage = serde_json::from_str(&frame(MessageType::Ping, json!({"x": 1}), None)).unwrap();
        let replies = sent(core.on_frame(&serde_json::to_string(&ping).unwrap()));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Pong);
        assert_eq!(replies[0].payload, Value::Null);
        assert_eq!(replies[0].metadata.correlation_id.as_deref(), Some(ping.id.as_str()));
        assert_eq!(replies[0].metadata.agent_id, "agent-a");
    }

    #[test]
    fn test_requires_ack_answered_and_emitted() {
        let core = core();
        let mut events = core.subscribe();
        let mut env: TransportMessage =
            serde_json::from_str(&frame(MessageType::Message, json!("hi"), None)).unwrap();
        env.metadata.requires_ack = true;

        let replies = sent(core.on_frame(&serde_json::to_string(&env).unwrap()));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageType::Ack);
        assert_eq!(replies[0].id, env.id);

        match events.try_recv().unwrap() {
            TransportEvent::Message(msg) => assert_eq!(msg.payload, json!("hi")),
            other => panic!("Expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_resolves_waiter() {
        let core = core();
        let rx = core.register_ack("m-1");
        let mut ack: TransportMessage = serde_json::from_str(&frame(MessageType::Ack, Value::Null, None)).unwrap();
        ack.id = "m-1".into();
        assert!(core.on_frame(&serde_json::to_string(&ack).unwrap()).is_empty());
        core.await_ack("m-1", rx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let core = core();
        let rx = core.register_ack("m-1");
        let err = core.await_ack("m-1", rx).await.unwrap_err();
        assert!(matches!(err, TransportError::AckTimeout { .. }));
    }

    #[tokio::test]
    async fn test_response_resolves_call() {
        let core = core();
        let (id, rx) = core.register_call();
        let replies = core.on_frame(&frame(MessageType::CapabilityResponse, json!({"out": 1}), Some(&id)));
        assert!(replies.is_empty());
        let result = core
            .await_response("translate", &id, rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"out": 1}));
        assert_eq!(core.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_error_rejects_call_as_remote() {
        let core = core();
        let (id, rx) = core.register_call();
        core.on_frame(&frame(
            MessageType::Error,
            json!({"code": "capability_not_found", "message": "nope"}),
            Some(&id),
        ));
        match core.await_response("x", &id, rx, Duration::from_secs(1)).await {
            Err(TransportError::Remote { code, message }) => {
                assert_eq!(code, "capability_not_found");
                assert_eq!(message, "nope");
            }
            other => panic!("Expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_early_and_late_response_ignored() {
        let core = core();
        let mut events = core.subscribe();
        let (id, rx) = core.register_call();

        let start = tokio::time::Instant::now();
        let err = core
            .await_response("translate", &id, rx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(matches!(err, TransportError::CallTimeout { .. }));
        assert_eq!(core.pending_calls(), 0);

        let late = frame(MessageType::CapabilityResponse, json!({"late": true}), Some(&id));
        assert!(core.on_frame(&late).is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_just_before_deadline_wins() {
        let core = Arc::new(core());
        let (id, rx) = core.register_call();

        let responder = {
            let core = Arc::clone(&core);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(4_990)).await;
                core.on_frame(&frame(MessageType::CapabilityResponse, json!("ok"), Some(&id)));
            })
        };

        let result = core.await_response("x", &id, rx, Duration::from_secs(5)).await;
        assert_eq!(result.unwrap(), json!("ok"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_all_closes_pending() {
        let core = core();
        let (id, rx) = core.register_call();
        let ack_rx = core.register_ack("m-1");
        core.reject_all();
        assert!(matches!(
            core.await_response("x", &id, rx, Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(core.await_ack("m-1", ack_rx).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_call_without_handler_surfaces_as_message() {
        let core = core();
        let mut events = core.subscribe();
        let replies = core.on_frame(&frame(
            MessageType::CapabilityCall,
            json!({"capability": "upper", "args": {"text": "hi"}}),
            Some("c-1"),
        ));
        assert!(replies.is_empty());
        match events.try_recv().unwrap() {
            TransportEvent::Message(call) => {
                assert_eq!(call.capability(), Some("upper"));
                let response = core.response_envelope(&call, json!("HI"));
                assert_eq!(response.kind, MessageType::CapabilityResponse);
                assert_eq!(response.metadata.correlation_id.as_deref(), Some("c-1"));
            }
            other => panic!("Expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_answers_call() {
        let core = core();
        core.set_handler(Some(Arc::new(Upper)));

        let mut replies = core.on_frame(&frame(
            MessageType::CapabilityCall,
            json!({"capability": "upper", "args": {"text": "hi"}}),
            Some("c-1"),
        ));
        assert_eq!(replies.len(), 1);
        let Reply::Answer { handler, call } = replies.remove(0) else {
            panic!("Expected Answer reply");
        };
        let response = core.answer_call(handler.as_ref(), &call).await;
        assert_eq!(response.kind, MessageType::CapabilityResponse);
        assert_eq!(response.payload, json!("HI"));
        assert_eq!(response.metadata.correlation_id.as_deref(), Some("c-1"));

        let mut unknown = call.clone();
        unknown.payload = json!({"capability": "ocr"});
        let error = core.answer_call(handler.as_ref(), &unknown).await;
        assert_eq!(error.kind, MessageType::Error);
        assert_eq!(error.payload["code"], "capability_not_found");
    }

    #[test]
    fn test_chunked_frames_emit_once() {
        let sender = RpcCore::new("agent-b", RpcConfig::default());
        let big = sender.envelope(
            MessageType::StatusUpdate,
            json!({ "blob": "x".repeat(5000) }),
            &SendOptions::default(),
        );
        let frames = chunk_envelope(&big, 1024).unwrap();
        assert!(frames.len() > 1);

        let core = core();
        let mut events = core.subscribe();
        for f in frames.iter().rev().chain(frames.iter()) {
            assert!(core.on_frame(f).is_empty());
        }

        match events.try_recv().unwrap() {
            TransportEvent::Message(msg) => {
                assert_eq!(msg.kind, MessageType::StatusUpdate);
                assert_eq!(msg.id, big.id);
                assert_eq!(msg.payload, big.payload);
            }
            other => panic!("Expected Message, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_undecodable_frames_counted() {
        let core = core();
        assert!(core.on_frame("not json").is_empty());
        assert!(core.on_frame(r#"{"type":"teleport","id":"x","timestamp":0,"metadata":{"agentId":"a"}}"#).is_empty());
        assert_eq!(core.dropped_frames(), 2);
    }
}
