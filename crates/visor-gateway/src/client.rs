use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use visor_core::errors::BridgeError;
use visor_core::turn::{TurnPort, WaitingSignal};
use visor_core::wire::{
    final_reply, lifecycle_event, AuthParams, ChatSendParams, ClientInfo, Envelope, HandshakeParams,
    LifecyclePhase, PROTOCOL_VERSION,
};

use crate::backoff::{Backoff, BackoffConfig};
use crate::runs::{RunRegistry, RunTimeouts};

const WRITER_QUEUE: usize = 64;

/// Connection lifecycle of the gateway link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReconnectScheduled => "reconnect_scheduled",
        }
    }
}

/// Gateway client configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    /// Backend conversation the bridge pins every turn to.
    pub session_key: String,
    pub client_id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: BackoffConfig,
    pub timeouts: RunTimeouts,
    /// Returned instead of submitting when there is no connection.
    pub offline_reply: String,
    /// Returned when the submission request itself fails.
    pub failed_reply: String,
    /// Forced resolution text at the hard timeout.
    pub overdue_reply: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".into(),
            token: String::new(),
            session_key: "agent:main:main".into(),
            client_id: "visor-bridge".into(),
            display_name: "Visor Bridge".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: "linux".into(),
            mode: "cli".into(),
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            reconnect: BackoffConfig::default(),
            timeouts: RunTimeouts::default(),
            offline_reply: "Assistant offline. Reconnecting...".into(),
            failed_reply: "Could not reach the assistant.".into(),
            overdue_reply: "The assistant is taking too long. Try again.".into(),
        }
    }
}

/// Point-in-time transport health, for the control plane.
#[derive(Clone, Debug, serde::Serialize)]
pub struct TransportStatus {
    pub state: &'static str,
    pub pending_requests: usize,
    pub unmatched_turns: usize,
    pub matched_turns: usize,
    pub next_backoff_ms: u64,
    pub requests_sent: u64,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, BridgeError>>,
}

struct ClientInner {
    config: GatewayConfig,
    state: Mutex<ConnectionState>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    runs: RunRegistry,
    next_request: AtomicU64,
    /// Holds slot registration and request send together so concurrent
    /// submissions hit the wire in slot order (the FIFO match depends
    /// on it).
    submit_lock: Mutex<()>,
    next_backoff: Mutex<Duration>,
    shutdown: CancellationToken,
}

/// Client for the gateway socket. Owns the connection, correlates
/// responses and run lifecycle events, reconnects forever.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let runs = RunRegistry::new(config.timeouts.clone());
        let next_backoff = Mutex::new(config.reconnect.base);
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                pending: Mutex::new(HashMap::new()),
                writer: Mutex::new(None),
                runs,
                next_request: AtomicU64::new(1),
                submit_lock: Mutex::new(()),
                next_backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the connection supervisor and wait for the first attempt.
    /// A failed or rejected first handshake returns the error; the
    /// supervisor keeps retrying with backoff either way.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let (first_tx, first_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(supervise(inner, first_tx));
        first_rx.await.unwrap_or(Err(BridgeError::TransportUnavailable))
    }

    /// Stop reconnecting and close the link.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.runs.cancel_all();
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.lock() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn status(&self) -> TransportStatus {
        let (unmatched, matched) = self.inner.runs.counts();
        TransportStatus {
            state: self.connection_state().name(),
            pending_requests: self.inner.pending.lock().len(),
            unmatched_turns: unmatched,
            matched_turns: matched,
            next_backoff_ms: self.inner.next_backoff.lock().as_millis() as u64,
            requests_sent: self.inner.next_request.load(Ordering::Relaxed).saturating_sub(1),
        }
    }

    /// Send a request and wait for its response envelope.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let (id, rx) = self.start_request(method, params)?;
        self.finish_request(method, id, rx).await
    }

    /// Submit one conversational turn. Infallible by design: offline,
    /// refused, and overdue turns all resolve to canned text.
    pub async fn submit_turn(&self, message: String, waiting: Option<WaitingSignal>) -> String {
        if !self.is_connected() {
            return self.inner.config.offline_reply.clone();
        }

        let params = ChatSendParams {
            message,
            session_key: self.inner.config.session_key.clone(),
            idempotency_key: format!("visor-{}", Uuid::now_v7()),
        };
        let params = match serde_json::to_value(&params) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode turn params");
                return self.inner.config.failed_reply.clone();
            }
        };

        // Slot registration and wire send must not interleave across
        // concurrent submissions: the backend announces run starts in
        // request order and the registry matches FIFO.
        let (ticket, started) = {
            let _order = self.inner.submit_lock.lock();
            let ticket = self
                .inner
                .runs
                .begin_turn(waiting, self.inner.config.overdue_reply.clone());
            let started = self.start_request("chat.send", params);
            (ticket, started)
        };

        let mut outcome = ticket.outcome;
        match started {
            Ok((id, rx)) => {
                tokio::select! {
                    text = &mut outcome => return text.unwrap_or_default(),
                    sent = self.finish_request("chat.send", id, rx) => {
                        if let Err(e) = sent {
                            tracing::warn!(error = %e, kind = e.error_kind(), "turn submission failed");
                            self.inner.runs.resolve(ticket.slot, &self.inner.config.failed_reply);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn submission not sent");
                self.inner.runs.resolve(ticket.slot, &self.inner.config.offline_reply);
            }
        }
        outcome.await.unwrap_or_default()
    }

    /// Fire a backend control message (no run slot, response discarded).
    pub async fn send_command(&self, message: String) -> Result<(), BridgeError> {
        let params = ChatSendParams {
            message,
            session_key: self.inner.config.session_key.clone(),
            idempotency_key: format!("visor-{}", Uuid::now_v7()),
        };
        let params = serde_json::to_value(&params).map_err(|e| BridgeError::Protocol(e.to_string()))?;
        self.request("chat.send", params).await.map(|_| ())
    }

    /// Resolve every outstanding turn with empty text.
    pub fn cancel_all_turns(&self) -> usize {
        self.inner.runs.cancel_all()
    }

    /// Register a pending request and hand the envelope to the writer.
    /// Fully synchronous so callers can order it under a lock.
    fn start_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(String, oneshot::Receiver<Result<Value, BridgeError>>), BridgeError> {
        if *self.inner.state.lock() != ConnectionState::Connected {
            return Err(BridgeError::TransportUnavailable);
        }
        let writer = self
            .inner
            .writer
            .lock()
            .clone()
            .ok_or(BridgeError::TransportUnavailable)?;

        let id = format!("visor-{}", self.inner.next_request.fetch_add(1, Ordering::Relaxed));
        let envelope = Envelope::request(id.clone(), method, params);
        let json = serde_json::to_string(&envelope).map_err(|e| BridgeError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        if writer.try_send(json).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(BridgeError::TransportClosed);
        }
        Ok((id, rx))
    }

    async fn finish_request(
        &self,
        method: &str,
        id: String,
        rx: oneshot::Receiver<Result<Value, BridgeError>>,
    ) -> Result<Value, BridgeError> {
        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::TransportClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(BridgeError::RequestTimeout {
                    method: method.to_string(),
                    timeout: self.inner.config.request_timeout,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl TurnPort for GatewayClient {
    async fn submit_turn(&self, message: String, waiting: Option<WaitingSignal>) -> String {
        GatewayClient::submit_turn(self, message, waiting).await
    }

    async fn send_command(&self, message: String) -> Result<(), BridgeError> {
        GatewayClient::send_command(self, message).await
    }

    async fn cancel_all(&self) -> usize {
        self.cancel_all_turns()
    }

    fn is_connected(&self) -> bool {
        GatewayClient::is_connected(self)
    }
}

/// Connection supervisor: connect, handshake, pump, and on any failure
/// back off and try again until shutdown. The first attempt's outcome is
/// reported through `first_tx` so `connect()` can resolve.
async fn supervise(inner: Arc<ClientInner>, first_tx: oneshot::Sender<Result<(), BridgeError>>) {
    let mut first = Some(first_tx);
    let mut backoff = Backoff::new(inner.config.reconnect.clone());

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        *inner.state.lock() = ConnectionState::Connecting;

        let result = run_connection(&inner, &mut backoff, &mut first).await;

        *inner.writer.lock() = None;
        fail_pending(&inner);

        if inner.shutdown.is_cancelled() {
            break;
        }
        match &result {
            Ok(()) => tracing::info!("gateway connection closed"),
            Err(e) => tracing::warn!(error = %e, kind = e.error_kind(), "gateway connection failed"),
        }
        if let Some(tx) = first.take() {
            let _ = tx.send(result);
        }

        *inner.state.lock() = ConnectionState::ReconnectScheduled;
        let delay = backoff.next_delay();
        *inner.next_backoff.lock() = backoff.peek();
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }

    *inner.state.lock() = ConnectionState::Disconnected;
    if let Some(tx) = first.take() {
        let _ = tx.send(Err(BridgeError::TransportUnavailable));
    }
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    backoff: &mut Backoff,
    first: &mut Option<oneshot::Sender<Result<(), BridgeError>>>,
) -> Result<(), BridgeError> {
    let (ws, _) = tokio_tungstenite::connect_async(inner.config.url.as_str())
        .await
        .map_err(|e| {
            tracing::debug!(error = %e, url = %inner.config.url, "dial failed");
            BridgeError::TransportUnavailable
        })?;
    let (mut sink, mut stream) = ws.split();

    // Versioned handshake; the connection is unusable until acked.
    let hs_id = format!("visor-{}", inner.next_request.fetch_add(1, Ordering::Relaxed));
    let params = HandshakeParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: ClientInfo {
            id: inner.config.client_id.clone(),
            display_name: inner.config.display_name.clone(),
            version: inner.config.version.clone(),
            platform: inner.config.platform.clone(),
            mode: inner.config.mode.clone(),
        },
        auth: AuthParams {
            token: inner.config.token.clone(),
        },
    };
    let params = serde_json::to_value(&params).map_err(|e| BridgeError::Protocol(e.to_string()))?;
    let envelope = Envelope::request(hs_id.clone(), "connect", params);
    let json = serde_json::to_string(&envelope).map_err(|e| BridgeError::Protocol(e.to_string()))?;
    sink.send(Message::text(json))
        .await
        .map_err(|_| BridgeError::TransportClosed)?;

    tokio::time::timeout(inner.config.handshake_timeout, wait_for_ack(&mut stream, &hs_id))
        .await
        .map_err(|_| BridgeError::RequestTimeout {
            method: "connect".into(),
            timeout: inner.config.handshake_timeout,
        })??;

    let (tx, mut rx) = mpsc::channel::<String>(WRITER_QUEUE);
    *inner.writer.lock() = Some(tx);
    *inner.state.lock() = ConnectionState::Connected;
    backoff.reset();
    *inner.next_backoff.lock() = backoff.peek();
    if let Some(tx) = first.take() {
        let _ = tx.send(Ok(()));
    }
    tracing::info!(url = %inner.config.url, "gateway connected");

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(text) => {
                    sink.send(Message::text(text))
                        .await
                        .map_err(|_| BridgeError::TransportClosed)?;
                }
                None => return Ok(()),
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(inner, text.as_str()),
                Some(Ok(Message::Ping(data))) => {
                    sink.send(Message::Pong(data))
                        .await
                        .map_err(|_| BridgeError::TransportClosed)?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "socket read error");
                    return Err(BridgeError::TransportClosed);
                }
            },
            _ = inner.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Read frames until the handshake response arrives. Anything else the
/// gateway sends before acking is discarded.
async fn wait_for_ack(
    stream: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    hs_id: &str,
) -> Result<(), BridgeError> {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(_) => continue,
            Err(_) => return Err(BridgeError::TransportClosed),
        };
        match serde_json::from_str::<Envelope>(text.as_str()) {
            Ok(Envelope::Res { id, ok, error, .. }) if id == hs_id => {
                if ok {
                    return Ok(());
                }
                let detail = error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no error detail".into());
                return Err(BridgeError::HandshakeRejected(detail));
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed envelope during handshake");
            }
        }
    }
    Err(BridgeError::TransportClosed)
}

/// Dispatch one inbound envelope. Malformed frames are logged and
/// dropped; the connection stays up.
fn handle_frame(inner: &Arc<ClientInner>, raw: &str) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(error = %e, "discarding malformed envelope");
            return;
        }
    };

    match envelope {
        Envelope::Res { id, ok, payload, error } => {
            let entry = inner.pending.lock().remove(&id);
            let Some(request) = entry else {
                tracing::debug!(id = %id, "response with no pending request");
                return;
            };
            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                let detail = error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "request refused".into());
                Err(BridgeError::Protocol(format!("{} refused: {detail}", request.method)))
            };
            let _ = request.tx.send(result);
        }
        Envelope::Event { event, payload } => {
            let Some(payload) = payload else { return };
            match event.as_str() {
                "chat" => {
                    if let Some((run_id, text)) = final_reply(&payload) {
                        if inner.runs.on_final(&run_id, &text) {
                            tracing::info!(run_id = %run_id, chars = text.len(), "turn resolved");
                        }
                    }
                }
                "agent" => {
                    if let Some((run_id, phase)) = lifecycle_event(&payload) {
                        match phase {
                            LifecyclePhase::Start => {
                                inner.runs.on_start(run_id);
                            }
                            LifecyclePhase::End => inner.runs.on_end(&run_id),
                        }
                    }
                }
                other => tracing::trace!(event = other, "ignoring event"),
            }
        }
        Envelope::Req { method, .. } => {
            tracing::debug!(method = %method, "ignoring inbound request envelope");
        }
    }
}

/// Fail every pending request with a transport-closed error. Turn slots
/// are left alone: an in-flight turn can still complete after reconnect,
/// and cancelling it is the owning layer's call.
fn fail_pending(inner: &Arc<ClientInner>) {
    let drained: Vec<PendingRequest> = {
        let mut pending = inner.pending.lock();
        pending.drain().map(|(_, req)| req).collect()
    };
    for request in drained {
        let _ = request.tx.send(Err(BridgeError::TransportClosed));
    }
}
