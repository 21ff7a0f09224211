// =============================================================================
// WebSocket gateway -- authenticated fan-out of bus channels
// =============================================================================
//
// Each client connection runs in its own task:
//   - auth: bearer token -> role, else close code 4401
//   - subscribe/unsubscribe with ACL and per-connection limits
//   - one bus subscription + forwarder task per accepted pattern, feeding a
//     bounded outbound queue (overflow drops oldest)
//   - send loop assigns per-connection `seq` starting at 1 and enforces the
//     client message rate (excess dropped; BACKPRESSURE error at most once
//     per second)
//   - ping/pong heartbeat; no client ping within the idle window closes the
//     connection with code 4000
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::gateway::acl::Role;
use crate::gateway::auth::{bearer_token, resolve_role};
use crate::gateway::protocol::{ChannelError, ClientMessage, ErrorCode, ServerMessage};
use crate::runtime_config::GatewayConfig;

/// Close code for failed authentication.
const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code for an idle connection (no ping inside the window).
const CLOSE_IDLE: u16 = 4000;
/// How often the idle watchdog wakes.
const IDLE_CHECK: Duration = Duration::from_secs(5);

// =============================================================================
// Gateway
// =============================================================================

pub struct Gateway {
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
    sessions: AtomicU64,
}

impl Gateway {
    pub fn new(bus: Arc<MessageBus>, clock: Arc<dyn Clock>, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            sessions: AtomicU64::new(0),
        })
    }

    /// Build the axum router: the WebSocket endpoint plus a public health
    /// probe.
    pub fn router(self: &Arc<Self>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(healthz))
            .layer(cors)
            .with_state(self.clone())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("sessions", &self.sessions.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// HTTP handlers
// =============================================================================

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn healthz(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": gateway.clock.now_utc().to_rfc3339(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Token from the query string, else the Authorization header. The role
    // is resolved after the upgrade so the close code can say 4401.
    let token = query.token.unwrap_or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .unwrap_or_default()
            .to_string()
    });

    ws.on_upgrade(move |socket| handle_socket(socket, gateway, token))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, token: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(role) = resolve_role(&token) else {
        warn!("gateway connection rejected: bad token");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    };

    let mut conn = Connection::new(gateway.clone(), role);
    info!(session_id = %conn.session_id, role = %role, "gateway client connected");

    let hello = ServerMessage::Connected {
        session_id: conn.session_id.clone(),
        server_time: gateway.clock.now_utc().to_rfc3339(),
    };
    if send_json(&mut sender, &hello).await.is_err() {
        conn.teardown();
        return;
    }

    let outbound = conn.outbound.clone();
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let replies = conn.on_text(&text);
                        for reply in replies {
                            if send_json(&mut sender, &reply).await.is_err() {
                                conn.teardown();
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        conn.touch();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %conn.session_id, "client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %conn.session_id, error = %e, "gateway receive error");
                        break;
                    }
                }
            }

            _ = outbound.notified() => {
                while let Some((channel, payload)) = outbound.pop() {
                    for msg in conn.next_data(&channel, &payload) {
                        if send_json(&mut sender, &msg).await.is_err() {
                            conn.teardown();
                            return;
                        }
                    }
                }
            }

            _ = gateway.clock.sleep(IDLE_CHECK) => {
                if conn.is_idle() {
                    info!(session_id = %conn.session_id, "closing idle gateway connection");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_IDLE,
                            reason: "idle".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }

    conn.teardown();
    info!(session_id = %conn.session_id, "gateway client cleaned up");
}

async fn send_json<S>(sender: &mut S, msg: &ServerMessage) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize gateway message");
            Ok(())
        }
    }
}

// =============================================================================
// Outbound queue -- bounded, drop-oldest
// =============================================================================

pub(crate) struct Outbound {
    queue: Mutex<std::collections::VecDeque<(String, Arc<Value>)>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Outbound {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(std::collections::VecDeque::with_capacity(capacity.min(4096))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    pub(crate) fn push(&self, channel: String, payload: Arc<Value>) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back((channel, payload));
        }
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<(String, Arc<Value>)> {
        self.queue.lock().pop_front()
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Connection state
// =============================================================================

struct SubEntry {
    bus_id: u64,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Everything one client connection owns. Separated from the socket loop so
/// the protocol behavior is testable without a live WebSocket.
pub struct Connection {
    gateway: Arc<Gateway>,
    pub role: Role,
    pub session_id: String,
    subs: HashMap<String, SubEntry>,
    pub(crate) outbound: Arc<Outbound>,

    seq: u64,
    rate_window: i64,
    rate_count: u64,
    rate_dropped: u64,
    backpressure_window: i64,
    last_ping_ms: i64,
}

impl Connection {
    pub fn new(gateway: Arc<Gateway>, role: Role) -> Self {
        let n = gateway.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let now = gateway.clock.now_ms();
        let outbound = Outbound::new(gateway.config.outbound_buffer);
        Self {
            session_id: format!("ws-{n}"),
            role,
            outbound,
            subs: HashMap::new(),
            seq: 0,
            rate_window: i64::MIN,
            rate_count: 0,
            rate_dropped: 0,
            backpressure_window: i64::MIN,
            last_ping_ms: now,
            gateway,
        }
    }

    /// Handle one raw client text frame.
    pub fn on_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe {
                channels,
                request_id,
            }) => vec![self.subscribe(channels, request_id)],
            Ok(ClientMessage::Unsubscribe {
                channels,
                request_id,
            }) => vec![self.unsubscribe(channels, request_id)],
            Ok(ClientMessage::Ping { request_id }) => {
                self.touch();
                vec![ServerMessage::Pong { request_id }]
            }
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "malformed client message");
                vec![ServerMessage::Error {
                    code: ErrorCode::InvalidSubscription,
                    message: format!("malformed client message: {e}"),
                }]
            }
        }
    }

    /// Apply a subscribe request: ACL, pattern validity, connection limits.
    pub fn subscribe(
        &mut self,
        channels: Vec<String>,
        request_id: Option<String>,
    ) -> ServerMessage {
        let mut accepted = Vec::new();
        let mut errors = Vec::new();

        for channel in channels {
            if self.subs.contains_key(&channel) {
                // Idempotent resubscribe.
                accepted.push(channel);
                continue;
            }
            if !valid_pattern(&channel) {
                errors.push(ChannelError {
                    channel,
                    code: ErrorCode::InvalidSubscription,
                });
                continue;
            }
            if !self.role.allows(&channel) {
                errors.push(ChannelError {
                    channel,
                    code: ErrorCode::Forbidden,
                });
                continue;
            }
            if self.subs.len() >= self.gateway.config.max_channels_per_conn {
                errors.push(ChannelError {
                    channel,
                    code: ErrorCode::RateLimit,
                });
                continue;
            }
            let is_wildcard = channel.contains('*');
            if is_wildcard && self.wildcard_count() >= self.gateway.config.max_wildcards_per_conn {
                errors.push(ChannelError {
                    channel,
                    code: ErrorCode::RateLimit,
                });
                continue;
            }

            // Accept: one bus subscription, one forwarder into the outbound
            // queue.
            let mut sub = self.gateway.bus.subscribe(&channel);
            let bus_id = sub.id;
            let outbound = self.outbound.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(env) = sub.recv().await {
                    outbound.push(env.channel.to_string(), env.payload);
                }
            });
            self.subs.insert(
                channel.clone(),
                SubEntry { bus_id, forwarder },
            );
            accepted.push(channel);
        }

        debug!(
            session_id = %self.session_id,
            accepted = accepted.len(),
            rejected = errors.len(),
            "subscribe handled"
        );
        ServerMessage::Subscribed {
            channels: accepted,
            errors: (!errors.is_empty()).then_some(errors),
            request_id,
        }
    }

    /// Remove subscriptions. Unknown channels are ignored (idempotent).
    pub fn unsubscribe(
        &mut self,
        channels: Vec<String>,
        request_id: Option<String>,
    ) -> ServerMessage {
        let mut removed = Vec::new();
        for channel in channels {
            if let Some(entry) = self.subs.remove(&channel) {
                self.gateway.bus.unsubscribe_id(entry.bus_id);
                entry.forwarder.abort();
                removed.push(channel);
            }
        }
        ServerMessage::Unsubscribed {
            channels: removed,
            request_id,
        }
    }

    /// Turn one outbound payload into wire messages, enforcing the client
    /// rate. Excess is dropped; a BACKPRESSURE error is emitted at most once
    /// per second while the condition persists.
    pub fn next_data(&mut self, channel: &str, payload: &Arc<Value>) -> Vec<ServerMessage> {
        let now = self.gateway.clock.now_ms();
        let window = now.div_euclid(1000);
        if window != self.rate_window {
            self.rate_window = window;
            self.rate_count = 0;
        }

        if self.rate_count >= self.gateway.config.client_rate_msg_per_s {
            self.rate_dropped += 1;
            if window != self.backpressure_window {
                self.backpressure_window = window;
                return vec![ServerMessage::Error {
                    code: ErrorCode::Backpressure,
                    message: "client message rate exceeded; dropping".to_string(),
                }];
            }
            return Vec::new();
        }

        self.rate_count += 1;
        self.seq += 1;
        vec![ServerMessage::Data {
            seq: self.seq,
            channel: channel.to_string(),
            data: (**payload).clone(),
            timestamp: self.gateway.clock.now_utc().to_rfc3339(),
        }]
    }

    /// Record client liveness (JSON ping or protocol ping frame).
    pub fn touch(&mut self) {
        self.last_ping_ms = self.gateway.clock.now_ms();
    }

    pub fn is_idle(&self) -> bool {
        let idle_ms = self.gateway.config.idle_timeout_s as i64 * 1000;
        self.gateway.clock.now_ms() - self.last_ping_ms >= idle_ms
    }

    /// Abort forwarders and drop bus subscriptions.
    pub fn teardown(&mut self) {
        for (_, entry) in self.subs.drain() {
            self.gateway.bus.unsubscribe_id(entry.bus_id);
            entry.forwarder.abort();
        }
    }

    fn wildcard_count(&self) -> usize {
        self.subs.keys().filter(|p| p.contains('*')).count()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    pub fn outbound_dropped(&self) -> u64 {
        self.outbound.dropped()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Pattern syntax check: non-empty colon-separated segments, `**` only as
/// the final segment.
fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let segments: Vec<&str> = pattern.split(':').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return false;
        }
        if *segment == "**" && i != segments.len() - 1 {
            return false;
        }
    }
    true
}
