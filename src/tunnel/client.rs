//! Tunnel client: the agent's outbound connection to the manager.
//!
//! Dials `<manager>/api/tunnel/connect` with the agent token, then runs a
//! heartbeat task next to a single receive loop. Inbound `request`s execute
//! against the agent's own [`Router`]; inbound `ws_start`s are bridged to a
//! local WebSocket endpoint. Any disconnect goes back to the dial loop after
//! the reconnect interval, until the cancellation token fires.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{body::Body, http::Request, response::Response, Router};
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::conn::{TunnelConn, TunnelReader};
use super::message::{headers_from_wire, headers_to_wire, TunnelMessage, WireHeaders, WsMessageType};
use super::pending::STREAM_CAPACITY;
use super::stats::{TunnelEventType, TunnelStats};
use super::{
    AGENT_TOKEN_HEADER, CONNECT_PATH, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PROXY_TIMEOUT,
    DEFAULT_RECONNECT_INTERVAL, MIN_RECONNECT_INTERVAL,
};
use crate::error::{Result, TunnelError};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Manager base URL (`http`, `https`, `ws` or `wss`).
    pub manager_url: String,
    pub agent_token: String,
    /// Port of the local WebSocket endpoint used for `ws_start`.
    pub local_port: u16,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    /// Bound on one local request execution.
    pub request_timeout: Duration,
    /// In-flight inbound requests before new ones get a 503.
    pub max_concurrent_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            manager_url: String::new(),
            agent_token: String::new(),
            local_port: 3552,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            request_timeout: DEFAULT_PROXY_TIMEOUT,
            max_concurrent_requests: 64,
        }
    }
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: String },
    ConnectFailed { error: String },
}

#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    handler: Router,
    stats: Arc<TunnelStats>,
    events: broadcast::Sender<ClientEvent>,
    limiter: Arc<Semaphore>,
}

/// State shared by the receive loop and the tasks it spawns, for one session.
struct Session {
    conn: Arc<TunnelConn>,
    streams: DashMap<String, Arc<ActiveStream>>,
    /// Last heartbeat sent, for round-trip timing.
    last_heartbeat: Mutex<Option<(String, Instant)>>,
    cancel: CancellationToken,
}

type StreamReceiver = mpsc::Receiver<(WsMessageType, Vec<u8>)>;

/// Where a `ws_start` should be bridged to.
struct LocalStreamTarget {
    path: String,
    query: String,
    headers: WireHeaders,
}

/// A bridged local WebSocket.
struct ActiveStream {
    id: String,
    data_tx: mpsc::Sender<(WsMessageType, Vec<u8>)>,
    cancel: CancellationToken,
    closed: Mutex<bool>,
}

impl ActiveStream {
    /// True for exactly one caller.
    fn mark_closed(&self) -> bool {
        let mut closed = self
            .closed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !std::mem::replace(&mut *closed, true)
    }
}

impl TunnelClient {
    pub fn new(mut config: ClientConfig, handler: Router, stats: Arc<TunnelStats>) -> Self {
        config.reconnect_interval = config.reconnect_interval.max(MIN_RECONNECT_INTERVAL);
        let (events, _) = broadcast::channel(32);
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                stats,
                events,
                limiter,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.inner.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Run the dial loop on a new task until `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run(cancel).await }.instrument(info_span!("tunnel_client")))
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let url = match tunnel_connect_url(&self.inner.config.manager_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Tunnel client not started");
                return;
            }
        };
        let stats = &self.inner.stats;

        loop {
            info!("Tunnel: connecting to manager at {url}");
            let dialed = tokio::select! {
                () = cancel.cancelled() => break,
                dialed = self.dial(&url) => dialed,
            };
            match dialed {
                Ok((conn, reader)) => {
                    info!("Tunnel: connected");
                    stats.connected.store(true, Ordering::Relaxed);
                    stats.push_event(TunnelEventType::Connected, url.clone()).await;
                    self.emit(ClientEvent::Connected);

                    let reason = self.run_session(conn, reader, &cancel).await;

                    stats.connected.store(false, Ordering::Relaxed);
                    stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    stats
                        .push_event(TunnelEventType::Disconnected, reason.to_string())
                        .await;
                    self.emit(ClientEvent::Disconnected {
                        reason: reason.to_string(),
                    });
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!(
                        "Tunnel: disconnected ({reason}), reconnecting in {}s",
                        self.inner.config.reconnect_interval.as_secs()
                    );
                }
                Err(e) => {
                    warn!(
                        "Tunnel: connection error: {e}, reconnecting in {}s",
                        self.inner.config.reconnect_interval.as_secs()
                    );
                    stats
                        .push_event(TunnelEventType::ConnectFailed, e.to_string())
                        .await;
                    self.emit(ClientEvent::ConnectFailed {
                        error: e.to_string(),
                    });
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.inner.config.reconnect_interval) => {}
            }
        }
        info!("Tunnel client stopped");
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn dial(&self, url: &str) -> Result<(Arc<TunnelConn>, TunnelReader)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TunnelError::Connect(e.to_string()))?;
        let token = HeaderValue::from_str(&self.inner.config.agent_token)
            .map_err(|e| TunnelError::Connect(format!("invalid agent token: {e}")))?;
        request.headers_mut().insert(AGENT_TOKEN_HEADER, token);
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;
        Ok(TunnelConn::from_tungstenite(ws))
    }

    /// Serve one established connection until it fails or `cancel` fires.
    /// Returns why the session ended. The connection is closed on return.
    pub async fn run_session(
        &self,
        conn: Arc<TunnelConn>,
        mut reader: TunnelReader,
        cancel: &CancellationToken,
    ) -> TunnelError {
        let session = Arc::new(Session {
            conn: conn.clone(),
            streams: DashMap::new(),
            last_heartbeat: Mutex::new(None),
            cancel: cancel.child_token(),
        });
        let heartbeat = tokio::spawn(heartbeat_loop(
            session.clone(),
            self.inner.config.heartbeat_interval,
            self.inner.stats.clone(),
        ));

        let reason = loop {
            let received = tokio::select! {
                () = session.cancel.cancelled() => break TunnelError::TransportClosed,
                received = reader.receive() => received,
            };
            match received {
                Ok(msg) => {
                    self.inner.stats.incr_received();
                    self.dispatch(&session, msg);
                }
                Err(e) => break e,
            }
        };

        session.cancel.cancel();
        conn.close().await;
        let _ = heartbeat.await;
        let streams: Vec<Arc<ActiveStream>> =
            session.streams.iter().map(|s| s.value().clone()).collect();
        for stream in streams {
            teardown_stream(&session, &stream, false).await;
        }
        reason
    }

    fn dispatch(&self, session: &Arc<Session>, msg: TunnelMessage) {
        match msg {
            TunnelMessage::Request {
                id,
                method,
                path,
                query,
                headers,
                body,
            } => {
                let request = LocalRequest {
                    method,
                    path,
                    query,
                    headers,
                    body,
                };
                self.spawn_request(session, id, request);
            }
            TunnelMessage::WsStart {
                id,
                path,
                query,
                headers,
            } => {
                let (stream, data_rx) = self.open_stream(session, &id);
                let session = session.clone();
                let client = self.clone();
                let target = LocalStreamTarget {
                    path,
                    query,
                    headers,
                };
                tokio::spawn(
                    async move { client.bridge_stream(session, stream, data_rx, target).await }
                        .instrument(info_span!("tunnel_stream", stream_id = %id)),
                );
            }
            TunnelMessage::WsData {
                id,
                ws_message_type,
                body,
            } => {
                let Some(stream) = session.streams.get(&id).map(|s| s.value().clone()) else {
                    debug!(stream_id = %id, "ws_data for unknown stream");
                    return;
                };
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    stream.data_tx.try_send((ws_message_type, body))
                {
                    let dropped = self
                        .inner
                        .stats
                        .dropped_stream_messages
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    warn!(stream_id = %id, dropped, "Local stream queue full, dropping ws_data");
                }
            }
            TunnelMessage::WsClose { id } => {
                if let Some(stream) = session.streams.get(&id).map(|s| s.value().clone()) {
                    let session = session.clone();
                    tokio::spawn(async move { teardown_stream(&session, &stream, false).await });
                }
            }
            TunnelMessage::HeartbeatAck { id } => {
                let sent = session
                    .last_heartbeat
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .take_if(|(sent_id, _)| *sent_id == id);
                if let Some((_, at)) = sent {
                    #[allow(clippy::cast_possible_truncation)]
                    let rtt_ms = at.elapsed().as_millis() as u64;
                    let stats = self.inner.stats.clone();
                    tokio::spawn(async move { stats.record_rtt(rtt_ms).await });
                }
            }
            other @ (TunnelMessage::Response { .. }
            | TunnelMessage::Heartbeat { .. }
            | TunnelMessage::StreamData { .. }
            | TunnelMessage::StreamEnd { .. }) => {
                warn!(
                    msg_type = %other.kind(),
                    id = %other.id(),
                    "Ignoring agent-only message type sent by manager"
                );
            }
        }
    }

    fn spawn_request(&self, session: &Arc<Session>, id: String, request: LocalRequest) {
        let conn = session.conn.clone();
        let stats = self.inner.stats.clone();
        let Ok(permit) = self.inner.limiter.clone().try_acquire_owned() else {
            stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %id, "Too many in-flight requests, rejecting");
            tokio::spawn(async move {
                let reply = TunnelMessage::error_response(id, 503, "agent is busy");
                if conn.send(&reply).await.is_ok() {
                    stats.incr_sent();
                }
            });
            return;
        };

        let handler = self.inner.handler.clone();
        let timeout = self.inner.config.request_timeout;
        tokio::spawn(async move {
            debug!(request_id = %id, method = %request.method, path = %request.path, "Executing tunneled request");
            let reply = execute_local(handler, id, request, timeout).await;
            drop(permit);
            match conn.send(&reply).await {
                Ok(()) => stats.incr_sent(),
                Err(e) => debug!(request_id = %reply.id(), error = %e, "Failed to send response"),
            }
        });
    }

    /// Register the stream before dialing so early `ws_data` is queued, not lost.
    fn open_stream(&self, session: &Session, id: &str) -> (Arc<ActiveStream>, StreamReceiver) {
        let (data_tx, data_rx) = mpsc::channel(STREAM_CAPACITY);
        let stream = Arc::new(ActiveStream {
            id: id.to_string(),
            data_tx,
            cancel: session.cancel.child_token(),
            closed: Mutex::new(false),
        });
        if let Some(previous) = session.streams.insert(id.to_string(), stream.clone()) {
            warn!(stream_id = %id, "Duplicate ws_start, replacing stream");
            previous.cancel.cancel();
        }
        (stream, data_rx)
    }

    async fn bridge_stream(
        &self,
        session: Arc<Session>,
        stream: Arc<ActiveStream>,
        mut data_rx: StreamReceiver,
        target: LocalStreamTarget,
    ) {
        let url = local_ws_url(self.inner.config.local_port, &target.path, &target.query);
        let request = match local_ws_request(&url, &target.headers, &self.inner.config.agent_token) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Bad local WebSocket request");
                teardown_stream(&session, &stream, true).await;
                return;
            }
        };
        let local = tokio::select! {
            () = stream.cancel.cancelled() => {
                teardown_stream(&session, &stream, false).await;
                return;
            }
            local = tokio_tungstenite::connect_async(request) => local,
        };
        let (local, _response) = match local {
            Ok(local) => local,
            Err(e) => {
                warn!(url = %url, error = %TunnelError::LocalExecution(e.to_string()), "Local WebSocket dial failed");
                teardown_stream(&session, &stream, true).await;
                return;
            }
        };
        info!(url = %url, "Local stream opened");

        let (mut local_sink, mut local_stream) = local.split();
        let conn = session.conn.clone();
        let stats = self.inner.stats.clone();
        let id = stream.id.clone();

        let read_loop = async {
            while let Some(frame) = local_stream.next().await {
                let (ws_message_type, body) = match frame {
                    Ok(WsMessage::Text(text)) => (WsMessageType::Text, text.as_str().as_bytes().to_vec()),
                    Ok(WsMessage::Binary(bytes)) => (WsMessageType::Binary, bytes.to_vec()),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Local stream read failed");
                        break;
                    }
                };
                let msg = TunnelMessage::WsData {
                    id: id.clone(),
                    ws_message_type,
                    body,
                };
                if conn.send(&msg).await.is_err() {
                    break;
                }
                stats.incr_sent();
            }
        };
        let write_loop = async {
            while let Some((ws_message_type, body)) = data_rx.recv().await {
                let frame = match ws_message_type {
                    WsMessageType::Text => {
                        WsMessage::Text(String::from_utf8_lossy(&body).into_owned().into())
                    }
                    WsMessageType::Binary => WsMessage::Binary(body.into()),
                };
                if let Err(e) = local_sink.send(frame).await {
                    debug!(error = %e, "Local stream write failed");
                    break;
                }
            }
        };

        let local_closed = tokio::select! {
            () = stream.cancel.cancelled() => false,
            () = read_loop => true,
            () = write_loop => true,
        };
        let _ = local_sink.close().await;
        teardown_stream(&session, &stream, local_closed).await;
        info!("Local stream closed");
    }
}

/// Single-shot teardown: cancel, forget, and optionally tell the manager.
async fn teardown_stream(session: &Session, stream: &Arc<ActiveStream>, notify_manager: bool) {
    if !stream.mark_closed() {
        return;
    }
    stream.cancel.cancel();
    session
        .streams
        .remove_if(&stream.id, |_, current| Arc::ptr_eq(current, stream));
    if notify_manager {
        let msg = TunnelMessage::WsClose {
            id: stream.id.clone(),
        };
        if let Err(e) = session.conn.send(&msg).await {
            debug!(stream_id = %stream.id, error = %e, "Failed to send ws_close");
        }
    }
}

async fn heartbeat_loop(session: Arc<Session>, every: Duration, stats: Arc<TunnelStats>) {
    let start = tokio::time::Instant::now() + every;
    let mut interval = tokio::time::interval_at(start, every);
    loop {
        tokio::select! {
            () = session.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let msg = TunnelMessage::heartbeat();
        *session
            .last_heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some((msg.id().to_string(), Instant::now()));
        if let Err(e) = session.conn.send(&msg).await {
            warn!(error = %e, "Heartbeat send failed, closing tunnel");
            stats
                .push_event(TunnelEventType::HeartbeatFailed, e.to_string())
                .await;
            // Wakes the receive loop.
            session.conn.close().await;
            break;
        }
        stats.incr_sent();
    }
}

/// The parts of an inbound `request` needed to run it locally.
struct LocalRequest {
    method: String,
    path: String,
    query: String,
    headers: WireHeaders,
    body: Vec<u8>,
}

fn build_local_request(req: LocalRequest) -> Result<Request<Body>> {
    let uri = if req.query.is_empty() {
        req.path
    } else {
        format!("{}?{}", req.path, req.query)
    };
    let mut request = Request::builder()
        .method(req.method.as_str())
        .uri(uri)
        .body(Body::from(req.body))
        .map_err(|e| TunnelError::LocalExecution(e.to_string()))?;
    *request.headers_mut() = headers_from_wire(&req.headers);
    Ok(request)
}

/// Run one request against the local router. Never fails: every problem
/// becomes an error response.
async fn execute_local(handler: Router, id: String, req: LocalRequest, timeout: Duration) -> TunnelMessage {
    let request = match build_local_request(req) {
        Ok(request) => request,
        Err(e) => return TunnelMessage::error_response(id, 400, &e.to_string()),
    };
    // The deadline covers reading the response body too.
    let run = async {
        match AssertUnwindSafe(handler.oneshot(request)).catch_unwind().await {
            Err(_panic) => {
                warn!(request_id = %id, "Local handler panicked");
                TunnelMessage::error_response(id.clone(), 500, "local handler failed")
            }
            Ok(Err(never)) => match never {},
            Ok(Ok(response)) => response_message(id.clone(), response).await,
        }
    };
    let outcome = tokio::time::timeout(timeout, run).await;
    match outcome {
        Ok(reply) => reply,
        Err(_) => {
            warn!(request_id = %id, "Local handler timed out");
            TunnelMessage::error_response(id, 504, "local handler timed out")
        }
    }
}

async fn response_message(id: String, response: Response) -> TunnelMessage {
    let (parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => TunnelMessage::Response {
            id,
            status: parts.status.as_u16(),
            headers: headers_to_wire(&parts.headers),
            body: collected.to_bytes().to_vec(),
        },
        Err(e) => {
            let e = TunnelError::LocalExecution(e.to_string());
            warn!(request_id = %id, error = %e, "Failed to read local response body");
            TunnelMessage::error_response(id, 500, &e.to_string())
        }
    }
}

/// `http(s)://host[/base]` → `ws(s)://host[/base]/api/tunnel/connect`.
pub fn tunnel_connect_url(manager_url: &str) -> Result<String> {
    let base = manager_url.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(TunnelError::Connect(format!(
            "unsupported manager URL: {manager_url:?}"
        )));
    };
    Ok(format!("{ws_base}{CONNECT_PATH}"))
}

fn local_ws_url(port: u16, path: &str, query: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if query.is_empty() {
        format!("ws://localhost:{port}{path}")
    } else {
        format!("ws://localhost:{port}{path}?{query}")
    }
}

/// Headers that belong to one specific handshake and must not be replayed.
fn is_handshake_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("sec-websocket-")
        || matches!(name.as_str(), "upgrade" | "connection" | "host")
}

fn local_ws_request(
    url: &str,
    headers: &WireHeaders,
    agent_token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TunnelError::LocalExecution(e.to_string()))?;
    for (name, value) in headers {
        if is_handshake_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            request.headers_mut().insert(name, value);
        }
    }
    if let Ok(token) = HeaderValue::from_str(agent_token) {
        request.headers_mut().insert(AGENT_TOKEN_HEADER, token);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade};
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::{any, get};

    fn local_router() -> Router {
        Router::new()
            .route("/api/health", get(|| async { "ok" }))
            .route(
                "/echo",
                any(|uri: Uri, headers: HeaderMap, body: Bytes| async move {
                    let marker = headers
                        .get("x-marker")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    format!(
                        "{}|{}|{}",
                        uri.query().unwrap_or_default(),
                        marker,
                        String::from_utf8_lossy(&body)
                    )
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "slow"
                }),
            )
            .route(
                "/endless",
                get(|| async { Body::from_stream(futures::stream::pending::<std::result::Result<Bytes, std::io::Error>>()) }),
            )
            .route(
                "/teapot",
                get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
            )
    }

    fn client(config: ClientConfig) -> TunnelClient {
        TunnelClient::new(config, local_router(), Arc::new(TunnelStats::new()))
    }

    /// Run a session for `client` over an in-memory pair; returns the manager end.
    fn start_session(client: &TunnelClient) -> (Arc<TunnelConn>, TunnelReader, CancellationToken) {
        let ((manager, manager_reader), (agent, agent_reader)) = TunnelConn::pair();
        let cancel = CancellationToken::new();
        let c = client.clone();
        let token = cancel.clone();
        tokio::spawn(async move { c.run_session(agent, agent_reader, &token).await });
        (manager, manager_reader, cancel)
    }

    fn request(id: &str, method: &str, path: &str, query: &str, body: &[u8]) -> TunnelMessage {
        let mut headers = WireHeaders::new();
        headers.insert("x-marker".into(), "m1".into());
        TunnelMessage::Request {
            id: id.into(),
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn request_runs_against_local_handler() {
        let client = client(ClientConfig::default());
        let (manager, mut reader, _cancel) = start_session(&client);

        manager
            .send(&request("r1", "GET", "/api/health", "", b""))
            .await
            .unwrap();
        match reader.receive().await.unwrap() {
            TunnelMessage::Response {
                id, status, body, ..
            } => {
                assert_eq!(id, "r1");
                assert_eq!(status, 200);
                assert_eq!(body, b"ok");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_headers_and_body_are_forwarded() {
        let client = client(ClientConfig::default());
        let (manager, mut reader, _cancel) = start_session(&client);

        manager
            .send(&request("r1", "POST", "/echo", "a=1&b=2", b"payload"))
            .await
            .unwrap();
        let TunnelMessage::Response { status, body, .. } = reader.receive().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(status, 200);
        assert_eq!(body, b"a=1&b=2|m1|payload");

        manager
            .send(&request("r2", "GET", "/teapot", "", b""))
            .await
            .unwrap();
        let TunnelMessage::Response { status, headers, .. } = reader.receive().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(status, 418);
        assert!(headers["content-type"].starts_with("text/plain"));

        manager
            .send(&request("r3", "GET", "/missing", "", b""))
            .await
            .unwrap();
        let TunnelMessage::Response { status, .. } = reader.receive().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn saturated_agent_answers_503() {
        let client = client(ClientConfig {
            max_concurrent_requests: 1,
            ..ClientConfig::default()
        });
        let (manager, mut reader, _cancel) = start_session(&client);

        manager
            .send(&request("r1", "GET", "/slow", "", b""))
            .await
            .unwrap();
        manager
            .send(&request("r2", "GET", "/slow", "", b""))
            .await
            .unwrap();

        let first = reader.receive().await.unwrap();
        assert!(matches!(first, TunnelMessage::Response { ref id, status: 503, .. } if id == "r2"));
        let second = reader.receive().await.unwrap();
        assert!(matches!(second, TunnelMessage::Response { ref id, status: 200, .. } if id == "r1"));
        assert_eq!(client.stats().rejected_requests.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn local_timeout_becomes_504() {
        let client = client(ClientConfig {
            request_timeout: Duration::from_millis(20),
            ..ClientConfig::default()
        });
        let (manager, mut reader, _cancel) = start_session(&client);
        manager
            .send(&request("r1", "GET", "/slow", "", b""))
            .await
            .unwrap();
        let reply = reader.receive().await.unwrap();
        assert!(matches!(reply, TunnelMessage::Response { status: 504, .. }));
    }

    #[tokio::test]
    async fn endless_local_body_becomes_504_and_frees_permit() {
        let client = client(ClientConfig {
            request_timeout: Duration::from_millis(100),
            max_concurrent_requests: 1,
            ..ClientConfig::default()
        });
        let (manager, mut reader, _cancel) = start_session(&client);
        manager
            .send(&request("r1", "GET", "/endless", "", b""))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), reader.receive())
            .await
            .expect("agent must answer within its own deadline")
            .unwrap();
        assert!(matches!(reply, TunnelMessage::Response { ref id, status: 504, .. } if id == "r1"));

        // The single permit is back.
        manager
            .send(&request("r2", "GET", "/api/health", "", b""))
            .await
            .unwrap();
        let reply = reader.receive().await.unwrap();
        assert!(matches!(reply, TunnelMessage::Response { ref id, status: 200, .. } if id == "r2"));
    }

    #[tokio::test]
    async fn manager_only_messages_are_ignored() {
        let client = client(ClientConfig::default());
        let (manager, mut reader, _cancel) = start_session(&client);

        manager
            .send(&TunnelMessage::Heartbeat { id: "h".into() })
            .await
            .unwrap();
        manager
            .send(&TunnelMessage::StreamEnd { id: "s".into() })
            .await
            .unwrap();
        manager
            .send(&TunnelMessage::error_response("x", 500, "nope"))
            .await
            .unwrap();
        manager
            .send(&request("r1", "GET", "/api/health", "", b""))
            .await
            .unwrap();
        assert_eq!(reader.receive().await.unwrap().id(), "r1");
    }

    #[tokio::test]
    async fn heartbeats_are_sent_on_interval() {
        let client = client(ClientConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        });
        let (manager, mut reader, _cancel) = start_session(&client);

        let hb = tokio::time::timeout(Duration::from_secs(2), reader.receive())
            .await
            .unwrap()
            .unwrap();
        let TunnelMessage::Heartbeat { id } = hb else {
            panic!("expected heartbeat, got {hb:?}");
        };
        manager
            .send(&TunnelMessage::HeartbeatAck { id })
            .await
            .unwrap();

        for _ in 0..100 {
            if client.stats().rtt_stats().await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("heartbeat ack was not timed");
    }

    #[tokio::test]
    async fn session_ends_when_manager_goes_away() {
        let client = client(ClientConfig::default());
        let ((manager, _manager_reader), (agent, agent_reader)) = TunnelConn::pair();
        let cancel = CancellationToken::new();
        let session = {
            let client = client.clone();
            let agent = agent.clone();
            tokio::spawn(async move { client.run_session(agent, agent_reader, &cancel).await })
        };
        manager.close().await;
        let reason = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, TunnelError::TransportClosed);
        assert!(agent.is_closed());
    }

    async fn echo_socket(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                AxumWsMessage::Text(_) | AxumWsMessage::Binary(_) => {
                    if socket.send(msg).await.is_err() {
                        break;
                    }
                }
                AxumWsMessage::Close(_) => break,
                _ => {}
            }
        }
    }

    async fn spawn_local_ws() -> u16 {
        let app = Router::new().route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo_socket) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    #[tokio::test]
    async fn ws_start_bridges_local_socket() {
        let port = spawn_local_ws().await;
        let client = client(ClientConfig {
            local_port: port,
            ..ClientConfig::default()
        });
        let (manager, mut reader, _cancel) = start_session(&client);

        manager
            .send(&TunnelMessage::WsStart {
                id: "s1".into(),
                path: "/ws".into(),
                query: String::new(),
                headers: WireHeaders::new(),
            })
            .await
            .unwrap();
        manager
            .send(&TunnelMessage::WsData {
                id: "s1".into(),
                ws_message_type: WsMessageType::Binary,
                body: vec![1, 2, 3],
            })
            .await
            .unwrap();
        manager
            .send(&TunnelMessage::WsData {
                id: "s1".into(),
                ws_message_type: WsMessageType::Text,
                body: b"hello".to_vec(),
            })
            .await
            .unwrap();

        let echoed = reader.receive().await.unwrap();
        assert_eq!(
            echoed,
            TunnelMessage::WsData {
                id: "s1".into(),
                ws_message_type: WsMessageType::Binary,
                body: vec![1, 2, 3],
            }
        );
        let echoed = reader.receive().await.unwrap();
        assert_eq!(
            echoed,
            TunnelMessage::WsData {
                id: "s1".into(),
                ws_message_type: WsMessageType::Text,
                body: b"hello".to_vec(),
            }
        );

        // Manager-initiated close tears the stream down without an echo.
        manager
            .send(&TunnelMessage::WsClose { id: "s1".into() })
            .await
            .unwrap();
        manager
            .send(&request("r1", "GET", "/api/health", "", b""))
            .await
            .unwrap();
        assert_eq!(reader.receive().await.unwrap().id(), "r1");
    }

    #[tokio::test]
    async fn failed_local_dial_reports_ws_close() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = client(ClientConfig {
            local_port: port,
            ..ClientConfig::default()
        });
        let (manager, mut reader, _cancel) = start_session(&client);
        manager
            .send(&TunnelMessage::WsStart {
                id: "s1".into(),
                path: "/ws".into(),
                query: String::new(),
                headers: WireHeaders::new(),
            })
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, TunnelMessage::WsClose { id: "s1".into() });
    }

    #[tokio::test]
    async fn unreachable_manager_emits_connect_failed() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = client(ClientConfig {
            manager_url: format!("http://127.0.0.1:{port}"),
            agent_token: "abc".into(),
            ..ClientConfig::default()
        });
        let mut events = client.subscribe();
        let cancel = CancellationToken::new();
        let task = client.spawn(cancel.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ClientEvent::ConnectFailed { .. }));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("client must stop on cancel")
            .unwrap();
        assert!(!client.stats().connected.load(Ordering::Relaxed));
    }

    #[test]
    fn connect_url_rewrites_scheme() {
        assert_eq!(
            tunnel_connect_url("https://manager.example.com/").unwrap(),
            "wss://manager.example.com/api/tunnel/connect"
        );
        assert_eq!(
            tunnel_connect_url("http://10.0.0.5:3552").unwrap(),
            "ws://10.0.0.5:3552/api/tunnel/connect"
        );
        assert_eq!(
            tunnel_connect_url("wss://m.example.com/base").unwrap(),
            "wss://m.example.com/base/api/tunnel/connect"
        );
        assert!(tunnel_connect_url("ftp://nope").is_err());
    }

    #[test]
    fn local_ws_request_strips_handshake_headers() {
        let mut headers = WireHeaders::new();
        headers.insert("Sec-WebSocket-Key".into(), "stale".into());
        headers.insert("sec-websocket-extensions".into(), "permessage-deflate".into());
        headers.insert("Upgrade".into(), "websocket".into());
        headers.insert("connection".into(), "Upgrade".into());
        headers.insert("host".into(), "manager:3552".into());
        headers.insert("x-request-id".into(), "abc".into());

        let url = local_ws_url(3553, "/api/containers/c1/logs", "follow=1");
        assert_eq!(url, "ws://localhost:3553/api/containers/c1/logs?follow=1");
        let request = local_ws_request(&url, &headers, "secret").unwrap();
        let h = request.headers();
        assert_eq!(h["x-request-id"], "abc");
        assert_eq!(h[AGENT_TOKEN_HEADER], "secret");
        assert_ne!(h["sec-websocket-key"], "stale");
        assert!(h.get("sec-websocket-extensions").is_none());
        assert_eq!(h["host"], "localhost:3553");
    }

    #[test]
    fn reconnect_interval_has_floor() {
        let client = client(ClientConfig {
            reconnect_interval: Duration::from_millis(10),
            ..ClientConfig::default()
        });
        assert_eq!(client.config().reconnect_interval, MIN_RECONNECT_INTERVAL);
    }
}
