//! Proxying through a tunnel: unary HTTP and full-duplex WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderName, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::agent::AgentTunnel;
use super::message::{headers_from_wire, headers_to_wire, TunnelMessage, WireHeaders, WsMessageType};
use super::registry::TunnelRegistry;
use crate::error::{Result, TunnelError};

/// Largest request body forwarded through a tunnel.
const MAX_PROXY_BODY: usize = 64 * 1024 * 1024;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// An HTTP request to run on the agent.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: WireHeaders,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: WireHeaders,
    pub body: Vec<u8>,
}

/// Live tunnel for `environment_id`, or `NoActiveTunnel`.
async fn active_tunnel(registry: &TunnelRegistry, environment_id: &str) -> Result<Arc<AgentTunnel>> {
    match registry.get(environment_id).await {
        Some(tunnel) if !tunnel.is_closed() => Ok(tunnel),
        _ => Err(TunnelError::NoActiveTunnel(environment_id.to_string())),
    }
}

/// Run `req` on the agent behind `environment_id` and wait for its response.
pub async fn proxy_request(
    registry: &TunnelRegistry,
    environment_id: &str,
    req: ProxyRequest,
    timeout: Duration,
) -> Result<ProxiedResponse> {
    let tunnel = active_tunnel(registry, environment_id).await?;
    let msg = TunnelMessage::Request {
        id: uuid::Uuid::new_v4().to_string(),
        method: req.method,
        path: req.path,
        query: req.query,
        headers: req.headers,
        body: req.body,
    };
    match tunnel.send_request(msg, timeout).await? {
        TunnelMessage::Response {
            status,
            headers,
            body,
            ..
        } => Ok(ProxiedResponse {
            status,
            headers,
            body,
        }),
        other => Err(TunnelError::Protocol(format!(
            "expected response, got {}",
            other.kind()
        ))),
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn proxy_error(err: &TunnelError) -> Response {
    let (status, code) = match err {
        TunnelError::NoActiveTunnel(_) => (StatusCode::NOT_FOUND, "NO_ACTIVE_TUNNEL"),
        TunnelError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
        TunnelError::TransportClosed => (StatusCode::BAD_GATEWAY, "TUNNEL_DISCONNECTED"),
        _ => (StatusCode::BAD_GATEWAY, "PROXY_FAILED"),
    };
    (status, Json(json!({"error": err.to_string(), "code": code}))).into_response()
}

/// Forward an inbound HTTP request to `path` on the agent and relay the result.
///
/// 504 when the timeout elapses, 502 for any other tunnel failure, 404 when the
/// environment has no tunnel.
pub async fn proxy_http_request(
    registry: &TunnelRegistry,
    environment_id: &str,
    path: &str,
    request: Request<Body>,
    timeout: Duration,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Failed to read request body: {e}"), "code": "BAD_BODY"})),
            )
                .into_response();
        }
    };
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    let req = ProxyRequest {
        method: parts.method.to_string(),
        path: path.to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers: headers_to_wire(&headers),
        body,
    };

    match proxy_request(registry, environment_id, req, timeout).await {
        Ok(proxied) => {
            let status = StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = headers_from_wire(&proxied.headers);
            strip_hop_by_hop(&mut headers);
            // Recomputed from the body.
            headers.remove(header::CONTENT_LENGTH);
            (status, headers, proxied.body).into_response()
        }
        Err(e) => {
            warn!(environment_id = %environment_id, path = %path, error = %e, "Proxy request failed");
            proxy_error(&e)
        }
    }
}

/// Upgrade the caller and bridge its WebSocket to `path` on the agent.
pub async fn proxy_websocket_request(
    registry: &TunnelRegistry,
    environment_id: &str,
    path: String,
    query: String,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let tunnel = match active_tunnel(registry, environment_id).await {
        Ok(tunnel) => tunnel,
        Err(e) => return proxy_error(&e),
    };
    let headers = headers_to_wire(headers);
    let span = info_span!("proxy_stream", environment_id = %environment_id, path = %path);
    ws.on_upgrade(move |socket| bridge_websocket(tunnel, socket, path, query, headers).instrument(span))
}

/// Run both forwarding directions until either side ends.
pub async fn bridge_websocket(
    tunnel: Arc<AgentTunnel>,
    socket: WebSocket,
    path: String,
    query: String,
    headers: WireHeaders,
) {
    let id = uuid::Uuid::new_v4().to_string();
    let mut inbound = match tunnel.open_stream(&id) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(error = %e, "Cannot open tunnel stream");
            return;
        }
    };
    let start = TunnelMessage::WsStart {
        id: id.clone(),
        path,
        query,
        headers,
    };
    if let Err(e) = tunnel.conn.send(&start).await {
        warn!(error = %e, "Failed to send ws_start");
        return;
    }
    info!(stream_id = %id, "Stream opened");

    let cancel = CancellationToken::new();
    let (mut client_sink, mut client_stream) = socket.split();

    let client_to_tunnel = async {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = client_stream.next() => frame,
            };
            let (ws_message_type, body) = match frame {
                Some(Ok(Message::Text(text))) => (WsMessageType::Text, text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Binary(bytes))) => (WsMessageType::Binary, bytes.to_vec()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "Client read failed");
                    break;
                }
            };
            let data = TunnelMessage::WsData {
                id: id.clone(),
                ws_message_type,
                body,
            };
            if tunnel.conn.send(&data).await.is_err() {
                cancel.cancel();
                return;
            }
        }
        // The client went away; let the agent release its local socket.
        let _ = tunnel.conn.send(&TunnelMessage::WsClose { id: id.clone() }).await;
        cancel.cancel();
    };

    let tunnel_to_client = async {
        loop {
            let delivered = tokio::select! {
                () = cancel.cancelled() => break,
                msg = inbound.recv() => msg,
            };
            match delivered {
                Some(TunnelMessage::WsData {
                    ws_message_type,
                    body,
                    ..
                }) => {
                    let frame = match ws_message_type {
                        WsMessageType::Text => {
                            Message::Text(String::from_utf8_lossy(&body).into_owned().into())
                        }
                        WsMessageType::Binary => Message::Binary(body.into()),
                    };
                    if client_sink.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(TunnelMessage::StreamData { body, .. }) => {
                    if client_sink.send(Message::Binary(body.into())).await.is_err() {
                        break;
                    }
                }
                Some(TunnelMessage::WsClose { .. } | TunnelMessage::StreamEnd { .. }) | None => break,
                Some(other) => debug!(msg_type = %other.kind(), "Ignoring message on stream"),
            }
        }
        cancel.cancel();
    };

    tokio::join!(client_to_tunnel, tunnel_to_client);
    let _ = client_sink.close().await;
    info!(stream_id = %id, "Stream closed");
}
