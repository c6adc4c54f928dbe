//! Manager side: accepts agent connections and runs one receive loop per tunnel.
//!
//! Per connection: token check (401, no upgrade, on failure) → register →
//! report `connected = true` → dispatch until the socket fails → unregister →
//! report `connected = false`. The last two steps run on a spawned task so they
//! happen even when the connection future is dropped mid-flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::agent::AgentTunnel;
use super::conn::{TunnelConn, TunnelReader};
use super::message::TunnelMessage;
use super::registry::TunnelRegistry;
use super::{AGENT_TOKEN_HEADER, API_KEY_HEADER, CONNECT_PATH};
use crate::auth::constant_time_eq;
use crate::error::TunnelError;

/// Maps an agent credential to the environment it belongs to.
pub trait TokenResolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<String>>;
}

/// Receives connect/disconnect notifications for an environment.
pub trait StatusReporter: Send + Sync + 'static {
    fn report<'a>(&'a self, environment_id: &'a str, connected: bool) -> BoxFuture<'a, ()>;
}

/// Resolver backed by a fixed token → environment map (from config).
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl TokenResolver for StaticTokenResolver {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<String>> {
        let found = self
            .tokens
            .iter()
            .find(|(known, _)| constant_time_eq(known.as_bytes(), token.as_bytes()))
            .map(|(_, env)| env.clone());
        Box::pin(async move { found })
    }
}

/// Status reporter that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStatusReporter;

impl StatusReporter for LoggingStatusReporter {
    fn report<'a>(&'a self, environment_id: &'a str, connected: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(environment_id = %environment_id, connected, "Environment status changed");
        })
    }
}

#[derive(Clone)]
pub struct TunnelServer {
    registry: TunnelRegistry,
    resolver: Arc<dyn TokenResolver>,
    status: Arc<dyn StatusReporter>,
}

impl TunnelServer {
    pub fn new(
        registry: TunnelRegistry,
        resolver: Arc<dyn TokenResolver>,
        status: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            registry,
            resolver,
            status,
        }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// `GET /api/tunnel/connect`.
    pub fn router(&self) -> Router {
        Router::new()
            .route(CONNECT_PATH, get(handle_connect))
            .with_state(self.clone())
    }

    /// Run one authenticated connection to completion.
    pub async fn serve(&self, environment_id: String, conn: Arc<TunnelConn>, mut reader: TunnelReader) {
        let tunnel = Arc::new(AgentTunnel::new(environment_id.clone(), conn));
        self.registry.register(tunnel.clone()).await;
        self.status.report(&environment_id, true).await;
        let _disconnect = DisconnectGuard {
            registry: self.registry.clone(),
            status: self.status.clone(),
            tunnel: tunnel.clone(),
        };
        info!("Agent connected");

        loop {
            match reader.receive().await {
                Ok(msg) => self.dispatch(&tunnel, msg).await,
                Err(TunnelError::TransportClosed) => {
                    info!("Agent disconnected");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Tunnel receive failed, closing");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, tunnel: &AgentTunnel, msg: TunnelMessage) {
        match msg {
            TunnelMessage::Heartbeat { id } => {
                tunnel.touch_heartbeat();
                if let Err(e) = tunnel.conn.send(&TunnelMessage::HeartbeatAck { id }).await {
                    debug!(error = %e, "Failed to send heartbeat ack");
                }
            }
            msg @ (TunnelMessage::Response { .. }
            | TunnelMessage::StreamData { .. }
            | TunnelMessage::StreamEnd { .. }
            | TunnelMessage::WsData { .. }
            | TunnelMessage::WsClose { .. }) => {
                tunnel.deliver(msg);
            }
            other @ (TunnelMessage::Request { .. }
            | TunnelMessage::HeartbeatAck { .. }
            | TunnelMessage::WsStart { .. }) => {
                warn!(
                    msg_type = %other.kind(),
                    id = %other.id(),
                    "Ignoring manager-only message type sent by agent"
                );
            }
        }
    }
}

/// Unregisters the tunnel once the connection ends, and reports the disconnect
/// unless a newer connection for the same environment has taken over.
struct DisconnectGuard {
    registry: TunnelRegistry,
    status: Arc<dyn StatusReporter>,
    tunnel: Arc<AgentTunnel>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let status = self.status.clone();
        let tunnel = self.tunnel.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            registry.unregister_if_current(&tunnel).await;
            // A successor has already reported the environment connected.
            let superseded = registry
                .get(&tunnel.environment_id)
                .await
                .is_some_and(|current| !Arc::ptr_eq(&current, &tunnel));
            if superseded {
                debug!(environment_id = %tunnel.environment_id, "Replaced tunnel closed");
                return;
            }
            status.report(&tunnel.environment_id, false).await;
        });
    }
}

fn agent_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AGENT_TOKEN_HEADER)
        .or_else(|| headers.get(API_KEY_HEADER))
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
}

async fn handle_connect(
    State(server): State<TunnelServer>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let environment_id = match agent_token(&headers) {
        Some(token) => server.resolver.resolve(token).await,
        None => None,
    };
    let Some(environment_id) = environment_id else {
        warn!("Rejected tunnel connection: {}", TunnelError::AuthenticationFailed);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid or missing agent token", "code": "AUTHENTICATION_FAILED"})),
        )
            .into_response();
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(environment_id = %environment_id, "Agent connecting...");
    ws.on_upgrade(move |socket| {
        let (conn, reader) = TunnelConn::from_axum(socket);
        let span = info_span!("tunnel", environment_id = %environment_id);
        async move { server.serve(environment_id, conn, reader).await }.instrument(span)
    })
}

/// Periodically evict tunnels whose heartbeat is older than `max_age`.
pub fn spawn_stale_sweep(
    registry: TunnelRegistry,
    every: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = registry.cleanup_stale(max_age).await;
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "Stale sweep evicted tunnels");
                    }
                }
            }
        }
    })
}
