//! `ANY /api/environments/{id}/proxy/{*path}`: forward a caller into an edge
//! environment's tunnel.
//!
//! WebSocket upgrades become a bridged stream; everything else is one
//! request/response exchange. The caller's `Authorization` header is the
//! manager's admin key and is consumed here, never forwarded to the agent.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{ws::rejection::WebSocketUpgradeRejection, Path, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, Request},
    response::Response,
};
use tracing::debug;

use crate::state::ManagerState;
use crate::tunnel::{proxy_http_request, proxy_websocket_request};

pub async fn proxy(
    State(state): State<ManagerState>,
    Path(params): Path<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    mut request: Request<Body>,
) -> Response {
    request.headers_mut().remove(AUTHORIZATION);
    let environment_id = params.get("id").cloned().unwrap_or_default();
    let path = format!("/{}", params.get("path").map_or("", |p| p.trim_start_matches('/')));
    let timeout = state.config.manager.proxy_timeout();

    match ws {
        Ok(ws) => {
            debug!(environment_id = %environment_id, path = %path, "Proxying WebSocket");
            let query = request.uri().query().unwrap_or_default().to_string();
            proxy_websocket_request(&state.registry, &environment_id, path, query, request.headers(), ws)
                .await
        }
        Err(_) => proxy_http_request(&state.registry, &environment_id, &path, request, timeout).await,
    }
}
