//! HTTP route handlers and router assembly.
//!
//! | Role    | Method | Path                                   | Auth       |
//! |---------|--------|----------------------------------------|------------|
//! | manager | GET    | `/api/health`                          | No         |
//! | manager | GET    | `/api/tunnel/connect`                  | agent token |
//! | manager | GET    | `/api/tunnel/status`                   | `api_key`  |
//! | manager | ANY    | `/api/environments/{id}/proxy/{*path}` | `api_key`  |
//! | agent   | GET    | `/api/health`                          | No         |
//! | agent   | GET    | `/api/tunnel`                          | No         |

pub mod environments;
pub mod health;
pub mod tunnels;

use axum::{
    middleware,
    routing::{any, get},
    Extension, Router,
};

use crate::auth::{require_api_key, ApiKey};
use crate::state::{AgentState, ManagerState};
use crate::tunnel::TunnelServer;

/// Manager router: operator routes plus the agent connect endpoint.
pub fn manager_router(state: ManagerState, server: &TunnelServer) -> Router {
    let api_key = ApiKey(state.config.auth.api_key.clone());

    let authed = Router::new()
        .route("/api/tunnel/status", get(tunnels::status))
        .route("/api/environments/{id}/proxy", any(environments::proxy))
        .route("/api/environments/{id}/proxy/{*path}", any(environments::proxy))
        .route_layer(middleware::from_fn(require_api_key));

    Router::new()
        .route("/api/health", get(health::manager_health))
        .merge(authed)
        .layer(Extension(api_key))
        .with_state(state)
        .merge(server.router())
}

/// Agent router. Served locally and handed to the tunnel client as its handler.
pub fn agent_router(state: AgentState) -> Router {
    Router::new()
        .route("/api/health", get(health::agent_health))
        .route("/api/tunnel", get(tunnels::agent_status))
        .with_state(state)
}
