//! Tunnel status endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::{AgentState, ManagerState};

/// `GET /api/tunnel/status`: every connected environment, sorted by ID.
pub async fn status(State(state): State<ManagerState>) -> Json<Value> {
    let tunnels = state.registry.snapshot().await;
    Json(json!({
        "count": tunnels.len(),
        "tunnels": tunnels,
    }))
}

/// `GET /api/tunnel` on the agent: counters, heartbeat RTT and recent events.
pub async fn agent_status(State(state): State<AgentState>) -> Json<Value> {
    Json(state.stats.snapshot().await)
}
