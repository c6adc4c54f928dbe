//! Unauthenticated health-check endpoints.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::{AgentState, ManagerState};

/// `GET /api/health` on the manager: liveness plus connected tunnel count.
pub async fn manager_health(State(state): State<ManagerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "role": "manager",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "tunnels": state.registry.len().await,
    }))
}

/// `GET /api/health` on the agent. Also reachable by the manager through the tunnel.
pub async fn agent_health(State(state): State<AgentState>) -> Json<Value> {
    let stats = &state.stats;
    let rtt = stats.rtt_stats().await;
    Json(json!({
        "status": "ok",
        "role": "agent",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "tunnel": {
            "connected": stats.connected.load(Ordering::Relaxed),
            "reconnects": stats.reconnects.load(Ordering::Relaxed),
            "rtt_median_ms": rtt.map(|(median, _)| median),
        },
    }))
}
