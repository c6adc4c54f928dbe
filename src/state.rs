//! Shared application state passed to handlers via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::tunnel::{TunnelRegistry, TunnelStats};

/// State for the manager's HTTP surface.
#[derive(Clone)]
pub struct ManagerState {
    pub config: Arc<Config>,
    /// Live tunnels, shared with the [`crate::tunnel::TunnelServer`].
    pub registry: TunnelRegistry,
    pub start_time: Instant,
}

impl ManagerState {
    pub fn new(config: Arc<Config>, registry: TunnelRegistry) -> Self {
        Self {
            config,
            registry,
            start_time: Instant::now(),
        }
    }
}

/// State for the agent's local router.
#[derive(Clone)]
pub struct AgentState {
    pub config: Arc<Config>,
    /// Shared with the running [`crate::tunnel::TunnelClient`].
    pub stats: Arc<TunnelStats>,
    pub start_time: Instant,
}

impl AgentState {
    pub fn new(config: Arc<Config>, stats: Arc<TunnelStats>) -> Self {
        Self {
            config,
            stats,
            start_time: Instant::now(),
        }
    }
}
