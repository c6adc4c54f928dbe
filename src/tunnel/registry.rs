//! Directory of live tunnels, keyed by environment ID.
//!
//! At most one [`AgentTunnel`] per environment: registering over an existing
//! entry closes the old tunnel as part of the swap. The lock is never held
//! across I/O; displaced tunnels are closed after it is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::agent::AgentTunnel;

#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, Arc<AgentTunnel>>>>,
}

/// Status row for one connected environment.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub environment_id: String,
    pub connected_secs: u64,
    pub last_heartbeat_ago_ms: u64,
    pub pending_requests: usize,
    pub dropped_messages: u64,
    pub closed: bool,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `tunnel`, closing whichever tunnel previously held its environment.
    pub async fn register(&self, tunnel: Arc<AgentTunnel>) {
        let id = tunnel.environment_id.clone();
        let old = self.tunnels.write().await.insert(id.clone(), tunnel);
        if let Some(old) = old {
            warn!(environment_id = %id, "Replacing existing tunnel");
            old.close().await;
        }
        info!(environment_id = %id, "Tunnel registered");
    }

    /// Remove and close the tunnel for `environment_id`, if any.
    pub async fn unregister(&self, environment_id: &str) -> bool {
        let removed = self.tunnels.write().await.remove(environment_id);
        match removed {
            Some(tunnel) => {
                tunnel.close().await;
                info!(environment_id = %environment_id, "Tunnel unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove the entry only if it is still `tunnel`. A connection that was
    /// replaced must not evict its successor when its loop exits.
    pub async fn unregister_if_current(&self, tunnel: &Arc<AgentTunnel>) -> bool {
        let removed = {
            let mut tunnels = self.tunnels.write().await;
            match tunnels.get(&tunnel.environment_id) {
                Some(current) if Arc::ptr_eq(current, tunnel) => {
                    tunnels.remove(&tunnel.environment_id)
                }
                _ => None,
            }
        };
        tunnel.close().await;
        if removed.is_some() {
            info!(environment_id = %tunnel.environment_id, "Tunnel unregistered");
        }
        removed.is_some()
    }

    pub async fn get(&self, environment_id: &str) -> Option<Arc<AgentTunnel>> {
        self.tunnels.read().await.get(environment_id).cloned()
    }

    /// Registered and not closed.
    pub async fn has_active_tunnel(&self, environment_id: &str) -> bool {
        self.get(environment_id)
            .await
            .is_some_and(|t| !t.is_closed())
    }

    /// Remove and close every tunnel whose last heartbeat is older than
    /// `max_age`. Returns the evicted environment IDs.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Vec<String> {
        let stale: Vec<Arc<AgentTunnel>> = {
            let mut tunnels = self.tunnels.write().await;
            let ids: Vec<String> = tunnels
                .iter()
                .filter(|(_, t)| t.heartbeat_age() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| tunnels.remove(id)).collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for tunnel in stale {
            warn!(
                environment_id = %tunnel.environment_id,
                age_secs = tunnel.heartbeat_age().as_secs(),
                "Evicted tunnel (heartbeat timeout)"
            );
            tunnel.close().await;
            evicted.push(tunnel.environment_id.clone());
        }
        evicted
    }

    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.read().await;
        let mut list: Vec<TunnelInfo> = tunnels
            .values()
            .map(|t| {
                #[allow(clippy::cast_possible_truncation)]
                let last_heartbeat_ago_ms = t.heartbeat_age().as_millis() as u64;
                TunnelInfo {
                    environment_id: t.environment_id.clone(),
                    connected_secs: t.connected_at.elapsed().as_secs(),
                    last_heartbeat_ago_ms,
                    pending_requests: t.pending.len(),
                    dropped_messages: t.dropped_messages(),
                    closed: t.is_closed(),
                }
            })
            .collect();
        list.sort_by(|a, b| a.environment_id.cmp(&b.environment_id));
        list
    }

    /// Close and forget every tunnel (shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<Arc<AgentTunnel>> =
            self.tunnels.write().await.drain().map(|(_, t)| t).collect();
        for tunnel in drained {
            info!(environment_id = %tunnel.environment_id, "Closing tunnel for shutdown");
            tunnel.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }
}
