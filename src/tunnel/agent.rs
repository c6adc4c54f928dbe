//! Per-environment session state on the manager side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::conn::TunnelConn;
use super::message::TunnelMessage;
use super::pending::{Delivery, PendingGuard, PendingTable, RESPONSE_CAPACITY, STREAM_CAPACITY};
use crate::error::{Result, TunnelError};

/// One connected agent: its connection, the requests waiting on it, and liveness.
pub struct AgentTunnel {
    pub environment_id: String,
    pub conn: Arc<TunnelConn>,
    pub pending: PendingTable,
    pub connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl AgentTunnel {
    pub fn new(environment_id: impl Into<String>, conn: Arc<TunnelConn>) -> Self {
        let now = Instant::now();
        Self {
            environment_id: environment_id.into(),
            conn,
            pending: PendingTable::new(),
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Record a heartbeat. Never moves the timestamp backwards.
    pub fn touch_heartbeat(&self) {
        let now = Instant::now();
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat().elapsed()
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Send a correlated message and wait for the reply carrying the same ID.
    ///
    /// The pending entry is gone when this returns, whatever the outcome, and
    /// also when the returned future is dropped before completion.
    pub async fn send_request(&self, msg: TunnelMessage, timeout: Duration) -> Result<TunnelMessage> {
        let mut guard = self.pending.register(msg.id(), RESPONSE_CAPACITY)?;
        self.conn.send(&msg).await?;
        match tokio::time::timeout(timeout, guard.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TunnelError::TransportClosed),
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Claim a stream ID. Register before sending `ws_start` so no early
    /// `ws_data` is lost.
    pub fn open_stream(&self, id: &str) -> Result<PendingGuard> {
        if self.is_closed() {
            return Err(TunnelError::TransportClosed);
        }
        self.pending.register(id, STREAM_CAPACITY)
    }

    /// Hand an inbound message to its waiter without blocking.
    pub fn deliver(&self, msg: TunnelMessage) -> Delivery {
        let id = msg.id().to_string();
        let kind = msg.kind();
        let outcome = self.pending.deliver(msg);
        match outcome {
            Delivery::Delivered => {}
            Delivery::Full => {
                let dropped = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    environment_id = %self.environment_id,
                    id = %id,
                    %kind,
                    dropped,
                    "Consumer channel full, dropping message"
                );
            }
            Delivery::Unknown => {
                warn!(
                    environment_id = %self.environment_id,
                    id = %id,
                    %kind,
                    "No pending request for message, dropping"
                );
            }
        }
        outcome
    }

    /// Close the connection and fail every pending caller immediately.
    pub async fn close(&self) {
        self.conn.close().await;
        self.pending.fail_all();
    }

    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, by: Duration) {
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(earlier) = Instant::now().checked_sub(by) {
            *last = earlier;
        }
    }
}
