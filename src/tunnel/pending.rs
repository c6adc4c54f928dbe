//! Correlation table: which caller is waiting on which message ID.
//!
//! The single receive loop of a connection delivers into this table; callers
//! wait on their own [`PendingGuard`]. Delivery never blocks: a full channel
//! drops the message. The guard removes its entry on drop, so every exit path
//! (success, timeout, cancelled future) cleans up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::message::TunnelMessage;
use crate::error::{Result, TunnelError};

/// Capacity for a unary request: exactly one response.
pub const RESPONSE_CAPACITY: usize = 1;

/// Capacity for a bridged WebSocket stream before newer messages are dropped.
pub const STREAM_CAPACITY: usize = 100;

/// Bookkeeping for one in-flight correlation ID.
pub struct PendingRequest {
    tx: mpsc::Sender<TunnelMessage>,
    created_at: Instant,
    seq: u64,
}

impl PendingRequest {
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Outcome of handing a message to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Consumer is behind; the message was dropped.
    Full,
    /// Nobody is waiting for this ID (timed out, finished, or never existed).
    Unknown,
}

#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<DashMap<String, PendingRequest>>,
    next_seq: Arc<AtomicU64>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` with a bounded channel of `capacity`. Fails if the ID is
    /// already in flight.
    pub fn register(&self, id: &str, capacity: usize) -> Result<PendingGuard> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::Protocol(format!(
                "correlation id {id} already in flight"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    tx,
                    created_at: Instant::now(),
                    seq,
                });
                Ok(PendingGuard {
                    id: id.to_string(),
                    seq,
                    entries: self.entries.clone(),
                    rx,
                })
            }
        }
    }

    /// Non-blocking hand-off to whoever waits on `msg.id()`.
    pub fn deliver(&self, msg: TunnelMessage) -> Delivery {
        let id = msg.id().to_string();
        let outcome = match self.entries.get(&id) {
            None => return Delivery::Unknown,
            Some(entry) => entry.tx.try_send(msg),
        };
        match outcome {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => {
                self.entries.remove(&id);
                Delivery::Unknown
            }
        }
    }

    /// Drop every entry. Waiters wake up with `None` from [`PendingGuard::recv`].
    pub fn fail_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}

/// A caller's claim on one correlation ID; the entry is removed on drop.
pub struct PendingGuard {
    id: String,
    seq: u64,
    entries: Arc<DashMap<String, PendingRequest>>,
    rx: mpsc::Receiver<TunnelMessage>,
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next delivered message, or `None` once the table was failed.
    pub async fn recv(&mut self) -> Option<TunnelMessage> {
        self.rx.recv().await
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let seq = self.seq;
        self.entries.remove_if(&self.id, |_, p| p.seq == seq);
    }
}
