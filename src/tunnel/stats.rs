//! Agent-side tunnel statistics, surfaced through the agent's local routes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Connection lifecycle event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Connected,
    Disconnected,
    ConnectFailed,
    HeartbeatFailed,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectFailed => "connect_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub at: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
}

const EVENT_HISTORY: usize = 50;
const RTT_WINDOW: usize = 20;

/// Append to a fixed-size window, dropping the oldest entry when full.
fn push_bounded<T>(window: &mut VecDeque<T>, cap: usize, item: T) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(item);
}

pub struct TunnelStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// `ws_data` dropped because a local stream's queue was full.
    pub dropped_stream_messages: AtomicU64,
    /// Inbound requests refused because the concurrency cap was reached.
    pub rejected_requests: AtomicU64,
    events: Mutex<VecDeque<ConnectionEvent>>,
    /// Heartbeat round trips in milliseconds, newest last.
    rtt_window: Mutex<VecDeque<u64>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            dropped_stream_messages: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY)),
            rtt_window: Mutex::new(VecDeque::with_capacity(RTT_WINDOW)),
        }
    }

    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        let event = ConnectionEvent {
            at: Instant::now(),
            event_type,
            detail,
        };
        push_bounded(&mut *self.events.lock().await, EVENT_HISTORY, event);
    }

    /// Most recent events, oldest first.
    pub async fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    pub async fn record_rtt(&self, rtt_ms: u64) {
        push_bounded(&mut *self.rtt_window.lock().await, RTT_WINDOW, rtt_ms);
    }

    /// Median and 95th percentile of the recent heartbeat round trips, in ms.
    pub async fn rtt_stats(&self) -> Option<(u64, u64)> {
        let mut sorted: Vec<u64> = self.rtt_window.lock().await.iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        // Nearest rank: ceil(0.95 * n), 1-based.
        let p95 = (sorted.len() * 95).div_ceil(100) - 1;
        Some((sorted[sorted.len() / 2], sorted[p95]))
    }

    pub fn incr_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// JSON view for the agent's `/api/tunnel` route.
    pub async fn snapshot(&self) -> Value {
        let now = Instant::now();
        let events: Vec<Value> = self
            .events()
            .await
            .into_iter()
            .map(|e| {
                json!({
                    "type": e.event_type.as_str(),
                    "detail": e.detail,
                    "ago_ms": now.duration_since(e.at).as_millis() as u64,
                })
            })
            .collect();
        let rtt = self
            .rtt_stats()
            .await
            .map(|(median, p95)| json!({"median_ms": median, "p95_ms": p95}));
        json!({
            "connected": self.connected.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "dropped_stream_messages": self.dropped_stream_messages.load(Ordering::Relaxed),
            "rejected_requests": self.rejected_requests.load(Ordering::Relaxed),
            "heartbeat_rtt": rtt,
            "events": events,
        })
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
