//! Edge tunnel: multiplexed RPC over one agent-initiated WebSocket.
//!
//! The manager cannot reach an edge agent, so the agent dials out to
//! [`CONNECT_PATH`] and keeps that socket open. The manager then drives HTTP
//! requests and WebSocket streams into the agent over it, correlating replies
//! by message ID.
//!
//! ```text
//! manager                                   agent
//!   TunnelServer  <── /api/tunnel/connect ──  TunnelClient
//!   TunnelRegistry                             local Router
//!   proxy / EdgeAwareClient                    ws://localhost:<port>
//! ```
//!
//! - `message`      wire protocol
//! - `conn`         framed send/receive over one socket
//! - `pending`      correlation table
//! - `agent`        per-environment session state (manager side)
//! - `registry`     environment ID → live tunnel
//! - `server`       manager connect handler and receive loop
//! - `client`       agent dial/reconnect loop and local execution
//! - `proxy`        unary and WebSocket proxying through a tunnel
//! - `edge_client`  tunnel-or-direct transport selection
//! - `stats`        agent-side counters and event history

use std::time::Duration;

pub mod agent;
pub mod client;
pub mod conn;
pub mod edge_client;
pub mod message;
pub mod pending;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod stats;

pub use agent::AgentTunnel;
pub use client::{ClientConfig, ClientEvent, TunnelClient};
pub use conn::{TunnelConn, TunnelReader};
pub use edge_client::{EdgeAwareClient, Environment, Transport};
pub use message::{MessageKind, TunnelMessage, WireHeaders, WsMessageType};
pub use proxy::{
    proxy_http_request, proxy_request, proxy_websocket_request, ProxiedResponse, ProxyRequest,
};
pub use registry::{TunnelInfo, TunnelRegistry};
pub use server::{
    spawn_stale_sweep, LoggingStatusReporter, StaticTokenResolver, StatusReporter, TokenResolver,
    TunnelServer,
};
pub use stats::TunnelStats;

/// Manager endpoint agents dial.
pub const CONNECT_PATH: &str = "/api/tunnel/connect";

/// Agent credential header. [`API_KEY_HEADER`] is accepted as an alias.
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";
pub const API_KEY_HEADER: &str = "x-api-key";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(120);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
