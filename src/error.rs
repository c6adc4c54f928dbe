//! Error types shared by the tunnel, the proxy helpers and configuration loading.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Everything that can go wrong while moving a message through a tunnel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    /// Missing or unknown agent token at connect time (401, no upgrade).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Dialing or upgrading the tunnel WebSocket failed.
    #[error("failed to connect tunnel: {0}")]
    Connect(String),

    /// A frame could not be decoded into a `TunnelMessage`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No registered, open tunnel for the environment.
    #[error("no active tunnel for environment {0}")]
    NoActiveTunnel(String),

    /// The caller's deadline elapsed while a request was pending.
    #[error("tunnel request timed out")]
    Timeout,

    /// Send attempted on a closed connection, or the connection went away
    /// while the caller was waiting.
    #[error("tunnel connection closed")]
    TransportClosed,

    /// Socket-level I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent's local handler or local WebSocket endpoint failed.
    #[error("local execution failed: {0}")]
    LocalExecution(String),

    /// Direct (non-tunnel) HTTP request failed.
    #[error("http request failed: {0}")]
    Http(String),
}

impl TunnelError {
    /// Whether this error means the caller ran out of time (504 rather than 502).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<axum::Error> for TunnelError {
    fn from(e: axum::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::TransportClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Configuration could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
