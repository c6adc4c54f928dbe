//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `EDGEWIRE_LISTEN`, `EDGEWIRE_API_KEY`,
//!    `EDGEWIRE_MANAGER_URL`, `EDGEWIRE_AGENT_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `edgewire.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3552"
//!
//! [auth]
//! api_key = "admin-secret"          # Bearer key for /api/tunnel/status
//!
//! [logging]
//! level = "info"
//!
//! [manager]
//! heartbeat_timeout_secs = 120
//! sweep_interval_secs = 300
//! proxy_timeout_secs = 300
//! [manager.agent_tokens]
//! "abc" = "env-1"
//!
//! [agent]
//! manager_url = "https://manager.example.com"
//! agent_token = "abc"
//! local_port = 3552                # defaults to the port of server.listen
//! heartbeat_interval_secs = 30
//! reconnect_interval_secs = 5
//! request_timeout_secs = 300
//! max_concurrent_requests = 64
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tunnel::ClientConfig;

const DEFAULT_CONFIG_FILE: &str = "edgewire.toml";
const DEFAULT_LOCAL_PORT: u16 = 3552;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3552`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer key for admin routes. Defaults to `"change-me"`, which logs a warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Manager-side tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// A tunnel without a heartbeat for this long is stale (default 120).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between stale sweeps (default 300).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Timeout for one proxied request (default 300).
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Agent token → environment ID.
    #[serde(default)]
    pub agent_tokens: HashMap<String, String>,
}

/// Agent-side tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Manager base URL (`http(s)://` or `ws(s)://`).
    #[serde(default)]
    pub manager_url: String,
    #[serde(default)]
    pub agent_token: String,
    /// Local port bridged `ws_start` streams dial. Unset means the port of
    /// `server.listen`, where the agent serves its own router.
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Clamped to at least 1.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_proxy_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_listen() -> String {
    "0.0.0.0:3552".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    120
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_proxy_timeout() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_max_concurrent_requests() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            proxy_timeout_secs: default_proxy_timeout(),
            agent_tokens: HashMap::new(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            manager_url: String::new(),
            agent_token: String::new(),
            local_port: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            request_timeout_secs: default_proxy_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl ManagerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }
}

impl AgentConfig {
    /// Tunnel client settings. `listen` is the agent's own bind address.
    pub fn client_config(&self, listen: &str) -> ClientConfig {
        let local_port = self
            .local_port
            .or_else(|| listen_port(listen))
            .unwrap_or(DEFAULT_LOCAL_PORT);
        ClientConfig {
            manager_url: self.manager_url.clone(),
            agent_token: self.agent_token.clone(),
            local_port,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs.max(1)),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_concurrent_requests: self.max_concurrent_requests,
        }
    }
}

/// Port of a `host:port` bind address.
fn listen_port(listen: &str) -> Option<u16> {
    listen.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `edgewire.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("EDGEWIRE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("EDGEWIRE_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(url) = lookup("EDGEWIRE_MANAGER_URL") {
            self.agent.manager_url = url;
        }
        if let Some(token) = lookup("EDGEWIRE_AGENT_TOKEN") {
            self.agent.agent_token = token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("test.toml", "").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3552");
        assert_eq!(config.manager.heartbeat_timeout(), Duration::from_secs(120));
        assert_eq!(config.manager.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.manager.proxy_timeout(), Duration::from_secs(300));
        assert_eq!(config.agent.heartbeat_interval_secs, 30);
        assert_eq!(config.agent.reconnect_interval_secs, 5);
        assert_eq!(config.agent.local_port, None);
        assert_eq!(
            config.agent.client_config(&config.server.listen).local_port,
            3552
        );
        assert!(config.manager.agent_tokens.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let config = Config::parse(
            "test.toml",
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [manager]
            heartbeat_timeout_secs = 60
            [manager.agent_tokens]
            "abc" = "env-1"

            [agent]
            manager_url = "https://manager.example.com"
            agent_token = "abc"
            reconnect_interval_secs = 0
            max_concurrent_requests = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.manager.agent_tokens["abc"], "env-1");
        assert_eq!(config.manager.heartbeat_timeout_secs, 60);

        let client = config.agent.client_config(&config.server.listen);
        assert_eq!(client.manager_url, "https://manager.example.com");
        assert_eq!(client.reconnect_interval, Duration::from_secs(1));
        assert_eq!(client.max_concurrent_requests, 8);
    }

    #[test]
    fn local_port_follows_listen_unless_set() {
        let mut agent = AgentConfig::default();
        assert_eq!(agent.client_config("127.0.0.1:9100").local_port, 9100);
        assert_eq!(agent.client_config("[::]:9200").local_port, 9200);
        assert_eq!(agent.client_config("not-an-addr").local_port, 3552);
        agent.local_port = Some(8080);
        assert_eq!(agent.client_config("127.0.0.1:9100").local_port, 8080);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "EDGEWIRE_LISTEN" => Some("0.0.0.0:1".into()),
            "EDGEWIRE_AGENT_TOKEN" => Some("from-env".into()),
            _ => None,
        });
        assert_eq!(config.server.listen, "0.0.0.0:1");
        assert_eq!(config.agent.agent_token, "from-env");
        assert_eq!(config.auth.api_key, "change-me");
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let err = Config::parse("bad.toml", "[server\nlisten = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn missing_explicit_file_is_read_error() {
        let err = Config::load(Some("/nonexistent/edgewire.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
