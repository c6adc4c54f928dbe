//! Transport selection: tunnel for edge environments, plain HTTP otherwise.
//!
//! Edge environments are unreachable directly, so a missing tunnel is an
//! immediate `NoActiveTunnel` error rather than a fallback to direct HTTP.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::Request;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use super::message::{headers_from_wire, headers_to_wire};
use super::proxy::{proxy_request, ProxiedResponse, ProxyRequest};
use super::registry::TunnelRegistry;
use crate::error::{Result, TunnelError};

/// A managed environment as far as transport selection is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub id: String,
    /// Base URL for direct calls; unused for edge environments.
    pub api_url: String,
    pub is_edge: bool,
}

impl Environment {
    pub fn edge(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_url: String::new(),
            is_edge: true,
        }
    }

    pub fn direct(id: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_url: api_url.into(),
            is_edge: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tunnel,
    Direct,
}

#[derive(Clone)]
pub struct EdgeAwareClient {
    registry: TunnelRegistry,
    http: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl EdgeAwareClient {
    pub fn new(registry: TunnelRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            http: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        }
    }

    pub async fn select_transport(&self, env: &Environment) -> Result<Transport> {
        if !env.is_edge {
            return Ok(Transport::Direct);
        }
        if self.registry.has_active_tunnel(&env.id).await {
            Ok(Transport::Tunnel)
        } else {
            Err(TunnelError::NoActiveTunnel(env.id.clone()))
        }
    }

    /// Run `req` against `env` over whichever transport applies.
    pub async fn do_request(&self, env: &Environment, req: ProxyRequest) -> Result<ProxiedResponse> {
        match self.select_transport(env).await? {
            Transport::Tunnel => proxy_request(&self.registry, &env.id, req, self.timeout).await,
            Transport::Direct => self.direct(env, req).await,
        }
    }

    async fn direct(&self, env: &Environment, req: ProxyRequest) -> Result<ProxiedResponse> {
        let mut url = format!("{}{}", env.api_url.trim_end_matches('/'), req.path);
        if !req.query.is_empty() {
            url.push('?');
            url.push_str(&req.query);
        }
        debug!(environment_id = %env.id, url = %url, method = %req.method, "Direct request");

        let mut request = Request::builder()
            .method(req.method.as_str())
            .uri(&url)
            .body(Full::new(Bytes::from(req.body)))
            .map_err(|e| TunnelError::Http(e.to_string()))?;
        *request.headers_mut() = headers_from_wire(&req.headers);

        let response = tokio::time::timeout(self.timeout, self.http.request(request))
            .await
            .map_err(|_| TunnelError::Timeout)?
            .map_err(|e| TunnelError::Http(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TunnelError::Http(e.to_string()))?
            .to_bytes();
        Ok(ProxiedResponse {
            status: parts.status.as_u16(),
            headers: headers_to_wire(&parts.headers),
            body: body.to_vec(),
        })
    }
}
