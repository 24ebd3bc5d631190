use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use control_plane::RequestContext;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::Method;
use thiserror::Error;
use tracing::warn;

/// Hop-by-hop and security-sensitive headers never forwarded upstream,
/// independent of the configurable blocklist.
const ALWAYS_BLOCKED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "content-length",
    "cookie",
    "set-cookie",
];

/// Headers dropped from upstream responses before they reach the client.
const RESPONSE_EXCLUDED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-encoding",
    "content-length",
];

#[derive(Clone, Debug)]
pub struct UpstreamClientConfig {
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub max_keepalive_connections: usize,
    pub max_connections: usize,
    pub user_agent: String,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_retries: 2,
            max_keepalive_connections: 20,
            max_connections: 100,
            user_agent: "warden-gateway".to_string(),
        }
    }
}

/// Header forwarding policy applied before a request leaves the gateway.
#[derive(Clone, Debug, Default)]
pub struct HeaderPolicy {
    pub forward_authorization: bool,
    pub blocked_headers: Vec<String>,
}

impl HeaderPolicy {
    /// Build the upstream header map: surviving client headers plus the
    /// gateway's identity headers, which always win.
    pub fn apply(
        &self,
        ctx: &RequestContext,
        client_headers: &HashMap<String, String>,
        client_ip: Option<&str>,
    ) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        for (name, value) in client_headers {
            let name_lower = name.to_lowercase();
            if ALWAYS_BLOCKED_HEADERS.contains(&name_lower.as_str()) {
                continue;
            }
            if self.blocked_headers.iter().any(|blocked| blocked == &name_lower) {
                continue;
            }
            if name_lower == "authorization" {
                if self.forward_authorization {
                    headers.insert(name_lower, value.clone());
                }
                continue;
            }
            headers.insert(name_lower, value.clone());
        }

        headers.insert("x-gateway-request-id".to_string(), ctx.request_id.clone());
        headers.insert("x-tenant-id".to_string(), ctx.tenant_id.clone());
        headers.insert("x-workspace-id".to_string(), ctx.workspace_id.clone());
        headers.insert("x-agent-id".to_string(), ctx.agent_id.clone());
        headers.insert(
            "x-forwarded-for".to_string(),
            client_ip.unwrap_or("unknown").to_string(),
        );
        headers
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct ForwardOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream timeout")]
    Timeout,
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("invalid upstream request: {0}")]
    BadRequest(String),
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn send(&self, upstream: &UpstreamRequest) -> Result<ForwardOutcome, ForwardError>;
}

/// Pooled HTTP forwarder with retry. Connect failures are always
/// retriable; timeouts and 502/503/504 retry only for idempotent methods,
/// with exponential backoff and full jitter between attempts.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamClientConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .pool_max_idle_per_host(config.max_keepalive_connections.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }

    /// Reachability probe for a configured upstream. Anything below 500
    /// counts as alive.
    pub async fn probe(&self, upstream_url: &str) -> bool {
        match self
            .client
            .get(upstream_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 500,
            Err(err) => {
                warn!(upstream_url, error = %err, "upstream probe failed");
                false
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        upstream: &UpstreamRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut headers = HeaderMap::new();
        let mut has_user_agent = false;
        for (name, value) in &upstream.headers {
            if name.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if !has_user_agent {
            if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }

        let mut request = self.client.request(method, &upstream.url).headers(headers);
        if let Some(body) = &upstream.body {
            request = request.body(body.clone());
        }
        request.send().await
    }
}

#[async_trait]
impl Forwarder for UpstreamClient {
    async fn send(&self, upstream: &UpstreamRequest) -> Result<ForwardOutcome, ForwardError> {
        let method = Method::from_bytes(upstream.method.as_bytes())
            .map_err(|err| ForwardError::BadRequest(err.to_string()))?;
        let idempotent = matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.send_once(method.clone(), upstream).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retriable_status = matches!(status, 502 | 503 | 504);
                    if retriable_status && idempotent && attempt < max_attempts {
                        warn!(url = %upstream.url, status, attempt, "retrying upstream error status");
                        backoff(attempt).await;
                        continue;
                    }
                    let headers = collect_response_headers(response.headers());
                    let body = response
                        .bytes()
                        .await
                        .map_err(|err| ForwardError::Unavailable(err.to_string()))?;
                    return Ok(ForwardOutcome {
                        status,
                        headers,
                        body: body.to_vec(),
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_connect() => {
                    if attempt < max_attempts {
                        warn!(url = %upstream.url, attempt, "retrying upstream connect failure");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(ForwardError::Unavailable(err.to_string()));
                }
                Err(err) if err.is_timeout() => {
                    if idempotent && attempt < max_attempts {
                        warn!(url = %upstream.url, attempt, "retrying upstream timeout");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(ForwardError::Timeout);
                }
                Err(err) => return Err(ForwardError::Unavailable(err.to_string())),
            }
        }
    }
}

async fn backoff(attempt: u32) {
    let cap = 100u64.saturating_mul(1 << attempt.min(6));
    let jittered = rand::thread_rng().gen_range(0..=cap);
    tokio::time::sleep(Duration::from_millis(jittered)).await;
}

fn collect_response_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut collected = HashMap::new();
    for (name, value) in headers {
        let name_lower = name.as_str().to_lowercase();
        if RESPONSE_EXCLUDED_HEADERS.contains(&name_lower.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            collected.insert(name_lower, value.to_string());
        }
    }
    collected
}

pub fn build_upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let mut url = if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    if let Some(query) = query {
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
    }
    url
}

/// Echoes the request body back. Test double for flows that do not need a
/// live upstream.
pub struct EchoForwarder;

#[async_trait]
impl Forwarder for EchoForwarder {
    async fn send(&self, upstream: &UpstreamRequest) -> Result<ForwardOutcome, ForwardError> {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Ok(ForwardOutcome {
            status: 200,
            headers,
            body: upstream.body.clone().unwrap_or_default(),
            attempts: 1,
        })
    }
}
