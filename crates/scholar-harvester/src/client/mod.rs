//! HTTP transports.
//!
//! Provides:
//! - [`PageRequest`] / [`PageResponse`], the unit every component fetches
//! - the [`Transport`] seam the proxy chain drives
//! - [`HttpTransport`]: pooled reqwest clients, one per egress path
//! - [`RenderTransport`]: the external rendering service

mod render;

pub use render::RenderTransport;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;

use crate::config::Config;
use crate::error::{ClientError, ClientResult, HarvestError, HarvestResult};
use crate::proxy::ProxyDescriptor;

/// Which block-signature set applies to a request's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignatureSet {
    /// Profile-source pages: any captcha mention counts.
    #[default]
    Scholar,
    /// Third-party pages: only full challenge pages count.
    Challenge,
}

/// A GET request as the harvester issues it.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Absolute URL, including the query string.
    pub url: String,

    /// Extra request headers.
    pub headers: Vec<(String, String)>,

    /// Host a usable response must come from; defaults to the URL host.
    pub expected_host: Option<String>,

    /// Block signatures to check responses against.
    pub signatures: SignatureSet,
}

impl PageRequest {
    /// GET `url` with no extra headers.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            expected_host: None,
            signatures: SignatureSet::Scholar,
        }
    }

    /// Build a GET for `base` with query parameters appended.
    pub fn with_query(base: &str, params: &[(&str, &str)]) -> HarvestResult<Self> {
        let url = url::Url::parse_with_params(base, params)
            .map_err(|e| HarvestError::config(format!("invalid URL '{base}': {e}")))?;
        Ok(Self::get(url.to_string()))
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Ask for JSON.
    #[must_use]
    pub fn accept_json(self) -> Self {
        self.header("Accept", "application/json")
    }

    /// Use the third-party signature set.
    #[must_use]
    pub fn third_party(mut self) -> Self {
        self.signatures = SignatureSet::Challenge;
        self
    }
}

/// A response as the harvester keeps it: status, where it ended up, and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResponse {
    /// HTTP status code.
    pub status: u16,

    /// URL after redirects.
    pub final_url: String,

    /// Response body as text.
    pub body: String,

    /// Seconds from a `Retry-After` header, if any.
    pub retry_after: Option<u64>,
}

impl PageResponse {
    /// A 200 response whose final URL is `url`.
    #[must_use]
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self { status: 200, final_url: url.into(), body: body.into(), retry_after: None }
    }

    /// Whether the status answers the question: success, redirect, or a definite
    /// "no such resource".
    #[must_use]
    pub const fn is_conclusive(&self) -> bool {
        self.status < 400 || self.status == 404 || self.status == 410
    }

    /// Whether the status is 404 or 410.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        self.status == 404 || self.status == 410
    }

    /// Map a non-conclusive status to the matching client error.
    #[must_use]
    pub fn status_error(&self) -> Option<ClientError> {
        if self.is_conclusive() {
            return None;
        }
        let message: String = self.body.chars().take(200).collect();
        Some(match self.status {
            429 => ClientError::rate_limited(self.retry_after.unwrap_or(60)),
            400 => ClientError::bad_request(message),
            500..=599 => ClientError::server(self.status, message),
            status => ClientError::UnexpectedStatus { status, message },
        })
    }
}

/// Something that can perform a [`PageRequest`] over a given egress path.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request. Any HTTP status is a response; only transport-level
    /// failures are errors.
    async fn fetch(&self, request: &PageRequest, via: &ProxyDescriptor) -> ClientResult<PageResponse>;
}

/// Plain HTTP transport with one pooled client per egress path.
pub struct HttpTransport {
    /// Clients keyed by proxy URL; `None` is the direct client.
    clients: HashMap<Option<String>, Client>,

    /// Request timeout, reported in timeout errors.
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build clients for the direct path and every configured chain entry.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if a proxy URL is rejected by the HTTP client.
    pub fn new(config: &Config) -> HarvestResult<Self> {
        let mut clients = HashMap::new();
        let direct = ProxyDescriptor::direct();
        for via in std::iter::once(&direct).chain(config.proxy_chain.iter()) {
            let key = via.proxy_url();
            if clients.contains_key(&key) {
                continue;
            }
            let client = build_client(config, via)
                .map_err(|e| HarvestError::config(format!("HTTP client for {}: {e}", via.label())))?;
            clients.insert(key, client);
        }
        Ok(Self { clients, request_timeout: config.request_timeout })
    }
}

fn build_client(config: &Config, via: &ProxyDescriptor) -> Result<Client, reqwest::Error> {
    let builder = Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .gzip(true);

    let builder = match via.proxy_url() {
        Some(url) => builder.proxy(reqwest::Proxy::all(url)?),
        None => builder.no_proxy(),
    };
    builder.build()
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &PageRequest, via: &ProxyDescriptor) -> ClientResult<PageResponse> {
        let client = self
            .clients
            .get(&via.proxy_url())
            .ok_or_else(|| ClientError::bad_request(format!("no client for {}", via.label())))?;

        let mut builder = client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = std::time::Instant::now();
        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        tracing::debug!(
            url = %request.url,
            proxy = %via.label(),
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "http request"
        );

        Ok(PageResponse { status, final_url, body, retry_after })
    }
}

impl HttpTransport {
    fn map_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() { ClientError::Timeout(self.request_timeout) } else { ClientError::Http(e) }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("paths", &self.clients.len()).finish()
    }
}
