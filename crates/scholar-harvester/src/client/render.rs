//! Transport backed by the external rendering service.
//!
//! The service takes `{"url", "proxy"}` and answers with the rendered HTML. It
//! may report where the browser ended up in an `X-Final-Url` header; without one
//! the requested URL is assumed.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use super::{PageRequest, PageResponse, Transport};
use crate::config::Config;
use crate::error::{ClientError, ClientResult, HarvestError, HarvestResult};
use crate::proxy::ProxyDescriptor;

const FINAL_URL_HEADER: &str = "x-final-url";

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<String>,
}

/// Fetches pages through a headless browser.
#[derive(Debug, Clone)]
pub struct RenderTransport {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl RenderTransport {
    /// Create a transport for the configured rendering service.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> HarvestResult<Self> {
        let client = Client::builder()
            .timeout(config.render_timeout)
            .connect_timeout(config.connect_timeout)
            .no_proxy()
            .build()
            .map_err(|e| HarvestError::config(format!("render client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/scrape", config.render_url.trim_end_matches('/')),
            timeout: config.render_timeout,
        })
    }
}

#[async_trait::async_trait]
impl Transport for RenderTransport {
    async fn fetch(&self, request: &PageRequest, via: &ProxyDescriptor) -> ClientResult<PageResponse> {
        let payload = RenderRequest { url: &request.url, proxy: via.proxy_url() };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { ClientError::Timeout(self.timeout) } else { e.into() })?;

        let status = response.status().as_u16();
        let final_url = response
            .headers()
            .get(FINAL_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or_else(|| request.url.clone(), str::to_string);
        let body = response.text().await?;

        tracing::debug!(url = %request.url, proxy = %via.label(), status, "rendered fetch");

        Ok(PageResponse { status, final_url, body, retry_after: None })
    }
}
