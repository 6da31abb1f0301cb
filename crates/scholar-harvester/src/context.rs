//! Process-wide harvesting context.
//!
//! Built once at start-up from [`Config`] and handed to every component
//! constructor. Tests build isolated contexts with scripted transports.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheEntry, CacheNamespace, Fetched, Fingerprint, HttpCache};
use crate::cancel::CancelToken;
use crate::client::{HttpTransport, PageRequest, PageResponse, RenderTransport, Transport};
use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};
use crate::proxy::{AttemptFailure, ChainSelector, FailureReason, ProxyDescriptor};
use crate::retry::RetryPolicy;

/// How a request leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// One plain request without a proxy. For registries that do not block.
    Direct,
    /// Plain requests through the proxy chain, with block detection.
    Chain,
    /// Rendered fetches through the proxy chain, with block detection.
    Render,
}

/// Shared configuration, cache, transports and cancellation.
#[derive(Clone)]
pub struct HarvestContext {
    config: Arc<Config>,
    cache: HttpCache,
    direct: Arc<dyn Transport>,
    chain: ChainSelector,
    render: ChainSelector,
    cancel: CancelToken,
}

impl HarvestContext {
    /// Build the production context: reqwest transports, rendering service, and the
    /// disk cache when a cache directory is configured.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if an HTTP client cannot be built.
    pub fn new(config: Config) -> HarvestResult<Self> {
        let http: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config)?);
        let render: Arc<dyn Transport> = Arc::new(RenderTransport::new(&config)?);
        let cache = match &config.cache_dir {
            Some(dir) => HttpCache::on_disk(dir, config.cache_ttl),
            None => HttpCache::in_memory(config.cache_ttl),
        };
        Ok(Self::with_transports(config, cache, http, render))
    }

    /// Build a context over explicit transports and cache.
    #[must_use]
    pub fn with_transports(
        config: Config,
        cache: HttpCache,
        http: Arc<dyn Transport>,
        render: Arc<dyn Transport>,
    ) -> Self {
        let cancel = CancelToken::new();
        let chain = ChainSelector::from_config(&config, Arc::clone(&http), cancel.clone());
        let render = ChainSelector::from_config(&config, render, cancel.clone());
        Self { config: Arc::new(config), cache, direct: http, chain, render, cancel }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Response cache.
    #[must_use]
    pub const fn cache(&self) -> &HttpCache {
        &self.cache
    }

    /// Retry policy for per-element fetches.
    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Cancellation token shared by every component using this context.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fingerprint a request as it will be cached on `route`. Rendered pages are
    /// kept apart from plain fetches of the same URL.
    #[must_use]
    pub fn fingerprint(request: &PageRequest, route: Route) -> Fingerprint {
        match route {
            Route::Direct | Route::Chain => Fingerprint::for_request(request),
            Route::Render => Fingerprint::new("RENDER", &request.url, &request.headers),
        }
    }

    /// Fetch through the cache, trusting a success younger than `ttl`.
    ///
    /// Returns the success entry (which may carry a 404/410 status), or
    /// [`HarvestError::Blocked`] when every path was refused.
    pub async fn fetch(
        &self,
        namespace: CacheNamespace,
        request: &PageRequest,
        route: Route,
        ttl: Duration,
    ) -> HarvestResult<CacheEntry> {
        let fingerprint = Self::fingerprint(request, route);
        let entry = self
            .cache
            .get_or_fetch(namespace, &fingerprint, ttl, || self.fetch_uncached(request, route))
            .await?;
        Self::usable(entry, request)
    }

    /// [`fetch`](Self::fetch) with the namespace TTL.
    pub async fn fetch_default(
        &self,
        namespace: CacheNamespace,
        request: &PageRequest,
        route: Route,
    ) -> HarvestResult<CacheEntry> {
        let fingerprint = Self::fingerprint(request, route);
        let entry = self
            .cache
            .get_or_fetch_default(namespace, &fingerprint, || self.fetch_uncached(request, route))
            .await?;
        Self::usable(entry, request)
    }

    fn usable(entry: CacheEntry, request: &PageRequest) -> HarvestResult<CacheEntry> {
        if entry.is_success() {
            Ok(entry)
        } else {
            Err(HarvestError::Blocked { url: request.url.clone() })
        }
    }

    async fn fetch_uncached(&self, request: &PageRequest, route: Route) -> HarvestResult<Fetched> {
        match route {
            Route::Direct => {
                let response = self.direct.fetch(request, &ProxyDescriptor::direct()).await?;
                match response.status_error() {
                    None => Ok(Fetched::Success(response)),
                    Some(e) => Err(e.into()),
                }
            }
            Route::Chain => through(&self.chain, request).await,
            Route::Render => through(&self.render, request).await,
        }
    }
}

/// Run the chain; a traversal where every attempt was refused is a blocked outcome
/// rather than an error.
async fn through(chain: &ChainSelector, request: &PageRequest) -> HarvestResult<Fetched> {
    match chain.fetch_via_chain(request).await {
        Ok(response) => Ok(Fetched::Success(response)),
        Err(HarvestError::ChainExhausted { failures })
            if !failures.is_empty() && failures.iter().all(AttemptFailure::is_block) =>
        {
            let status = failures
                .iter()
                .rev()
                .find_map(|f| match f.reason {
                    FailureReason::Status(code) => Some(code),
                    _ => None,
                })
                .unwrap_or(0);
            Ok(Fetched::Blocked(PageResponse {
                status,
                final_url: request.url.clone(),
                body: String::new(),
                retry_after: None,
            }))
        }
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for HarvestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestContext")
            .field("chain", &self.chain)
            .field("cache", &self.cache)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
