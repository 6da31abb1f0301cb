//! Configuration for the harvester.
//!
//! Loaded once at process start (environment plus an optional `.env` file) and
//! shared read-only through [`crate::HarvestContext`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::NamespaceTtls;
use crate::error::{HarvestError, HarvestResult};
use crate::proxy::ProxyDescriptor;
use crate::retry::RetryPolicy;

/// Endpoint and timing defaults.
pub mod api {
    use std::time::Duration;

    /// Google Scholar base URL.
    pub const SCHOLAR_URL: &str = "https://scholar.google.com";

    /// Crossref REST API.
    pub const CROSSREF_API: &str = "https://api.crossref.org";

    /// doi.org (handle API and DOI links).
    pub const DOI_URL: &str = "https://doi.org";

    /// Altmetric public API.
    pub const ALTMETRIC_API: &str = "https://api.altmetric.com/v1";

    /// Rendering service (headless browser behind an HTTP endpoint).
    pub const RENDER_URL: &str = "http://localhost:3000";

    /// Browser-like user agent; the profile source rejects obvious clients.
    pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    /// Request timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Rendered fetches are slow.
    pub const RENDER_TIMEOUT: Duration = Duration::from_secs(90);

    /// Connection timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Retry attempts per element.
    pub const MAX_RETRIES: u32 = 3;

    /// Delay before the second attempt.
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

    /// Profile-source pages (30 days).
    pub const PROFILE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    /// DOI lookups (30 days).
    pub const IDENTIFIER_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    /// Metrics responses (14 days).
    pub const METRICS_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

    /// Skip a full run if the dataset is younger than this (7 days).
    pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Successful metrics older than this are revalidated (7 days).
    pub const STALENESS_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Delay between co-author pages.
    pub const COAUTHOR_DELAY: Duration = Duration::from_secs(2);

    /// Delay between publication pages and DOI lookups.
    pub const PUBLICATION_DELAY: Duration = Duration::from_secs(1);

    /// Delay between metrics requests.
    pub const METRICS_DELAY: Duration = Duration::from_secs(1);

    /// Attempts on the relay entry before moving on.
    pub const RELAY_ATTEMPTS: u32 = 5;

    /// Bound on a single relay attempt.
    pub const RELAY_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Harvester configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Profile source base URL (for testing with mock servers).
    pub scholar_url: String,

    /// Crossref API base URL.
    pub crossref_url: String,

    /// doi.org base URL.
    pub doi_url: String,

    /// Altmetric API base URL.
    pub altmetric_url: String,

    /// Rendering service base URL.
    pub render_url: String,

    /// Directory holding one dataset document per profile.
    pub data_dir: PathBuf,

    /// Directory for the persistent response cache; in-memory when `None`.
    pub cache_dir: Option<PathBuf>,

    /// Retry policy for per-element fetches.
    pub retry: RetryPolicy,

    /// Per-namespace cache TTLs.
    pub cache_ttl: NamespaceTtls,

    /// Full runs are skipped while the dataset is younger than this.
    pub freshness_window: Duration,

    /// Successful metrics older than this are revalidated.
    pub staleness_window: Duration,

    /// Delay between co-author fetches.
    pub coauthor_delay: Duration,

    /// Delay between publication fetches and DOI resolutions.
    pub publication_delay: Duration,

    /// Delay between metrics fetches.
    pub metrics_delay: Duration,

    /// Ordered egress chain.
    pub proxy_chain: Vec<ProxyDescriptor>,

    /// Attempts on each relay entry.
    pub relay_attempts: u32,

    /// Bound on a single relay attempt.
    pub relay_timeout: Duration,

    /// Request timeout.
    pub request_timeout: Duration,

    /// Request timeout for the rendering service.
    pub render_timeout: Duration,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// User agent sent with plain requests.
    pub user_agent: String,
}

impl Config {
    /// Create a configuration with production defaults and the given egress chain.
    ///
    /// An empty chain means a single direct entry.
    #[must_use]
    pub fn new(proxy_chain: Vec<ProxyDescriptor>) -> Self {
        let proxy_chain =
            if proxy_chain.is_empty() { vec![ProxyDescriptor::direct()] } else { proxy_chain };
        Self {
            scholar_url: api::SCHOLAR_URL.to_string(),
            crossref_url: api::CROSSREF_API.to_string(),
            doi_url: api::DOI_URL.to_string(),
            altmetric_url: api::ALTMETRIC_API.to_string(),
            render_url: api::RENDER_URL.to_string(),
            data_dir: PathBuf::from("scholar_data"),
            cache_dir: Some(PathBuf::from("cache")),
            retry: RetryPolicy::new(api::MAX_RETRIES, api::RETRY_BASE_DELAY),
            cache_ttl: NamespaceTtls {
                profile: api::PROFILE_TTL,
                identifier: api::IDENTIFIER_TTL,
                metrics: api::METRICS_TTL,
            },
            freshness_window: api::FRESHNESS_WINDOW,
            staleness_window: api::STALENESS_WINDOW,
            coauthor_delay: api::COAUTHOR_DELAY,
            publication_delay: api::PUBLICATION_DELAY,
            metrics_delay: api::METRICS_DELAY,
            proxy_chain,
            relay_attempts: api::RELAY_ATTEMPTS,
            relay_timeout: api::RELAY_TIMEOUT,
            request_timeout: api::REQUEST_TIMEOUT,
            render_timeout: api::RENDER_TIMEOUT,
            connect_timeout: api::CONNECT_TIMEOUT,
            user_agent: api::USER_AGENT.to_string(),
        }
    }

    /// Create a test configuration pointing every source at one mock server.
    ///
    /// No delays, no backoff, in-memory cache.
    #[must_use]
    pub fn for_testing(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            scholar_url: base.to_string(),
            crossref_url: format!("{base}/crossref"),
            doi_url: format!("{base}/doi"),
            altmetric_url: format!("{base}/altmetric/v1"),
            render_url: format!("{base}/render"),
            data_dir: std::env::temp_dir().join("scholar-harvester-test"),
            cache_dir: None,
            retry: RetryPolicy::new(3, Duration::ZERO),
            freshness_window: api::FRESHNESS_WINDOW,
            staleness_window: api::STALENESS_WINDOW,
            coauthor_delay: Duration::ZERO,
            publication_delay: Duration::ZERO,
            metrics_delay: Duration::ZERO,
            relay_attempts: 2,
            relay_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            render_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            ..Self::new(Vec::new())
        }
    }

    /// Create configuration from environment variables (and `.env` if present).
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if a variable is present but malformed.
    pub fn from_env() -> HarvestResult<Self> {
        dotenv::dotenv().ok();

        let mut chain = Vec::new();
        if let Some(relay) = env_string("TOR_PROXY") {
            chain.push(ProxyDescriptor::relay(&relay)?);
        }
        if let Some(raw) = env_string("SOCKS5_PROXIES") {
            chain.extend(ProxyDescriptor::parse_socks_list(&raw)?);
        }

        let mut config = Self::new(chain);
        let defaults = config.clone();

        if let Some(dir) = env_string("SCHOLAR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = env_string("RENDER_URL") {
            config.render_url = url;
        }

        config.retry = RetryPolicy::new(
            env_parse("MAX_RETRIES", defaults.retry.max_attempts)?,
            env_secs("RETRY_BASE_DELAY", defaults.retry.base_delay)?,
        )
        .with_jitter(env_parse("RETRY_JITTER", false)?);

        config.cache_ttl = NamespaceTtls {
            profile: env_secs("CACHE_PROFILE_TTL", defaults.cache_ttl.profile)?,
            identifier: env_secs("CACHE_IDENTIFIER_TTL", defaults.cache_ttl.identifier)?,
            metrics: env_secs("CACHE_METRICS_TTL", defaults.cache_ttl.metrics)?,
        };
        config.freshness_window = env_secs("FRESH_DATA_SECONDS", defaults.freshness_window)?;
        config.staleness_window = env_secs("METRICS_STALENESS", defaults.staleness_window)?;
        config.coauthor_delay = env_secs("COAUTHOR_DELAY", defaults.coauthor_delay)?;
        config.publication_delay = env_secs("PUBLICATION_DELAY", defaults.publication_delay)?;
        config.metrics_delay = env_secs("METRICS_DELAY", defaults.metrics_delay)?;
        config.relay_attempts = env_parse("RELAY_ATTEMPTS", defaults.relay_attempts)?;
        config.relay_timeout = env_secs("RELAY_TIMEOUT", defaults.relay_timeout)?;

        Ok(config)
    }

    /// Whether any non-direct egress path is configured.
    #[must_use]
    pub fn has_proxies(&self) -> bool {
        self.proxy_chain.iter().any(|p| !p.is_direct())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> HarvestResult<T> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| HarvestError::config(format!("{name}: cannot parse '{raw}'"))),
    }
}

/// Durations are configured in (possibly fractional) seconds.
fn env_secs(name: &str, default: Duration) -> HarvestResult<Duration> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => parse_secs(&raw)
            .ok_or_else(|| HarvestError::config(format!("{name}: '{raw}' is not a duration in seconds"))),
    }
}

fn parse_secs(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}
