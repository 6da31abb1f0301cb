//! Egress paths and the proxy chain selector.
//!
//! The chain is tried in configured order. A relay entry (an anonymizing HTTP proxy
//! that rotates its own exit) is slow rather than down, so it gets several bounded
//! attempts; every other entry gets exactly one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::client::{PageRequest, PageResponse, Transport};
use crate::config::Config;
use crate::detect::BlockDetector;
use crate::error::{ClientError, HarvestError, HarvestResult};

/// Kind of egress path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// No proxy.
    Direct,
    /// Anonymizing relay (e.g. a Tor HTTP bridge).
    Relay,
    /// Rotating SOCKS5 proxy.
    Socks,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Relay => "relay",
            Self::Socks => "socks",
        })
    }
}

/// Proxy credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

/// One entry of the egress chain. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Kind of path.
    pub kind: ProxyKind,
    /// Proxy URL for relays, `host:port` for SOCKS, empty for direct.
    pub host: String,
    /// Optional credentials (SOCKS only).
    pub credentials: Option<Credentials>,
}

impl ProxyDescriptor {
    /// The direct path.
    #[must_use]
    pub fn direct() -> Self {
        Self { kind: ProxyKind::Direct, host: String::new(), credentials: None }
    }

    /// A relay reached over HTTP, e.g. `http://localhost:3128` or `localhost:3128`.
    pub fn relay(url: &str) -> HarvestResult<Self> {
        let url = url.trim().trim_end_matches('/');
        let url =
            if url.contains("://") { url.to_string() } else { format!("http://{url}") };
        url::Url::parse(&url)
            .map_err(|e| HarvestError::config(format!("relay proxy '{url}': {e}")))?;
        Ok(Self { kind: ProxyKind::Relay, host: url, credentials: None })
    }

    /// A SOCKS5 proxy at `host:port`.
    #[must_use]
    pub fn socks(host: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self { kind: ProxyKind::Socks, host: host.into(), credentials }
    }

    /// Parse a SOCKS5 list: one `host:port|user|password` per line or `;`-separated.
    ///
    /// The password is everything after the second `|`, so it may contain `|`.
    pub fn parse_socks_list(raw: &str) -> HarvestResult<Vec<Self>> {
        raw.split(['\n', ';'])
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let mut parts = entry.splitn(3, '|');
                let host = parts.next().unwrap_or_default().trim();
                let (Some(user), Some(pass)) = (parts.next(), parts.next()) else {
                    return Err(HarvestError::config(format!(
                        "SOCKS5 entry '{host}' must be host:port|user|password"
                    )));
                };
                if host.is_empty() {
                    return Err(HarvestError::config("SOCKS5 entry with empty host"));
                }
                let credentials = Credentials {
                    username: user.trim().to_string(),
                    password: pass.trim().to_string(),
                };
                Ok(Self::socks(host, Some(credentials)))
            })
            .collect()
    }

    /// Whether this is the direct path.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.kind == ProxyKind::Direct
    }

    /// Proxy URL for the HTTP client; `None` for direct.
    ///
    /// Credentials are percent-encoded so characters like `@` or `*` survive.
    #[must_use]
    pub fn proxy_url(&self) -> Option<String> {
        match self.kind {
            ProxyKind::Direct => None,
            ProxyKind::Relay => Some(self.host.clone()),
            ProxyKind::Socks => Some(match &self.credentials {
                Some(c) => format!(
                    "socks5://{}:{}@{}",
                    urlencoding::encode(&c.username),
                    urlencoding::encode(&c.password),
                    self.host
                ),
                None => format!("socks5://{}", self.host),
            }),
        }
    }

    /// Log-safe label (never includes credentials).
    #[must_use]
    pub fn label(&self) -> String {
        match self.kind {
            ProxyKind::Direct => "direct".to_string(),
            kind => format!("{kind}({})", self.host),
        }
    }
}

/// Why one chain attempt did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Connection-level failure.
    Network(String),
    /// The attempt exceeded its time bound.
    Timeout(Duration),
    /// The Block Detector flagged the response.
    Blocked,
    /// The response status was a refusal (403, 429, 5xx, ...).
    Status(u16),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Timeout(d) => write!(f, "timed out after {d:?}"),
            Self::Blocked => f.write_str("blocked"),
            Self::Status(code) => write!(f, "status {code}"),
        }
    }
}

/// One failed attempt inside a chain traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Index of the chain entry.
    pub entry: usize,
    /// Kind of the chain entry.
    pub kind: ProxyKind,
    /// 1-based attempt number on that entry.
    pub attempt: u32,
    /// What went wrong.
    pub reason: FailureReason,
}

impl AttemptFailure {
    /// Whether the source actively refused this attempt.
    #[must_use]
    pub fn is_block(&self) -> bool {
        matches!(self.reason, FailureReason::Blocked | FailureReason::Status(403 | 429))
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} attempt {}: {}", self.kind, self.entry, self.attempt, self.reason)
    }
}

/// Tries each egress path in order until one yields a usable response.
#[derive(Clone)]
pub struct ChainSelector {
    chain: Arc<[ProxyDescriptor]>,
    transport: Arc<dyn Transport>,
    relay_attempts: u32,
    relay_timeout: Duration,
    cancel: CancelToken,
}

impl ChainSelector {
    /// Create a selector over an explicit chain. An empty chain becomes `[direct]`.
    #[must_use]
    pub fn new(
        chain: Vec<ProxyDescriptor>,
        transport: Arc<dyn Transport>,
        relay_attempts: u32,
        relay_timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        let chain = if chain.is_empty() { vec![ProxyDescriptor::direct()] } else { chain };
        Self { chain: chain.into(), transport, relay_attempts, relay_timeout, cancel }
    }

    /// Create a selector over the configured chain.
    #[must_use]
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>, cancel: CancelToken) -> Self {
        Self::new(
            config.proxy_chain.clone(),
            transport,
            config.relay_attempts,
            config.relay_timeout,
            cancel,
        )
    }

    /// The configured chain.
    #[must_use]
    pub fn chain(&self) -> &[ProxyDescriptor] {
        &self.chain
    }

    fn attempts_for(&self, via: &ProxyDescriptor) -> u32 {
        match via.kind {
            ProxyKind::Relay => self.relay_attempts.max(1),
            ProxyKind::Direct | ProxyKind::Socks => 1,
        }
    }

    async fn attempt(&self, request: &PageRequest, via: &ProxyDescriptor) -> Result<PageResponse, ClientError> {
        if via.kind != ProxyKind::Relay {
            return self.transport.fetch(request, via).await;
        }
        match tokio::time::timeout(self.relay_timeout, self.transport.fetch(request, via)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.relay_timeout)),
        }
    }

    /// Fetch `request` through the chain.
    ///
    /// Returns the first response that has an acceptable status and passes the
    /// Block Detector. Fails with [`HarvestError::ChainExhausted`] listing every
    /// attempt in order, or [`HarvestError::Cancelled`] between attempts.
    pub async fn fetch_via_chain(&self, request: &PageRequest) -> HarvestResult<PageResponse> {
        let detector = BlockDetector::for_request(request);
        let mut failures = Vec::new();

        for (entry, via) in self.chain.iter().enumerate() {
            for attempt in 1..=self.attempts_for(via) {
                self.cancel.check()?;

                let reason = match self.attempt(request, via).await {
                    Ok(response) if !response.is_conclusive() => {
                        FailureReason::Status(response.status)
                    }
                    Ok(response) if detector.is_blocked(&response.final_url, &response.body) => {
                        tracing::warn!(
                            url = %request.url,
                            final_url = %response.final_url,
                            proxy = %via.label(),
                            attempt,
                            "block detected"
                        );
                        FailureReason::Blocked
                    }
                    Ok(response) => {
                        tracing::debug!(url = %request.url, proxy = %via.label(), attempt, "chain attempt succeeded");
                        return Ok(response);
                    }
                    Err(ClientError::Timeout(bound)) => FailureReason::Timeout(bound),
                    Err(e) => FailureReason::Network(e.to_string()),
                };

                tracing::info!(
                    url = %request.url,
                    proxy = %via.label(),
                    attempt,
                    reason = %reason,
                    "chain attempt failed"
                );
                failures.push(AttemptFailure { entry, kind: via.kind, attempt, reason });
            }
        }

        tracing::error!(url = %request.url, attempts = failures.len(), "proxy chain exhausted");
        Err(HarvestError::ChainExhausted { failures })
    }
}

impl fmt::Debug for ChainSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSelector")
            .field("chain", &self.chain.iter().map(ProxyDescriptor::label).collect::<Vec<_>>())
            .field("relay_attempts", &self.relay_attempts)
            .finish()
    }
}
