//! HTTP response cache.
//!
//! Responses are keyed by a request [`Fingerprint`] inside a [`CacheNamespace`],
//! and each namespace expires on its own TTL. Only successful entries are ever
//! served as fresh; blocked and failed outcomes are kept for inspection but always
//! refetched, and never overwrite an earlier success.
//!
//! Nothing is evicted by size. The on-disk store grows until an operator prunes it.

mod store;

pub use store::{CacheStore, DiskStore, MemoryStore};

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::client::{PageRequest, PageResponse};

/// Headers that change what a source returns for the same URL.
const VARYING_HEADERS: &[&str] = &["accept", "accept-language"];

/// Independent expiry domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheNamespace {
    /// Profile-source pages.
    Profile,
    /// DOI lookups (registry queries, rendered publisher pages, handle API).
    Identifier,
    /// Attention metrics.
    Metrics,
}

impl CacheNamespace {
    /// Stable name, used as the on-disk directory.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Identifier => "identifier",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TTL per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceTtls {
    /// Profile-source pages.
    pub profile: Duration,
    /// DOI lookups.
    pub identifier: Duration,
    /// Attention metrics.
    pub metrics: Duration,
}

impl NamespaceTtls {
    /// TTL for `namespace`.
    #[must_use]
    pub const fn get(&self, namespace: CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::Profile => self.profile,
            CacheNamespace::Identifier => self.identifier,
            CacheNamespace::Metrics => self.metrics,
        }
    }
}

/// Key identifying equivalent requests.
///
/// md5 of the method, the normalized URL, and the varying headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a request given its parts.
    #[must_use]
    pub fn new(method: &str, url: &str, headers: &[(String, String)]) -> Self {
        let mut varying: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .filter(|(name, _)| VARYING_HEADERS.contains(&name.as_str()))
            .collect();
        varying.sort();

        let mut hasher = Md5::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b"|");
        hasher.update(normalize_url(url).as_bytes());
        hasher.update(b"|");
        for (name, value) in &varying {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }

        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint of a GET [`PageRequest`].
    #[must_use]
    pub fn for_request(request: &PageRequest) -> Self {
        Self::new("GET", &request.url, &request.headers)
    }

    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of a URL for fingerprinting.
///
/// Scheme and host are lowercased and the default port dropped (the `url` crate
/// does both while parsing); the fragment is removed and query pairs are sorted.
/// Strings that do not parse are only trimmed.
#[must_use]
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// How a fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Usable response.
    Success,
    /// The source refused or challenged every path.
    Blocked,
    /// The fetch errored.
    Failed,
}

/// One cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request fingerprint.
    pub fingerprint: Fingerprint,

    /// HTTP status (0 when the fetch failed before a response).
    pub status: u16,

    /// URL after redirects.
    pub final_url: String,

    /// Response body.
    pub body: String,

    /// When the response was captured.
    pub captured_at: DateTime<Utc>,

    /// How the fetch ended.
    pub outcome: Outcome,

    /// Error message for failed fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CacheEntry {
    fn from_response(fingerprint: Fingerprint, response: PageResponse, outcome: Outcome) -> Self {
        Self {
            fingerprint,
            status: response.status,
            final_url: response.final_url,
            body: response.body,
            captured_at: Utc::now(),
            outcome,
            error: None,
        }
    }

    fn failed(fingerprint: Fingerprint, error: String) -> Self {
        Self {
            fingerprint,
            status: 0,
            final_url: String::new(),
            body: String::new(),
            captured_at: Utc::now(),
            outcome: Outcome::Failed,
            error: Some(error),
        }
    }

    /// Time since capture; zero for timestamps in the future.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the entry is a success younger than `ttl`.
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.is_success() && self.age() < ttl
    }

    /// Whether the outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Whether the source answered "no such resource".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        self.status == 404 || self.status == 410
    }

    /// Parse the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// What a fetch function hands back to the cache.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// A usable response.
    Success(PageResponse),
    /// A response the source used to refuse us.
    Blocked(PageResponse),
}

/// Namespaced response cache over a pluggable store.
#[derive(Clone)]
pub struct HttpCache {
    store: Arc<dyn CacheStore>,
    ttls: NamespaceTtls,
}

impl HttpCache {
    /// Cache over an explicit store.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, ttls: NamespaceTtls) -> Self {
        Self { store, ttls }
    }

    /// Cache that lives for the process only.
    #[must_use]
    pub fn in_memory(ttls: NamespaceTtls) -> Self {
        Self::new(Arc::new(MemoryStore::new()), ttls)
    }

    /// Cache persisted under `dir`.
    #[must_use]
    pub fn on_disk(dir: impl Into<PathBuf>, ttls: NamespaceTtls) -> Self {
        Self::new(Arc::new(DiskStore::new(dir)), ttls)
    }

    /// Configured TTL for `namespace`.
    #[must_use]
    pub const fn ttl(&self, namespace: CacheNamespace) -> Duration {
        self.ttls.get(namespace)
    }

    /// Current entry for `fingerprint`, without fetching.
    pub async fn peek(&self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.store.load(namespace, fingerprint).await
    }

    /// Return a fresh success for `fingerprint`, or invoke `fetch` once and record
    /// what it produced.
    ///
    /// A fetch error is recorded as a failed entry and then returned. A blocked or
    /// failed outcome never replaces a stored success; the caller still receives
    /// the new outcome.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        namespace: CacheNamespace,
        fingerprint: &Fingerprint,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheEntry, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched, E>>,
        E: fmt::Display,
    {
        let existing = self.store.load(namespace, fingerprint).await;
        if let Some(entry) = existing.as_ref().filter(|e| e.is_fresh(ttl)) {
            tracing::debug!(%namespace, %fingerprint, "cache hit");
            return Ok(entry.clone());
        }
        tracing::debug!(
            %namespace,
            %fingerprint,
            previous = ?existing.as_ref().map(|e| e.outcome),
            "cache miss"
        );

        let (entry, result) = match fetch().await {
            Ok(Fetched::Success(response)) => {
                let entry = CacheEntry::from_response(fingerprint.clone(), response, Outcome::Success);
                (entry.clone(), Ok(entry))
            }
            Ok(Fetched::Blocked(response)) => {
                let entry = CacheEntry::from_response(fingerprint.clone(), response, Outcome::Blocked);
                (entry.clone(), Ok(entry))
            }
            Err(e) => (CacheEntry::failed(fingerprint.clone(), e.to_string()), Err(e)),
        };

        self.record(namespace, existing.as_ref(), &entry).await;
        result
    }

    /// [`get_or_fetch`](Self::get_or_fetch) with the namespace TTL.
    pub async fn get_or_fetch_default<F, Fut, E>(
        &self,
        namespace: CacheNamespace,
        fingerprint: &Fingerprint,
        fetch: F,
    ) -> Result<CacheEntry, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched, E>>,
        E: fmt::Display,
    {
        self.get_or_fetch(namespace, fingerprint, self.ttl(namespace), fetch).await
    }

    async fn record(&self, namespace: CacheNamespace, existing: Option<&CacheEntry>, entry: &CacheEntry) {
        if !entry.is_success() && existing.is_some_and(CacheEntry::is_success) {
            tracing::debug!(
                %namespace,
                fingerprint = %entry.fingerprint,
                outcome = ?entry.outcome,
                "keeping previous success"
            );
            return;
        }
        // A cache write failure costs a refetch later, not the current result.
        if let Err(e) = self.store.save(namespace, entry).await {
            tracing::warn!(%namespace, fingerprint = %entry.fingerprint, error = %e, "cache write failed");
        }
    }
}

impl fmt::Debug for HttpCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCache").field("ttls", &self.ttls).finish_non_exhaustive()
    }
}
