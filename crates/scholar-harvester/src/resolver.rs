//! DOI resolution.
//!
//! Tried in order, stopping at the first hit:
//! 1. a DOI already on the record, or one embedded in the publisher URL
//! 2. the Crossref works API, queried directly by title and first-author family name
//! 3. the publisher page, rendered through the proxy chain, scanned for DOI meta tags
//!
//! Every request goes through the cache (`identifier` namespace) on the normal
//! path: a cached success is trusted until its TTL runs out, blocked and failed
//! entries are retried.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::cache::CacheNamespace;
use crate::client::PageRequest;
use crate::context::{HarvestContext, Route};
use crate::error::{HarvestError, HarvestResult};
use crate::models::Publication;

static META_DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\s+name="[^"]*"\s+content="(?:doi:)?(10\.\d{4,9}/[-._()/:a-zA-Z0-9]+)""#)
        .expect("valid meta DOI pattern")
});

static LINK_DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a[^>]*class="[^"]*doi[^"]*"[^>]*href="https?://(?:dx\.)?doi\.org/([^"]+)""#)
        .expect("valid link DOI pattern")
});

static BARE_DOI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)10\.\d{4,9}/[-._;()/:a-z0-9]+").expect("valid DOI pattern"));

/// Trailing URL segments that are not part of a DOI.
const URL_SUFFIXES: &[&str] = &["/full", "/abstract", "/pdf", "/epdf", ".pdf", ".html", ".full"];

/// Outcome of a resolution attempt. `Unresolved` is a valid answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoiResolution {
    /// A DOI was found.
    Resolved(String),
    /// Every source answered and none had a match.
    Unresolved,
}

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: CrossrefMessage,
}

#[derive(Debug, Deserialize)]
struct CrossrefMessage {
    #[serde(default)]
    items: Vec<CrossrefItem>,
}

#[derive(Debug, Deserialize)]
struct CrossrefItem {
    #[serde(rename = "DOI")]
    doi: String,
    #[serde(default)]
    author: Vec<CrossrefAuthor>,
}

#[derive(Debug, Deserialize)]
struct CrossrefAuthor {
    #[serde(default)]
    family: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HandleResponse {
    #[serde(default)]
    values: Vec<HandleValue>,
}

#[derive(Debug, Deserialize)]
struct HandleValue {
    #[serde(rename = "type")]
    kind: String,
    data: HandleData,
}

#[derive(Debug, Deserialize)]
struct HandleData {
    value: serde_json::Value,
}

/// Resolves publications to DOIs.
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    ctx: HarvestContext,
}

impl IdentifierResolver {
    /// Create a resolver over `ctx`.
    #[must_use]
    pub fn new(ctx: HarvestContext) -> Self {
        Self { ctx }
    }

    /// Resolve `publication` to a DOI.
    ///
    /// # Errors
    ///
    /// When nothing resolved and at least one step failed, the last failure is
    /// returned so the caller's retry policy can act on it.
    pub async fn resolve_doi(&self, publication: &Publication) -> HarvestResult<DoiResolution> {
        if let Some(doi) = publication.doi.as_deref().map(normalize_doi).filter(|d| is_doi(d)) {
            return Ok(DoiResolution::Resolved(doi));
        }
        if let Some(doi) = publication.pub_url.as_deref().and_then(extract_doi_from_url) {
            tracing::debug!(title = %publication.title, %doi, "DOI found in publisher URL");
            return Ok(DoiResolution::Resolved(doi));
        }

        let mut last_error = None;

        match self.from_registry(publication).await {
            Ok(Some(doi)) => {
                tracing::debug!(title = %publication.title, %doi, "DOI found in registry");
                return Ok(DoiResolution::Resolved(doi));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(title = %publication.title, error = %e, "registry lookup failed");
                last_error = Some(e);
            }
        }

        if let Some(url) = publication.pub_url.as_deref().filter(|u| !self.is_source_url(u)) {
            match self.from_publisher_page(url).await {
                Ok(Some(doi)) => {
                    tracing::debug!(title = %publication.title, %doi, "DOI found on publisher page");
                    return Ok(DoiResolution::Resolved(doi));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(title = %publication.title, url, error = %e, "publisher page lookup failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(title = %publication.title, "no DOI found");
                Ok(DoiResolution::Unresolved)
            }
        }
    }

    fn is_source_url(&self, url: &str) -> bool {
        let host = |u: &str| url::Url::parse(u).ok().and_then(|u| u.host_str().map(str::to_ascii_lowercase));
        host(url).is_some_and(|h| Some(h) == host(&self.ctx.config().scholar_url))
    }

    /// Crossref works search. `None` when no item matches.
    async fn from_registry(&self, publication: &Publication) -> HarvestResult<Option<String>> {
        let base = format!("{}/works", self.ctx.config().crossref_url);
        let author = publication.first_author_family();
        let mut params = vec![("query.title", publication.title.as_str())];
        if let Some(author) = author {
            params.push(("query.author", author));
        }
        params.push(("rows", "5"));
        let request = PageRequest::with_query(&base, &params)?.accept_json();

        let entry = self.ctx.fetch_default(CacheNamespace::Identifier, &request, Route::Direct).await?;
        if entry.is_not_found() {
            return Ok(None);
        }
        let response: CrossrefResponse = entry
            .json()
            .map_err(|e| HarvestError::parse("registry response", e.to_string()))?;

        let chosen = match author {
            None => response.message.items.into_iter().next(),
            Some(author) => response.message.items.into_iter().find(|item| {
                item.author
                    .iter()
                    .filter_map(|a| a.family.as_deref())
                    .any(|family| family.eq_ignore_ascii_case(author))
            }),
        };
        Ok(chosen.map(|item| normalize_doi(&item.doi)).filter(|d| is_doi(d)))
    }

    /// Rendered publisher page, scanned for DOIs.
    async fn from_publisher_page(&self, url: &str) -> HarvestResult<Option<String>> {
        let request = PageRequest::get(url).third_party();
        let entry = self.ctx.fetch_default(CacheNamespace::Identifier, &request, Route::Render).await?;

        let candidates = extract_dois_from_html(&entry.body);
        match candidates.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            several => {
                for doi in several {
                    if let Some(target) = self.resolved_link(doi).await? {
                        if urls_equal(&target, url) {
                            return Ok(Some(doi.clone()));
                        }
                    }
                }
                tracing::debug!(url, candidates = several.len(), "no candidate DOI points back at the page");
                Ok(None)
            }
        }
    }

    /// Where doi.org sends `doi`, via the handle API. `None` for an unknown handle.
    ///
    /// # Errors
    ///
    /// Transport failures and an unreadable handle record.
    pub async fn resolved_link(&self, doi: &str) -> HarvestResult<Option<String>> {
        let url = format!("{}/api/handles/{doi}", self.ctx.config().doi_url);
        let request = PageRequest::get(url).accept_json();
        let entry = self.ctx.fetch_default(CacheNamespace::Identifier, &request, Route::Direct).await?;
        if entry.is_not_found() {
            return Ok(None);
        }
        let response: HandleResponse =
            entry.json().map_err(|e| HarvestError::parse("handle response", e.to_string()))?;
        Ok(response
            .values
            .into_iter()
            .filter(|v| v.kind == "URL")
            .find_map(|v| v.data.value.as_str().map(str::to_string)))
    }
}

/// Canonical DOI: percent-decoded until stable, then trimmed.
#[must_use]
pub fn normalize_doi(raw: &str) -> String {
    let mut current = raw.trim().to_string();
    loop {
        let decoded = match urlencoding::decode(&current) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => break,
        };
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current.trim().to_string()
}

/// Whether `s` looks like a DOI (`10.<registrant>/<suffix>`).
#[must_use]
pub fn is_doi(s: &str) -> bool {
    BARE_DOI.find(s).is_some_and(|m| m.start() == 0 && m.end() == s.len())
}

/// DOI embedded in a URL, e.g. `https://onlinelibrary.wiley.com/doi/full/10.1111/gcb.12345`.
#[must_use]
pub fn extract_doi_from_url(url: &str) -> Option<String> {
    let decoded = normalize_doi(url);
    let found = BARE_DOI.find(&decoded)?.as_str();
    let mut doi = found.trim_end_matches(['.', ';', ':', '/']);
    for suffix in URL_SUFFIXES {
        doi = doi.strip_suffix(suffix).unwrap_or(doi);
    }
    Some(doi.to_string()).filter(|d| is_doi(d))
}

/// DOIs declared by a page: meta tags first, then `a.doi` links. Distinct,
/// normalized, in page order.
#[must_use]
pub fn extract_dois_from_html(html: &str) -> Vec<String> {
    let collect = |re: &Regex| {
        let mut seen = Vec::new();
        for caps in re.captures_iter(html) {
            let doi = normalize_doi(&caps[1]);
            if is_doi(&doi) && !seen.iter().any(|s: &String| s.eq_ignore_ascii_case(&doi)) {
                seen.push(doi);
            }
        }
        seen
    };
    let from_meta = collect(&META_DOI);
    if from_meta.is_empty() { collect(&LINK_DOI) } else { from_meta }
}

fn loose_url(url: &str) -> String {
    let mut normalized = url::Url::parse(url).map_or_else(
        |_| url.to_string(),
        |mut u| {
            u.set_query(None);
            u.set_fragment(None);
            u.to_string()
        },
    );
    normalized = normalized.trim_end_matches('/').to_string();
    for (from, to) in [("/abs/", "/"), ("/article/", "/"), ("/articles/", "/"), ("http://", "https://"), ("//www.", "//")] {
        normalized = normalized.replace(from, to);
    }
    normalized
}

/// Whether two publisher URLs point at the same article.
///
/// Equal after dropping query, fragment, `www.`, scheme differences and common
/// path prefixes; or on the same host with the same last two path segments.
#[must_use]
pub fn urls_equal(a: &str, b: &str) -> bool {
    if loose_url(a) == loose_url(b) {
        return true;
    }
    let (Ok(a), Ok(b)) = (url::Url::parse(a), url::Url::parse(b)) else {
        return false;
    };
    let host = |u: &url::Url| u.host_str().map(|h| h.trim_start_matches("www.").to_ascii_lowercase());
    if host(&a).is_none() || host(&a) != host(&b) {
        return false;
    }
    let tail = |u: &url::Url| {
        let segments: Vec<&str> = u.path().split('/').filter(|s| !s.is_empty()).collect();
        segments[segments.len().saturating_sub(2)..].join("/")
    };
    !tail(&a).is_empty() && tail(&a) == tail(&b)
}
