//! Two-phase metrics revalidation.
//!
//! Each DOI carries one cache entry per [`Metric`]: the attention record and the
//! citation count from a source search for the DOI. Phase 1 refetches every entry
//! that is missing, blocked or failed. Phase 2 refetches every success entry older
//! than the staleness window. Each phase classifies against the cache as it stands when the phase
//! starts, and both go through the cache's normal path, so a new block never
//! replaces a prior success.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::cache::{CacheEntry, CacheNamespace};
use crate::client::PageRequest;
use crate::context::{HarvestContext, Route};
use crate::error::HarvestResult;
use crate::models::MetricsBlock;

static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").expect("valid selector"));
static CITED_BY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Cited by (\d+)").expect("valid regex"));

/// A per-DOI metric kept in the metrics cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Attention record from the metrics API.
    Attention,
    /// Citation count from a source search for the DOI.
    ScholarCitations,
}

impl Metric {
    /// Every metric, in fetch order.
    pub const ALL: [Self; 2] = [Self::Attention, Self::ScholarCitations];

    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attention => "attention",
            Self::ScholarCitations => "scholar_citations",
        }
    }
}

/// Which phases to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidateOptions {
    /// Refetch missing, blocked and failed entries.
    pub phase1: bool,
    /// Refetch success entries older than the staleness window.
    pub phase2: bool,
}

impl Default for RevalidateOptions {
    fn default() -> Self {
        Self { phase1: true, phase2: true }
    }
}

/// What a revalidation run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevalidationReport {
    /// Fetches issued by phase 1, one per stale metric per DOI.
    pub phase1_refetched: usize,
    /// Fetches issued by phase 2.
    pub phase2_refetched: usize,
    /// Fetches that produced a usable response.
    pub succeeded: usize,
    /// Fetches that were blocked or failed.
    pub failed: usize,
}

impl RevalidationReport {
    /// Fetches across both phases.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.phase1_refetched + self.phase2_refetched
    }
}

#[derive(Debug, Deserialize)]
struct AltmetricRecord {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    cited_by_posts_count: u64,
    #[serde(default)]
    cited_by_accounts_count: u64,
    #[serde(default)]
    readers_count: u64,
}

/// Keeps per-DOI attention metrics current.
#[derive(Debug, Clone)]
pub struct MetricsRevalidator {
    ctx: HarvestContext,
}

impl MetricsRevalidator {
    /// Create a revalidator over `ctx`.
    #[must_use]
    pub fn new(ctx: HarvestContext) -> Self {
        Self { ctx }
    }

    /// Request that fetches `metric` for `doi`.
    ///
    /// # Errors
    ///
    /// [`crate::HarvestError::Config`] when the configured source URL is invalid.
    pub fn request(&self, metric: Metric, doi: &str) -> HarvestResult<PageRequest> {
        let config = self.ctx.config();
        match metric {
            Metric::Attention => {
                Ok(PageRequest::get(format!("{}/doi/{doi}", config.altmetric_url)).accept_json().third_party())
            }
            Metric::ScholarCitations => PageRequest::with_query(
                &format!("{}/scholar", config.scholar_url),
                &[("hl", "en"), ("as_sdt", "0,5"), ("q", doi), ("btnG", "")],
            ),
        }
    }

    async fn entry(&self, metric: Metric, doi: &str) -> Option<CacheEntry> {
        let request = self.request(metric, doi).ok()?;
        let fingerprint = HarvestContext::fingerprint(&request, Route::Chain);
        self.ctx.cache().peek(CacheNamespace::Metrics, &fingerprint).await
    }

    /// Run the enabled phases over `dois`.
    ///
    /// # Errors
    ///
    /// Only [`crate::HarvestError::Cancelled`]; individual fetch failures are
    /// counted in the report.
    pub async fn revalidate(&self, dois: &[String], options: RevalidateOptions) -> HarvestResult<RevalidationReport> {
        let mut report = RevalidationReport::default();
        let staleness = self.ctx.config().staleness_window;

        if options.phase1 {
            let mut targets = Vec::new();
            for doi in dois {
                for metric in Metric::ALL {
                    if !self.entry(metric, doi).await.is_some_and(|e| e.is_success()) {
                        targets.push((metric, doi.as_str()));
                    }
                }
            }
            let ttl = self.ctx.cache().ttl(CacheNamespace::Metrics);
            let refetched = self.refetch(&targets, ttl, &mut report).await?;
            report.phase1_refetched = refetched;
            tracing::info!(candidates = dois.len(), refetched = report.phase1_refetched, "metrics phase 1 done");
        }

        if options.phase2 {
            let mut targets = Vec::new();
            for doi in dois {
                for metric in Metric::ALL {
                    if self.entry(metric, doi).await.is_some_and(|e| e.is_success() && e.age() > staleness) {
                        targets.push((metric, doi.as_str()));
                    }
                }
            }
            let refetched = self.refetch(&targets, staleness, &mut report).await?;
            report.phase2_refetched = refetched;
            tracing::info!(candidates = dois.len(), refetched = report.phase2_refetched, "metrics phase 2 done");
        }

        Ok(report)
    }

    async fn refetch(
        &self,
        targets: &[(Metric, &str)],
        ttl: std::time::Duration,
        report: &mut RevalidationReport,
    ) -> HarvestResult<usize> {
        let delay = self.ctx.config().metrics_delay;
        for (i, &(metric, doi)) in targets.iter().enumerate() {
            let pause = if i == 0 { std::time::Duration::ZERO } else { delay };
            self.ctx.cancel_token().sleep(pause).await?;

            let fetched = match self.request(metric, doi) {
                Ok(request) => self.ctx.fetch(CacheNamespace::Metrics, &request, Route::Chain, ttl).await,
                Err(e) => Err(e),
            };
            match fetched {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    tracing::warn!(doi, metric = metric.as_str(), error = %e, "metrics fetch failed");
                    report.failed += 1;
                }
            }
        }
        Ok(targets.len())
    }

    /// Metrics from the current success entries for `doi`, if any.
    ///
    /// A DOI the attention source does not know contributes empty counts; a
    /// search without a citation link leaves the citation count empty.
    pub async fn metrics_for(&self, doi: &str) -> Option<MetricsBlock> {
        let attention = self.entry(Metric::Attention, doi).await.filter(CacheEntry::is_success);
        let citations = self.entry(Metric::ScholarCitations, doi).await.filter(CacheEntry::is_success);
        let fetched_at = match (&attention, &citations) {
            (Some(a), Some(c)) => a.captured_at.min(c.captured_at),
            (Some(e), None) | (None, Some(e)) => e.captured_at,
            (None, None) => return None,
        };

        let mut block = MetricsBlock { fetched_at, ..MetricsBlock::default() };
        if let Some(entry) = attention.filter(|e| !e.is_not_found()) {
            match entry.json::<AltmetricRecord>() {
                Ok(record) => {
                    block.altmetric_score = record.score;
                    block.cited_by_posts = record.cited_by_posts_count;
                    block.cited_by_accounts = record.cited_by_accounts_count;
                    block.readers = record.readers_count;
                }
                Err(e) => {
                    tracing::warn!(doi, error = %e, "unreadable metrics response");
                    if citations.is_none() {
                        return None;
                    }
                }
            }
        }
        block.scholar_citations = citations.filter(|e| !e.is_not_found()).and_then(|e| parse_cited_by(&e.body));
        Some(block)
    }
}

/// Citation count from the first "Cited by N" link on a search results page.
#[must_use]
pub fn parse_cited_by(html: &str) -> Option<u64> {
    let document = Html::parse_document(html);
    document.select(&LINK).find_map(|link| {
        let text = link.text().collect::<String>();
        CITED_BY.captures(text.trim())?.get(1)?.as_str().parse().ok()
    })
}
