//! Publication model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a publication stands in DOI resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoiStatus {
    /// Not attempted yet, or the last attempt failed transiently.
    #[default]
    Pending,
    /// A DOI was found.
    Resolved,
    /// Every source answered and none had a match.
    Unresolved,
    /// Not looked up (conference material rarely carries a DOI).
    Skipped,
}

/// A publication from a profile listing, enriched in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Title.
    pub title: String,

    /// Publication year.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,

    /// Journal, conference, or other venue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,

    /// Citation count from the listing.
    #[serde(default)]
    pub citations: u64,

    /// Normalized DOI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,

    /// Resolution state.
    #[serde(default)]
    pub doi_status: DoiStatus,

    /// `https://doi.org/<doi>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi_link: Option<String>,

    /// Where doi.org sends the DOI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi_resolved_link: Option<String>,

    /// Publisher URL from the detail page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_url: Option<String>,

    /// Author line from the detail page.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,

    /// Detail page on the profile source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_link: Option<String>,

    /// Attention metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsBlock>,
}

impl Publication {
    /// Listing entry with just a title and year.
    #[must_use]
    pub fn new(title: impl Into<String>, year: Option<i32>) -> Self {
        Self { title: title.into(), year, ..Self::default() }
    }

    /// Identity within a profile: `(title, year)`, title compared case- and
    /// whitespace-insensitively.
    #[must_use]
    pub fn identity(&self) -> (String, Option<i32>) {
        let title = self.title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        (title, self.year)
    }

    /// Record a resolved DOI.
    pub fn set_doi(&mut self, doi: String, doi_base: &str) {
        self.doi_link = Some(format!("{}/{doi}", doi_base.trim_end_matches('/')));
        self.doi = Some(doi);
        self.doi_status = DoiStatus::Resolved;
    }

    /// Whether the detail page has been fetched.
    #[must_use]
    pub fn has_details(&self) -> bool {
        self.pub_url.is_some() || !self.authors.is_empty()
    }

    /// Family name of the first listed author.
    #[must_use]
    pub fn first_author_family(&self) -> Option<&str> {
        self.authors.first()?.split_whitespace().last()
    }
}

/// Attention metrics for one DOI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBlock {
    /// Attention score; absent when the DOI has no record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altmetric_score: Option<f64>,

    /// Posts mentioning the DOI.
    #[serde(default)]
    pub cited_by_posts: u64,

    /// Distinct accounts mentioning the DOI.
    #[serde(default)]
    pub cited_by_accounts: u64,

    /// Reference-manager readers.
    #[serde(default)]
    pub readers: u64,

    /// Citation count shown by the profile source's search for the DOI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scholar_citations: Option<u64>,

    /// When the oldest contributing response was captured.
    pub fetched_at: DateTime<Utc>,
}
