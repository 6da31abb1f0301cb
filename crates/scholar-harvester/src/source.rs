//! Profile source fetcher.
//!
//! Reads the author header, the co-author sidebar and the paginated publication
//! table from profile pages, and the per-publication detail pages. Every request
//! goes through the cache (`profile` namespace) and the proxy chain, and every
//! element fetch runs under the retry policy.
//!
//! HTML is parsed synchronously; no parsed document is held across an await.

use std::sync::LazyLock;
use std::time::Duration;

use futures::Stream;
use scraper::{ElementRef, Html, Selector};

use crate::cache::CacheNamespace;
use crate::client::PageRequest;
use crate::context::{HarvestContext, Route};
use crate::error::{ClientError, HarvestError, HarvestResult};
use crate::models::{CoauthorRef, Publication, ScholarProfile};

/// Rows requested per listing page.
pub const PAGE_SIZE: usize = 100;

/// Upper bound on listing pages for one profile.
const MAX_PAGES: usize = 50;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static NAME: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_prf_in"));
static AFFILIATION: LazyLock<Selector> = LazyLock::new(|| selector(".gsc_prf_il"));
static INTERESTS: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_prf_int a"));
static CITED_BY: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_rsb_st td.gsc_rsb_std"));
static COAUTHOR: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_rsb_co .gsc_rsb_a_desc"));
static COAUTHOR_EXT: LazyLock<Selector> = LazyLock::new(|| selector(".gsc_rsb_a_ext"));
static LINK: LazyLock<Selector> = LazyLock::new(|| selector("a"));
static ROW: LazyLock<Selector> = LazyLock::new(|| selector("tr.gsc_a_tr"));
static ROW_TITLE: LazyLock<Selector> = LazyLock::new(|| selector("a.gsc_a_at"));
static ROW_GRAY: LazyLock<Selector> = LazyLock::new(|| selector(".gs_gray"));
static ROW_CITES: LazyLock<Selector> = LazyLock::new(|| selector("a.gsc_a_ac"));
static ROW_YEAR: LazyLock<Selector> = LazyLock::new(|| selector(".gsc_a_h"));
static DETAIL_TITLE: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_oci_title"));
static DETAIL_LINK: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_oci_title_link"));
static DETAIL_ROW: LazyLock<Selector> = LazyLock::new(|| selector(".gs_scl"));
static DETAIL_FIELD: LazyLock<Selector> = LazyLock::new(|| selector(".gsc_oci_field"));
static DETAIL_VALUE: LazyLock<Selector> = LazyLock::new(|| selector(".gsc_oci_value"));

/// Check a profile id: exactly 12 of `[A-Za-z0-9_-]`.
///
/// # Errors
///
/// Returns a non-transient [`HarvestError::InvalidIdentifier`] otherwise.
pub fn validate_profile_id(id: &str) -> HarvestResult<()> {
    let valid = id.len() == 12
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid { Ok(()) } else { Err(HarvestError::invalid("profile id", id)) }
}

/// Fetches profiles, co-authors and publications from the profile source.
#[derive(Debug, Clone)]
pub struct ScholarSource {
    ctx: HarvestContext,
}

impl ScholarSource {
    /// Create a fetcher over `ctx`.
    #[must_use]
    pub fn new(ctx: HarvestContext) -> Self {
        Self { ctx }
    }

    fn listing_request(&self, profile_id: &str, cstart: usize) -> HarvestResult<PageRequest> {
        let base = format!("{}/citations", self.ctx.config().scholar_url);
        let cstart = cstart.to_string();
        let pagesize = PAGE_SIZE.to_string();
        PageRequest::with_query(
            &base,
            &[("user", profile_id), ("hl", "en"), ("cstart", &cstart), ("pagesize", &pagesize)],
        )
    }

    /// GET `request` through the cache and chain, under the retry policy.
    async fn page(&self, label: &str, request: &PageRequest) -> HarvestResult<String> {
        let entry = self
            .ctx
            .retry()
            .with_retry(label, |_| self.ctx.fetch_default(CacheNamespace::Profile, request, Route::Chain))
            .await?;
        if entry.is_not_found() {
            return Err(ClientError::not_found(request.url.clone()).into());
        }
        Ok(entry.body)
    }

    /// Fetch identity, co-author references and the full publication listing.
    ///
    /// # Errors
    ///
    /// [`HarvestError::InvalidIdentifier`] for a malformed id; the page's fetch
    /// error after retries; [`HarvestError::Parse`] if the first page has no
    /// author header.
    pub async fn fetch_profile(&self, profile_id: &str) -> HarvestResult<ScholarProfile> {
        validate_profile_id(profile_id)?;

        let mut profile: Option<ScholarProfile> = None;
        for page in 0..MAX_PAGES {
            self.ctx.cancel_token().check()?;

            let request = self.listing_request(profile_id, page * PAGE_SIZE)?;
            let html = self.page("profile page", &request).await?;
            let base = self.ctx.config().scholar_url.as_str();

            let (header, rows) = {
                let document = Html::parse_document(&html);
                let header = if profile.is_none() {
                    Some(parse_profile_header(&document, profile_id)?)
                } else {
                    None
                };
                (header, parse_publication_rows(&document, base))
            };

            let profile = profile.get_or_insert_with(|| header.unwrap_or_else(|| ScholarProfile::new(profile_id)));
            let count = rows.len();
            profile.publications.extend(rows);

            tracing::debug!(profile_id, page, rows = count, "listing page parsed");
            if count < PAGE_SIZE {
                break;
            }
        }

        let profile = profile.unwrap_or_else(|| ScholarProfile::new(profile_id));
        tracing::info!(
            profile_id,
            name = %profile.name,
            coauthors = profile.coauthors.len(),
            publications = profile.publications.len(),
            "profile fetched"
        );
        Ok(profile)
    }

    /// Fetch the detail page for one listing entry and merge it in.
    ///
    /// Entries without a detail link are returned unchanged.
    pub async fn fetch_publication(&self, stub: &Publication) -> HarvestResult<Publication> {
        let Some(link) = stub.source_link.as_deref() else {
            return Ok(stub.clone());
        };
        let html = self.page("publication page", &PageRequest::get(link)).await?;
        let mut publication = stub.clone();
        parse_publication_details(&Html::parse_document(&html), &mut publication)?;
        Ok(publication)
    }

    /// Fetch a co-author's own profile header and fill in their affiliation.
    pub async fn fetch_coauthor(&self, coauthor: &CoauthorRef) -> HarvestResult<CoauthorRef> {
        validate_profile_id(&coauthor.id)?;
        let request = PageRequest::with_query(
            &format!("{}/citations", self.ctx.config().scholar_url),
            &[("user", coauthor.id.as_str()), ("hl", "en")],
        )?;
        let html = self.page("coauthor page", &request).await?;
        let header = parse_profile_header(&Html::parse_document(&html), &coauthor.id)?;

        let mut filled = coauthor.clone();
        if filled.name.is_empty() {
            filled.name = header.name;
        }
        filled.affiliation = header.affiliation.or(filled.affiliation);
        Ok(filled)
    }

    /// Lazy sequence of detail-page fetches starting at `resume_index`.
    ///
    /// Yields `(index, result)` per publication with the configured delay between
    /// elements. A failed element does not end the sequence; cancellation yields
    /// one [`HarvestError::Cancelled`] and ends it.
    pub fn fetch_publications<'a>(
        &'a self,
        profile: &'a ScholarProfile,
        resume_index: usize,
    ) -> impl Stream<Item = (usize, HarvestResult<Publication>)> + 'a {
        self.fetch_publications_at(profile, (resume_index..profile.publications.len()).collect())
    }

    /// Detail-page fetches for the given listing indices, in the order given.
    /// Indices past the end of the listing are ignored.
    pub fn fetch_publications_at<'a>(
        &'a self,
        profile: &'a ScholarProfile,
        indices: Vec<usize>,
    ) -> impl Stream<Item = (usize, HarvestResult<Publication>)> + 'a {
        let delay = self.ctx.config().publication_delay;
        async_stream::stream! {
            let stubs = indices.into_iter().filter_map(|i| profile.publications.get(i).map(|p| (i, p)));
            for (n, (index, stub)) in stubs.enumerate() {
                let pause = if n == 0 { Duration::ZERO } else { delay };
                if let Err(e) = self.ctx.cancel_token().sleep(pause).await {
                    yield (index, Err(e));
                    break;
                }
                yield (index, self.fetch_publication(stub).await);
            }
        }
    }

    /// Lazy sequence of co-author fetches starting at `resume_index`; same
    /// contract as [`fetch_publications`](Self::fetch_publications).
    pub fn fetch_coauthors<'a>(
        &'a self,
        profile: &'a ScholarProfile,
        resume_index: usize,
    ) -> impl Stream<Item = (usize, HarvestResult<CoauthorRef>)> + 'a {
        self.fetch_coauthors_at(profile, (resume_index..profile.coauthors.len()).collect())
    }

    /// Co-author fetches for the given indices, in the order given.
    pub fn fetch_coauthors_at<'a>(
        &'a self,
        profile: &'a ScholarProfile,
        indices: Vec<usize>,
    ) -> impl Stream<Item = (usize, HarvestResult<CoauthorRef>)> + 'a {
        let delay = self.ctx.config().coauthor_delay;
        async_stream::stream! {
            let refs = indices.into_iter().filter_map(|i| profile.coauthors.get(i).map(|c| (i, c)));
            for (n, (index, coauthor)) in refs.enumerate() {
                let pause = if n == 0 { Duration::ZERO } else { delay };
                if let Err(e) = self.ctx.cancel_token().sleep(pause).await {
                    yield (index, Err(e));
                    break;
                }
                yield (index, self.fetch_coauthor(coauthor).await);
            }
        }
    }
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().map(text_of).filter(|t| !t.is_empty())
}

fn resolve_link(base: &str, href: &str) -> Option<String> {
    let base = url::Url::parse(&format!("{}/", base.trim_end_matches('/'))).ok()?;
    base.join(href).ok().map(String::from)
}

fn query_param(base: &str, href: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(&resolve_link(base, href)?).ok()?;
    url.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
}

/// Author header and co-author sidebar of a profile page.
///
/// # Errors
///
/// [`HarvestError::Parse`] when the page has no author name.
pub fn parse_profile_header(document: &Html, profile_id: &str) -> HarvestResult<ScholarProfile> {
    let root = document.root_element();
    let name = first_text(root, &NAME)
        .ok_or_else(|| HarvestError::parse("profile page", format!("no author name for {profile_id}")))?;

    let coauthors = root
        .select(&COAUTHOR)
        .filter_map(|desc| {
            let link = desc.select(&LINK).next()?;
            let id = query_param("https://scholar.google.com", link.value().attr("href")?, "user")?;
            Some(CoauthorRef {
                id,
                name: text_of(link),
                affiliation: first_text(desc, &COAUTHOR_EXT),
            })
        })
        .collect();

    Ok(ScholarProfile {
        id: profile_id.to_string(),
        name,
        affiliation: first_text(root, &AFFILIATION),
        interests: root.select(&INTERESTS).map(text_of).filter(|t| !t.is_empty()).collect(),
        cited_by: first_text(root, &CITED_BY).and_then(|t| t.parse().ok()),
        coauthors,
        publications: Vec::new(),
    })
}

/// Rows of the publication table. Rows without a title are dropped.
#[must_use]
pub fn parse_publication_rows(document: &Html, base: &str) -> Vec<Publication> {
    document
        .select(&ROW)
        .filter_map(|row| {
            let title_link = row.select(&ROW_TITLE).next()?;
            let title = text_of(title_link);
            if title.is_empty() {
                return None;
            }
            let venue = row
                .select(&ROW_GRAY)
                .nth(1)
                .map(text_of)
                .map(|v| strip_trailing_year(&v))
                .filter(|v| !v.is_empty());

            Some(Publication {
                title,
                year: first_text(row, &ROW_YEAR).and_then(|t| t.parse().ok()),
                venue,
                citations: first_text(row, &ROW_CITES).and_then(|t| t.parse().ok()).unwrap_or(0),
                source_link: title_link.value().attr("href").and_then(|href| resolve_link(base, href)),
                ..Publication::default()
            })
        })
        .collect()
}

/// The listing shows "Journal 12 (3), 45-67, 2020"; keep the venue part.
fn strip_trailing_year(venue: &str) -> String {
    let trimmed = venue.trim().trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() + 4 == venue.trim().len() {
        trimmed.trim_end().trim_end_matches(',').trim_end().to_string()
    } else {
        venue.trim().to_string()
    }
}

/// Merge a detail page into `publication`.
///
/// # Errors
///
/// [`HarvestError::Parse`] when the page has no title block at all.
pub fn parse_publication_details(document: &Html, publication: &mut Publication) -> HarvestResult<()> {
    let root = document.root_element();
    if root.select(&DETAIL_TITLE).next().is_none() {
        return Err(HarvestError::parse("publication page", format!("no title block for '{}'", publication.title)));
    }

    if let Some(href) = root.select(&DETAIL_LINK).next().and_then(|a| a.value().attr("href")) {
        publication.pub_url = Some(href.to_string());
    }

    for row in root.select(&DETAIL_ROW) {
        let (Some(field), Some(value)) = (first_text(row, &DETAIL_FIELD), first_text(row, &DETAIL_VALUE))
        else {
            continue;
        };
        match field.to_ascii_lowercase().as_str() {
            "authors" | "inventors" => {
                publication.authors =
                    value.split(',').map(str::trim).filter(|a| !a.is_empty()).map(str::to_string).collect();
            }
            "journal" | "conference" | "source" | "book" => {
                publication.venue = Some(value);
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r##"<html><body>
        <div id="gsc_prf_in">Jodie L. Rummer</div>
        <div class="gsc_prf_il">Professor, James Cook University</div>
        <div id="gsc_prf_int"><a href="#">Marine biology</a><a href="#">Physiology</a></div>
        <table id="gsc_rsb_st"><tr><td class="gsc_rsb_std">4821</td><td class="gsc_rsb_std">3100</td></tr></table>
        <div id="gsc_rsb_co"><ul>
          <li><span class="gsc_rsb_a_desc"><a href="/citations?user=AbCdEfGhIjKl&amp;hl=en">Colin Brauner</a>
              <span class="gsc_rsb_a_ext">University of British Columbia</span></span></li>
        </ul></div>
        <table><tbody>
          <tr class="gsc_a_tr">
            <td><a class="gsc_a_at" href="/citations?view_op=view_citation&amp;citation_for_view=x:1">Ocean warming and fish</a>
                <div class="gs_gray">JL Rummer, CS Couturier</div><div class="gs_gray">Global Change Biology 20 (4), 1055-1066, 2014</div></td>
            <td><a class="gsc_a_ac">312</a></td><td class="gsc_a_y"><span class="gsc_a_h">2014</span></td>
          </tr>
          <tr class="gsc_a_tr"><td><a class="gsc_a_at"></a></td></tr>
        </tbody></table></body></html>"##;

    #[test]
    fn test_validate_profile_id() {
        assert!(validate_profile_id("ynWS968AAAAJ").is_ok());
        assert!(validate_profile_id("ab-_0123456Z").is_ok());
        assert!(validate_profile_id("short").is_err());
        assert!(validate_profile_id("../etc/passw").is_err());
        assert!(!validate_profile_id("x").unwrap_err().is_transient());
    }

    #[test]
    fn test_parse_profile_header() {
        let profile = parse_profile_header(&Html::parse_document(PROFILE), "ynWS968AAAAJ").unwrap();
        assert_eq!(profile.name, "Jodie L. Rummer");
        assert_eq!(profile.affiliation.as_deref(), Some("Professor, James Cook University"));
        assert_eq!(profile.interests, vec!["Marine biology", "Physiology"]);
        assert_eq!(profile.cited_by, Some(4821));
        assert_eq!(profile.coauthors.len(), 1);
        assert_eq!(profile.coauthors[0].id, "AbCdEfGhIjKl");
        assert_eq!(profile.coauthors[0].affiliation.as_deref(), Some("University of British Columbia"));
    }

    #[test]
    fn test_parse_profile_header_without_name() {
        let err = parse_profile_header(&Html::parse_document("<html></html>"), "ynWS968AAAAJ").unwrap_err();
        assert!(matches!(err, HarvestError::Parse { .. }));
    }

    #[test]
    fn test_parse_publication_rows() {
        let rows = parse_publication_rows(&Html::parse_document(PROFILE), "https://scholar.google.com");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.title, "Ocean warming and fish");
        assert_eq!(row.year, Some(2014));
        assert_eq!(row.citations, 312);
        assert_eq!(row.venue.as_deref(), Some("Global Change Biology 20 (4), 1055-1066"));
        assert_eq!(
            row.source_link.as_deref(),
            Some("https://scholar.google.com/citations?view_op=view_citation&citation_for_view=x:1")
        );
    }

    #[test]
    fn test_parse_publication_details() {
        let html = r#"<div id="gsc_oci_title"><a id="gsc_oci_title_link" href="https://journals.example.org/a/1">Ocean warming</a></div>
            <div id="gsc_oci_table">
              <div class="gs_scl"><div class="gsc_oci_field">Authors</div><div class="gsc_oci_value">Jodie L Rummer, Colin Brauner</div></div>
              <div class="gs_scl"><div class="gsc_oci_field">Journal</div><div class="gsc_oci_value">Global Change Biology</div></div>
              <div class="gs_scl"><div class="gsc_oci_field">Publication date</div><div class="gsc_oci_value">2014/4</div></div>
            </div>"#;
        let mut publication = Publication::new("Ocean warming", None);
        parse_publication_details(&Html::parse_document(html), &mut publication).unwrap();
        assert_eq!(publication.pub_url.as_deref(), Some("https://journals.example.org/a/1"));
        assert_eq!(publication.authors, vec!["Jodie L Rummer", "Colin Brauner"]);
        assert_eq!(publication.first_author_family(), Some("Rummer"));
        assert_eq!(publication.venue.as_deref(), Some("Global Change Biology"));
        assert_eq!(publication.year, None, "year stays as listed so identity is stable");
    }

    #[test]
    fn test_strip_trailing_year() {
        assert_eq!(strip_trailing_year("Nature 5, 2019"), "Nature 5");
        assert_eq!(strip_trailing_year("Nature"), "Nature");
        assert_eq!(strip_trailing_year("2019"), "");
    }
}
