//! End-to-end pipeline tests against a mocked profile source, registry and
//! metrics API.
#![allow(clippy::needless_pass_by_value)]

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scholar_harvester::models::{DoiStatus, Publication, ScholarProfile};
use scholar_harvester::{
    Config, Dataset, DatasetStore, HarvestContext, HarvestError, Pipeline, PipelineState, RevalidateOptions,
    RunOptions,
};

const PROFILE_ID: &str = "ynWS968AAAAJ";
const COAUTHOR_ID: &str = "AbCdEfGhIjKl";
const TITLES: [&str; 3] = ["Ocean warming and fish", "Second paper on hypoxia", "Third paper on sharks"];
const NEW_TITLE: &str = "Reef sharks in a warming ocean";

/// Pipeline over `server` writing datasets to `data_dir`, with a fresh cache.
fn pipeline(server: &MockServer, data_dir: &Path) -> Pipeline {
    let mut config = Config::for_testing(&server.uri());
    config.data_dir = data_dir.to_path_buf();
    Pipeline::new(HarvestContext::new(config).unwrap())
}

/// Like [`pipeline`], but a finished dataset is never fresh.
fn eager_pipeline(server: &MockServer, data_dir: &Path) -> Pipeline {
    let mut config = Config::for_testing(&server.uri());
    config.data_dir = data_dir.to_path_buf();
    config.freshness_window = Duration::ZERO;
    Pipeline::new(HarvestContext::new(config).unwrap())
}

/// Detail-page key for a listing title: `p<i>` for the fixed titles.
fn detail_key(title: &str) -> String {
    TITLES.iter().position(|t| *t == title).map_or_else(|| "new".to_string(), |i| format!("p{i}"))
}

/// Profile page with one co-author and a row per `(title, venue)`.
fn listing_html(rows: &[(&str, &str)]) -> String {
    let rows: String = rows
        .iter()
        .enumerate()
        .map(|(i, (title, venue))| {
            format!(
                r#"<tr class="gsc_a_tr"><td>
                  <a class="gsc_a_at" href="/citations?view_op=view_citation&amp;hl=en&amp;citation_for_view={PROFILE_ID}:{}">{title}</a>
                  <div class="gs_gray">JL Rummer, C Brauner</div><div class="gs_gray">{venue}, 2020</div></td>
                  <td><a class="gsc_a_ac">{}</a></td><td class="gsc_a_y"><span class="gsc_a_h">2020</span></td></tr>"#,
                detail_key(title),
                10 * (i + 1)
            )
        })
        .collect();
    format!(
        r#"<html><body>
        <div id="gsc_prf_in">Jodie L. Rummer</div>
        <div class="gsc_prf_il">James Cook University</div>
        <div id="gsc_rsb_co"><ul><li><span class="gsc_rsb_a_desc">
          <a href="/citations?user={COAUTHOR_ID}&amp;hl=en">Colin Brauner</a></span></li></ul></div>
        <table><tbody>{rows}</tbody></table></body></html>"#
    )
}

fn default_listing() -> String {
    listing_html(&TITLES.map(|t| (t, "Journal of Fish Biology")))
}

fn coauthor_html() -> &'static str {
    r#"<html><body><div id="gsc_prf_in">Colin Brauner</div>
       <div class="gsc_prf_il">University of British Columbia</div></body></html>"#
}

fn detail_html(title: &str) -> String {
    format!(
        r#"<html><body><div id="gsc_oci_title">{title}</div><div id="gsc_oci_table">
           <div class="gs_scl"><div class="gsc_oci_field">Authors</div>
           <div class="gsc_oci_value">Jodie L Rummer, Colin Brauner</div></div></div></body></html>"#
    )
}

fn crossref_json(doi: &str) -> serde_json::Value {
    json!({
        "status": "ok",
        "message": {
            "items": [{"DOI": doi, "title": ["x"], "author": [{"given": "Jodie", "family": "Rummer"}]}]
        }
    })
}

async fn mount_listing(server: &MockServer, html: String) {
    Mock::given(method("GET"))
        .and(path("/citations"))
        .and(query_param("user", PROFILE_ID))
        .and(query_param("cstart", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .mount(server)
        .await;
}

async fn mount_coauthor(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/citations"))
        .and(query_param("user", COAUTHOR_ID))
        .respond_with(ResponseTemplate::new(200).set_body_string(coauthor_html()))
        .mount(server)
        .await;
}

async fn mount_detail(server: &MockServer, index: usize, response: ResponseTemplate) {
    mount_detail_for(server, &format!("p{index}"), response, None).await;
}

async fn mount_detail_for(server: &MockServer, key: &str, response: ResponseTemplate, calls: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path("/citations"))
        .and(query_param("view_op", "view_citation"))
        .and(query_param("citation_for_view", format!("{PROFILE_ID}:{key}")))
        .respond_with(response);
    match calls {
        Some(n) => mock.expect(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

async fn registry_calls(server: &MockServer) -> usize {
    let requests = server.received_requests().await.unwrap();
    requests.iter().filter(|r| r.url.path() == "/crossref/works").count()
}

async fn mount_crossref(server: &MockServer, title: &str, doi: &str) {
    Mock::given(method("GET"))
        .and(path("/crossref/works"))
        .and(query_param("query.title", title))
        .respond_with(ResponseTemplate::new(200).set_body_json(crossref_json(doi)))
        .mount(server)
        .await;
}

/// Every upstream answers, every publication has a DOI.
async fn mount_happy_path(server: &MockServer) {
    mount_listing(server, default_listing()).await;
    mount_coauthor(server).await;
    for (i, title) in TITLES.iter().enumerate() {
        mount_detail(server, i, ResponseTemplate::new(200).set_body_string(detail_html(title))).await;
        mount_crossref(server, title, &format!("10.1000/p{i}")).await;
    }
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn test_run_survives_transient_registry_failures() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    mount_listing(&server, default_listing()).await;
    mount_coauthor(&server).await;
    for (i, title) in TITLES.iter().enumerate() {
        mount_detail(&server, i, ResponseTemplate::new(200).set_body_string(detail_html(title))).await;
    }
    mount_crossref(&server, TITLES[0], "10.1000/p0").await;
    // Second publication: two server errors, then an answer on the last attempt.
    Mock::given(method("GET"))
        .and(path("/crossref/works"))
        .and(query_param("query.title", TITLES[1]))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crossref/works"))
        .and(query_param("query.title", TITLES[1]))
        .respond_with(ResponseTemplate::new(200).set_body_json(crossref_json("10.1000/p1")))
        .expect(1)
        .mount(&server)
        .await;
    mount_crossref(&server, TITLES[2], "10.1000/p2").await;

    let pipeline = pipeline(&server, data_dir.path());
    let report = pipeline.run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(report.is_complete(), "report: {report:?}");
    assert_eq!(report.final_state, PipelineState::Done);
    assert_eq!(report.publications_fetched, 3);
    assert_eq!(report.coauthors_fetched, 1);
    assert_eq!(report.resolved, 3);
    assert!(report.failures.is_empty());

    let dataset = pipeline.store().load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.publication_marker, Some(2));
    assert_eq!(dataset.coauthor_marker, Some(0));
    assert!(dataset.last_fetched.is_some());

    let publications = &dataset.profile.publications;
    assert_eq!(publications.len(), 3);
    for (i, publication) in publications.iter().enumerate() {
        assert_eq!(publication.doi_status, DoiStatus::Resolved);
        assert_eq!(publication.doi.as_deref(), Some(format!("10.1000/p{i}").as_str()));
    }
    assert_eq!(
        publications[1].doi_link.as_deref(),
        Some(format!("{}/doi/10.1000/p1", server.uri()).as_str())
    );
    assert_eq!(publications[0].authors, vec!["Jodie L Rummer", "Colin Brauner"]);
    assert_eq!(
        dataset.profile.coauthors[0].affiliation.as_deref(),
        Some("University of British Columbia")
    );
}

#[tokio::test]
async fn test_fresh_dataset_short_circuits() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    mount_happy_path(&server).await;

    let first = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();
    assert!(first.is_complete());
    let stored = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();

    let requests_before = server.received_requests().await.unwrap().len();
    let second = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(second.short_circuited);
    assert_eq!(second.final_state, PipelineState::Done);
    assert_eq!(server.received_requests().await.unwrap().len(), requests_before);
    let after = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(after, stored);
}

#[tokio::test]
async fn test_forced_run_starts_over() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    mount_happy_path(&server).await;

    pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();
    let report = pipeline(&server, data_dir.path())
        .run(PROFILE_ID, RunOptions { force: true })
        .await
        .unwrap();

    assert!(!report.short_circuited);
    assert_eq!(report.publications_fetched, 3);
    assert_eq!(report.coauthors_fetched, 1);
    // DOIs carried over from the first run are not looked up again.
    assert_eq!(report.resolved, 0);

    let dataset = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.publication_marker, Some(2));
    assert!(dataset.profile.publications.iter().all(|p| p.doi_status == DoiStatus::Resolved));
}

// =============================================================================
// Resume
// =============================================================================

#[tokio::test]
async fn test_transient_failure_holds_marker_and_next_run_resumes() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    mount_listing(&server, default_listing()).await;
    mount_coauthor(&server).await;
    mount_detail(&server, 0, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[0]))).await;
    mount_detail(&server, 1, ResponseTemplate::new(503)).await;
    mount_detail(&server, 2, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[2]))).await;
    for (i, title) in TITLES.iter().enumerate() {
        mount_crossref(&server, title, &format!("10.1000/p{i}")).await;
    }

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.final_state, PipelineState::FetchingPublications);
    assert_eq!(report.publications_fetched, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 1);
    assert!(report.failures[0].transient);

    let store = DatasetStore::new(data_dir.path());
    let dataset = store.load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.publication_marker, Some(0), "marker stops before the failed element");
    assert!(dataset.last_fetched.is_none(), "an incomplete run is not fresh");
    assert!(dataset.profile.publications[2].has_details());

    assert_eq!(dataset.publication_settled.len(), 1, "the element after the failure is recorded as done");

    // The source recovers; only the failed element is fetched again.
    server.reset().await;
    mount_listing(&server, default_listing()).await;
    mount_coauthor(&server).await;
    let ok = |title: &str| ResponseTemplate::new(200).set_body_string(detail_html(title));
    mount_detail_for(&server, "p0", ok(TITLES[0]), Some(0)).await;
    mount_detail_for(&server, "p1", ok(TITLES[1]), Some(1)).await;
    mount_detail_for(&server, "p2", ok(TITLES[2]), Some(0)).await;
    mount_crossref(&server, TITLES[1], "10.1000/p1").await;

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(report.is_complete(), "report: {report:?}");
    assert_eq!(report.publications_fetched, 1);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.coauthors_fetched, 0, "co-author stage was already complete");

    let dataset = store.load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.publication_marker, Some(2));
    assert!(dataset.publication_settled.is_empty());
    assert_eq!(dataset.profile.publications.len(), 3, "no duplicates after resume");
    assert!(dataset.profile.publications.iter().all(Publication::has_details));
    assert!(dataset.last_fetched.is_some());
}

#[tokio::test]
async fn test_prepended_publication_is_fetched_without_rewinding_the_marker() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    mount_happy_path(&server).await;

    let first = eager_pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();
    assert!(first.is_complete());
    let store = DatasetStore::new(data_dir.path());
    assert_eq!(store.load(PROFILE_ID).await.unwrap().unwrap().publication_marker, Some(2));

    // A new publication appears at the top of the listing.
    server.reset().await;
    let rows: Vec<_> = std::iter::once(NEW_TITLE).chain(TITLES).map(|t| (t, "Journal of Fish Biology")).collect();
    mount_listing(&server, listing_html(&rows)).await;
    mount_coauthor(&server).await;
    for (i, title) in TITLES.iter().enumerate() {
        let response = ResponseTemplate::new(200).set_body_string(detail_html(title));
        mount_detail_for(&server, &format!("p{i}"), response, Some(0)).await;
    }
    let response = ResponseTemplate::new(200).set_body_string(detail_html(NEW_TITLE));
    mount_detail_for(&server, "new", response, Some(1)).await;
    mount_crossref(&server, NEW_TITLE, "10.1000/new").await;

    let second = eager_pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(second.is_complete(), "report: {second:?}");
    assert_eq!(second.publications_fetched, 1);
    assert_eq!(second.resolved, 1);

    let dataset = store.load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.publication_marker, Some(3));
    assert!(dataset.publication_backlog.is_empty());
    assert!(dataset.publication_settled.is_empty());
    let publications = &dataset.profile.publications;
    assert_eq!(publications.len(), 4);
    assert_eq!(publications[0].doi.as_deref(), Some("10.1000/new"));
    assert_eq!(publications[1].doi.as_deref(), Some("10.1000/p0"), "enrichment follows the row");
    assert!(publications.iter().all(Publication::has_details));
}

#[tokio::test]
async fn test_resolved_doi_records_where_it_points() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    mount_happy_path(&server).await;
    Mock::given(method("GET"))
        .and(path("/doi/api/handles/10.1000/p0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseCode": 1,
            "values": [{"type": "URL", "data": {"format": "string", "value": "https://journal.example.org/p0"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(report.is_complete(), "a missing handle is not a failure: {report:?}");
    let dataset = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();
    let publications = &dataset.profile.publications;
    assert_eq!(publications[0].doi_resolved_link.as_deref(), Some("https://journal.example.org/p0"));
    assert_eq!(publications[1].doi_resolved_link, None);
    assert_eq!(publications[1].doi.as_deref(), Some("10.1000/p1"));
}

#[tokio::test]
async fn test_resolution_waits_for_publication_details() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    mount_listing(&server, default_listing()).await;
    mount_coauthor(&server).await;
    mount_detail(&server, 0, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[0]))).await;
    mount_detail(&server, 1, ResponseTemplate::new(503)).await;
    mount_detail(&server, 2, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[2]))).await;
    mount_crossref(&server, TITLES[0], "10.1000/p0").await;
    mount_crossref(&server, TITLES[2], "10.1000/p2").await;
    // Without an author line the first hit for this title would be taken.
    let ambiguous = json!({"message": {"items": [
        {"DOI": "10.9999/wrong", "author": [{"family": "Smith"}]},
        {"DOI": "10.1000/p1", "author": [{"family": "Rummer"}]}
    ]}});
    let mount_ambiguous = || {
        Mock::given(method("GET"))
            .and(path("/crossref/works"))
            .and(query_param("query.title", TITLES[1]))
            .respond_with(ResponseTemplate::new(200).set_body_json(ambiguous.clone()))
    };
    mount_ambiguous().mount(&server).await;

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert_eq!(report.final_state, PipelineState::FetchingPublications);
    assert_eq!(report.resolved, 2);
    assert_eq!(registry_calls(&server).await, 2, "no lookup for the publication without details");
    let store = DatasetStore::new(data_dir.path());
    let dataset = store.load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.profile.publications[1].doi_status, DoiStatus::Pending);
    assert_eq!(dataset.profile.publications[1].doi, None);

    // Once the details arrive the author line picks the right record.
    server.reset().await;
    mount_listing(&server, default_listing()).await;
    mount_coauthor(&server).await;
    mount_detail(&server, 1, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[1]))).await;
    mount_ambiguous().mount(&server).await;

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(report.is_complete(), "report: {report:?}");
    let dataset = store.load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.profile.publications[1].doi.as_deref(), Some("10.1000/p1"));
}

#[tokio::test]
async fn test_identity_failure_leaves_dataset_untouched() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    let store = DatasetStore::new(data_dir.path());
    let mut profile = ScholarProfile::new(PROFILE_ID);
    profile.name = "Jodie L. Rummer".into();
    profile.publications = vec![Publication::new(TITLES[0], Some(2020))];
    let mut seeded = Dataset::new(profile);
    seeded.publication_marker = Some(0);
    store.save(&seeded).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/citations"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap_err();

    assert!(err.is_transient(), "got {err}");
    assert_eq!(store.load(PROFILE_ID).await.unwrap().unwrap(), seeded);
}

#[tokio::test]
async fn test_invalid_profile_id_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    let err = pipeline(&server, data_dir.path()).run("not-an-id", RunOptions::default()).await.unwrap_err();

    assert!(matches!(err, HarvestError::InvalidIdentifier { .. }));
    assert!(!err.is_transient());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_meeting_abstracts_are_not_looked_up() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    mount_listing(&server, listing_html(&[(TITLES[0], "Society for Experimental Biology Annual Meeting")])).await;
    mount_coauthor(&server).await;
    mount_detail(&server, 0, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[0]))).await;
    Mock::given(method("GET"))
        .and(path("/crossref/works"))
        .respond_with(ResponseTemplate::new(200).set_body_json(crossref_json("10.1000/x")))
        .expect(0)
        .mount(&server)
        .await;

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.skipped, 1);
    let dataset = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.profile.publications[0].doi_status, DoiStatus::Skipped);
}

#[tokio::test]
async fn test_unresolved_is_a_value_not_a_failure() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    mount_listing(&server, listing_html(&[(TITLES[0], "Journal of Fish Biology")])).await;
    mount_coauthor(&server).await;
    mount_detail(&server, 0, ResponseTemplate::new(200).set_body_string(detail_html(TITLES[0]))).await;
    Mock::given(method("GET"))
        .and(path("/crossref/works"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": {"items": []}})))
        .mount(&server)
        .await;

    let report = pipeline(&server, data_dir.path()).run(PROFILE_ID, RunOptions::default()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.unresolved, 1);
    assert!(report.failures.is_empty());
    let dataset = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();
    assert_eq!(dataset.profile.publications[0].doi_status, DoiStatus::Unresolved);
    assert!(dataset.profile.publications[0].doi.is_none());
}

#[tokio::test]
async fn test_cancelled_run_commits_and_stops() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    mount_happy_path(&server).await;

    let mut config = Config::for_testing(&server.uri());
    config.data_dir = data_dir.path().to_path_buf();
    let ctx = HarvestContext::new(config).unwrap();
    ctx.cancel_token().cancel();
    let pipeline = Pipeline::new(ctx);

    let err = pipeline.run(PROFILE_ID, RunOptions::default()).await.unwrap_err();

    assert!(matches!(err, HarvestError::Cancelled));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_many_keeps_profiles_independent() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();
    mount_happy_path(&server).await;

    let ids = vec![PROFILE_ID.to_string(), "bad".to_string()];
    let results = pipeline(&server, data_dir.path()).run_many(&ids, RunOptions::default()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, PROFILE_ID);
    assert!(results[0].1.as_ref().is_ok_and(|r| r.is_complete()));
    assert!(matches!(results[1].1, Err(HarvestError::InvalidIdentifier { .. })));
}

// =============================================================================
// Metrics revalidation
// =============================================================================

#[tokio::test]
async fn test_revalidate_metrics_requires_a_dataset() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    let err = pipeline(&server, data_dir.path())
        .revalidate_metrics(PROFILE_ID, RevalidateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::MissingDataset(ref id) if id == PROFILE_ID));
}

#[tokio::test]
async fn test_revalidate_metrics_attaches_blocks() {
    let server = MockServer::start().await;
    let data_dir = TempDir::new().unwrap();

    let mut profile = ScholarProfile::new(PROFILE_ID);
    for (i, title) in TITLES.iter().take(2).enumerate() {
        let mut publication = Publication::new(*title, Some(2020));
        publication.set_doi(format!("10.1000/p{i}"), "https://doi.org");
        profile.publications.push(publication);
    }
    profile.publications.push(Publication::new(TITLES[2], Some(2020)));
    DatasetStore::new(data_dir.path()).save(&Dataset::new(profile)).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/altmetric/v1/doi/10.1000/p0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "score": 12.5,
            "cited_by_posts_count": 4,
            "cited_by_accounts_count": 3,
            "readers_count": 40
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/altmetric/v1/doi/10.1000/p1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .expect(1)
        .mount(&server)
        .await;
    let searches = [
        ("10.1000/p0", r#"<div class="gs_fl"><a href="/scholar?cites=7">Cited by 31</a></div>"#),
        ("10.1000/p1", "<p>Your search did not match any articles.</p>"),
    ];
    for (doi, body) in searches {
        Mock::given(method("GET"))
            .and(path("/scholar"))
            .and(query_param("q", doi))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let report = pipeline(&server, data_dir.path())
        .revalidate_metrics(PROFILE_ID, RevalidateOptions::default())
        .await
        .unwrap();

    assert_eq!(report.phase1_refetched, 4);
    assert_eq!(report.phase2_refetched, 0);
    assert_eq!(report.succeeded, 4);

    let dataset = DatasetStore::new(data_dir.path()).load(PROFILE_ID).await.unwrap().unwrap();
    let metrics = dataset.profile.publications[0].metrics.as_ref().unwrap();
    assert_eq!(metrics.altmetric_score, Some(12.5));
    assert_eq!(metrics.readers, 40);
    assert_eq!(metrics.scholar_citations, Some(31));
    let empty = dataset.profile.publications[1].metrics.as_ref().unwrap();
    assert_eq!(empty.altmetric_score, None);
    assert_eq!(empty.scholar_citations, None);
    assert!(dataset.profile.publications[2].metrics.is_none());
}
