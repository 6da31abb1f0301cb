//! Integration tests against the live services.
//!
//! These tests hit Crossref, doi.org, Altmetric and Google Scholar.
//! Run with: `cargo test --features integration -- --nocapture`

#![cfg(feature = "integration")]

use scholar_harvester::models::Publication;
use scholar_harvester::{
    Config, DoiResolution, HarvestContext, IdentifierResolver, MetricsRevalidator, RevalidateOptions, ScholarSource,
};

/// Well-known records for testing.
mod records {
    /// Jodie L. Rummer's profile.
    pub const PROFILE: &str = "ynWS968AAAAJ";
    /// "Life in the fast lane", Rummer et al., Global Change Biology 2014.
    pub const TITLE: &str = "Life in the fast lane: how climate change affects fish";
    /// DOI with a stable Altmetric record.
    pub const DOI: &str = "10.1111/gcb.12455";
}

fn context() -> HarvestContext {
    let mut config = Config::new(Vec::new());
    config.cache_dir = None;
    HarvestContext::new(config).expect("Failed to create context")
}

#[tokio::test]
async fn test_registry_resolves_known_title() {
    let resolver = IdentifierResolver::new(context());
    let mut publication = Publication::new(records::TITLE, Some(2014));
    publication.authors = vec!["Jodie L Rummer".to_string()];

    match resolver.resolve_doi(&publication).await {
        Ok(DoiResolution::Resolved(doi)) => println!("Resolved: {doi}"),
        Ok(DoiResolution::Unresolved) => println!("Note: registry had no match"),
        Err(e) => println!("Note: registry lookup failed (likely rate limited): {e}"),
    }
}

#[tokio::test]
async fn test_altmetric_record_for_known_doi() {
    let revalidator = MetricsRevalidator::new(context());
    let report = revalidator
        .revalidate(&[records::DOI.to_string()], RevalidateOptions::default())
        .await
        .expect("revalidation only fails on cancellation");

    assert_eq!(report.phase1_refetched, 1);
    if let Some(metrics) = revalidator.metrics_for(records::DOI).await {
        println!("Altmetric: score={:?}, readers={}", metrics.altmetric_score, metrics.readers);
    }
}

#[tokio::test]
async fn test_profile_fetch_direct() {
    let source = ScholarSource::new(context());

    // Scholar blocks unproxied clients often; a block is an acceptable outcome.
    match source.fetch_profile(records::PROFILE).await {
        Ok(profile) => {
            assert_eq!(profile.id, records::PROFILE);
            assert!(!profile.publications.is_empty());
            println!("{}: {} publications", profile.name, profile.publications.len());
        }
        Err(e) => {
            assert!(e.is_transient(), "unexpected permanent failure: {e}");
            println!("Note: profile fetch blocked: {e}");
        }
    }
}
