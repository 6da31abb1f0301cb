//! Pipeline orchestration.
//!
//! One run per profile walks
//! `Init → FetchingIdentity → FetchingCoauthors → FetchingPublications →
//! ResolvingIdentifiers → Done`, committing the dataset after every stage.
//! `RevalidatingMetrics` runs separately whenever a dataset exists.
//!
//! Resume markers record the last index processed in the co-author and
//! publication stages. A marker only moves forward: it advances over successes
//! and permanent failures, and stops at the first transient failure so the next
//! run starts there. Elements behind a marker are never fetched again unless the
//! run is forced. When the listing changes, rows that land at or behind a marker
//! without having been processed go into the stage's backlog and are fetched
//! before the stage moves forward.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::pin::pin;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;

use crate::context::HarvestContext;
use crate::dataset::{Dataset, DatasetStore, SCHEMA_VERSION, resume_index};
use crate::error::{HarvestError, HarvestResult};
use crate::metrics::{MetricsRevalidator, RevalidateOptions, RevalidationReport};
use crate::models::{DoiStatus, Publication, ScholarProfile};
use crate::resolver::{DoiResolution, IdentifierResolver, urls_equal};
use crate::source::{ScholarSource, validate_profile_id};

/// Venues that rarely carry a DOI; their publications are not looked up.
const SKIPPED_VENUES: &[&str] = &["symposium", "conference", "workshop", "annual meeting"];

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Loading the previous dataset and checking freshness.
    Init,
    /// Fetching the profile header and listing.
    FetchingIdentity,
    /// Filling in co-author details.
    FetchingCoauthors,
    /// Fetching publication detail pages.
    FetchingPublications,
    /// Resolving DOIs.
    ResolvingIdentifiers,
    /// Refreshing attention and citation metrics.
    RevalidatingMetrics,
    /// Finished.
    Done,
}

/// Options for a full run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Ignore freshness and reset resume markers.
    pub force: bool,
}

/// One element that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementFailure {
    /// Stage the element belongs to.
    pub stage: PipelineState,
    /// Index within the stage's sequence.
    pub index: usize,
    /// Whether a later run may succeed.
    pub transient: bool,
    /// Error message.
    pub message: String,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Profile id.
    pub profile_id: String,
    /// Last state reached. A run with outstanding transient failures stays in
    /// the earliest stage that has one.
    pub final_state: PipelineState,
    /// The dataset was fresh and nothing was fetched.
    pub short_circuited: bool,
    /// Co-authors fetched this run.
    pub coauthors_fetched: usize,
    /// Publication pages fetched this run.
    pub publications_fetched: usize,
    /// DOIs resolved this run.
    pub resolved: usize,
    /// Publications with no DOI to be found.
    pub unresolved: usize,
    /// Publications not looked up because of their venue.
    pub skipped: usize,
    /// Elements that failed.
    pub failures: Vec<ElementFailure>,
}

impl RunReport {
    fn new(profile_id: &str) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            final_state: PipelineState::Init,
            short_circuited: false,
            coauthors_fetched: 0,
            publications_fetched: 0,
            resolved: 0,
            unresolved: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    /// Whether the run reached `Done`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.final_state == PipelineState::Done
    }

    /// Earliest stage left with a transient failure.
    fn stalled_stage(&self) -> Option<PipelineState> {
        self.failures.iter().find(|f| f.transient).map(|f| f.stage)
    }

    fn record(&mut self, index: usize, error: &HarvestError) {
        let transient = error.is_transient();
        tracing::warn!(
            profile_id = %self.profile_id,
            stage = ?self.final_state,
            index,
            transient,
            error = %error,
            "element failed"
        );
        self.failures.push(ElementFailure {
            stage: self.final_state,
            index,
            transient,
            message: error.to_string(),
        });
    }
}

/// Progress over one stage's sequence, keyed by element identity: a
/// forward-only marker, the backlog of entries at or behind it still to fetch,
/// and the entries past it that are already done.
struct Frontier<K> {
    keys: Vec<K>,
    marker: Option<usize>,
    resume: usize,
    open: bool,
    backlog: Vec<K>,
    settled: Vec<K>,
}

impl<K: PartialEq + Clone> Frontier<K> {
    fn new(keys: Vec<K>, marker: Option<usize>, backlog: Vec<K>, settled: Vec<K>) -> Self {
        let mut frontier = Self { keys, marker, resume: resume_index(marker), open: true, backlog, settled };
        frontier.pass_settled();
        frontier
    }

    /// Backlog entries, then everything after the marker not already done.
    fn indices(&self) -> Vec<usize> {
        let keys = &self.keys;
        let behind = (0..self.resume.min(keys.len())).filter(|&i| self.backlog.contains(&keys[i]));
        let ahead = (resume_index(self.marker)..keys.len()).filter(|&i| !self.settled.contains(&keys[i]));
        behind.chain(ahead).collect()
    }

    /// The element at `index` is done, successfully or for good.
    fn settle(&mut self, index: usize) {
        let key = &self.keys[index];
        if index < self.resume {
            self.backlog.retain(|k| k != key);
        } else if self.open && self.marker.is_none_or(|m| index > m) {
            self.marker = Some(index);
            self.pass_settled();
        } else if !self.settled.contains(key) {
            self.settled.push(key.clone());
        }
    }

    /// The element at `index` failed transiently. Past the marker this stops
    /// the marker for the rest of the run; in the backlog the entry stays.
    fn hold(&mut self, index: usize) {
        if index >= self.resume {
            self.open = false;
        }
    }

    /// Move the marker over entries already done.
    fn pass_settled(&mut self) {
        while let Some(key) = self.keys.get(resume_index(self.marker)) {
            let Some(position) = self.settled.iter().position(|k| k == key) else {
                break;
            };
            self.settled.swap_remove(position);
            self.marker = Some(resume_index(self.marker));
        }
    }
}

/// Runs the harvesting stages for profiles.
#[derive(Debug, Clone)]
pub struct Pipeline {
    ctx: HarvestContext,
    source: ScholarSource,
    resolver: IdentifierResolver,
    metrics: MetricsRevalidator,
    store: DatasetStore,
}

impl Pipeline {
    /// Pipeline writing to the configured data directory.
    #[must_use]
    pub fn new(ctx: HarvestContext) -> Self {
        let store = DatasetStore::new(ctx.config().data_dir.clone());
        Self::with_store(ctx, store)
    }

    /// Pipeline writing to `store`.
    #[must_use]
    pub fn with_store(ctx: HarvestContext, store: DatasetStore) -> Self {
        Self {
            source: ScholarSource::new(ctx.clone()),
            resolver: IdentifierResolver::new(ctx.clone()),
            metrics: MetricsRevalidator::new(ctx.clone()),
            ctx,
            store,
        }
    }

    /// Dataset store.
    #[must_use]
    pub const fn store(&self) -> &DatasetStore {
        &self.store
    }

    fn enter(report: &mut RunReport, state: PipelineState) {
        tracing::info!(profile_id = %report.profile_id, ?state, "pipeline state");
        report.final_state = state;
    }

    /// Run every stage for one profile.
    ///
    /// # Errors
    ///
    /// Fails without touching the stored dataset when the profile id is invalid
    /// or the identity fetch fails. Fails after committing progress on
    /// cancellation or a fatal error. Element failures are reported, not raised.
    pub async fn run(&self, profile_id: &str, options: RunOptions) -> HarvestResult<RunReport> {
        validate_profile_id(profile_id)?;
        let mut report = RunReport::new(profile_id);
        Self::enter(&mut report, PipelineState::Init);

        let previous = self.store.load(profile_id).await?;
        if !options.force
            && previous.as_ref().is_some_and(|d| d.is_fresh(self.ctx.config().freshness_window))
        {
            tracing::info!(profile_id, "dataset is fresh, skipping run");
            report.short_circuited = true;
            Self::enter(&mut report, PipelineState::Done);
            return Ok(report);
        }

        Self::enter(&mut report, PipelineState::FetchingIdentity);
        let fetched = match self.source.fetch_profile(profile_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(profile_id, error = %e, "identity fetch failed, run aborted");
                return Err(e);
            }
        };
        let mut dataset = merge(previous, fetched, options.force);
        self.store.save(&dataset).await?;

        Self::enter(&mut report, PipelineState::FetchingCoauthors);
        let outcome = self.coauthor_stage(&mut dataset, &mut report).await;
        self.commit(&dataset, outcome).await?;

        Self::enter(&mut report, PipelineState::FetchingPublications);
        let outcome = self.publication_stage(&mut dataset, &mut report).await;
        self.commit(&dataset, outcome).await?;

        Self::enter(&mut report, PipelineState::ResolvingIdentifiers);
        let outcome = self.resolution_stage(&mut dataset, &mut report).await;
        self.commit(&dataset, outcome).await?;

        if let Some(stage) = report.stalled_stage() {
            report.final_state = stage;
            tracing::warn!(
                profile_id,
                ?stage,
                failures = report.failures.len(),
                "run incomplete, next run resumes from the committed markers"
            );
            return Ok(report);
        }

        dataset.last_fetched = Some(Utc::now());
        self.store.save(&dataset).await?;
        Self::enter(&mut report, PipelineState::Done);

        tracing::info!(
            profile_id,
            coauthors = report.coauthors_fetched,
            publications = report.publications_fetched,
            resolved = report.resolved,
            failures = report.failures.len(),
            "run complete"
        );
        Ok(report)
    }

    /// Run several profiles concurrently. Each profile's run is independent.
    pub async fn run_many(&self, profile_ids: &[String], options: RunOptions) -> Vec<(String, HarvestResult<RunReport>)> {
        let runs = profile_ids.iter().map(|id| async move { (id.clone(), self.run(id, options).await) });
        futures::future::join_all(runs).await
    }

    /// Commit the dataset after a stage; a stage error is raised after the commit.
    async fn commit(&self, dataset: &Dataset, outcome: HarvestResult<()>) -> HarvestResult<()> {
        self.store.save(dataset).await?;
        outcome
    }

    async fn coauthor_stage(&self, dataset: &mut Dataset, report: &mut RunReport) -> HarvestResult<()> {
        let snapshot = dataset.profile.clone();
        let mut frontier = Frontier::new(
            snapshot.coauthors.iter().map(|c| c.id.clone()).collect(),
            dataset.coauthor_marker,
            std::mem::take(&mut dataset.coauthor_backlog),
            std::mem::take(&mut dataset.coauthor_settled),
        );
        let mut stream = pin!(self.source.fetch_coauthors_at(&snapshot, frontier.indices()));

        let outcome = loop {
            let Some((index, result)) = stream.next().await else { break Ok(()) };
            match result {
                Ok(coauthor) => {
                    dataset.profile.coauthors[index] = coauthor;
                    report.coauthors_fetched += 1;
                    frontier.settle(index);
                }
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    report.record(index, &e);
                    if e.is_transient() { frontier.hold(index) } else { frontier.settle(index) }
                }
            }
        };
        dataset.coauthor_marker = frontier.marker;
        dataset.coauthor_backlog = frontier.backlog;
        dataset.coauthor_settled = frontier.settled;
        outcome
    }

    async fn publication_stage(&self, dataset: &mut Dataset, report: &mut RunReport) -> HarvestResult<()> {
        let snapshot = dataset.profile.clone();
        let mut frontier = Frontier::new(
            snapshot.publications.iter().map(Publication::identity).collect(),
            dataset.publication_marker,
            std::mem::take(&mut dataset.publication_backlog),
            std::mem::take(&mut dataset.publication_settled),
        );
        let mut stream = pin!(self.source.fetch_publications_at(&snapshot, frontier.indices()));

        let outcome = loop {
            let Some((index, result)) = stream.next().await else { break Ok(()) };
            match result {
                Ok(publication) => {
                    dataset.profile.publications[index] = publication;
                    report.publications_fetched += 1;
                    frontier.settle(index);
                }
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    report.record(index, &e);
                    if e.is_transient() { frontier.hold(index) } else { frontier.settle(index) }
                }
            }
        };
        dataset.publication_marker = frontier.marker;
        dataset.publication_backlog = frontier.backlog;
        dataset.publication_settled = frontier.settled;
        outcome
    }

    /// Resolve every pending publication. Resolution state lives on each
    /// publication, so this stage needs no marker.
    ///
    /// Publications whose detail page failed transiently this run stay pending:
    /// without their author line a title search cannot be disambiguated.
    async fn resolution_stage(&self, dataset: &mut Dataset, report: &mut RunReport) -> HarvestResult<()> {
        let delay = self.ctx.config().publication_delay;
        let doi_base = self.ctx.config().doi_url.clone();
        let outstanding: HashSet<usize> = report
            .failures
            .iter()
            .filter(|f| f.stage == PipelineState::FetchingPublications && f.transient)
            .map(|f| f.index)
            .collect();
        let mut attempted = 0usize;

        for index in 0..dataset.profile.publications.len() {
            let publication = &dataset.profile.publications[index];
            if publication.doi_status != DoiStatus::Pending {
                continue;
            }
            if is_skipped_venue(publication) {
                tracing::debug!(title = %publication.title, venue = ?publication.venue, "venue skipped");
                dataset.profile.publications[index].doi_status = DoiStatus::Skipped;
                report.skipped += 1;
                continue;
            }
            if outstanding.contains(&index) {
                tracing::debug!(title = %publication.title, "details outstanding, resolution deferred");
                continue;
            }

            let pause = if attempted == 0 { Duration::ZERO } else { delay };
            self.ctx.cancel_token().sleep(pause).await?;
            attempted += 1;

            let snapshot = publication.clone();
            let outcome = self
                .ctx
                .retry()
                .with_retry("doi resolution", |_| self.resolver.resolve_doi(&snapshot))
                .await;

            let resolved_link = match &outcome {
                Ok(DoiResolution::Resolved(doi)) => self.resolved_link(doi, snapshot.pub_url.as_deref()).await,
                _ => None,
            };
            let publication = &mut dataset.profile.publications[index];
            match outcome {
                Ok(DoiResolution::Resolved(doi)) => {
                    publication.doi_resolved_link = resolved_link;
                    publication.set_doi(doi, &doi_base);
                    report.resolved += 1;
                }
                Ok(DoiResolution::Unresolved) => {
                    publication.doi_status = DoiStatus::Unresolved;
                    report.unresolved += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.record(index, &e);
                    if !e.is_transient() {
                        publication.doi_status = DoiStatus::Unresolved;
                        report.unresolved += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Where doi.org sends `doi`. A failed lookup leaves the link empty.
    async fn resolved_link(&self, doi: &str, pub_url: Option<&str>) -> Option<String> {
        match self.resolver.resolved_link(doi).await {
            Ok(Some(link)) => {
                if let Some(url) = pub_url.filter(|u| !urls_equal(u, &link)) {
                    tracing::warn!(doi, url, resolved = %link, "DOI resolves away from the publisher URL");
                }
                Some(link)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(doi, error = %e, "DOI target lookup failed");
                None
            }
        }
    }

    /// Refresh metrics for every DOI in a stored dataset and attach them.
    ///
    /// # Errors
    ///
    /// [`HarvestError::MissingDataset`] when the profile was never harvested;
    /// cancellation and storage errors.
    pub async fn revalidate_metrics(
        &self,
        profile_id: &str,
        options: RevalidateOptions,
    ) -> HarvestResult<RevalidationReport> {
        validate_profile_id(profile_id)?;
        let mut dataset = self
            .store
            .load(profile_id)
            .await?
            .ok_or_else(|| HarvestError::MissingDataset(profile_id.to_string()))?;
        tracing::info!(profile_id, state = ?PipelineState::RevalidatingMetrics, "pipeline state");

        let dois = dataset.profile.dois();
        let report = self.metrics.revalidate(&dois, options).await?;

        let mut blocks = HashMap::new();
        for doi in &dois {
            if let Some(block) = self.metrics.metrics_for(doi).await {
                blocks.insert(doi.to_ascii_lowercase(), block);
            }
        }
        for publication in &mut dataset.profile.publications {
            if let Some(block) = publication.doi.as_deref().and_then(|d| blocks.get(&d.to_ascii_lowercase())) {
                publication.metrics = Some(block.clone());
            }
        }
        self.store.save(&dataset).await?;

        tracing::info!(
            profile_id,
            dois = dois.len(),
            refetched = report.total(),
            failed = report.failed,
            "metrics revalidated"
        );
        Ok(report)
    }
}

/// Carry one stage's progress over to a new listing. Returns the backlog (not
/// yet processed, at or behind the marker) and the settled entries (processed,
/// past the marker).
fn carry_progress<K: Clone + Eq + Hash>(
    marker: Option<usize>,
    backlog: &[K],
    settled: &[K],
    old: &[K],
    new: &[K],
) -> (Vec<K>, Vec<K>) {
    let behind = resume_index(marker);
    let processed: HashSet<&K> =
        old.iter().take(behind).filter(|k| !backlog.contains(k)).chain(settled).collect();
    let backlog = new.iter().take(behind).filter(|k| !processed.contains(k)).cloned().collect();
    let settled = new.iter().skip(behind).filter(|k| processed.contains(k)).cloned().collect();
    (backlog, settled)
}

fn is_skipped_venue(publication: &Publication) -> bool {
    publication.venue.as_deref().is_some_and(|venue| {
        let venue = venue.to_lowercase();
        SKIPPED_VENUES.iter().any(|kind| venue.contains(kind))
    })
}

/// Combine a fresh listing with the stored dataset.
///
/// Publications are carried over by `(title, year)` and co-authors by id, so
/// enrichment survives a re-listing; citation counts come from the new listing.
/// Markers are kept as they are; only a forced run resets them.
fn merge(previous: Option<Dataset>, fetched: ScholarProfile, force: bool) -> Dataset {
    let Some(mut previous) = previous else {
        return Dataset::new(fetched);
    };
    if force {
        previous.reset_markers();
    }

    let mut profile = fetched;

    let mut old_publications: HashMap<_, Publication> =
        previous.profile.publications.iter().map(|p| (p.identity(), p.clone())).collect();
    for publication in &mut profile.publications {
        if let Some(mut carried) = old_publications.remove(&publication.identity()) {
            carried.citations = publication.citations;
            if carried.venue.is_none() {
                carried.venue = publication.venue.take();
            }
            if carried.source_link.is_none() {
                carried.source_link = publication.source_link.take();
            }
            *publication = carried;
        }
    }

    let old_coauthors: HashMap<&str, _> =
        previous.profile.coauthors.iter().map(|c| (c.id.as_str(), c)).collect();
    for coauthor in &mut profile.coauthors {
        if let Some(old) = old_coauthors.get(coauthor.id.as_str()) {
            if coauthor.affiliation.is_none() {
                coauthor.affiliation.clone_from(&old.affiliation);
            }
        }
    }

    let (coauthor_backlog, coauthor_settled) = carry_progress(
        previous.coauthor_marker,
        &previous.coauthor_backlog,
        &previous.coauthor_settled,
        &previous.profile.coauthors.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        &profile.coauthors.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
    );
    let (publication_backlog, publication_settled) = carry_progress(
        previous.publication_marker,
        &previous.publication_backlog,
        &previous.publication_settled,
        &previous.profile.publications.iter().map(Publication::identity).collect::<Vec<_>>(),
        &profile.publications.iter().map(Publication::identity).collect::<Vec<_>>(),
    );
    if !coauthor_backlog.is_empty() || !publication_backlog.is_empty() {
        tracing::info!(
            profile_id = %profile.id,
            coauthors = coauthor_backlog.len(),
            publications = publication_backlog.len(),
            "listing changed behind the resume markers, entries backlogged"
        );
    }

    Dataset {
        schema_version: SCHEMA_VERSION,
        last_fetched: previous.last_fetched,
        profile,
        coauthor_marker: previous.coauthor_marker,
        publication_marker: previous.publication_marker,
        coauthor_backlog,
        coauthor_settled,
        publication_backlog,
        publication_settled,
    }
}
