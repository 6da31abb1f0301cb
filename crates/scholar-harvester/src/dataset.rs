//! Persisted per-profile dataset.
//!
//! One JSON document per profile at `<data_dir>/<profile_id>.json`, replaced
//! atomically. Documents written by older versions are migrated on load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HarvestError, HarvestResult};
use crate::models::ScholarProfile;
use crate::storage::write_atomic;

/// Current document version.
pub const SCHEMA_VERSION: u32 = 2;

/// The persisted document: profile plus run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Document version.
    pub schema_version: u32,

    /// End of the last run that reached `Done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<DateTime<Utc>>,

    /// Profile data.
    #[serde(flatten)]
    pub profile: ScholarProfile,

    /// Index of the last co-author processed; absent when none.
    #[serde(
        rename = "_last_successful_coauthor_index",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub coauthor_marker: Option<usize>,

    /// Index of the last publication processed; absent when none.
    #[serde(
        rename = "_last_successful_publication_index",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub publication_marker: Option<usize>,

    /// Co-authors at or behind the marker still to fetch, by id.
    #[serde(rename = "_pending_coauthors", default, skip_serializing_if = "Vec::is_empty")]
    pub coauthor_backlog: Vec<String>,

    /// Co-authors past the marker already processed, by id.
    #[serde(rename = "_settled_coauthors", default, skip_serializing_if = "Vec::is_empty")]
    pub coauthor_settled: Vec<String>,

    /// Publications at or behind the marker still to fetch, by
    /// [`identity`](crate::models::Publication::identity).
    #[serde(rename = "_pending_publications", default, skip_serializing_if = "Vec::is_empty")]
    pub publication_backlog: Vec<(String, Option<i32>)>,

    /// Publications past the marker already processed, by identity.
    #[serde(rename = "_settled_publications", default, skip_serializing_if = "Vec::is_empty")]
    pub publication_settled: Vec<(String, Option<i32>)>,
}

impl Dataset {
    /// New document for `profile` with no markers.
    #[must_use]
    pub fn new(profile: ScholarProfile) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            last_fetched: None,
            profile,
            coauthor_marker: None,
            publication_marker: None,
            coauthor_backlog: Vec::new(),
            coauthor_settled: Vec::new(),
            publication_backlog: Vec::new(),
            publication_settled: Vec::new(),
        }
    }

    /// Whether the last completed run is younger than `window`.
    #[must_use]
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.last_fetched.is_some_and(|at| {
            (Utc::now() - at).to_std().is_ok_and(|age| age <= window)
        })
    }

    /// Drop both resume markers and the entries tracked around them.
    pub fn reset_markers(&mut self) {
        self.coauthor_marker = None;
        self.publication_marker = None;
        self.coauthor_backlog.clear();
        self.coauthor_settled.clear();
        self.publication_backlog.clear();
        self.publication_settled.clear();
    }
}

/// First index still to process after `marker`.
#[must_use]
pub fn resume_index(marker: Option<usize>) -> usize {
    marker.map_or(0, |m| m + 1)
}

/// Reads and writes dataset documents under one directory.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    dir: PathBuf,
}

impl DatasetStore {
    /// Store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `profile_id`.
    #[must_use]
    pub fn path_for(&self, profile_id: &str) -> PathBuf {
        self.dir.join(format!("{profile_id}.json"))
    }

    /// Load and migrate the document for `profile_id`. `None` if there is none.
    ///
    /// # Errors
    ///
    /// [`HarvestError::Storage`] on I/O failure, [`HarvestError::Parse`] when the
    /// document is not a dataset.
    pub async fn load(&self, profile_id: &str) -> HarvestResult<Option<Dataset>> {
        let path = self.path_for(profile_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HarvestError::storage(path, e)),
        };

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| HarvestError::parse("dataset", format!("{}: {e}", path.display())))?;
        let migrated = migrate(value)?;
        let dataset = serde_json::from_value(migrated)
            .map_err(|e| HarvestError::parse("dataset", format!("{}: {e}", path.display())))?;
        Ok(Some(dataset))
    }

    /// Replace the document for the dataset's profile.
    pub async fn save(&self, dataset: &Dataset) -> HarvestResult<()> {
        let path = self.path_for(&dataset.profile.id);
        let bytes = serde_json::to_vec_pretty(dataset)?;
        write_atomic(&path, &bytes).await?;
        tracing::debug!(
            path = %path.display(),
            coauthor_marker = ?dataset.coauthor_marker,
            publication_marker = ?dataset.publication_marker,
            "dataset committed"
        );
        Ok(())
    }
}

/// Bring a document of any known version up to [`SCHEMA_VERSION`].
///
/// # Errors
///
/// [`HarvestError::Parse`] when the document is not an object or is newer than
/// this build understands.
pub fn migrate(mut value: Value) -> HarvestResult<Value> {
    let Some(doc) = value.as_object_mut() else {
        return Err(HarvestError::parse("dataset", "document is not an object"));
    };
    let version = doc.get("schema_version").and_then(Value::as_u64).unwrap_or(1);

    if version > u64::from(SCHEMA_VERSION) {
        return Err(HarvestError::parse(
            "dataset",
            format!("schema_version {version} is newer than {SCHEMA_VERSION}"),
        ));
    }
    if version < 2 {
        migrate_v1(doc);
        tracing::info!(from = version, to = SCHEMA_VERSION, "dataset migrated");
    }
    doc.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    Ok(value)
}

/// v1 documents: nested `bib` publication records, `-1` markers, empty-string DOIs,
/// naive local timestamps.
fn migrate_v1(doc: &mut Map<String, Value>) {
    rename(doc, "scholar_id", "id");
    rename(doc, "citedby", "cited_by");

    for key in ["_last_successful_coauthor_index", "_last_successful_publication_index"] {
        if doc.get(key).and_then(Value::as_i64).is_some_and(|i| i < 0) {
            doc.remove(key);
        }
    }

    if let Some(raw) = doc.get("last_fetched").and_then(Value::as_str) {
        match parse_timestamp(raw) {
            Some(at) => {
                doc.insert("last_fetched".into(), Value::from(at.to_rfc3339()));
            }
            None => {
                doc.remove("last_fetched");
            }
        }
    }

    if let Some(coauthors) = doc.get_mut("coauthors").and_then(Value::as_array_mut) {
        for coauthor in coauthors.iter_mut().filter_map(Value::as_object_mut) {
            rename(coauthor, "scholar_id", "id");
        }
    }

    if let Some(publications) = doc.get_mut("publications").and_then(Value::as_array_mut) {
        for publication in publications.iter_mut().filter_map(Value::as_object_mut) {
            migrate_publication_v1(publication);
        }
    }
}

fn migrate_publication_v1(publication: &mut Map<String, Value>) {
    if let Some(Value::Object(bib)) = publication.remove("bib") {
        for (from, to) in [("title", "title"), ("citation", "venue"), ("venue", "venue"), ("journal", "venue")] {
            if let Some(v) = bib.get(from).filter(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
                publication.entry(to).or_insert_with(|| v.clone());
            }
        }
        if let Some(year) = bib.get("pub_year").and_then(|y| y.as_i64().or_else(|| y.as_str()?.parse().ok())) {
            publication.entry("year").or_insert_with(|| Value::from(year));
        }
        if let Some(Value::String(authors)) = bib.get("author") {
            let authors: Vec<Value> = authors.split(" and ").map(|a| Value::from(a.trim())).collect();
            publication.entry("authors").or_insert(Value::Array(authors));
        }
    }
    rename(publication, "num_citations", "citations");

    if publication.get("doi").and_then(Value::as_str).is_some_and(|d| d.trim().is_empty()) {
        publication.remove("doi");
    }
    if publication.get("doi_link").and_then(Value::as_str).is_some_and(str::is_empty) {
        publication.remove("doi_link");
    }
    let status = if publication.contains_key("doi") { "resolved" } else { "pending" };
    publication.entry("doi_status").or_insert_with(|| Value::from(status));
}

fn rename(map: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(v) = map.remove(from) {
        map.entry(to).or_insert(v);
    }
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|n| n.and_utc()))
}
