//! Author profile model.

use serde::{Deserialize, Serialize};

use super::Publication;

/// An author profile with its co-author references and publications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScholarProfile {
    /// 12-character profile id.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Affiliation line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,

    /// Research interests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interests: Vec<String>,

    /// Total citation count shown on the profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_by: Option<u64>,

    /// Co-authors in profile order, referenced by id.
    #[serde(default)]
    pub coauthors: Vec<CoauthorRef>,

    /// Publications in listing order.
    #[serde(default)]
    pub publications: Vec<Publication>,
}

impl ScholarProfile {
    /// Empty profile for `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    /// Family name of the profile owner: the last whitespace-separated token.
    #[must_use]
    pub fn family_name(&self) -> Option<&str> {
        self.name.split_whitespace().last()
    }

    /// Distinct DOIs across all publications, in publication order.
    #[must_use]
    pub fn dois(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.publications
            .iter()
            .filter_map(|p| p.doi.clone())
            .filter(|doi| seen.insert(doi.to_ascii_lowercase()))
            .collect()
    }
}

/// Reference to another profile. Co-authors are never embedded, so a cyclic
/// co-author graph needs no cyclic ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoauthorRef {
    /// Co-author's profile id.
    pub id: String,

    /// Display name as shown on the referring profile.
    #[serde(default)]
    pub name: String,

    /// Affiliation, filled in by the co-author stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}
