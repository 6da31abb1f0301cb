//! Data models for harvested profiles.
//!
//! Optional fields use `#[serde(default)]` so older datasets deserialize; absent
//! values are skipped on write to keep documents small.

mod profile;
mod publication;

pub use profile::{CoauthorRef, ScholarProfile};
pub use publication::{DoiStatus, MetricsBlock, Publication};
