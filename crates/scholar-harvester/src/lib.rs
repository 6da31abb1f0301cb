//! Scholar Harvester
//!
//! Harvests Google Scholar profiles into per-profile JSON datasets, resolves DOIs
//! for each publication, and keeps Altmetric attention metrics current. Runs for
//! days against a hostile upstream: every request is cached, retried with
//! backoff, and routed through a fixed chain of egress paths that skips any path
//! the source has started blocking.
//!
//! # Features
//!
//! - **Resumable**: per-stage resume markers, committed atomically after every stage
//! - **Cached**: fingerprinted responses with per-namespace TTLs; a failure never
//!   replaces a prior success
//! - **Proxy chain**: direct, relay, then SOCKS5 paths, with block detection on
//!   every response
//! - **Two-phase metrics revalidation**: missing and blocked entries first, then
//!   stale successes
//!
//! # Example
//!
//! ```no_run
//! use scholar_harvester::{Config, HarvestContext, Pipeline, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pipeline = Pipeline::new(HarvestContext::new(config)?);
//!
//!     let report = pipeline.run("ynWS968AAAAJ", RunOptions::default()).await?;
//!     println!("{:?} with {} failures", report.final_state, report.failures.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod context;
pub mod dataset;
pub mod detect;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod proxy;
pub mod resolver;
pub mod retry;
pub mod source;
mod storage;

pub use cache::{CacheNamespace, HttpCache};
pub use cancel::CancelToken;
pub use config::Config;
pub use context::{HarvestContext, Route};
pub use dataset::{Dataset, DatasetStore};
pub use error::{ClientError, HarvestError, HarvestResult};
pub use metrics::{Metric, MetricsRevalidator, RevalidateOptions, RevalidationReport};
pub use pipeline::{Pipeline, PipelineState, RunOptions, RunReport};
pub use proxy::{ChainSelector, ProxyDescriptor};
pub use resolver::{DoiResolution, IdentifierResolver};
pub use source::ScholarSource;
