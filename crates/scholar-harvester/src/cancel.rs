//! Cooperative cancellation, checked at sequence boundaries only.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{HarvestError, HarvestResult};

/// Shared cancellation handle.
///
/// Checked between publications, between co-authors, and between proxy-chain
/// entries; pacing delays end early on cancellation. A request already in
/// flight runs to its transport timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(CancellationToken);

impl CancelToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> HarvestResult<()> {
        if self.is_cancelled() { Err(HarvestError::Cancelled) } else { Ok(()) }
    }

    /// Wait for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> HarvestResult<()> {
        if !duration.is_zero() {
            tokio::select! {
                () = self.0.cancelled() => {}
                () = tokio::time::sleep(duration) => {}
            }
        }
        self.check()
    }
}
