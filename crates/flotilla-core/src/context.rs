//! The engine context threaded through every operation.
//!
//! Carries the cancellation token and the run's [`Stats`]. There are no
//! hidden process-wide singletons: everything an operation needs arrives in
//! its `Ctx`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::accounting::Stats;
use crate::error::{FsError, FsResult};

/// Per-run context: cancellation plus accounting.
#[derive(Debug, Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    stats: Arc<Stats>,
}

impl Ctx {
    pub fn new() -> Self {
        Ctx {
            cancel: CancellationToken::new(),
            stats: Stats::new(),
        }
    }

    pub fn with_stats(stats: Arc<Stats>) -> Self {
        Ctx {
            cancel: CancellationToken::new(),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of everything running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast at a suspension point when the run has been cancelled.
    pub fn check(&self) -> FsResult<()> {
        if self.is_cancelled() {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A child context sharing the stats; cancelling the parent cancels the
    /// child, not the other way around.
    pub fn child(&self) -> Ctx {
        Ctx {
            cancel: self.cancel.child_token(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_after_cancel() {
        let ctx = Ctx::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(FsError::Cancelled)));
    }

    #[test]
    fn test_child_cancellation_is_one_way() {
        let parent = Ctx::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let parent = Ctx::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
