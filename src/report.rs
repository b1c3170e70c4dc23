//! Designated reporting channel for replicated workers.
//!
//! Every worker process performs the same numeric updates; only the one
//! holding rank 0 emits summary diagnostics.

/// Which worker this process is in a data-parallel run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reporter {
    rank: usize,
}

impl Reporter {
    pub fn new(rank: usize) -> Self {
        Self { rank }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// True for the worker that logs summaries.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}
