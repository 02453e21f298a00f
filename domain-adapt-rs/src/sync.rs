//! Pairing of the source-train stream with a cycled target stream.
//!
//! The source stream drives the epoch. Every source batch is paired with one
//! target batch; the target stream is restarted whenever the global step
//! reaches a multiple of its length, and silently whenever it runs dry
//! before that.

use crate::dataset::{Batch, BatchIter, BatchSource};
use crate::error::{AdaptError, Result};

/// Yields one target batch per source step, restarting the target stream as
/// needed. Create a fresh cycler at the start of every epoch.
pub struct TargetCycler<'a> {
    source: &'a dyn BatchSource,
    iter: Option<BatchIter>,
    period: usize,
    stale: bool,
    restarts: usize,
}

impl<'a> TargetCycler<'a> {
    /// Wrap the target-train stream.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Dataset`] if the stream has no batches.
    pub fn new(source: &'a dyn BatchSource) -> Result<Self> {
        let period = source.num_batches();
        if period == 0 {
            return Err(AdaptError::Dataset(
                "target training stream has no batches".into(),
            ));
        }
        Ok(Self {
            source,
            iter: None,
            period,
            stale: false,
            restarts: 0,
        })
    }

    /// Number of restarts so far (the initial pass is not counted).
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Target stream length used for the restart schedule.
    #[must_use]
    pub fn period(&self) -> usize {
        self.period
    }

    /// Next target batch.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Dataset`] if the stream yields nothing even
    /// after a restart, or whatever error the stream itself reports.
    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.iter.is_none() {
            self.iter = Some(self.source.batches()?);
        } else if self.stale {
            self.restart()?;
        }
        self.stale = false;

        if let Some(batch) = self.pull() {
            return batch;
        }
        // ran dry before the scheduled restart
        self.restart()?;
        self.pull().unwrap_or_else(|| {
            Err(AdaptError::Dataset(
                "target training stream produced no batches after restart".into(),
            ))
        })
    }

    /// Record that source step `step` (global, zero-based) finished.
    pub fn after_step(&mut self, step: usize) {
        if (step + 1) % self.period == 0 {
            self.stale = true;
        }
    }

    fn pull(&mut self) -> Option<Result<Batch>> {
        self.iter.as_mut().and_then(Iterator::next)
    }

    fn restart(&mut self) -> Result<()> {
        self.iter = Some(self.source.batches()?);
        self.restarts += 1;
        tracing::debug!("Restarted target stream (restart #{})", self.restarts);
        Ok(())
    }
}
