//! Loss/accuracy aggregation and throughput reporting.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::trainer::Phase;

/// Sample-weighted loss and accuracy over one phase.
#[derive(Debug)]
pub struct PhaseMetrics {
    phase: Phase,
    loss_sum: f64,
    correct: usize,
    samples: usize,
    batches: usize,
    started: Instant,
}

impl PhaseMetrics {
    /// Start timing a phase.
    #[must_use]
    pub fn start(phase: Phase) -> Self {
        Self {
            phase,
            loss_sum: 0.0,
            correct: 0,
            samples: 0,
            batches: 0,
            started: Instant::now(),
        }
    }

    /// Add one batch: mean `loss` over `samples` rows, `correct` of them right.
    pub fn record(&mut self, loss: f64, correct: usize, samples: usize) {
        self.loss_sum += loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
        self.batches += 1;
    }

    /// Normalise by the sample count.
    #[must_use]
    pub fn finish(&self) -> PhaseSummary {
        let denom = self.samples.max(1) as f64;
        PhaseSummary {
            phase: self.phase,
            loss: self.loss_sum / denom,
            accuracy: self.correct as f64 / denom,
            samples: self.samples,
            batches: self.batches,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// End-of-phase report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    /// Phase
    pub phase: Phase,
    /// Mean loss per sample
    pub loss: f64,
    /// Fraction of correct predictions
    pub accuracy: f64,
    /// Samples seen
    pub samples: usize,
    /// Batches seen
    pub batches: usize,
    /// Wall-clock duration
    pub elapsed_secs: f64,
}

/// Training statistics over the last `print_step` steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalReport {
    /// Mean loss per sample
    pub loss: f64,
    /// Fraction of correct predictions
    pub accuracy: f64,
    /// Throughput
    pub samples_per_sec: f64,
    /// Average time per step
    pub sec_per_batch: f64,
}

/// Rolling window reported every `print_step` global steps.
///
/// The clock keeps running across phases and epochs, so the first window of
/// an epoch also covers the validation passes of the previous one.
#[derive(Debug)]
pub struct IntervalMeter {
    print_step: usize,
    loss_sum: f64,
    correct: usize,
    samples: usize,
    window_start: Instant,
}

impl IntervalMeter {
    /// Create a meter reporting every `print_step` steps.
    #[must_use]
    pub fn new(print_step: usize) -> Self {
        Self {
            print_step: print_step.max(1),
            loss_sum: 0.0,
            correct: 0,
            samples: 0,
            window_start: Instant::now(),
        }
    }

    /// Add one training step and report if `step` closes a window.
    pub fn record(
        &mut self,
        step: usize,
        loss: f64,
        correct: usize,
        samples: usize,
    ) -> Option<IntervalReport> {
        self.loss_sum += loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
        if step % self.print_step != 0 {
            return None;
        }

        let elapsed = self.window_start.elapsed();
        self.window_start = Instant::now();
        let report = self.report(step, elapsed);
        self.loss_sum = 0.0;
        self.correct = 0;
        self.samples = 0;
        Some(report)
    }

    fn report(&self, step: usize, elapsed: Duration) -> IntervalReport {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let denom = self.samples.max(1) as f64;
        IntervalReport {
            loss: self.loss_sum / denom,
            accuracy: self.correct as f64 / denom,
            samples_per_sec: self.samples as f64 / secs,
            // step 0 closes a window of a single batch
            sec_per_batch: if step == 0 {
                secs
            } else {
                secs / self.print_step as f64
            },
        }
    }
}
