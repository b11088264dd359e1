//! Cumulative progress derived from the encoder's per-pass elapsed time.
//!
//! ffmpeg reports `out_time` for the pass it is currently running. When an
//! encoder restarts its counter (second pass, re-analysis) the raw value drops
//! back towards zero. The tracker folds the finished pass into an accumulator
//! so the percentage it reports never moves backwards.

/// Per-attempt progress state. Owned by the single worker driving a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    accumulated_ms: u64,
    last_sample_ms: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time folded in from completed passes.
    pub fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms
    }

    /// Most recent raw sample.
    pub fn last_sample_ms(&self) -> u64 {
        self.last_sample_ms
    }

    /// Feed one raw sample and get the resulting percentage.
    ///
    /// Returns `None` when `total_duration_ms` is zero (unknown duration). The
    /// tracker state is left untouched in that case.
    pub fn observe(&mut self, raw_sample_ms: u64, total_duration_ms: u64) -> Option<u8> {
        if total_duration_ms == 0 {
            return None;
        }

        // Pass reset: fold the previous pass before taking the new sample.
        if raw_sample_ms < self.last_sample_ms {
            self.accumulated_ms = self.accumulated_ms.saturating_add(self.last_sample_ms);
        }
        self.last_sample_ms = raw_sample_ms;

        let total_ms = self
            .accumulated_ms
            .saturating_add(raw_sample_ms)
            .min(total_duration_ms);

        let percent = (total_ms as f64 / total_duration_ms as f64 * 100.0).round();
        Some(percent.clamp(0.0, 100.0) as u8)
    }
}
