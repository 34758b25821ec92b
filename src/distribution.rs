//! Worker distribution across pipeline phases.
//!
//! The reading phase always gets exactly one worker because it owns the single
//! underlying file or stream handle. The remaining CPU budget is split across
//! the other phases following a fixed ratio table, rounding half up.

use crate::error::{PipelineError, Result};

/// Ratio tables keyed by phase count
const RATIO_3: [usize; 3] = [1, 1, 2];
const RATIO_4: [usize; 4] = [1, 2, 2, 4];
const RATIO_5: [usize; 5] = [1, 2, 2, 2, 4];

/// Number of workers per phase, in pipeline order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingDistribution {
    workers: Vec<usize>,
}

impl ScalingDistribution {
    /// Compute the distribution for `phase_count` phases and `cpu_budget` CPUs
    pub fn compute(phase_count: usize, cpu_budget: usize) -> Result<Self> {
        let ratio = ratio(phase_count)?;

        let available = cpu_budget.saturating_sub(1);
        let required = phase_count - 1;
        if available < required {
            return Err(PipelineError::InsufficientCpus {
                available,
                required,
            });
        }

        let ratio_sum: usize = ratio[1..].iter().sum();
        let per_unit = available as f64 / ratio_sum as f64;

        let mut workers = Vec::with_capacity(phase_count);
        workers.push(1);
        for &share in &ratio[1..] {
            // f64::round rounds half away from zero, i.e. half up for positives
            workers.push((share as f64 * per_unit).round() as usize);
        }

        Self::from_workers(workers)
    }

    /// Wrap an explicit distribution, validating it
    pub fn from_workers(workers: Vec<usize>) -> Result<Self> {
        ratio(workers.len())?;
        let distribution = Self { workers };
        distribution.validate()?;
        Ok(distribution)
    }

    /// Check that the reader has one worker and no phase has fewer workers
    /// than the phase before it
    pub fn validate(&self) -> Result<()> {
        if self.workers.first() != Some(&1) {
            return Err(PipelineError::Config(format!(
                "the reading phase must have exactly one worker, got {:?}",
                self.workers.first()
            )));
        }
        for phase in 1..self.workers.len() {
            let previous = self.workers[phase - 1];
            let workers = self.workers[phase];
            if workers < previous {
                return Err(PipelineError::NonMonotonicDistribution {
                    phase,
                    workers,
                    previous,
                });
            }
        }
        Ok(())
    }

    /// Worker counts, one entry per phase
    pub fn workers(&self) -> &[usize] {
        &self.workers
    }

    /// Workers for one phase
    pub fn phase(&self, phase: usize) -> usize {
        self.workers[phase]
    }

    pub fn phase_count(&self) -> usize {
        self.workers.len()
    }

    /// Total number of workers across all phases
    pub fn total(&self) -> usize {
        self.workers.iter().sum()
    }

    /// Number of channels a run allocates: one input channel per worker,
    /// except for the reader, which pulls from the source
    pub fn channel_count(&self) -> usize {
        self.total() - self.workers.first().copied().unwrap_or(0)
    }

    /// Capacity of each channel when `buffer_budget` objects may be in flight
    pub fn channel_capacity(&self, buffer_budget: usize) -> usize {
        (buffer_budget / self.channel_count().max(1)).max(1)
    }
}

/// The ratio table for a phase count
pub fn ratio(phase_count: usize) -> Result<&'static [usize]> {
    match phase_count {
        3 => Ok(&RATIO_3),
        4 => Ok(&RATIO_4),
        5 => Ok(&RATIO_5),
        n => Err(PipelineError::UnsupportedPhaseCount(n)),
    }
}

/// Round-robin links between `producers` upstream workers and `consumers`
/// downstream workers: entry `j` is the producer feeding consumer `j`.
///
/// Every producer gets at least one consumer as long as
/// `consumers >= producers`, which [`ScalingDistribution::validate`] enforces.
pub fn round_robin(producers: usize, consumers: usize) -> Vec<usize> {
    if producers == 0 {
        return Vec::new();
    }
    (0..consumers).map(|j| j % producers).collect()
}
