use std::fmt;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while building or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pipeline has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// No ratio table exists for this number of phases
    #[error("Unsupported number of pipeline phases: {0} (expected 3, 4 or 5)")]
    UnsupportedPhaseCount(usize),

    /// Not enough CPUs to give every non-reading phase one worker
    #[error(
        "Not enough CPUs for a scaling distribution: {available} available for non-reading \
         phases, at least {required} required"
    )]
    InsufficientCpus { available: usize, required: usize },

    /// A later phase has fewer workers than the one before it
    #[error(
        "Invalid worker distribution: phase {phase} has {workers} workers but phase {} has \
         {previous}; some channels would never drain",
        .phase - 1
    )]
    NonMonotonicDistribution {
        phase: usize,
        workers: usize,
        previous: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A record did not have the expected number of fields
    #[error("Record has {actual} fields, expected {expected}")]
    FieldCountMismatch { expected: usize, actual: usize },

    /// The source collaborator failed
    #[error("Source error: {0}")]
    Source(String),

    /// The sink collaborator failed
    #[error("Sink error: {0}")]
    Sink(String),

    /// Table preparation failed
    #[error("Table preparation error: {0}")]
    Table(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker thread panicked
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// Thread spawn error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// One or more workers faulted; the run was aborted
    #[error("Pipeline run failed with {} worker error(s): {}", .failures.len(), FailureList(.failures))]
    RunFailed { failures: Vec<WorkerFailure> },
}

impl PipelineError {
    /// The worker failures carried by an aggregate error, empty for anything else
    pub fn failures(&self) -> &[WorkerFailure] {
        match self {
            PipelineError::RunFailed { failures } => failures,
            _ => &[],
        }
    }

    /// True for errors raised before any worker starts
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedPhaseCount(_)
                | PipelineError::InsufficientCpus { .. }
                | PipelineError::NonMonotonicDistribution { .. }
                | PipelineError::Config(_)
        )
    }
}

/// The error one worker terminated with
#[derive(Debug)]
pub struct WorkerFailure {
    /// Worker name, e.g. `loader-1`
    pub worker: String,
    pub error: PipelineError,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.worker, self.error)
    }
}

struct FailureList<'a>(&'a [WorkerFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}]", failure)?;
        }
        Ok(())
    }
}
