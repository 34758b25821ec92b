//! A backpressured, multi-stage extract/transform/load pipeline engine.
//!
//! A run reads items from a single source, splits and types them into rows,
//! optionally transforms them and hands them to a sink. Each phase runs on
//! its own worker threads, connected by bounded channels that block a
//! producer when full.
//!
//! # Features
//!
//! - Bounded channels over crossbeam's `SegQueue`, guarded by a counting permit
//! - Worker counts per phase derived from the CPU budget with a fixed ratio
//! - Round-robin linking between phases with unequal worker counts
//! - Phase-by-phase drain that only stops a phase once its input is empty
//! - Global pause/resume through a shared gate
//! - Worker faults collected into one aggregate error that aborts the run
//!
//! Rows are not delivered in source order once a phase fans out.
//!
//! # Example
//!
//! ```no_run
//! use staged_etl::{FlatFileSource, MemorySink, PipelineBuilder, RunConfig};
//!
//! # fn main() -> staged_etl::Result<()> {
//! let config = RunConfig::new()
//!     .with_delimiter("|")
//!     .with_columns(["id", "name", "city"]);
//! let sink = MemorySink::new();
//!
//! let mut pipeline = PipelineBuilder::new(config)
//!     .line_source(FlatFileSource::open("people.txt")?)
//!     .sink(sink.clone())
//!     .on_progress(|n| println!("{n} lines read"))
//!     .build()?;
//!
//! let report = pipeline.run()?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod control;
pub mod distribution;
pub mod error;
pub mod gate;
pub mod io;
pub mod metrics;
mod monitor;
pub mod pipeline;
pub mod progress;
pub mod row;
pub mod split;
pub mod stage;

pub use buffer::{BoundedChannel, Fanout};
pub use config::{PhaseKind, RunConfig, TableOptions, Topology};
pub use control::{PipelineControl, RunState};
pub use distribution::ScalingDistribution;
pub use error::{PipelineError, Result, WorkerFailure};
pub use gate::PauseGate;
pub use io::{
    read_header, FlatFileSink, FlatFileSource, IterSource, MemorySink, Produced, Sink, Source,
    TableManager,
};
pub use metrics::{RunReport, WorkerReport};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use progress::ProgressReporter;
pub use row::{Record, Row, RowFactory, Value, ValueType};
pub use stage::{RowTransform, Stage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
