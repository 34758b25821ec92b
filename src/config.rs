use crate::error::{PipelineError, Result};
use std::time::Duration;

/// Default number of objects held across all in-flight channels
pub const DEFAULT_BUFFER_BUDGET: usize = 100_000;

/// Default interval between progress reports, in items
pub const DEFAULT_PROGRESS_EVERY: u64 = 1000;

/// Default interval at which the monitor and drain steps re-check the run
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default sleep of a worker that found its input empty
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Shape of the stage graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// Records come straight from the source: read, build rows, load
    Direct,
    /// Lines come from the source: read, split, build rows, load
    #[default]
    Split,
    /// Like `Split`, with a row transform between building and loading
    SplitTransform,
}

impl Topology {
    /// Number of phases in this topology
    pub fn phase_count(self) -> usize {
        match self {
            Topology::Direct => 3,
            Topology::Split => 4,
            Topology::SplitTransform => 5,
        }
    }

    /// Phase kinds in pipeline order
    pub fn phases(self) -> &'static [PhaseKind] {
        match self {
            Topology::Direct => &[PhaseKind::Reader, PhaseKind::RowBuilder, PhaseKind::Loader],
            Topology::Split => &[
                PhaseKind::Reader,
                PhaseKind::Splitter,
                PhaseKind::RowBuilder,
                PhaseKind::Loader,
            ],
            Topology::SplitTransform => &[
                PhaseKind::Reader,
                PhaseKind::Splitter,
                PhaseKind::RowBuilder,
                PhaseKind::Transformer,
                PhaseKind::Loader,
            ],
        }
    }
}

/// The kind of work a phase performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Reader,
    Splitter,
    RowBuilder,
    Transformer,
    Loader,
}

impl PhaseKind {
    pub fn name(self) -> &'static str {
        match self {
            PhaseKind::Reader => "reader",
            PhaseKind::Splitter => "splitter",
            PhaseKind::RowBuilder => "row_builder",
            PhaseKind::Transformer => "transformer",
            PhaseKind::Loader => "loader",
        }
    }
}

/// Destination table statements issued before any worker starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub drop: bool,
    pub create: bool,
    pub truncate: bool,
}

impl TableOptions {
    pub fn any(&self) -> bool {
        self.drop || self.create || self.truncate
    }
}

/// Options consumed when a run is orchestrated
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Field delimiter; may be several characters long
    pub delimiter: String,
    /// Text qualifier for fields containing the delimiter
    pub qualifier: Option<char>,
    /// Whether the first line of the source is a header
    pub has_header: bool,
    /// Expected column names, in field order
    pub columns: Vec<String>,
    /// Drop malformed records with a warning instead of failing the run
    pub skip_errors: bool,
    /// CPUs used to compute the worker distribution
    pub cpu_budget: usize,
    /// Objects held across all in-flight channels
    pub buffer_budget: usize,
    pub topology: Topology,
    /// Monitor and drain re-check interval
    pub poll_interval: Duration,
    /// Sleep of a worker whose input was empty
    pub idle_sleep: Duration,
    /// Report progress every this many items
    pub progress_every: u64,
    /// Field text standing for SQL NULL
    pub null_value: Option<String>,
    pub table: TableOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            delimiter: "|".to_string(),
            qualifier: Some('"'),
            has_header: true,
            columns: Vec::new(),
            skip_errors: false,
            cpu_budget: num_cpus::get(),
            buffer_budget: DEFAULT_BUFFER_BUDGET,
            topology: Topology::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            progress_every: DEFAULT_PROGRESS_EVERY,
            null_value: None,
            table: TableOptions::default(),
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_qualifier(mut self, qualifier: Option<char>) -> Self {
        self.qualifier = qualifier;
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_errors(mut self, skip: bool) -> Self {
        self.skip_errors = skip;
        self
    }

    pub fn with_cpu_budget(mut self, cpus: usize) -> Self {
        self.cpu_budget = cpus;
        self
    }

    pub fn with_buffer_budget(mut self, objects: usize) -> Self {
        self.buffer_budget = objects;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_progress_every(mut self, items: u64) -> Self {
        self.progress_every = items;
        self
    }

    pub fn with_null_value(mut self, null: impl Into<String>) -> Self {
        self.null_value = Some(null.into());
        self
    }

    pub fn with_table_options(mut self, table: TableOptions) -> Self {
        self.table = table;
        self
    }

    /// Reject option combinations no run can honour
    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(PipelineError::Config("delimiter must not be empty".into()));
        }
        if let Some(q) = self.qualifier {
            if self.delimiter.contains(q) {
                return Err(PipelineError::Config(format!(
                    "qualifier {:?} must not appear in the delimiter {:?}",
                    q, self.delimiter
                )));
            }
        }
        if self.columns.is_empty() {
            return Err(PipelineError::Config("expected column list is empty".into()));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].contains(column) {
                return Err(PipelineError::Config(format!(
                    "column '{}' appears more than once",
                    column
                )));
            }
        }
        if self.buffer_budget == 0 {
            return Err(PipelineError::Config("buffer budget must be positive".into()));
        }
        if self.progress_every == 0 {
            return Err(PipelineError::Config(
                "progress interval must be at least one item".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(PipelineError::Config("poll interval must be positive".into()));
        }
        Ok(())
    }
}
