//! Workers and the loop they share.
//!
//! Every worker of every phase runs the same loop: wait at the pause gate,
//! pull one item, apply its phase's function, hand the result downstream.
//! A worker stops once its phase's completion flag has been signalled and its
//! input is empty, or as soon as the run is aborted.

use crate::buffer::{BoundedChannel, Fanout};
use crate::config::PhaseKind;
use crate::error::{PipelineError, Result};
use crate::gate::PauseGate;
use crate::io::{Produced, Sink, Source};
use crate::metrics::WorkerMetrics;
use crate::progress::ProgressReporter;
use crate::row::{Record, Row, RowFactory};
use crate::split::split_to_record;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// User function applied by the transformer phase; `None` drops the row
pub type RowTransform = Arc<dyn Fn(Row) -> Result<Option<Row>> + Send + Sync>;

/// One-way "more work may arrive" flag shared by the workers of a phase
#[derive(Debug, Clone)]
pub struct CompletionFlag {
    more_work: Arc<AtomicBool>,
}

impl CompletionFlag {
    pub fn new() -> Self {
        Self {
            more_work: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Tell the phase that nothing more will be enqueued for it
    pub fn signal_completion(&self) {
        self.more_work.store(false, Ordering::Release);
    }

    pub fn has_more_work(&self) -> bool {
        self.more_work.load(Ordering::Acquire)
    }
}

impl Default for CompletionFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker consults besides its channels
#[derive(Debug, Clone)]
pub struct StageContext {
    name: String,
    gate: Arc<PauseGate>,
    completion: CompletionFlag,
    progress: ProgressReporter,
    progress_every: u64,
    idle_sleep: Duration,
    metrics: WorkerMetrics,
}

impl StageContext {
    pub fn new(name: impl Into<String>, gate: Arc<PauseGate>, completion: CompletionFlag) -> Self {
        Self {
            name: name.into(),
            gate,
            completion,
            progress: ProgressReporter::silent(),
            progress_every: crate::config::DEFAULT_PROGRESS_EVERY,
            idle_sleep: crate::config::DEFAULT_IDLE_SLEEP,
            metrics: WorkerMetrics::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter, every: u64) -> Self {
        self.progress = progress;
        self.progress_every = every.max(1);
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    fn tick(&self, count: u64) {
        if count % self.progress_every == 0 {
            self.progress.report(count);
        }
    }

    /// Push downstream; `false` once the channel has been abandoned
    fn forward<T: Send>(&self, output: &mut Fanout<T>, item: T) -> bool {
        if output.next_is_full() {
            self.metrics.record_block();
        }
        output.push(item).is_ok()
    }
}

/// A unit of work run by one worker thread
pub trait Stage: Send {
    fn kind(&self) -> PhaseKind;

    /// Run until drained or aborted, returning the number of items handled
    fn run(&mut self, ctx: &StageContext) -> Result<u64>;
}

/// Pull, apply, emit until the phase is drained; the final count is reported
/// on every exit path
fn pump<I, O>(
    ctx: &StageContext,
    input: &BoundedChannel<I>,
    mut apply: impl FnMut(I) -> Result<Option<O>>,
    mut emit: impl FnMut(O) -> Result<bool>,
) -> Result<u64>
where
    I: Send,
{
    let mut count = 0;
    let result = pump_items(ctx, input, &mut count, &mut apply, &mut emit);
    ctx.progress.report(count);
    debug!(worker = %ctx.name, items = count, "worker finished");
    result.map(|()| count)
}

fn pump_items<I, O>(
    ctx: &StageContext,
    input: &BoundedChannel<I>,
    count: &mut u64,
    apply: &mut impl FnMut(I) -> Result<Option<O>>,
    emit: &mut impl FnMut(O) -> Result<bool>,
) -> Result<()>
where
    I: Send,
{
    loop {
        if !ctx.gate.wait() {
            return Ok(());
        }
        let item = match input.pop() {
            Some(item) => item,
            None => {
                if !ctx.completion.has_more_work() {
                    return Ok(());
                }
                thread::sleep(ctx.idle_sleep);
                continue;
            }
        };

        let start = Instant::now();
        match apply(item)? {
            Some(out) => {
                if !emit(out)? {
                    return Ok(());
                }
                ctx.metrics.record_processed();
            }
            None => ctx.metrics.record_skipped(),
        }
        ctx.metrics.record_latency(start.elapsed().as_nanos() as u64);

        *count += 1;
        ctx.tick(*count);
    }
}

/// Owns the source and feeds the splitting or row-building workers
pub struct ReaderStage<T: Send> {
    source: Box<dyn Source<T>>,
    output: Fanout<T>,
    skip_header: bool,
}

impl<T: Send> ReaderStage<T> {
    pub fn new(source: Box<dyn Source<T>>, output: impl Into<Fanout<T>>) -> Self {
        Self {
            source,
            output: output.into(),
            skip_header: false,
        }
    }

    /// Discard the first item the source yields; it is neither forwarded nor counted
    pub fn with_header(mut self, has_header: bool) -> Self {
        self.skip_header = has_header;
        self
    }

    fn produce(&mut self, ctx: &StageContext, count: &mut u64) -> Result<()> {
        loop {
            if !ctx.gate.wait() {
                return Ok(());
            }
            let start = Instant::now();
            match self.source.try_produce()? {
                Produced::Item(_) if self.skip_header => {
                    self.skip_header = false;
                    debug!(worker = %ctx.name, "header line skipped");
                }
                Produced::Item(item) => {
                    if !ctx.forward(&mut self.output, item) {
                        return Ok(());
                    }
                    ctx.metrics.record_processed();
                    ctx.metrics.record_latency(start.elapsed().as_nanos() as u64);
                    *count += 1;
                    ctx.tick(*count);
                }
                Produced::Pending => thread::sleep(ctx.idle_sleep),
                Produced::Exhausted => return Ok(()),
            }
        }
    }
}

impl<T: Send> Stage for ReaderStage<T> {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Reader
    }

    fn run(&mut self, ctx: &StageContext) -> Result<u64> {
        let mut count = 0;
        let result = self.produce(ctx, &mut count);
        ctx.progress.report(count);
        debug!(worker = %ctx.name, items = count, "source exhausted");
        result.map(|()| count)
    }
}

/// Splits delimited lines into raw records
pub struct SplitterStage {
    input: BoundedChannel<String>,
    output: Fanout<Record>,
    delimiter: String,
    qualifier: Option<char>,
    null_value: Option<String>,
}

impl SplitterStage {
    pub fn new(
        input: BoundedChannel<String>,
        output: impl Into<Fanout<Record>>,
        delimiter: impl Into<String>,
        qualifier: Option<char>,
        null_value: Option<String>,
    ) -> Self {
        Self {
            input,
            output: output.into(),
            delimiter: delimiter.into(),
            qualifier,
            null_value,
        }
    }
}

impl Stage for SplitterStage {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Splitter
    }

    fn run(&mut self, ctx: &StageContext) -> Result<u64> {
        let (delimiter, qualifier) = (self.delimiter.as_str(), self.qualifier);
        let null_value = self.null_value.as_deref();
        pump(
            ctx,
            &self.input,
            |line: String| {
                Ok(Some(split_to_record(&line, delimiter, qualifier, null_value)))
            },
            |record| Ok(ctx.forward(&mut self.output, record)),
        )
    }
}

/// Turns raw records into rows of the expected columns
pub struct RowBuilderStage {
    input: BoundedChannel<Record>,
    output: Fanout<Row>,
    factory: RowFactory,
    skip_errors: bool,
}

impl RowBuilderStage {
    pub fn new(
        input: BoundedChannel<Record>,
        output: impl Into<Fanout<Row>>,
        factory: RowFactory,
        skip_errors: bool,
    ) -> Self {
        Self {
            input,
            output: output.into(),
            factory,
            skip_errors,
        }
    }
}

impl Stage for RowBuilderStage {
    fn kind(&self) -> PhaseKind {
        PhaseKind::RowBuilder
    }

    fn run(&mut self, ctx: &StageContext) -> Result<u64> {
        let (factory, skip_errors) = (&self.factory, self.skip_errors);
        pump(
            ctx,
            &self.input,
            |record: Record| match factory.create_row(record) {
                Ok(row) => Ok(Some(row)),
                Err(PipelineError::FieldCountMismatch { expected, actual }) if skip_errors => {
                    warn!(
                        worker = %ctx.name,
                        expected,
                        actual,
                        "skipping record with wrong field count"
                    );
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            |row| Ok(ctx.forward(&mut self.output, row)),
        )
    }
}

/// Applies the user's row transform
pub struct TransformerStage {
    input: BoundedChannel<Row>,
    output: Fanout<Row>,
    transform: RowTransform,
}

impl TransformerStage {
    pub fn new(input: BoundedChannel<Row>, output: impl Into<Fanout<Row>>, transform: RowTransform) -> Self {
        Self {
            input,
            output: output.into(),
            transform,
        }
    }
}

impl Stage for TransformerStage {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Transformer
    }

    fn run(&mut self, ctx: &StageContext) -> Result<u64> {
        let transform = &self.transform;
        pump(
            ctx,
            &self.input,
            |row: Row| (**transform)(row),
            |row| Ok(ctx.forward(&mut self.output, row)),
        )
    }
}

/// Hands rows to the shared sinks.
///
/// With several sinks every row is duplicated: each sink but the last gets
/// its own clone, in registration order.
pub struct LoaderStage {
    input: BoundedChannel<Row>,
    sinks: Arc<[Arc<dyn Sink>]>,
}

impl LoaderStage {
    pub fn new(input: BoundedChannel<Row>, sinks: Arc<[Arc<dyn Sink>]>) -> Self {
        Self { input, sinks }
    }
}

fn deliver(sinks: &[Arc<dyn Sink>], row: Row) -> Result<()> {
    let Some((last, rest)) = sinks.split_last() else {
        return Err(PipelineError::Sink("no sink to load into".into()));
    };
    for sink in rest {
        sink.consume(row.clone())?;
    }
    last.consume(row)
}

impl Stage for LoaderStage {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Loader
    }

    fn run(&mut self, ctx: &StageContext) -> Result<u64> {
        let sinks = &self.sinks;
        pump(
            ctx,
            &self.input,
            |row: Row| Ok(Some(row)),
            |row| {
                deliver(sinks, row)?;
                Ok(true)
            },
        )
    }
}

/// The closed set of workers a run is made of
pub enum Worker {
    LineReader(ReaderStage<String>),
    RecordReader(ReaderStage<Record>),
    Splitter(SplitterStage),
    RowBuilder(RowBuilderStage),
    Transformer(TransformerStage),
    Loader(LoaderStage),
}

impl Stage for Worker {
    fn kind(&self) -> PhaseKind {
        match self {
            Worker::LineReader(s) => s.kind(),
            Worker::RecordReader(s) => s.kind(),
            Worker::Splitter(s) => s.kind(),
            Worker::RowBuilder(s) => s.kind(),
            Worker::Transformer(s) => s.kind(),
            Worker::Loader(s) => s.kind(),
        }
    }

    fn run(&mut self, ctx: &StageContext) -> Result<u64> {
        match self {
            Worker::LineReader(s) => s.run(ctx),
            Worker::RecordReader(s) => s.run(ctx),
            Worker::Splitter(s) => s.run(ctx),
            Worker::RowBuilder(s) => s.run(ctx),
            Worker::Transformer(s) => s.run(ctx),
            Worker::Loader(s) => s.run(ctx),
        }
    }
}
