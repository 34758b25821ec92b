use crate::buffer::{BoundedChannel, Fanout};
use crate::config::{RunConfig, Topology};
use crate::control::{PipelineControl, RunState};
use crate::distribution::{round_robin, ScalingDistribution};
use crate::error::{PipelineError, Result};
use crate::io::{Sink, Source, TableManager};
use crate::metrics::{RunReport, WorkerMetrics};
use crate::monitor::{Watch, WorkerTracker};
use crate::progress::ProgressReporter;
use crate::row::{Record, Row, RowFactory};
use crate::stage::{
    CompletionFlag, LoaderStage, ReaderStage, RowBuilderStage, RowTransform, SplitterStage,
    Stage, StageContext, TransformerStage, Worker,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

/// Where the reading phase gets its items from
enum Extractor {
    /// Raw lines, split by a dedicated phase
    Lines(Box<dyn Source<String>>),
    /// Records already split into fields
    Records(Box<dyn Source<Record>>),
}

/// Builder for a single pipeline run
pub struct PipelineBuilder {
    config: RunConfig,
    extractor: Option<Extractor>,
    sinks: Vec<Arc<dyn Sink>>,
    transform: Option<RowTransform>,
    table: Option<Box<dyn TableManager>>,
    progress: ProgressReporter,
    distribution: Option<ScalingDistribution>,
}

impl PipelineBuilder {
    /// Create a builder for a run configured by `config`
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            extractor: None,
            sinks: Vec::new(),
            transform: None,
            table: None,
            progress: ProgressReporter::silent(),
            distribution: None,
        }
    }

    /// Read raw delimited lines; requires a splitting topology.
    ///
    /// When the configuration says the source has a header row, the first
    /// line is discarded by the reader.
    pub fn line_source<S>(mut self, source: S) -> Self
    where
        S: Source<String> + 'static,
    {
        self.extractor = Some(Extractor::Lines(Box::new(source)));
        self
    }

    /// Read pre-split records; requires [`Topology::Direct`]
    pub fn record_source<S>(mut self, source: S) -> Self
    where
        S: Source<Record> + 'static,
    {
        self.extractor = Some(Extractor::Records(Box::new(source)));
        self
    }

    /// Load rows into `sink`. Registering several sinks duplicates every
    /// row into each of them.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: Sink + 'static,
    {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Apply `transform` to every row; requires [`Topology::SplitTransform`]
    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Row) -> Result<Option<Row>> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Destination table handle used for drop/create/truncate before the run
    pub fn table_manager<T>(mut self, table: T) -> Self
    where
        T: TableManager + 'static,
    {
        self.table = Some(Box::new(table));
        self
    }

    /// Receive the reader's cumulative item count
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.progress = ProgressReporter::new(callback);
        self
    }

    /// Use an explicit worker distribution instead of one computed from the CPU budget
    pub fn distribution(mut self, distribution: ScalingDistribution) -> Self {
        self.distribution = Some(distribution);
        self
    }

    /// Validate the configuration and compute the distribution.
    ///
    /// Every configuration error surfaces here, before any thread exists.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let topology = self.config.topology;

        let extractor = self
            .extractor
            .ok_or_else(|| PipelineError::Config("no source configured".into()))?;
        match (&extractor, topology) {
            (Extractor::Lines(_), Topology::Direct) => {
                return Err(PipelineError::Config(
                    "a line source needs a topology with a splitting phase".into(),
                ))
            }
            (Extractor::Records(_), Topology::Split | Topology::SplitTransform) => {
                return Err(PipelineError::Config(
                    "a record source is only supported by the direct topology".into(),
                ))
            }
            _ => {}
        }

        if self.sinks.is_empty() {
            return Err(PipelineError::Config("no sink configured".into()));
        }

        match (topology, self.transform.is_some()) {
            (Topology::SplitTransform, false) => {
                return Err(PipelineError::Config(
                    "the split-transform topology needs a row transform".into(),
                ))
            }
            (Topology::Direct | Topology::Split, true) => {
                return Err(PipelineError::Config(format!(
                    "a row transform needs the split-transform topology, got {:?}",
                    topology
                )))
            }
            _ => {}
        }

        if self.config.table.any() && self.table.is_none() {
            return Err(PipelineError::Config(
                "table preparation requested without a table manager".into(),
            ));
        }

        let distribution = match self.distribution {
            Some(distribution) if distribution.phase_count() != topology.phase_count() => {
                return Err(PipelineError::Config(format!(
                    "distribution has {} phases, topology {:?} has {}",
                    distribution.phase_count(),
                    topology,
                    topology.phase_count()
                )))
            }
            Some(distribution) => distribution,
            None => ScalingDistribution::compute(topology.phase_count(), self.config.cpu_budget)?,
        };
        debug!(?topology, workers = ?distribution.workers(), "pipeline built");

        Ok(Pipeline {
            config: self.config,
            distribution,
            extractor: Some(extractor),
            sinks: self.sinks.into(),
            transform: self.transform,
            table: self.table,
            progress: self.progress,
            control: PipelineControl::new(),
        })
    }
}

/// Occupancy and abandonment of a channel, whatever it carries
trait Drainable {
    fn is_empty(&self) -> bool;
    fn abandon(&self);
}

impl<T: Send> Drainable for BoundedChannel<T> {
    fn is_empty(&self) -> bool {
        BoundedChannel::is_empty(self)
    }

    fn abandon(&self) {
        BoundedChannel::abandon(self)
    }
}

/// A worker waiting to be spawned
struct Planned {
    phase: usize,
    name: String,
    worker: Worker,
}

/// Workers and the channel arena of one run, in pipeline order.
///
/// `inputs[i][j]` is the input channel of worker `j` of phase `i` (the reader
/// has none); `links[i][j]` is the worker of phase `i - 1` feeding it.
struct Graph {
    workers: Vec<Planned>,
    inputs: Vec<Vec<Box<dyn Drainable>>>,
    links: Vec<Vec<usize>>,
    capacity: usize,
}

impl Graph {
    fn new(phase_count: usize, capacity: usize) -> Self {
        Self {
            workers: Vec::new(),
            inputs: (0..phase_count).map(|_| Vec::new()).collect(),
            links: (0..phase_count).map(|_| Vec::new()).collect(),
            capacity,
        }
    }

    /// Allocate one input channel per worker of `phase`, linked round-robin
    /// to the `producers` workers of the phase before it
    fn channels<T: Send + 'static>(
        &mut self,
        phase: usize,
        producers: usize,
        consumers: usize,
    ) -> Edge<T> {
        let channels: Vec<BoundedChannel<T>> =
            (0..consumers).map(|_| BoundedChannel::new(self.capacity)).collect();
        for channel in &channels {
            self.inputs[phase].push(Box::new(channel.clone()));
        }
        self.links[phase] = round_robin(producers, consumers);
        Edge {
            channels,
            links: self.links[phase].clone(),
        }
    }

    fn add(&mut self, phase: usize, worker: Worker) {
        let name = format!("{}-{}", worker.kind().name(), self.count(phase));
        self.workers.push(Planned {
            phase,
            name,
            worker,
        });
    }

    fn count(&self, phase: usize) -> usize {
        self.workers.iter().filter(|w| w.phase == phase).count()
    }

    fn inputs_empty(&self, phase: usize) -> bool {
        self.inputs[phase].iter().all(|c| c.is_empty())
    }

    fn abandon(&self) {
        for channel in self.inputs.iter().flatten() {
            channel.abandon();
        }
    }
}

/// The channels between two phases
struct Edge<T: Send> {
    channels: Vec<BoundedChannel<T>>,
    links: Vec<usize>,
}

impl<T: Send> Edge<T> {
    /// Output handle of producer `producer`
    fn fanout(&self, producer: usize) -> Fanout<T> {
        Fanout::assign(&self.channels, &self.links, producer)
    }
}

/// A configured run, ready to start
pub struct Pipeline {
    config: RunConfig,
    distribution: ScalingDistribution,
    extractor: Option<Extractor>,
    sinks: Arc<[Arc<dyn Sink>]>,
    transform: Option<RowTransform>,
    table: Option<Box<dyn TableManager>>,
    progress: ProgressReporter,
    control: PipelineControl,
}

impl Pipeline {
    pub fn builder(config: RunConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Handle for pausing the run and observing its state from other threads
    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    pub fn distribution(&self) -> &ScalingDistribution {
        &self.distribution
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run to completion, blocking the calling thread.
    ///
    /// Returns the run report once every phase drained and the sink was
    /// closed, or the aggregate of every worker failure. A pipeline runs once.
    pub fn run(&mut self) -> Result<RunReport> {
        let extractor = self.extractor.take().ok_or(PipelineError::AlreadyStarted)?;
        let started = Instant::now();
        info!(
            topology = ?self.config.topology,
            workers = ?self.distribution.workers(),
            "starting pipeline run"
        );

        if let Err(e) = self.prepare_table() {
            error!(error = %e, "table preparation failed");
            self.control.set_state(RunState::Failed);
            return Err(e);
        }

        let capacity = self.distribution.channel_capacity(self.config.buffer_budget);
        let mut graph = self.wire(extractor, capacity);
        let phase_count = self.distribution.phase_count();
        let flags: Vec<CompletionFlag> = (0..phase_count).map(|_| CompletionFlag::new()).collect();
        let tracker = Arc::new(WorkerTracker::new(self.distribution.workers()));
        let gate = self.control.gate();

        self.control.set_state(RunState::Running);
        let mut handles: Vec<Vec<JoinHandle<()>>> = (0..phase_count).map(|_| Vec::new()).collect();
        let mut metrics: Vec<(String, usize, WorkerMetrics)> = Vec::with_capacity(graph.workers.len());

        for planned in std::mem::take(&mut graph.workers) {
            let Planned {
                phase,
                name,
                mut worker,
            } = planned;
            let progress = if phase == 0 {
                self.progress.clone()
            } else {
                ProgressReporter::silent()
            };
            let ctx = StageContext::new(name.clone(), Arc::clone(&gate), flags[phase].clone())
                .with_progress(progress, self.config.progress_every)
                .with_idle_sleep(self.config.idle_sleep);
            metrics.push((name.clone(), phase, ctx.metrics().clone()));

            let tracker = Arc::clone(&tracker);
            let spawned = thread::Builder::new().name(name).spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&ctx)))
                    .unwrap_or_else(|payload| {
                        Err(PipelineError::WorkerPanicked(panic_message(payload)))
                    });
                tracker.finish(phase, ctx.name(), result);
            });
            match spawned {
                Ok(handle) => handles[phase].push(handle),
                Err(e) => {
                    self.abort(&graph);
                    return Err(PipelineError::ThreadError(e.to_string()));
                }
            }
        }

        // The calling thread monitors the run: it sleeps on the tracker until
        // the reader is done or any worker of any phase has failed.
        let poll = self.config.poll_interval;
        if tracker.wait_phase(0, poll) == Watch::Faulted {
            return Err(self.fail(&graph, &tracker));
        }
        join_all(&mut handles[0])?;

        for phase in 1..phase_count {
            self.control.set_state(RunState::Draining(phase));
            debug!(phase, links = ?graph.links[phase], "waiting for phase input to drain");
            if tracker.wait_until(poll, || graph.inputs_empty(phase)) == Watch::Faulted {
                return Err(self.fail(&graph, &tracker));
            }

            flags[phase].signal_completion();
            debug!(phase, "phase signalled complete");
            if tracker.wait_phase(phase, poll) == Watch::Faulted {
                return Err(self.fail(&graph, &tracker));
            }
            join_all(&mut handles[phase])?;
        }

        if let Err(e) = self.sinks.iter().try_for_each(|sink| sink.close()) {
            error!(error = %e, "closing a sink failed");
            self.control.set_state(RunState::Failed);
            return Err(e);
        }
        self.control.set_state(RunState::Completed);

        let phases = self.config.topology.phases();
        let workers = metrics
            .iter()
            .map(|(name, phase, m)| m.report(name, phases[*phase]))
            .collect();
        let report = RunReport::new(self.distribution.workers().to_vec(), workers, started.elapsed());
        info!(
            read = report.items_read,
            loaded = report.rows_loaded,
            skipped = report.rows_skipped,
            elapsed = ?report.elapsed,
            "pipeline run completed"
        );
        Ok(report)
    }

    fn prepare_table(&mut self) -> Result<()> {
        let options = self.config.table;
        if !options.any() {
            return Ok(());
        }
        self.control.set_state(RunState::TablePrep);
        let table = self
            .table
            .as_mut()
            .ok_or_else(|| PipelineError::Config("no table manager configured".into()))?;
        if options.drop {
            info!("dropping destination table");
            table.drop_table()?;
        }
        if options.create {
            info!(columns = self.config.columns.len(), "creating destination table");
            table.create_table(&self.config.columns)?;
        }
        if options.truncate {
            info!("truncating destination table");
            table.truncate_table()?;
        }
        Ok(())
    }

    /// Lay out every worker and channel of the run
    fn wire(&self, extractor: Extractor, capacity: usize) -> Graph {
        let w = self.distribution.workers();
        let mut graph = Graph::new(w.len(), capacity);
        let config = &self.config;

        let (records, built) = match extractor {
            Extractor::Lines(source) => {
                let lines = graph.channels::<String>(1, w[0], w[1]);
                let reader = ReaderStage::new(source, lines.fanout(0)).with_header(config.has_header);
                graph.add(0, Worker::LineReader(reader));
                let records = graph.channels::<Record>(2, w[1], w[2]);
                for (j, line) in lines.channels.into_iter().enumerate() {
                    let splitter = SplitterStage::new(
                        line,
                        records.fanout(j),
                        config.delimiter.clone(),
                        config.qualifier,
                        config.null_value.clone(),
                    );
                    graph.add(1, Worker::Splitter(splitter));
                }
                (records, 2)
            }
            Extractor::Records(source) => {
                let records = graph.channels::<Record>(1, w[0], w[1]);
                graph.add(0, Worker::RecordReader(ReaderStage::new(source, records.fanout(0))));
                (records, 1)
            }
        };

        let factory = RowFactory::new(config.columns.iter().cloned());
        let rows = graph.channels::<Row>(built + 1, w[built], w[built + 1]);
        for (j, record) in records.channels.into_iter().enumerate() {
            let builder =
                RowBuilderStage::new(record, rows.fanout(j), factory.clone(), config.skip_errors);
            graph.add(built, Worker::RowBuilder(builder));
        }

        let (ready, load) = match &self.transform {
            Some(transform) => {
                let t = built + 1;
                let transformed = graph.channels::<Row>(t + 1, w[t], w[t + 1]);
                for (j, row) in rows.channels.into_iter().enumerate() {
                    let stage =
                        TransformerStage::new(row, transformed.fanout(j), Arc::clone(transform));
                    graph.add(t, Worker::Transformer(stage));
                }
                (transformed, t + 1)
            }
            None => (rows, built + 1),
        };

        for input in ready.channels {
            let loader = LoaderStage::new(input, Arc::clone(&self.sinks));
            graph.add(load, Worker::Loader(loader));
        }
        graph
    }

    /// Stop every worker without joining it: parked workers are woken by the
    /// gate, blocked producers by their abandoned channel
    fn abort(&self, graph: &Graph) {
        self.control.gate().abort();
        graph.abandon();
        self.control.set_state(RunState::Failed);
    }

    fn fail(&self, graph: &Graph, tracker: &WorkerTracker) -> PipelineError {
        self.abort(graph);
        let err = tracker.aggregate();
        error!(error = %err, "pipeline run aborted");
        err
    }
}

fn join_all(handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
    for handle in handles.drain(..) {
        handle
            .join()
            .map_err(|_| PipelineError::ThreadError("worker thread panicked".into()))?;
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
