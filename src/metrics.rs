use crate::config::PhaseKind;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of per-item latencies
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<u64>>>,
    window: usize,
}

impl LatencyWindow {
    /// Create a window keeping the last `window` samples
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window))),
            window,
        }
    }

    /// Record one sample in nanoseconds
    pub fn record(&self, nanos: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(nanos);
    }

    /// The `p` quantile (0.0..=1.0) of the window, in microseconds
    pub fn percentile_us(&self, p: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        sorted[idx] as f64 / 1000.0
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Counters kept by one worker while it runs
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    processed: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    blocks: Arc<AtomicU64>,
    latency: LatencyWindow,
    started: Instant,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            blocks: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(1000),
            started: Instant::now(),
        }
    }

    /// An item was handed downstream
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// An item was dropped on purpose
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// The output channel was full when the worker tried to push
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, nanos: u64) {
        self.latency.record(nanos);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Snapshot the counters under a worker name
    pub fn report(&self, worker: &str, phase: PhaseKind) -> WorkerReport {
        WorkerReport {
            worker: worker.to_string(),
            phase,
            processed: self.processed(),
            skipped: self.skipped(),
            blocks: self.blocks(),
            latency_p50_us: self.latency.percentile_us(0.50),
            latency_p99_us: self.latency.percentile_us(0.99),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Final counters of one worker
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker: String,
    pub phase: PhaseKind,
    pub processed: u64,
    pub skipped: u64,
    pub blocks: u64,
    pub latency_p50_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl WorkerReport {
    pub fn format(&self) -> String {
        format!(
            "{}: processed {}, skipped {}, blocks {}, latency p50 {:.2}µs p99 {:.2}µs",
            self.worker,
            self.processed,
            self.skipped,
            self.blocks,
            self.latency_p50_us,
            self.latency_p99_us
        )
    }
}

/// Outcome of a run that drained cleanly
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Workers per phase, in pipeline order
    pub distribution: Vec<usize>,
    /// Items pulled from the source
    pub items_read: u64,
    /// Rows handed to the sink
    pub rows_loaded: u64,
    /// Rows dropped by the skip-errors policy or the transform
    pub rows_skipped: u64,
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub(crate) fn new(distribution: Vec<usize>, workers: Vec<WorkerReport>, elapsed: Duration) -> Self {
        let sum = |kind: PhaseKind, f: fn(&WorkerReport) -> u64| -> u64 {
            workers.iter().filter(|w| w.phase == kind).map(f).sum()
        };
        let items_read = sum(PhaseKind::Reader, |w| w.processed);
        let rows_loaded = sum(PhaseKind::Loader, |w| w.processed);
        let rows_skipped = workers.iter().map(|w| w.skipped).sum();
        Self {
            distribution,
            items_read,
            rows_loaded,
            rows_skipped,
            workers,
            elapsed,
        }
    }

    /// Report of a worker by name, e.g. `splitter-0`
    pub fn worker(&self, name: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.worker == name)
    }

    /// Reports of every worker of one phase
    pub fn phase(&self, kind: PhaseKind) -> impl Iterator<Item = &WorkerReport> {
        self.workers.iter().filter(move |w| w.phase == kind)
    }

    /// Rows per second over the whole run
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.rows_loaded as f64 / secs
        }
    }

    /// Human-readable summary, one line per worker
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run summary: read {}, loaded {}, skipped {} in {:.2}s ({:.0} rows/s), workers {:?}\n",
            self.items_read,
            self.rows_loaded,
            self.rows_skipped,
            self.elapsed.as_secs_f64(),
            self.throughput(),
            self.distribution
        );
        for worker in &self.workers {
            let _ = writeln!(out, "  {}", worker.format());
        }
        out
    }
}
