use parking_lot::Mutex;
use staged_etl::{
    FlatFileSink, FlatFileSource, IterSource, MemorySink, PhaseKind, PipelineBuilder,
    PipelineError, Produced, Result as PipelineResult, Row, RunConfig, RunState,
    ScalingDistribution, Sink, Source, TableManager, TableOptions, Topology, Value,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

fn fast_config<I, S>(columns: I) -> RunConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    RunConfig::new()
        .with_columns(columns)
        .with_header(false)
        .with_poll_interval(Duration::from_millis(5))
        .with_idle_sleep(Duration::from_millis(1))
}

fn numbered_lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{i}|name-{i}")).collect()
}

fn sorted_ids(rows: &[Row]) -> Vec<usize> {
    let mut ids: Vec<usize> = rows
        .iter()
        .map(|row| {
            row.get("id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .expect("id column holds a number")
        })
        .collect();
    ids.sort_unstable();
    ids
}

/// Yields `total` lines, sleeping a little before each one
struct SlowSource {
    next: usize,
    total: usize,
    delay: Duration,
}

impl Source<String> for SlowSource {
    fn try_produce(&mut self) -> PipelineResult<Produced<String>> {
        if self.next == self.total {
            return Ok(Produced::Exhausted);
        }
        thread::sleep(self.delay);
        self.next += 1;
        Ok(Produced::Item(format!("{}|slow", self.next - 1)))
    }
}

/// Fails on one specific call, counting every call it receives
struct FlakySink {
    calls: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    fail_on: usize,
}

impl Sink for FlakySink {
    fn consume(&self, _row: Row) -> PipelineResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(PipelineError::Sink("connection lost".into()));
        }
        Ok(())
    }

    fn close(&self) -> PipelineResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingTable {
    calls: Arc<Mutex<Vec<String>>>,
    fail_truncate: bool,
}

impl TableManager for RecordingTable {
    fn drop_table(&mut self) -> PipelineResult<()> {
        self.calls.lock().push("drop".into());
        Ok(())
    }

    fn create_table(&mut self, columns: &[String]) -> PipelineResult<()> {
        self.calls.lock().push(format!("create {}", columns.join(",")));
        Ok(())
    }

    fn truncate_table(&mut self) -> PipelineResult<()> {
        self.calls.lock().push("truncate".into());
        if self.fail_truncate {
            return Err(PipelineError::Table("permission denied".into()));
        }
        Ok(())
    }
}

#[test]
fn test_flat_file_end_to_end() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "id|first|last|city|score").unwrap();
    writeln!(file, "1|Ada|Lovelace|London|9.5").unwrap();
    writeln!(file, "2|Alan|Turing|Wilmslow|").unwrap();
    writeln!(file, "3|Grace|Hopper|New York|8").unwrap();
    file.flush().unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = MemorySink::new();
    let config = fast_config(["id", "first", "last", "city", "score"])
        .with_header(true)
        .with_cpu_budget(4);

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(FlatFileSource::open(file.path()).expect("open source"))
        .sink(sink.clone())
        .on_progress({
            let progress = Arc::clone(&progress);
            move |n| progress.lock().push(n)
        })
        .build()
        .expect("Pipeline build failed");
    assert_eq!(pipeline.distribution().workers(), &[1, 1, 1, 2]);

    let report = pipeline.run().expect("Run failed");

    assert_eq!(report.items_read, 3);
    assert_eq!(report.rows_loaded, 3);
    assert_eq!(progress.lock().last(), Some(&3));
    assert_eq!(sink.close_count(), 1);

    let mut rows = sink.rows();
    rows.sort_by_key(|row| row.get("id").map(|v| v.to_string()));
    let turing = &rows[1];
    assert_eq!(turing.get("first"), Some(&Value::from("Alan")));
    assert_eq!(turing.get("city"), Some(&Value::from("Wilmslow")));
    assert_eq!(turing.get("score"), Some(&Value::from("")));
    assert_eq!(rows[2].get("city"), Some(&Value::from("New York")));
    assert_eq!(rows[0].columns(), ["id", "first", "last", "city", "score"]);
}

#[test]
fn test_flat_file_to_flat_file() {
    let mut input = NamedTempFile::new().expect("temp file");
    writeln!(input, "id;name").unwrap();
    for i in 0..50 {
        writeln!(input, "{i};\"n;{i}\"").unwrap();
    }
    input.flush().unwrap();
    let output = NamedTempFile::new().expect("temp file");

    let columns = staged_etl::read_header(input.path(), ";", Some('"'), true).expect("header");
    assert_eq!(columns, vec!["id", "name"]);
    let config = fast_config(columns.clone())
        .with_delimiter(";")
        .with_header(true)
        .with_cpu_budget(6);
    let sink = FlatFileSink::create(output.path(), "|", Some(columns.as_slice())).expect("create sink");

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(FlatFileSource::open(input.path()).expect("open source"))
        .sink(sink)
        .build()
        .expect("Pipeline build failed");
    pipeline.run().expect("Run failed");

    let written = std::fs::read_to_string(output.path()).expect("read output");
    let mut lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.remove(0), "id|name");
    assert_eq!(lines.len(), 50);
    assert!(lines.contains(&"7|n;7"));
}

#[test]
fn test_header_flag_decides_whether_first_line_is_data() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "id|name").unwrap();
    writeln!(file, "1|a").unwrap();
    file.flush().unwrap();

    for (has_header, expected) in [(true, vec!["1"]), (false, vec!["1", "id"])] {
        let sink = MemorySink::new();
        let config = fast_config(["id", "name"])
            .with_header(has_header)
            .with_cpu_budget(4);
        let mut pipeline = PipelineBuilder::new(config)
            .line_source(FlatFileSource::open(file.path()).expect("open source"))
            .sink(sink.clone())
            .build()
            .expect("Pipeline build failed");
        pipeline.run().expect("Run failed");

        let mut ids: Vec<String> = sink
            .rows()
            .iter()
            .filter_map(|row| row.get("id").map(|v| v.to_string()))
            .collect();
        ids.sort();
        assert_eq!(ids, expected, "has_header = {has_header}");
    }
}

#[test]
fn test_direct_topology_with_record_source() {
    let records: Vec<Vec<Value>> = (0..200)
        .map(|i| vec![Value::from(i.to_string()), Value::from(i as i64)])
        .collect();
    let sink = MemorySink::new();
    let config = fast_config(["id", "n"])
        .with_topology(Topology::Direct)
        .with_cpu_budget(4);

    let mut pipeline = PipelineBuilder::new(config)
        .record_source(IterSource::new(records))
        .sink(sink.clone())
        .build()
        .expect("Pipeline build failed");
    assert_eq!(pipeline.distribution().phase_count(), 3);
    let report = pipeline.run().expect("Run failed");

    assert_eq!(report.rows_loaded, 200);
    assert_eq!(sorted_ids(&sink.rows()), (0..200).collect::<Vec<_>>());
}

#[test]
fn test_pause_stops_delivery_until_resumed() {
    let sink = MemorySink::new();
    let config = fast_config(["id", "tag"]).with_cpu_budget(4);
    let mut pipeline = PipelineBuilder::new(config)
        .line_source(SlowSource {
            next: 0,
            total: 200,
            delay: Duration::from_millis(2),
        })
        .sink(sink.clone())
        .build()
        .expect("Pipeline build failed");
    let control = pipeline.control();
    let run = thread::spawn(move || pipeline.run());

    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.len() < 10 {
        assert!(Instant::now() < deadline, "no rows delivered");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(control.toggle_pause());
    thread::sleep(Duration::from_millis(50));

    let during_pause = sink.len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.len(), during_pause);
    assert!(during_pause < 200);
    assert!(control.is_paused());

    assert!(!control.toggle_pause());
    let report = run
        .join()
        .expect("run thread panicked")
        .expect("Run failed");
    assert_eq!(report.rows_loaded, 200);
    assert_eq!(sink.len(), 200);
    assert_eq!(control.state(), RunState::Completed);
}

#[test]
fn test_sink_fault_aborts_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let sink = FlakySink {
        calls: Arc::clone(&calls),
        closes: Arc::clone(&closes),
        fail_on: 2,
    };
    let distribution = ScalingDistribution::from_workers(vec![1, 1, 1, 1]).expect("distribution");

    let mut pipeline = PipelineBuilder::new(fast_config(["id", "name"]))
        .line_source(IterSource::new(numbered_lines(1000)))
        .sink(sink)
        .distribution(distribution)
        .build()
        .expect("Pipeline build failed");
    let control = pipeline.control();

    let err = pipeline.run().expect_err("run must fail");
    assert!(matches!(err, PipelineError::RunFailed { .. }));
    assert!(err.to_string().contains("loader-0"));
    assert!(err.to_string().contains("connection lost"));
    assert_eq!(err.failures().len(), 1);
    assert_eq!(control.state(), RunState::Failed);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(closes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_source_fault_aborts_run() {
    struct Broken(usize);
    impl Source<String> for Broken {
        fn try_produce(&mut self) -> PipelineResult<Produced<String>> {
            self.0 += 1;
            if self.0 > 5 {
                return Err(PipelineError::Source("file vanished".into()));
            }
            Ok(Produced::Item(format!("{}|x", self.0)))
        }
    }

    let progress = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = PipelineBuilder::new(fast_config(["id", "name"]).with_cpu_budget(4))
        .line_source(Broken(0))
        .sink(MemorySink::new())
        .on_progress({
            let progress = Arc::clone(&progress);
            move |n| progress.lock().push(n)
        })
        .build()
        .expect("Pipeline build failed");

    let err = pipeline.run().expect_err("run must fail");
    assert_eq!(err.failures()[0].worker, "reader-0");
    assert_eq!(*progress.lock(), vec![5]);
}

#[test]
fn test_single_reader_feeds_every_splitter() {
    let sink = MemorySink::new();
    let distribution = ScalingDistribution::from_workers(vec![1, 3, 3, 3]).expect("distribution");

    let mut pipeline = PipelineBuilder::new(fast_config(["id", "name"]))
        .line_source(IterSource::new(numbered_lines(30)))
        .sink(sink.clone())
        .distribution(distribution)
        .build()
        .expect("Pipeline build failed");
    let report = pipeline.run().expect("Run failed");

    for kind in [PhaseKind::Splitter, PhaseKind::RowBuilder, PhaseKind::Loader] {
        let counts: Vec<u64> = report.phase(kind).map(|w| w.processed).collect();
        assert_eq!(counts, vec![10, 10, 10], "{kind:?}");
    }
    assert_eq!(sorted_ids(&sink.rows()), (0..30).collect::<Vec<_>>());
}

#[test]
fn test_round_robin_fan_out_feeds_every_transformer() {
    let sink = MemorySink::new();
    let distribution =
        ScalingDistribution::from_workers(vec![1, 1, 1, 3, 5]).expect("distribution");
    let config = fast_config(["id", "name"]).with_topology(Topology::SplitTransform);

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(IterSource::new(numbered_lines(30)))
        .sink(sink.clone())
        .transform(|row| Ok(Some(row)))
        .distribution(distribution)
        .build()
        .expect("Pipeline build failed");
    let report = pipeline.run().expect("Run failed");

    let transformers: Vec<u64> = report.phase(PhaseKind::Transformer).map(|w| w.processed).collect();
    assert_eq!(transformers, vec![10, 10, 10]);
    // transformers 0 and 1 feed two loaders each, transformer 2 feeds one
    let loaders: Vec<u64> = report.phase(PhaseKind::Loader).map(|w| w.processed).collect();
    assert_eq!(loaders, vec![5, 5, 10, 5, 5]);
    assert_eq!(sorted_ids(&sink.rows()), (0..30).collect::<Vec<_>>());
}

#[test]
fn test_every_sink_receives_every_row() {
    let (primary, audit) = (MemorySink::new(), MemorySink::new());
    let mut pipeline = PipelineBuilder::new(fast_config(["id", "name"]).with_cpu_budget(6))
        .line_source(IterSource::new(numbered_lines(100)))
        .sink(primary.clone())
        .sink(audit.clone())
        .build()
        .expect("Pipeline build failed");
    let report = pipeline.run().expect("Run failed");

    assert_eq!(report.rows_loaded, 100);
    assert_eq!(sorted_ids(&primary.rows()), (0..100).collect::<Vec<_>>());
    assert_eq!(sorted_ids(&audit.rows()), (0..100).collect::<Vec<_>>());
    assert_eq!(primary.close_count(), 1);
    assert_eq!(audit.close_count(), 1);
}

#[test]
fn test_wide_fan_out_drains_everything() {
    let sink = MemorySink::new();
    let distribution = ScalingDistribution::from_workers(vec![1, 3, 4, 6]).expect("distribution");
    let config = fast_config(["id", "name"]).with_buffer_budget(64);

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(IterSource::new(numbered_lines(5000)))
        .sink(sink.clone())
        .distribution(distribution)
        .build()
        .expect("Pipeline build failed");
    let report = pipeline.run().expect("Run failed");

    assert_eq!(report.items_read, 5000);
    assert_eq!(report.rows_loaded, 5000);
    let split: u64 = report.phase(PhaseKind::Splitter).map(|w| w.processed).sum();
    assert_eq!(split, 5000);
    assert_eq!(sorted_ids(&sink.rows()), (0..5000).collect::<Vec<_>>());
}

#[test]
fn test_skip_errors_drops_malformed_records() {
    let mut lines = numbered_lines(20);
    lines.insert(5, "too|many|fields".into());
    lines.insert(12, "lonely".into());
    let sink = MemorySink::new();
    let config = fast_config(["id", "name"])
        .with_cpu_budget(4)
        .with_skip_errors(true);

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(IterSource::new(lines))
        .sink(sink.clone())
        .build()
        .expect("Pipeline build failed");
    let report = pipeline.run().expect("Run failed");

    assert_eq!(report.items_read, 22);
    assert_eq!(report.rows_loaded, 20);
    assert_eq!(report.rows_skipped, 2);
    assert_eq!(sink.len(), 20);
}

#[test]
fn test_malformed_record_is_fatal_by_default() {
    let mut lines = numbered_lines(20);
    lines.insert(3, "a|b|c".into());

    let mut pipeline = PipelineBuilder::new(fast_config(["id", "name"]).with_cpu_budget(4))
        .line_source(IterSource::new(lines))
        .sink(MemorySink::new())
        .build()
        .expect("Pipeline build failed");

    let err = pipeline.run().expect_err("run must fail");
    let failure = &err.failures()[0];
    assert!(failure.worker.starts_with("row_builder-"));
    assert!(matches!(
        failure.error,
        PipelineError::FieldCountMismatch {
            expected: 2,
            actual: 3
        }
    ));
}

#[test]
fn test_transform_phase_rewrites_and_filters() {
    let sink = MemorySink::new();
    let config = fast_config(["id", "name"])
        .with_topology(Topology::SplitTransform)
        .with_cpu_budget(5)
        .with_null_value("NULL");
    let lines = vec!["1|ada".to_string(), "2|NULL".to_string(), "3|grace".to_string()];

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(IterSource::new(lines))
        .sink(sink.clone())
        .transform(|mut row: Row| {
            let upper = match row.get("name") {
                Some(Value::Text(name)) => name.to_uppercase(),
                _ => return Ok(None),
            };
            row.set("name", Value::from(upper))?;
            Ok(Some(row))
        })
        .build()
        .expect("Pipeline build failed");
    assert_eq!(pipeline.distribution().workers(), &[1, 1, 1, 1, 2]);
    let report = pipeline.run().expect("Run failed");

    assert_eq!(report.rows_loaded, 2);
    assert_eq!(report.rows_skipped, 1);
    let mut names: Vec<String> = sink
        .rows()
        .iter()
        .filter_map(|row| row.get("name").map(|v| v.to_string()))
        .collect();
    names.sort();
    assert_eq!(names, vec!["ADA", "GRACE"]);
}

#[test]
fn test_table_prep_runs_in_order_before_loading() {
    let table = RecordingTable::default();
    let config = fast_config(["id", "name"])
        .with_cpu_budget(4)
        .with_table_options(TableOptions {
            drop: true,
            create: true,
            truncate: true,
        });

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(IterSource::new(numbered_lines(3)))
        .sink(MemorySink::new())
        .table_manager(table.clone())
        .build()
        .expect("Pipeline build failed");
    pipeline.run().expect("Run failed");

    assert_eq!(
        *table.calls.lock(),
        vec!["drop".to_string(), "create id,name".to_string(), "truncate".to_string()]
    );
}

#[test]
fn test_table_prep_failure_starts_no_worker() {
    let table = RecordingTable {
        fail_truncate: true,
        ..RecordingTable::default()
    };
    let sink = MemorySink::new();
    let config = fast_config(["id", "name"])
        .with_cpu_budget(4)
        .with_table_options(TableOptions {
            truncate: true,
            ..TableOptions::default()
        });

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(IterSource::new(numbered_lines(3)))
        .sink(sink.clone())
        .table_manager(table)
        .build()
        .expect("Pipeline build failed");
    let control = pipeline.control();

    assert!(matches!(pipeline.run(), Err(PipelineError::Table(_))));
    assert_eq!(control.state(), RunState::Failed);
    assert!(sink.is_empty());
    assert_eq!(sink.close_count(), 0);
}

#[test]
fn test_configuration_errors_fail_fast() {
    let err = PipelineBuilder::new(fast_config(["id"]).with_cpu_budget(2))
        .line_source(IterSource::new(numbered_lines(1)))
        .sink(MemorySink::new())
        .build()
        .err()
        .expect("build must fail");
    assert!(err.is_configuration());

    let err = PipelineBuilder::new(fast_config(Vec::<String>::new()))
        .line_source(IterSource::new(numbered_lines(1)))
        .sink(MemorySink::new())
        .build()
        .err()
        .expect("build must fail");
    assert!(matches!(err, PipelineError::Config(_)));
}
