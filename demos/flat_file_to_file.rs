//! Copy a delimited file into another one through the pipeline.
//!
//! ```text
//! cargo run --example flat_file_to_file -- input.txt output.txt [delimiter]
//! ```
//!
//! Press Enter while it runs to pause or resume.

use staged_etl::{read_header, FlatFileSink, FlatFileSource, PipelineBuilder, RunConfig};
use std::io::BufRead;
use std::process::ExitCode;
use std::thread;
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn run(input: &str, output: &str, delimiter: &str) -> staged_etl::Result<()> {
    let columns = read_header(input, delimiter, Some('"'), true)?;
    let config = RunConfig::new()
        .with_delimiter(delimiter)
        .with_columns(columns.clone())
        .with_header(true)
        .with_skip_errors(true);

    let mut pipeline = PipelineBuilder::new(config)
        .line_source(FlatFileSource::open(input)?)
        .sink(FlatFileSink::create(output, delimiter, Some(columns.as_slice()))?)
        .on_progress(|n| tracing::info!(lines = n, "progress"))
        .build()?;

    let control = pipeline.control();
    thread::spawn(move || {
        for _ in std::io::stdin().lock().lines() {
            let paused = control.toggle_pause();
            tracing::info!(paused, state = %control.state(), "toggled pause");
        }
    });

    let report = pipeline.run()?;
    print!("{}", report.summary());
    Ok(())
}

fn main() -> ExitCode {
    init_logging("info");

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <input> <output> [delimiter]", args[0]);
        return ExitCode::FAILURE;
    }
    let delimiter = args.get(3).map(String::as_str).unwrap_or("|");

    match run(&args[1], &args[2], delimiter) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}
