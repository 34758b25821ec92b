//! Collaborators at the edges of the pipeline: sources, sinks and table
//! management, plus the file and in-memory implementations shipped with the
//! crate.

use crate::error::{PipelineError, Result};
use crate::row::Row;
use crate::split::split_record;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome of one pull from a source
#[derive(Debug, Clone, PartialEq)]
pub enum Produced<T> {
    /// The next item
    Item(T),
    /// Nothing available right now, more may follow
    Pending,
    /// The source has no more items
    Exhausted,
}

/// Pull-style producer owned exclusively by the reading worker
pub trait Source<T>: Send {
    fn try_produce(&mut self) -> Result<Produced<T>>;
}

impl<T, S: Source<T> + ?Sized> Source<T> for Box<S> {
    fn try_produce(&mut self) -> Result<Produced<T>> {
        (**self).try_produce()
    }
}

/// Push-style consumer shared by every loading worker
pub trait Sink: Send + Sync {
    fn consume(&self, row: Row) -> Result<()>;

    /// Called exactly once, after every loader has finished
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn consume(&self, row: Row) -> Result<()> {
        (**self).consume(row)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Destination table statements issued before a run starts
pub trait TableManager: Send {
    fn drop_table(&mut self) -> Result<()>;
    fn create_table(&mut self, columns: &[String]) -> Result<()>;
    fn truncate_table(&mut self) -> Result<()>;
}

/// Line source over a delimited text file.
///
/// Yields every line, the header included; a run configured with a header
/// row has its reader discard the first line.
#[derive(Debug)]
pub struct FlatFileSource {
    reader: BufReader<File>,
    buf: String,
}

impl FlatFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            buf: String::new(),
        })
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        let line = self.buf.trim_end_matches(['\n', '\r']);
        Ok(Some(line.to_string()))
    }
}

impl Source<String> for FlatFileSource {
    fn try_produce(&mut self) -> Result<Produced<String>> {
        Ok(match self.read_line()? {
            Some(line) => Produced::Item(line),
            None => Produced::Exhausted,
        })
    }
}

/// Source draining an iterator
#[derive(Debug)]
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new<C>(items: C) -> Self
    where
        C: IntoIterator<IntoIter = I>,
    {
        Self {
            iter: items.into_iter(),
        }
    }
}

impl<I, T> Source<T> for IterSource<I>
where
    I: Iterator<Item = T> + Send,
{
    fn try_produce(&mut self) -> Result<Produced<T>> {
        Ok(match self.iter.next() {
            Some(item) => Produced::Item(item),
            None => Produced::Exhausted,
        })
    }
}

/// Sink collecting rows in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<Row>>>,
    closes: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the rows consumed so far
    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// How many times [`Sink::close`] was called
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Sink for MemorySink {
    fn consume(&self, row: Row) -> Result<()> {
        self.rows.lock().push(row);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink writing delimited lines to a file.
///
/// Loaders write concurrently, so line order follows arrival order and not
/// source order.
#[derive(Debug)]
pub struct FlatFileSink {
    writer: Mutex<Option<BufWriter<File>>>,
    delimiter: String,
}

impl FlatFileSink {
    /// Create (or truncate) `path`, writing `header` first when given
    pub fn create(
        path: impl AsRef<Path>,
        delimiter: impl Into<String>,
        header: Option<&[String]>,
    ) -> Result<Self> {
        let delimiter = delimiter.into();
        let mut writer = BufWriter::new(File::create(path)?);
        if let Some(columns) = header {
            writeln!(writer, "{}", columns.join(&delimiter))?;
        }
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            delimiter,
        })
    }

    fn format_row(&self, row: &Row) -> String {
        let mut line = String::new();
        for (i, value) in row.values().enumerate() {
            if i > 0 {
                line.push_str(&self.delimiter);
            }
            line.push_str(&value.to_string());
        }
        line
    }
}

impl Sink for FlatFileSink {
    fn consume(&self, row: Row) -> Result<()> {
        let line = self.format_row(&row);
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Sink("flat file sink is closed".into()))?;
        writeln!(writer, "{}", line)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Read the column names of a delimited file.
///
/// With a header, names come from the first line and repeated names get a
/// numeric suffix (`name_2`, `name_3`, ...). Without one, the first line only
/// fixes the column count and names are generated as `Column 01`,
/// `Column 02`, ...
pub fn read_header(
    path: impl AsRef<Path>,
    delimiter: &str,
    qualifier: Option<char>,
    has_header: bool,
) -> Result<Vec<String>> {
    let mut source = FlatFileSource::open(path)?;
    let line = match source.read_line()? {
        Some(line) => line,
        None => return Err(PipelineError::Source("file is empty, no header to read".into())),
    };
    let fields = split_record(&line, delimiter, qualifier);

    if !has_header {
        return Ok((1..=fields.len())
            .map(|i| format!("Column {:02}", i))
            .collect());
    }

    let mut names: Vec<String> = Vec::with_capacity(fields.len());
    for field in fields {
        let base = field.trim().to_string();
        let mut name = base.clone();
        let mut n = 2;
        while names.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        names.push(name);
    }
    Ok(names)
}
