use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Callback = Arc<dyn Fn(u64) + Send + Sync>;

/// Republishes the reading phase's cumulative item count to the caller.
///
/// Counts only ever move forward: a report lower than or equal to the last
/// published one is swallowed, so concurrent or repeated reports coalesce
/// into a single monotonically increasing event stream. A reporter built with
/// [`ProgressReporter::silent`] discards everything, which is what the
/// non-reading phases use.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Option<Callback>,
    last: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
}

impl ProgressReporter {
    /// Create a reporter forwarding to `callback`
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self::from_callback(Some(Arc::new(callback)))
    }

    /// Create a reporter that drops every report
    pub fn silent() -> Self {
        Self::from_callback(None)
    }

    pub(crate) fn from_callback(callback: Option<Callback>) -> Self {
        Self {
            callback,
            last: Arc::new(AtomicU64::new(0)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report a cumulative count
    pub fn report(&self, count: u64) {
        let previous = self.last.fetch_max(count, Ordering::AcqRel);
        let first = self.published.load(Ordering::Acquire) == 0;
        if count < previous || (count == previous && !first) {
            return;
        }
        self.published.fetch_add(1, Ordering::AcqRel);
        if let Some(callback) = &self.callback {
            callback(count);
        }
    }

    /// Highest count reported so far
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Number of events forwarded to the callback
    pub fn events(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("has_callback", &self.callback.is_some())
            .field("last", &self.last())
            .finish()
    }
}
