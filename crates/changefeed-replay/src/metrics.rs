//! Writer metrics.
//!
//! [`WriterMetrics`] holds lock-free counters owned by one partition writer.
//! Readers take a [`MetricsSnapshot`]; the pool sums the snapshots of its
//! writers on read instead of sharing one counter between tasks.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Atomic counters of one partition writer.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    /// Rows written by successful executes.
    pub rows_written: AtomicU64,

    /// Batches executed successfully (discarded batches included).
    pub batches_flushed: AtomicU64,

    /// Failed execute attempts that were retried.
    pub retries: AtomicU64,

    /// Events dropped because no query is configured for them.
    pub events_discarded: AtomicU64,

    /// Messages dropped because they are not change envelopes.
    pub envelopes_dropped: AtomicU64,

    /// Messages acknowledged to the source.
    pub commits: AtomicU64,

    /// Messages accepted into the writer queue.
    pub messages_enqueued: AtomicU64,

    /// Messages dropped at enqueue because the writer stopped.
    pub messages_dropped: AtomicU64,
}

impl WriterMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful batch execute.
    pub fn record_flush(&self, rows: u64, discarded: bool) {
        if discarded {
            self.events_discarded.fetch_add(rows, Ordering::Relaxed);
        } else {
            self.rows_written.fetch_add(rows, Ordering::Relaxed);
        }
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed execute that will be retried.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a message that was not a change envelope.
    pub fn record_dropped_envelope(&self) {
        self.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records acknowledged messages.
    pub fn record_commits(&self, messages: u64) {
        self.commits.fetch_add(messages, Ordering::Relaxed);
    }

    /// Records a message accepted by the queue.
    pub fn record_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a message dropped at enqueue.
    pub fn record_enqueue_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WriterMetrics`], summable across writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Rows written.
    pub rows_written: u64,
    /// Batches executed.
    pub batches_flushed: u64,
    /// Retried execute attempts.
    pub retries: u64,
    /// Events dropped for lack of a query.
    pub events_discarded: u64,
    /// Messages that were not change envelopes.
    pub envelopes_dropped: u64,
    /// Messages acknowledged.
    pub commits: u64,
    /// Messages accepted into queues.
    pub messages_enqueued: u64,
    /// Messages dropped at enqueue.
    pub messages_dropped: u64,
}

impl AddAssign for MetricsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.rows_written += rhs.rows_written;
        self.batches_flushed += rhs.batches_flushed;
        self.retries += rhs.retries;
        self.events_discarded += rhs.events_discarded;
        self.envelopes_dropped += rhs.envelopes_dropped;
        self.commits += rhs.commits;
        self.messages_enqueued += rhs.messages_enqueued;
        self.messages_dropped += rhs.messages_dropped;
    }
}

impl std::iter::Sum for MetricsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

/// Rows-per-second reporting window of one writer.
#[derive(Debug)]
pub struct ThroughputWindow {
    interval: Duration,
    started: Instant,
    rows_at_start: u64,
}

impl ThroughputWindow {
    /// Starts a window at the current time.
    #[must_use]
    pub fn new(interval: Duration, rows_total: u64) -> Self {
        Self {
            interval,
            started: Instant::now(),
            rows_at_start: rows_total,
        }
    }

    /// Closes the window if it is older than the interval.
    ///
    /// Returns rows written in the window and the rate, then starts a new
    /// window.
    #[allow(clippy::cast_precision_loss)]
    pub fn tick(&mut self, rows_total: u64) -> Option<(u64, f64)> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.started);
        if elapsed <= self.interval {
            return None;
        }
        let rows = rows_total.saturating_sub(self.rows_at_start);
        let rps = rows as f64 / elapsed.as_secs_f64();
        self.started = now;
        self.rows_at_start = rows_total;
        Some((rows, rps))
    }
}
