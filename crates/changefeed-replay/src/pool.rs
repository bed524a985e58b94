//! Writer pool of one change stream.
//!
//! Messages are routed by `partition_id % writers`, so every source
//! partition is handled by exactly one writer and keeps its order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::binding::StreamBinding;
use crate::config::ChangeStreamConfig;
use crate::database::{Database, Status};
use crate::metrics::MetricsSnapshot;
use crate::retry::BackoffPolicy;
use crate::source::SourceMessage;
use crate::writer::{PartitionWriter, WriterOptions, DEFAULT_ENQUEUE_TIMEOUT};

/// Fixed set of partition writers.
#[derive(Debug)]
pub struct WriterPool {
    writers: Vec<PartitionWriter>,
    cancel: CancellationToken,
}

impl WriterPool {
    /// Creates stopped writers for a bound stream.
    ///
    /// Writers are named `writer-<consumer>[n]`, counting from 1.
    #[must_use]
    pub fn new(
        binding: &StreamBinding,
        db: &Arc<dyn Database>,
        config: &ChangeStreamConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let options = WriterOptions {
            queue_capacity: config.queue_capacity(),
            error_threshold: config.error_threshold,
            backoff: BackoffPolicy::default(),
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        };
        Self::with_options(binding, db, &config.consumer, config.threads, &options, cancel)
    }

    /// Creates stopped writers with explicit options.
    #[must_use]
    pub fn with_options(
        binding: &StreamBinding,
        db: &Arc<dyn Database>,
        consumer: &str,
        threads: usize,
        options: &WriterOptions,
        cancel: &CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let writers = (1..=threads.max(1))
            .map(|idx| {
                PartitionWriter::new(
                    format!("writer-{consumer}[{idx}]"),
                    binding,
                    Arc::clone(db),
                    options,
                    cancel.child_token(),
                )
            })
            .collect();
        Self { writers, cancel }
    }

    /// Number of writers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    /// Returns `true` if the pool has no writers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Writers in routing order.
    #[must_use]
    pub fn writers(&self) -> &[PartitionWriter] {
        &self.writers
    }

    /// Index of the writer serving a partition.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // the modulo is below the writer count
    pub fn route(&self, partition_id: u64) -> usize {
        (partition_id % self.writers.len() as u64) as usize
    }

    /// Starts every writer.
    pub fn start(&self) {
        for writer in &self.writers {
            writer.start();
        }
    }

    /// Routes a message to its partition's writer.
    ///
    /// Returns `false` if the message was dropped.
    pub async fn dispatch(&self, msg: SourceMessage) -> bool {
        let idx = self.route(msg.partition_id);
        self.writers[idx].enqueue(msg).await
    }

    /// Stops every writer and waits for all of them.
    ///
    /// A write in flight completes before its writer exits.
    pub async fn close(&self) {
        self.cancel.cancel();
        for writer in &self.writers {
            writer.stop();
        }
        for writer in &self.writers {
            writer.join().await;
        }
    }

    /// First failing writer status, or success.
    #[must_use]
    pub fn status(&self) -> Status {
        self.writers
            .iter()
            .map(PartitionWriter::status)
            .find(|s| !s.is_success())
            .unwrap_or(Status::SUCCESS)
    }

    /// Latest read time over all writers.
    #[must_use]
    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        self.writers
            .iter()
            .filter_map(|w| w.status_cell().last_read())
            .max()
    }

    /// Latest write time over all writers.
    #[must_use]
    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        self.writers
            .iter()
            .filter_map(|w| w.status_cell().last_write())
            .max()
    }

    /// Sum of all writer counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.writers.iter().map(PartitionWriter::metrics).sum()
    }
}
