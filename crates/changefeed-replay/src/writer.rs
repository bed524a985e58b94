//! Partition writer.
//!
//! Each [`PartitionWriter`] owns a bounded queue and one tokio task. The task
//! waits for a message, drains whatever else is queued into the active
//! [`Batch`], and flushes when the batch is full or the queue runs dry.
//! A flush retries until the database accepts it; only then are the offsets
//! of the covering messages committed.
//!
//! Update and erase events may go to different queries. When the routing
//! changes mid-drain the pending batch is flushed first, so every commit
//! group covers exactly one successful write and offsets are acknowledged
//! in arrival order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batch::Batch;
use crate::binding::{EventKind, StreamBinding};
use crate::database::{Database, Status, StatusCode};
use crate::envelope::{self, Envelope};
use crate::error::DecodeError;
use crate::metrics::{MetricsSnapshot, ThroughputWindow, WriterMetrics};
use crate::retry::{retry_until_success, BackoffPolicy};
use crate::source::{DeferredCommitter, SourceMessage};
use crate::status::StatusCell;

/// How long an enqueue waits for queue space before re-checking the writer.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the rows-per-second debug log.
const THROUGHPUT_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning of one partition writer.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Queue capacity in messages.
    pub queue_capacity: usize,
    /// Failures in a row logged at trace level before switching to warn.
    pub error_threshold: u32,
    /// Backoff between failed writes.
    pub backoff: BackoffPolicy,
    /// Enqueue wait before re-checking that the writer is alive.
    pub enqueue_timeout: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 2000,
            error_threshold: 3,
            backoff: BackoffPolicy::default(),
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// State shared between a writer task and its observers.
#[derive(Debug)]
struct WriterShared {
    name: Arc<str>,
    status: StatusCell,
    metrics: WriterMetrics,
}

/// One worker of a change stream.
pub struct PartitionWriter {
    shared: Arc<WriterShared>,
    tx: mpsc::Sender<SourceMessage>,
    cancel: CancellationToken,
    enqueue_timeout: Duration,
    worker: Mutex<Option<WriterLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionWriter {
    /// Creates a stopped writer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        binding: &StreamBinding,
        db: Arc<dyn Database>,
        options: &WriterOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let shared = Arc::new(WriterShared {
            name: Arc::from(name.into()),
            status: StatusCell::new(),
            metrics: WriterMetrics::new(),
        });
        let worker = WriterLoop {
            shared: Arc::clone(&shared),
            rx,
            db,
            update: Batch::new(Arc::clone(&binding.update)),
            delete: Batch::new(Arc::clone(&binding.delete)),
            cancel: cancel.clone(),
            backoff: options.backoff,
            error_threshold: options.error_threshold,
        };
        Self {
            shared,
            tx,
            cancel,
            enqueue_timeout: options.enqueue_timeout,
            worker: Mutex::new(Some(worker)),
            task: Mutex::new(None),
        }
    }

    /// Writer name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawns the writer task on the current tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let handle = tokio::spawn(worker.run());
        *self.task.lock() = Some(handle);
        info!(writer = %self.shared.name, "writer started");
    }

    /// Requests the task to stop at its next suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
        info!(writer = %self.shared.name, "writer stopped");
    }

    /// Waits for the task to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(writer = %self.shared.name, error = %e, "writer task failed");
            }
            info!(writer = %self.shared.name, "writer finished");
        }
    }

    /// Returns `true` while the task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Queues a message, waiting while the queue is full.
    ///
    /// Returns `false` if the message was dropped because the writer stopped
    /// or can no longer make progress.
    pub async fn enqueue(&self, msg: SourceMessage) -> bool {
        let written_at = msg.written_at;
        let mut msg = msg;
        loop {
            match self.tx.send_timeout(msg, self.enqueue_timeout).await {
                Ok(()) => {
                    self.shared.metrics.record_enqueued();
                    self.shared.status.mark_read(written_at);
                    return true;
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.is_cancelled() || !self.is_running() {
                        break;
                    }
                    msg = back;
                }
                Err(SendTimeoutError::Closed(_)) => break,
            }
        }
        self.shared.metrics.record_enqueue_drop();
        warn!(writer = %self.shared.name, "writer is not running, message dropped");
        false
    }

    /// Status of the latest execute.
    #[must_use]
    pub fn status(&self) -> Status {
        self.shared.status.status()
    }

    /// Progress timestamps and last status.
    #[must_use]
    pub fn status_cell(&self) -> &StatusCell {
        &self.shared.status
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl std::fmt::Debug for PartitionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWriter")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ── Worker loop ──

enum Flow {
    Continue,
    Cancelled,
}

struct WriterLoop {
    shared: Arc<WriterShared>,
    rx: mpsc::Receiver<SourceMessage>,
    db: Arc<dyn Database>,
    update: Batch,
    delete: Batch,
    cancel: CancellationToken,
    backoff: BackoffPolicy,
    error_threshold: u32,
}

impl WriterLoop {
    async fn run(mut self) {
        let mut window = ThroughputWindow::new(THROUGHPUT_INTERVAL, 0);
        loop {
            let first = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            if let Some((rows, rps)) = window.tick(self.shared.metrics.snapshot().rows_written) {
                let rps = (rps * 100.0).round() / 100.0;
                debug!(writer = %self.shared.name, rows, rps, "written rows");
            }

            match self.drain(first).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Cancelled) => break,
                Err(e) => {
                    error!(writer = %self.shared.name, error = %e, "writer has stopped by decode error");
                    self.shared
                        .status
                        .set_status(Status::error(StatusCode::ClientInternalError, e.to_string()));
                    break;
                }
            }
        }
        debug!(writer = %self.shared.name, "writer loop exited");
    }

    fn batch_mut(&mut self, kind: EventKind) -> &mut Batch {
        match kind {
            EventKind::Update => &mut self.update,
            EventKind::Erase => &mut self.delete,
        }
    }

    /// Pulls queued messages into batches and flushes them.
    async fn drain(&mut self, first: SourceMessage) -> Result<Flow, DecodeError> {
        let mut committer = DeferredCommitter::new();
        let mut active: Option<EventKind> = None;
        let mut next = Some(first);

        while let Some(msg) = next {
            match envelope::parse(&msg.data, msg.created_at, msg.written_at)? {
                Envelope::Unsupported { reason } => {
                    warn!(
                        writer = %self.shared.name,
                        partition = msg.partition_id,
                        offset = msg.offset,
                        reason,
                        message = %String::from_utf8_lossy(&msg.data),
                        "unsupported cdc message dropped"
                    );
                    self.shared.metrics.record_dropped_envelope();
                    committer.add(&msg);
                }
                Envelope::Change(event) => {
                    let kind = if event.is_erase() {
                        EventKind::Erase
                    } else {
                        EventKind::Update
                    };
                    if let Some(previous) = active.filter(|a| *a != kind) {
                        if !self.flush(previous, &mut committer).await {
                            return Ok(Flow::Cancelled);
                        }
                    }
                    active = Some(kind);

                    let batch = self.batch_mut(kind);
                    batch.add_row(&event)?;
                    committer.add(&msg);
                    if batch.is_full() {
                        break;
                    }
                }
            }
            next = self.rx.try_recv().ok();
        }

        match active {
            Some(kind) => {
                if !self.flush(kind, &mut committer).await {
                    return Ok(Flow::Cancelled);
                }
            }
            None => {
                let committed = committer.commit();
                self.shared.metrics.record_commits(committed as u64);
            }
        }
        Ok(Flow::Continue)
    }

    /// Executes a batch until it succeeds, then commits its messages.
    ///
    /// Returns `false` if cancelled during a backoff; nothing is committed.
    async fn flush(&mut self, kind: EventKind, committer: &mut DeferredCommitter) -> bool {
        let retries = {
            let batch: &Batch = match kind {
                EventKind::Update => &self.update,
                EventKind::Erase => &self.delete,
            };
            let db: &dyn Database = self.db.as_ref();
            let shared: &WriterShared = &self.shared;
            let threshold = self.error_threshold;

            retry_until_success(
                &self.backoff,
                &self.cancel,
                move || async move {
                    let status = batch.execute(db).await;
                    shared.status.set_status(status.clone());
                    status
                },
                |retry, status, delay| {
                    shared.metrics.record_retry();
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    if retry < threshold {
                        trace!(writer = %shared.name, retry, delay_ms, %status, "write failed, retrying");
                    } else {
                        warn!(writer = %shared.name, retry, delay_ms, %status, "write failed, retrying");
                    }
                },
            )
            .await
        };

        let Some(retries) = retries else {
            return false;
        };

        let batch = self.batch_mut(kind);
        let rows = batch.len() as u64;
        let discarded = batch.binding().is_discard();
        let newest = batch.newest_created_at();
        batch.clear();

        let metrics = &self.shared.metrics;
        metrics.record_flush(rows, discarded);
        let committed = committer.commit();
        metrics.record_commits(committed as u64);
        if let Some(newest) = newest {
            self.shared.status.mark_write(newest);
        }
        if retries > 0 {
            debug!(writer = %self.shared.name, rows, retries, "batch written after retries");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingAction, QueryBinding, RowMember, RowSchema};
    use crate::testing::{message, MockDatabase, RecordingCommitter};
    use crate::types::ColumnType;
    use serde_json::json;

    fn binding(limit: usize) -> StreamBinding {
        let update = QueryBinding {
            kind: EventKind::Update,
            param_name: "$rows".into(),
            row: RowSchema::new(vec![
                RowMember {
                    name: "id".into(),
                    ty: ColumnType::Uint64,
                    key_index: Some(0),
                },
                RowMember {
                    name: "v".into(),
                    ty: ColumnType::optional(ColumnType::Int64),
                    key_index: None,
                },
            ]),
            batch_limit: limit,
            action: BindingAction::Execute {
                query: "UPSERT".into(),
            },
            timeout: None,
        };
        let delete = QueryBinding {
            kind: EventKind::Erase,
            param_name: "$keys".into(),
            row: RowSchema::new(vec![RowMember {
                name: "id".into(),
                ty: ColumnType::Uint64,
                key_index: Some(0),
            }]),
            batch_limit: limit,
            action: BindingAction::Execute {
                query: "DELETE".into(),
            },
            timeout: None,
        };
        StreamBinding {
            changefeed: "/local/t/feed".into(),
            table: "/local/t".into(),
            update: Arc::new(update),
            delete: Arc::new(delete),
        }
    }

    fn writer(db: &Arc<MockDatabase>, limit: usize, capacity: usize) -> PartitionWriter {
        let db: Arc<dyn Database> = db.clone();
        let options = WriterOptions {
            queue_capacity: capacity,
            ..WriterOptions::default()
        };
        PartitionWriter::new("writer-test[1]", &binding(limit), db, &options, CancellationToken::new())
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_share_one_write() {
        let db = Arc::new(MockDatabase::new("/local"));
        let commits = Arc::new(RecordingCommitter::new());
        let w = writer(&db, 10, 16);

        for i in 0..3 {
            let body = format!(r#"{{"key":[{i}],"update":{{"v":{i}}}}}"#);
            assert!(w.enqueue(message(&commits, 0, i, &body)).await);
        }
        w.start();
        settle().await;

        let executions = db.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].rows, vec![json!([0, 0]), json!([1, 1]), json!([2, 2])]);
        assert_eq!(commits.ranges(), vec![(0, 0..3)]);
        assert_eq!(w.metrics().rows_written, 3);

        w.stop();
        w.join().await;
        assert!(!w.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_switch_splits_commit_groups() {
        let db = Arc::new(MockDatabase::new("/local"));
        let commits = Arc::new(RecordingCommitter::new());
        let w = writer(&db, 10, 16);

        w.enqueue(message(&commits, 0, 0, r#"{"key":[1],"update":{"v":1}}"#)).await;
        w.enqueue(message(&commits, 0, 1, r#"{"key":[1],"erase":{}}"#)).await;
        w.enqueue(message(&commits, 0, 2, r#"{"key":[2],"update":{}}"#)).await;
        w.start();
        settle().await;

        let queries: Vec<String> = db.executions().into_iter().map(|e| e.query).collect();
        assert_eq!(queries, vec!["UPSERT", "DELETE", "UPSERT"]);
        assert_eq!(commits.ranges(), vec![(0, 0..1), (0, 1..2), (0, 2..3)]);

        w.stop();
        w.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_envelope_committed_behind_write() {
        let db = Arc::new(MockDatabase::new("/local"));
        let commits = Arc::new(RecordingCommitter::new());
        let w = writer(&db, 10, 16);

        w.enqueue(message(&commits, 0, 0, r#"{"key":[1],"update":{}}"#)).await;
        w.enqueue(message(&commits, 0, 1, r#"{"nokey":true}"#)).await;
        w.start();
        settle().await;

        assert_eq!(db.executions().len(), 1);
        assert_eq!(commits.ranges(), vec![(0, 0..2)]);
        assert_eq!(w.metrics().envelopes_dropped, 1);

        w.stop();
        w.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_json_stops_writer() {
        let db = Arc::new(MockDatabase::new("/local"));
        let commits = Arc::new(RecordingCommitter::new());
        let w = writer(&db, 10, 16);

        w.enqueue(message(&commits, 0, 0, r#"{"key":[1],"update":{}}"#)).await;
        w.enqueue(message(&commits, 0, 1, "{not json")).await;
        w.start();
        settle().await;

        assert!(!w.is_running());
        let status = w.status();
        assert_eq!(status.code, StatusCode::ClientInternalError);
        assert!(db.executions().is_empty());
        assert!(commits.ranges().is_empty());

        // Nothing drains the queue any more.
        assert!(!w.enqueue(message(&commits, 0, 2, "{}")).await);
        assert_eq!(w.metrics().messages_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_does_not_commit() {
        let db = Arc::new(MockDatabase::new("/local"));
        db.fail_next(u32::MAX, StatusCode::Unavailable);
        let commits = Arc::new(RecordingCommitter::new());
        let w = writer(&db, 10, 16);

        w.enqueue(message(&commits, 0, 0, r#"{"key":[1],"update":{}}"#)).await;
        w.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(db.executions().len() > 1);
        assert_eq!(w.status().code, StatusCode::Unavailable);

        w.stop();
        w.join().await;
        assert!(commits.ranges().is_empty());
        assert_eq!(w.metrics().rows_written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_drops_when_not_started() {
        let db = Arc::new(MockDatabase::new("/local"));
        let commits = Arc::new(RecordingCommitter::new());
        let w = writer(&db, 10, 1);

        assert!(w.enqueue(message(&commits, 0, 0, "{}")).await);
        // Queue is full and no task drains it.
        assert!(!w.enqueue(message(&commits, 0, 1, "{}")).await);
        assert_eq!(w.metrics().messages_enqueued, 1);
        assert_eq!(w.metrics().messages_dropped, 1);
    }
}
