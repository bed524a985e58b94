//! In-memory collaborators for tests.
//!
//! - [`MockDatabase`]: scripted schema, parsed queries and execute failures
//! - [`MockSubscriptionFactory`] / [`MockFeed`]: channel-backed subscriptions
//! - [`RecordingCommitter`]: remembers every committed offset range

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec;
use crate::database::{Database, QueryParams, QueryTypes, Status, StatusCode, TableDescription};
use crate::error::ReplayError;
use crate::source::{OffsetCommitter, SourceMessage, Subscription, SubscriptionFactory};
use crate::types::TypedValue;

/// Base of the creation timestamps produced by [`message`].
pub const BASE_EPOCH_SECS: i64 = 1_700_000_000;

/// Creation time [`message`] assigns to an offset.
#[must_use]
pub fn created_at(offset: u64) -> DateTime<Utc> {
    let secs = BASE_EPOCH_SECS + i64::try_from(offset).unwrap_or(0);
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Builds a source message acknowledged through `committer`.
///
/// The creation time is [`created_at`]`(offset)`.
#[must_use]
pub fn message(
    committer: &Arc<RecordingCommitter>,
    partition_id: u64,
    offset: u64,
    body: &str,
) -> SourceMessage {
    let committer: Arc<dyn OffsetCommitter> = committer.clone();
    SourceMessage {
        data: body.as_bytes().to_vec(),
        partition_id,
        offset,
        created_at: created_at(offset),
        written_at: created_at(offset),
        committer,
    }
}

// ── Committer ──

/// Committer that records every range it receives.
#[derive(Debug, Default)]
pub struct RecordingCommitter {
    ranges: Mutex<Vec<(u64, Range<u64>)>>,
}

impl RecordingCommitter {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed `(partition, offsets)` ranges in commit order.
    #[must_use]
    pub fn ranges(&self) -> Vec<(u64, Range<u64>)> {
        self.ranges.lock().clone()
    }

    /// Total number of committed offsets.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.ranges
            .lock()
            .iter()
            .map(|(_, r)| r.end - r.start)
            .sum()
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, partition_id: u64, offsets: Range<u64>) {
        self.ranges.lock().push((partition_id, offsets));
    }
}

// ── Database ──

/// One recorded execute attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Statement text.
    pub query: String,
    /// Parameter name.
    pub param_name: String,
    /// Rows of the list parameter, rendered as JSON arrays.
    pub rows: Vec<Value>,
    /// Per-call timeout.
    pub timeout: Option<Duration>,
    /// Status returned for this attempt.
    pub status: Status,
}

/// In-memory database.
///
/// Unknown tables fail to describe with `SCHEME_ERROR`, unknown queries fail
/// to parse with `BAD_REQUEST`, and executes succeed unless failures are
/// scripted with [`fail_next`](Self::fail_next).
#[derive(Debug, Default)]
pub struct MockDatabase {
    database: String,
    tables: HashMap<String, TableDescription>,
    queries: HashMap<String, QueryTypes>,
    failures_left: AtomicU32,
    failure_code: Mutex<Option<StatusCode>>,
    execute_delay: Option<Duration>,
    executions: Mutex<Vec<Execution>>,
}

impl MockDatabase {
    /// Creates a database with the given root path.
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Adds a table description.
    #[must_use]
    pub fn with_table(mut self, path: impl Into<String>, desc: TableDescription) -> Self {
        self.tables.insert(path.into(), desc);
        self
    }

    /// Adds the parse result of a query.
    #[must_use]
    pub fn with_query(mut self, text: impl Into<String>, types: QueryTypes) -> Self {
        self.queries.insert(text.into(), types);
        self
    }

    /// Makes every execute take `delay`.
    #[must_use]
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    /// Fails the next `count` executes with `code`; `u32::MAX` fails forever.
    pub fn fail_next(&self, count: u32, code: StatusCode) {
        *self.failure_code.lock() = Some(code);
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Every execute attempt, failed ones included.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().clone()
    }

    /// Rows of all successful executes, in execution order.
    #[must_use]
    pub fn written_rows(&self) -> Vec<Value> {
        self.executions
            .lock()
            .iter()
            .filter(|e| e.status.is_success())
            .flat_map(|e| e.rows.iter().cloned())
            .collect()
    }

    fn next_status(&self) -> Status {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if !failing {
            return Status::SUCCESS;
        }
        let code = self
            .failure_code
            .lock()
            .unwrap_or(StatusCode::Unavailable);
        Status::error(code, "scripted failure")
    }
}

#[async_trait]
impl Database for MockDatabase {
    fn database(&self) -> &str {
        &self.database
    }

    async fn describe_table(&self, path: &str) -> Result<TableDescription, Status> {
        self.tables.get(path).cloned().ok_or_else(|| {
            Status::error(StatusCode::SchemeError, format!("path not found: {path}"))
        })
    }

    async fn parse_query(&self, query: &str) -> Result<QueryTypes, Status> {
        self.queries
            .get(query)
            .cloned()
            .ok_or_else(|| Status::error(StatusCode::BadRequest, "can't parse query"))
    }

    async fn execute_query(
        &self,
        query: &str,
        params: &QueryParams,
        timeout: Option<Duration>,
    ) -> Status {
        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }
        let status = self.next_status();
        let rows = match &params.value {
            TypedValue::List(items) => items.iter().map(codec::encode).collect(),
            other => vec![codec::encode(other)],
        };
        self.executions.lock().push(Execution {
            query: query.to_string(),
            param_name: params.name.clone(),
            rows,
            timeout,
            status: status.clone(),
        });
        status
    }
}

// ── Subscriptions ──

/// Producer side of a [`MockSubscription`].
#[derive(Debug, Clone)]
pub struct MockFeed {
    tx: mpsc::UnboundedSender<Result<SourceMessage, ReplayError>>,
    committer: Arc<RecordingCommitter>,
    closed: Arc<AtomicBool>,
}

impl MockFeed {
    /// Delivers a JSON message on a partition.
    ///
    /// Returns `false` once the subscription is gone.
    pub fn push(&self, partition_id: u64, offset: u64, body: &str) -> bool {
        self.tx
            .send(Ok(message(&self.committer, partition_id, offset, body)))
            .is_ok()
    }

    /// Makes the subscription's next read fail.
    pub fn fail(&self, reason: &str) -> bool {
        self.tx
            .send(Err(ReplayError::Subscription(reason.to_string())))
            .is_ok()
    }

    /// Committer that acknowledges this feed's messages.
    #[must_use]
    pub fn committer(&self) -> &Arc<RecordingCommitter> {
        &self.committer
    }

    /// Returns `true` once the subscription was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Subscription reading from a [`MockFeed`].
#[derive(Debug)]
pub struct MockSubscription {
    rx: mpsc::UnboundedReceiver<Result<SourceMessage, ReplayError>>,
    closed: Arc<AtomicBool>,
}

impl MockSubscription {
    /// Creates a connected feed and subscription.
    #[must_use]
    pub fn channel() -> (MockFeed, MockSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let feed = MockFeed {
            tx,
            committer: Arc::new(RecordingCommitter::new()),
            closed: Arc::clone(&closed),
        };
        (feed, MockSubscription { rx, closed })
    }
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, ReplayError> {
        self.rx.recv().await.transpose()
    }

    async fn close(&mut self) {
        self.rx.close();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`MockSubscription`]s registered per consumer.
#[derive(Debug, Default)]
pub struct MockSubscriptionFactory {
    pending: Mutex<HashMap<String, MockSubscription>>,
    subscribed: Mutex<Vec<(String, String)>>,
}

impl MockSubscriptionFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription for `consumer` and returns its feed.
    pub fn feed(&self, consumer: &str) -> MockFeed {
        let (feed, subscription) = MockSubscription::channel();
        self.pending.lock().insert(consumer.to_string(), subscription);
        feed
    }

    /// `(changefeed, consumer)` pairs subscribed so far.
    #[must_use]
    pub fn subscribed(&self) -> Vec<(String, String)> {
        self.subscribed.lock().clone()
    }
}

#[async_trait]
impl SubscriptionFactory for MockSubscriptionFactory {
    async fn subscribe(
        &self,
        changefeed: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, ReplayError> {
        let subscription = self.pending.lock().remove(consumer).ok_or_else(|| {
            ReplayError::Subscription(format!("no feed registered for consumer {consumer}"))
        })?;
        self.subscribed
            .lock()
            .push((changefeed.to_string(), consumer.to_string()));
        Ok(Box::new(subscription))
    }
}
