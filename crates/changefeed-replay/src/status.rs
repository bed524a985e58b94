//! Observability state of writers and streams.
//!
//! A [`StatusCell`] is written by exactly one writer task and read by anyone.
//! Timestamps are atomics; only the last [`Status`] sits behind a lock since
//! it carries a message string.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::database::Status;

const NEVER: i64 = i64::MIN;

/// Last status and progress timestamps of one writer.
#[derive(Debug)]
pub struct StatusCell {
    last_status: Mutex<Status>,
    last_read_us: AtomicI64,
    last_write_us: AtomicI64,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self {
            last_status: Mutex::new(Status::SUCCESS),
            last_read_us: AtomicI64::new(NEVER),
            last_write_us: AtomicI64::new(NEVER),
        }
    }
}

impl StatusCell {
    /// Creates a cell with a success status and no progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the status of the latest execute.
    pub fn set_status(&self, status: Status) {
        *self.last_status.lock() = status;
    }

    /// Status of the latest execute.
    #[must_use]
    pub fn status(&self) -> Status {
        self.last_status.lock().clone()
    }

    /// Records the write time of the latest accepted message.
    pub fn mark_read(&self, at: DateTime<Utc>) {
        self.last_read_us.store(at.timestamp_micros(), Ordering::Release);
    }

    /// Records the creation time of the newest event in a written batch.
    pub fn mark_write(&self, at: DateTime<Utc>) {
        self.last_write_us.store(at.timestamp_micros(), Ordering::Release);
    }

    /// Write time of the latest accepted message.
    #[must_use]
    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        from_micros(self.last_read_us.load(Ordering::Acquire))
    }

    /// Creation time of the newest written event.
    #[must_use]
    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        from_micros(self.last_write_us.load(Ordering::Acquire))
    }
}

fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    if us == NEVER {
        None
    } else {
        DateTime::from_timestamp_micros(us)
    }
}

/// Externally visible state of one change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// Stream id.
    pub id: Uuid,
    /// Full changefeed path.
    pub changefeed: String,
    /// Consumer name.
    pub consumer: String,
    /// `true` when every writer's last execute succeeded.
    pub ok: bool,
    /// Rendered status.
    pub status: String,
    /// Last read time, milliseconds since the epoch.
    pub last_read_ms: Option<i64>,
    /// Last write time, milliseconds since the epoch.
    pub last_write_ms: Option<i64>,
}

impl StreamStatus {
    /// Builds a stream status from aggregated writer state.
    #[must_use]
    pub fn new(
        id: Uuid,
        changefeed: impl Into<String>,
        consumer: impl Into<String>,
        status: &Status,
        last_read: Option<DateTime<Utc>>,
        last_write: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            changefeed: changefeed.into(),
            consumer: consumer.into(),
            ok: status.is_success(),
            status: status.to_string(),
            last_read_ms: last_read.map(|t| t.timestamp_millis()),
            last_write_ms: last_write.map(|t| t.timestamp_millis()),
        }
    }
}
