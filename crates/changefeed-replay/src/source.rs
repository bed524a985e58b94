//! Subscription source contract.
//!
//! The topic client lives behind [`Subscription`] and [`SubscriptionFactory`].
//! Each delivered [`SourceMessage`] carries the committer that acknowledges
//! it, so writers can commit offsets long after delivery, in groups, once
//! the covering write has succeeded.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ReplayError;

/// Acknowledges consumed offsets back to the topic.
///
/// Commits are idempotent: committing a range twice is harmless.
pub trait OffsetCommitter: Send + Sync {
    /// Marks `offsets` of `partition_id` as processed.
    fn commit(&self, partition_id: u64, offsets: Range<u64>);
}

/// One raw message delivered by a subscription.
#[derive(Clone)]
pub struct SourceMessage {
    /// JSON payload.
    pub data: Vec<u8>,
    /// Source partition the message was read from.
    pub partition_id: u64,
    /// Offset within the partition.
    pub offset: u64,
    /// Event creation time.
    pub created_at: DateTime<Utc>,
    /// Time the message was written to the topic.
    pub written_at: DateTime<Utc>,
    /// Committer that acknowledges this message.
    pub committer: Arc<dyn OffsetCommitter>,
}

impl fmt::Debug for SourceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceMessage")
            .field("partition_id", &self.partition_id)
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

struct PendingRange {
    committer: Arc<dyn OffsetCommitter>,
    partition_id: u64,
    offsets: Range<u64>,
}

/// A group of messages acknowledged together.
///
/// Adjacent offsets of the same partition and committer are merged into a
/// single range, so a full batch usually commits as one call per partition.
#[derive(Default)]
pub struct DeferredCommitter {
    pending: Vec<PendingRange>,
    messages: usize,
}

impl DeferredCommitter {
    /// Creates an empty commit group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a message to the group.
    pub fn add(&mut self, msg: &SourceMessage) {
        self.messages += 1;
        if let Some(last) = self.pending.last_mut() {
            if Arc::ptr_eq(&last.committer, &msg.committer)
                && last.partition_id == msg.partition_id
                && last.offsets.end == msg.offset
            {
                last.offsets.end = msg.offset + 1;
                return;
            }
        }
        self.pending.push(PendingRange {
            committer: Arc::clone(&msg.committer),
            partition_id: msg.partition_id,
            offsets: msg.offset..msg.offset + 1,
        });
    }

    /// Commits every pending range and empties the group.
    ///
    /// Returns the number of messages acknowledged.
    pub fn commit(&mut self) -> usize {
        for range in self.pending.drain(..) {
            range.committer.commit(range.partition_id, range.offsets);
        }
        std::mem::take(&mut self.messages)
    }

    /// Returns the number of messages in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
    }

    /// Returns `true` if the group holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }
}

impl fmt::Debug for DeferredCommitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCommitter")
            .field("messages", &self.messages)
            .field("ranges", &self.pending.len())
            .finish()
    }
}

/// An open read session on one changefeed consumer.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message.
    ///
    /// Returns `Ok(None)` once the subscription has ended.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Subscription`] if the session failed.
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, ReplayError>;

    /// Closes the read session.
    async fn close(&mut self);
}

/// Opens subscriptions for change streams.
#[async_trait]
pub trait SubscriptionFactory: Send + Sync {
    /// Subscribes `consumer` to the changefeed at `changefeed` (a full path).
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Subscription`] if the session can't be opened.
    async fn subscribe(
        &self,
        changefeed: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, ReplayError>;
}
