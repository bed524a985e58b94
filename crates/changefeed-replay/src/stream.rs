//! Change stream: one subscription feeding one writer pool.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::binding::StreamBinding;
use crate::config::ChangeStreamConfig;
use crate::database::{Database, Status, StatusCode};
use crate::metrics::MetricsSnapshot;
use crate::pool::WriterPool;
use crate::source::Subscription;
use crate::status::{StatusCell, StreamStatus};

/// A bound changefeed consumer and its writers.
#[derive(Debug)]
pub struct ChangeStream {
    id: Uuid,
    consumer: String,
    binding: StreamBinding,
    pool: Arc<WriterPool>,
    cancel: CancellationToken,
    // Failure of the subscription itself, reported ahead of writer statuses.
    source_status: Arc<StatusCell>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeStream {
    /// Creates a stopped stream.
    #[must_use]
    pub fn new(
        binding: StreamBinding,
        config: &ChangeStreamConfig,
        db: &Arc<dyn Database>,
        cancel: &CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let pool = WriterPool::new(&binding, db, config, &cancel);
        Self {
            id: Uuid::new_v4(),
            consumer: config.consumer.clone(),
            binding,
            pool: Arc::new(pool),
            cancel,
            source_status: Arc::new(StatusCell::new()),
            reader: Mutex::new(None),
        }
    }

    /// Random id assigned at creation.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Full changefeed path.
    #[must_use]
    pub fn changefeed(&self) -> &str {
        &self.binding.changefeed
    }

    /// Consumer name.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Resolved bindings.
    #[must_use]
    pub fn binding(&self) -> &StreamBinding {
        &self.binding
    }

    /// The stream's writers.
    #[must_use]
    pub fn pool(&self) -> &WriterPool {
        &self.pool
    }

    /// Starts the writers and forwards messages from `subscription`.
    pub fn start(&self, subscription: Box<dyn Subscription>) {
        self.pool.start();
        let handle = tokio::spawn(forward(
            subscription,
            Arc::clone(&self.pool),
            Arc::clone(&self.source_status),
            self.cancel.clone(),
            self.consumer.clone(),
        ));
        *self.reader.lock() = Some(handle);
        info!(id = %self.id, changefeed = %self.binding.changefeed, consumer = %self.consumer, "change stream started");
    }

    /// Requests shutdown without waiting.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stops reading, then stops and joins every writer.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.pool.close().await;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                error!(consumer = %self.consumer, error = %e, "reader task failed");
            }
        }
        info!(id = %self.id, consumer = %self.consumer, "change stream closed");
    }

    /// Observability snapshot.
    ///
    /// A failed subscription takes precedence over writer statuses.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        let source = self.source_status.status();
        let status = if source.is_success() {
            self.pool.status()
        } else {
            source
        };
        StreamStatus::new(
            self.id,
            &self.binding.changefeed,
            &self.consumer,
            &status,
            self.pool.last_read(),
            self.pool.last_write(),
        )
    }

    /// Summed writer counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.pool.metrics()
    }
}

/// Delivery loop: subscription to pool until cancelled or the source ends.
async fn forward(
    mut subscription: Box<dyn Subscription>,
    pool: Arc<WriterPool>,
    source_status: Arc<StatusCell>,
    cancel: CancellationToken,
    consumer: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = subscription.next_message() => next,
        };
        match next {
            Ok(Some(msg)) => {
                pool.dispatch(msg).await;
            }
            Ok(None) => {
                info!(consumer = %consumer, "subscription ended");
                break;
            }
            Err(e) => {
                error!(consumer = %consumer, error = %e, "subscription failed");
                source_status.set_status(Status::error(
                    StatusCode::TransportUnavailable,
                    format!("subscription failed: {e}"),
                ));
                break;
            }
        }
    }
    subscription.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{EventKind, QueryBinding};
    use crate::testing::{MockDatabase, MockSubscription};
    use std::time::Duration;

    fn stream() -> ChangeStream {
        let binding = StreamBinding {
            changefeed: "/local/t/feed".into(),
            table: "/local/t".into(),
            update: Arc::new(QueryBinding::discard(EventKind::Update, 10)),
            delete: Arc::new(QueryBinding::discard(EventKind::Erase, 10)),
        };
        let db: Arc<dyn Database> = Arc::new(MockDatabase::new("/local"));
        let cfg = ChangeStreamConfig::new("t/feed", "c");
        ChangeStream::new(binding, &cfg, &db, &CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_and_closes_subscription() {
        let s = stream();
        let (feed, sub) = MockSubscription::channel();
        s.start(Box::new(sub));

        feed.push(0, 0, r#"{"key":[1],"update":{}}"#);
        feed.push(0, 1, r#"{"key":[1],"erase":{}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(feed.committer().committed(), 2);
        let status = s.status();
        assert!(status.ok);
        assert_eq!(status.changefeed, "/local/t/feed");
        assert_eq!(status.consumer, "c");
        assert_eq!(status.id, s.id());
        assert!(status.last_read_ms.is_some());

        s.close().await;
        assert!(feed.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_is_reported() {
        let s = stream();
        let (feed, sub) = MockSubscription::channel();
        s.start(Box::new(sub));

        feed.push(0, 0, r#"{"key":[1],"update":{}}"#);
        feed.fail("connection reset");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(feed.is_closed());
        assert!(!feed.push(0, 1, r#"{"key":[1],"update":{}}"#));
        assert_eq!(feed.committer().committed(), 1);

        let status = s.status();
        assert!(!status.ok);
        assert!(status.status.contains("TRANSPORT_UNAVAILABLE"));
        assert!(status.status.contains("connection reset"));
        s.close().await;
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        assert_ne!(stream().id(), stream().id());
    }
}
