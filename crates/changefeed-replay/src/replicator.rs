//! Multi-stream host.
//!
//! [`Replicator::build`] binds every configured stream. A stream that fails
//! to bind is skipped with a warning so the others keep running; the host
//! itself never fails to build.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::binding::bind_stream;
use crate::config::ReplicatorConfig;
use crate::database::Database;
use crate::error::ReplayError;
use crate::metrics::MetricsSnapshot;
use crate::source::SubscriptionFactory;
use crate::status::StreamStatus;
use crate::stream::ChangeStream;

/// Warning recorded when no stream could be created.
pub const NO_READERS_WARNING: &str = "No reader configs found!!";

/// Identity of a running stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Stream id.
    pub id: Uuid,
    /// Full changefeed path.
    pub changefeed: String,
    /// Consumer name.
    pub consumer: String,
}

/// Startup warnings and stream identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicatorInfo {
    /// Problems found while building and starting streams.
    pub warnings: Vec<String>,
    /// Created streams.
    pub streams: Vec<StreamInfo>,
}

/// Hosts every configured change stream.
pub struct Replicator {
    subscriptions: Arc<dyn SubscriptionFactory>,
    streams: Vec<ChangeStream>,
    warnings: Mutex<Vec<String>>,
    cancel: CancellationToken,
}

impl Replicator {
    /// Binds all configured streams.
    pub async fn build(
        config: &ReplicatorConfig,
        db: Arc<dyn Database>,
        subscriptions: Arc<dyn SubscriptionFactory>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut streams = Vec::with_capacity(config.streams.len());
        let mut warnings = Vec::new();

        for stream_config in &config.streams {
            let bound = match stream_config.validate() {
                Ok(()) => bind_stream(db.as_ref(), stream_config, &config.queries)
                    .await
                    .map_err(ReplayError::from),
                Err(e) => Err(e),
            };
            match bound {
                Ok(binding) => {
                    streams.push(ChangeStream::new(binding, stream_config, &db, &cancel));
                }
                Err(e) => {
                    warn!(consumer = %stream_config.consumer, error = %e, "can't create reader");
                    warnings.push(format!(
                        "can't create reader {} with problem: {e}",
                        stream_config.consumer
                    ));
                }
            }
        }

        if streams.is_empty() {
            warn!("{NO_READERS_WARNING}");
            warnings.push(NO_READERS_WARNING.to_string());
        }

        Self {
            subscriptions,
            streams,
            warnings: Mutex::new(warnings),
            cancel,
        }
    }

    /// Subscribes and starts every stream.
    ///
    /// A stream whose subscription can't be opened is left stopped and
    /// reported as a warning.
    pub async fn start(&self) {
        for stream in &self.streams {
            match self
                .subscriptions
                .subscribe(stream.changefeed(), stream.consumer())
                .await
            {
                Ok(subscription) => stream.start(subscription),
                Err(e) => {
                    warn!(consumer = %stream.consumer(), error = %e, "can't start reader");
                    self.warnings.lock().push(format!(
                        "can't start reader {} with problem: {e}",
                        stream.consumer()
                    ));
                }
            }
        }
        info!(streams = self.streams.len(), "replicator started");
    }

    /// Created streams.
    #[must_use]
    pub fn streams(&self) -> &[ChangeStream] {
        &self.streams
    }

    /// Problems found so far.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    /// One status entry per stream.
    #[must_use]
    pub fn status(&self) -> Vec<StreamStatus> {
        self.streams.iter().map(ChangeStream::status).collect()
    }

    /// Warnings and stream identities.
    #[must_use]
    pub fn info(&self) -> ReplicatorInfo {
        ReplicatorInfo {
            warnings: self.warnings(),
            streams: self
                .streams
                .iter()
                .map(|s| StreamInfo {
                    id: s.id(),
                    changefeed: s.changefeed().to_string(),
                    consumer: s.consumer().to_string(),
                })
                .collect(),
        }
    }

    /// Summed counters of all streams.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.streams.iter().map(ChangeStream::metrics).sum()
    }

    /// Asks every stream to stop; [`close`](Self::close) waits for them.
    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        self.cancel.cancel();
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        self.cancel.cancelled().await;
    }

    /// Stops every stream and waits for all writers.
    pub async fn close(&self) {
        self.cancel.cancel();
        for stream in &self.streams {
            stream.close().await;
        }
        info!("replicator closed");
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("streams", &self.streams.len())
            .field("warnings", &self.warnings.lock().len())
            .finish_non_exhaustive()
    }
}
