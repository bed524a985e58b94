//! # Changefeed Replay
//!
//! Reads change events from database changefeeds and replays them into
//! destination tables through user-supplied batched write queries.
//!
//! ## Pipeline
//!
//! ```text
//! Subscription --> ChangeStream --> WriterPool --(partition % n)--> PartitionWriter
//!                                                                        |
//!   envelope::parse -> Batch (decode rows) -> Database::execute_query <--+
//!                                                                        |
//!                   DeferredCommitter <-- commit after successful write --+
//! ```
//!
//! - [`binding`] - Resolves queries against the source table schema
//! - [`codec`] - JSON to typed value conversion
//! - [`writer`] - Per-partition batching, retries and offset commits
//! - [`replicator`] - Hosts every configured stream
//! - [`testing`] - Mock database and subscriptions

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::float_cmp,
        clippy::unreadable_literal,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        unused_mut
    )
)]

// ── Values ──

/// Error types.
pub mod error;

/// Column and value types.
pub mod types;

/// JSON codec for typed values.
pub mod codec;

/// Change event envelope parsing.
pub mod envelope;

// ── External seams ──

/// Database abstraction and schema types.
pub mod database;

/// Changefeed subscription abstraction and offset commits.
pub mod source;

/// Stream and query configuration.
pub mod config;

// ── Pipeline ──

/// Query binding against the source schema.
pub mod binding;

/// Row batches bound to one query.
pub mod batch;

/// Retry with exponential backoff.
pub mod retry;

/// Writer metrics.
pub mod metrics;

/// Stream status reporting.
pub mod status;

/// Partition writers.
pub mod writer;

/// Writer pools.
pub mod pool;

/// Change streams.
pub mod stream;

/// Multi-stream host.
pub mod replicator;

/// Testing utilities (mock database, subscriptions, helpers).
pub mod testing;

pub use binding::{bind_stream, StreamBinding};
pub use config::{ChangeStreamConfig, NamedQuery, PropertyMap, ReplicatorConfig};
pub use database::{Database, Status, StatusCode};
pub use error::{BindError, DecodeError, ReplayError};
pub use replicator::{Replicator, ReplicatorInfo};
pub use source::{OffsetCommitter, SourceMessage, Subscription, SubscriptionFactory};
pub use status::StreamStatus;
pub use stream::ChangeStream;
pub use types::{ColumnType, TypedValue};
