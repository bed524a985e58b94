//! Configuration model.
//!
//! Streams can be configured two ways:
//! - [`ReplicatorConfig`] deserialized with serde from any file format
//! - [`PropertyMap`] string key-value pairs, parsed by
//!   [`ChangeStreamConfig::from_properties`]
//!
//! Both produce the same [`ChangeStreamConfig`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ReplayError;

/// Default number of rows per write.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default number of partition writers per stream.
pub const DEFAULT_THREADS: usize = 1;

/// Default length of a failure streak logged at trace level.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// String key-value configuration of one change stream.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    properties: HashMap<String, String>,
}

impl PropertyMap {
    /// Creates an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Gets a required property.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::MissingConfig` if the key is not set.
    pub fn require(&self, key: &str) -> Result<&str, ReplayError> {
        self.get(key)
            .ok_or_else(|| ReplayError::MissingConfig(key.to_string()))
    }

    /// Gets a property parsed as the given type.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Configuration` if the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ReplayError>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.trim().parse::<T>().map(Some).map_err(|e| {
                ReplayError::Configuration(format!("invalid value for '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }
}

/// Where a destination query comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource<'a> {
    /// Query text given inline in the stream config.
    Inline(&'a str),
    /// Reference to a [`NamedQuery`] by id.
    Named(&'a str),
    /// Nothing configured; matching events are discarded.
    None,
}

/// Configuration of one change stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeStreamConfig {
    /// Changefeed path, absolute or relative to the database root.
    pub changefeed: String,
    /// Topic consumer name.
    pub consumer: String,
    /// Inline query for update events.
    #[serde(default)]
    pub update_query: Option<String>,
    /// Named query for update events, used when no inline query is set.
    #[serde(default)]
    pub update_query_id: Option<String>,
    /// Inline query for erase events.
    #[serde(default)]
    pub delete_query: Option<String>,
    /// Named query for erase events, used when no inline query is set.
    #[serde(default)]
    pub delete_query_id: Option<String>,
    /// Rows per write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of partition writers.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Per-call timeout in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Failures in a row logged at trace level before switching to warn.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Queue capacity per writer; defaults to twice the batch size.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

fn default_error_threshold() -> u32 {
    DEFAULT_ERROR_THRESHOLD
}

impl ChangeStreamConfig {
    /// Creates a config with default tuning and no queries.
    #[must_use]
    pub fn new(changefeed: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            changefeed: changefeed.into(),
            consumer: consumer.into(),
            update_query: None,
            update_query_id: None,
            delete_query: None,
            delete_query_id: None,
            batch_size: DEFAULT_BATCH_SIZE,
            threads: DEFAULT_THREADS,
            timeout_seconds: 0,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            queue_capacity: None,
        }
    }

    /// Parses a stream config from key-value properties.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::MissingConfig` if `changefeed` or `consumer` is
    /// missing, or `ReplayError::Configuration` for invalid values.
    pub fn from_properties(props: &PropertyMap) -> Result<Self, ReplayError> {
        let mut cfg = Self::new(props.require("changefeed")?, props.require("consumer")?);

        cfg.update_query = non_empty(props.get("update.query"));
        cfg.update_query_id = non_empty(props.get("update.query.id"));
        cfg.delete_query = non_empty(props.get("delete.query"));
        cfg.delete_query_id = non_empty(props.get("delete.query.id"));

        if let Some(v) = props.get_parsed("batch.size")? {
            cfg.batch_size = v;
        }
        if let Some(v) = props.get_parsed("threads")? {
            cfg.threads = v;
        }
        if let Some(v) = props.get_parsed("timeout.seconds")? {
            cfg.timeout_seconds = v;
        }
        if let Some(v) = props.get_parsed("error.threshold")? {
            cfg.error_threshold = v;
        }
        cfg.queue_capacity = props.get_parsed("queue.capacity")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the tuning values.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Configuration` if a value is out of range.
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.changefeed.is_empty() {
            return Err(ReplayError::Configuration("changefeed must not be empty".into()));
        }
        if self.consumer.is_empty() {
            return Err(ReplayError::Configuration("consumer must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ReplayError::Configuration("batch.size must be at least 1".into()));
        }
        if self.threads == 0 {
            return Err(ReplayError::Configuration("threads must be at least 1".into()));
        }
        if self.queue_capacity == Some(0) {
            return Err(ReplayError::Configuration("queue.capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Source of the update query.
    #[must_use]
    pub fn update_source(&self) -> QuerySource<'_> {
        query_source(self.update_query.as_deref(), self.update_query_id.as_deref())
    }

    /// Source of the delete query.
    #[must_use]
    pub fn delete_source(&self) -> QuerySource<'_> {
        query_source(self.delete_query.as_deref(), self.delete_query_id.as_deref())
    }

    /// Per-call timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }

    /// Effective queue capacity per writer.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.batch_size.saturating_mul(2))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn query_source<'a>(inline: Option<&'a str>, named: Option<&'a str>) -> QuerySource<'a> {
    match (inline, named) {
        (Some(text), _) => QuerySource::Inline(text),
        (None, Some(id)) => QuerySource::Named(id),
        (None, None) => QuerySource::None,
    }
}

/// A reusable query fragment shared by streams.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamedQuery {
    /// Identifier referenced by `update_query_id` / `delete_query_id`.
    pub id: String,
    /// Query text or fragment.
    pub text: String,
    /// One of `insertInto`, `upsertInto`, `updateOn`, `deleteFrom`.
    #[serde(default)]
    pub action: Option<String>,
    /// Target table for the action, absolute or relative.
    #[serde(default)]
    pub table: Option<String>,
}

impl NamedQuery {
    /// Creates a plain query without an action.
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            action: None,
            table: None,
        }
    }

    /// Sets the synthesized action and its target table.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>, table: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self.table = Some(table.into());
        self
    }
}

/// Full replicator configuration: streams plus the query library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplicatorConfig {
    /// Configured change streams.
    #[serde(default)]
    pub streams: Vec<ChangeStreamConfig>,
    /// Named queries.
    #[serde(default)]
    pub queries: Vec<NamedQuery>,
}

impl ReplicatorConfig {
    /// Looks up a named query.
    #[must_use]
    pub fn query(&self, id: &str) -> Option<&NamedQuery> {
        self.queries.iter().find(|q| q.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> PropertyMap {
        let mut p = PropertyMap::new();
        for (k, v) in pairs {
            p.set(*k, *v);
        }
        p
    }

    #[test]
    fn test_defaults() {
        let cfg =
            ChangeStreamConfig::from_properties(&props(&[("changefeed", "t/feed"), ("consumer", "c")]))
                .unwrap();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.error_threshold, 3);
        assert_eq!(cfg.timeout(), None);
        assert_eq!(cfg.queue_capacity(), 2000);
        assert_eq!(cfg.update_source(), QuerySource::None);
        assert_eq!(cfg.delete_source(), QuerySource::None);
    }

    #[test]
    fn test_all_keys() {
        let cfg = ChangeStreamConfig::from_properties(&props(&[
            ("changefeed", "/local/t/feed"),
            ("consumer", "c"),
            ("update.query", "UPSERT INTO t SELECT * FROM AS_TABLE($rows)"),
            ("update.query.id", "ignored"),
            ("delete.query.id", "del"),
            ("batch.size", "50"),
            ("threads", "4"),
            ("timeout.seconds", "10"),
            ("error.threshold", "7"),
            ("queue.capacity", "64"),
        ]))
        .unwrap();
        assert!(matches!(cfg.update_source(), QuerySource::Inline(q) if q.starts_with("UPSERT")));
        assert_eq!(cfg.delete_source(), QuerySource::Named("del"));
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(cfg.error_threshold, 7);
        assert_eq!(cfg.queue_capacity(), 64);
    }

    #[test]
    fn test_missing_required() {
        let err = ChangeStreamConfig::from_properties(&props(&[("consumer", "c")])).unwrap_err();
        assert!(matches!(err, ReplayError::MissingConfig(ref k) if k == "changefeed"));
    }

    #[test]
    fn test_invalid_values() {
        let err = ChangeStreamConfig::from_properties(&props(&[
            ("changefeed", "t/f"),
            ("consumer", "c"),
            ("batch.size", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ReplayError::Configuration(_)));

        let err = ChangeStreamConfig::from_properties(&props(&[
            ("changefeed", "t/f"),
            ("consumer", "c"),
            ("threads", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("threads"));
    }

    #[test]
    fn test_blank_query_is_unset() {
        let cfg = ChangeStreamConfig::from_properties(&props(&[
            ("changefeed", "t/f"),
            ("consumer", "c"),
            ("update.query", "   "),
        ]))
        .unwrap();
        assert_eq!(cfg.update_source(), QuerySource::None);
    }

    #[test]
    fn test_deserialize() {
        let cfg: ReplicatorConfig = serde_json::from_str(
            r#"{
                "streams": [
                    {"changefeed": "orders/feed", "consumer": "replay", "update_query_id": "up", "threads": 2}
                ],
                "queries": [
                    {"id": "up", "text": "SELECT * FROM AS_TABLE($rows)", "action": "upsertInto", "table": "orders_copy"}
                ]
            }"#,
        )
        .unwrap();
        let stream = &cfg.streams[0];
        assert_eq!(stream.threads, 2);
        assert_eq!(stream.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(stream.update_source(), QuerySource::Named("up"));
        let query = cfg.query("up").unwrap();
        assert_eq!(query.action.as_deref(), Some("upsertInto"));
        assert!(cfg.query("down").is_none());
    }
}
