//! CDC envelope parsing.
//!
//! A changefeed message is a JSON object:
//!
//! ```json
//! {"key": [42, "eu"], "update": {"amount": "10.50"}}
//! {"key": [42, "eu"], "newImage": {"amount": "10.50", "note": null}}
//! {"key": [42, "eu"], "erase": {}}
//! ```
//!
//! `key` holds one element per primary-key column in table key order.
//! `newImage` takes precedence over `update` (changefeeds in
//! `NEW_AND_OLD_IMAGES` mode send both, with an empty `update`).
//! An `erase` marker of `true` or an object turns the event into a deletion;
//! `false` and other scalars are ignored as if the marker were absent.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Whether a change event updates or erases its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row inserted or updated.
    Update,
    /// Row deleted.
    Erase,
}

/// One decoded row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Primary key values in table key order.
    pub key: Vec<Value>,
    /// Non-key column values; `None` for erase events.
    pub payload: Option<Map<String, Value>>,
    /// Update or erase.
    pub kind: ChangeKind,
    /// Event time reported by the changefeed.
    pub created_at: DateTime<Utc>,
    /// Time the message was written to the topic.
    pub written_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Returns `true` for erase events.
    #[must_use]
    pub fn is_erase(&self) -> bool {
        self.kind == ChangeKind::Erase
    }

    /// Returns the key element at a key-order index.
    #[must_use]
    pub fn key_value(&self, index: usize) -> Option<&Value> {
        self.key.get(index)
    }

    /// Returns the payload value of a non-key column.
    #[must_use]
    pub fn column_value(&self, name: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(name))
    }
}

/// Outcome of parsing one message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A well-formed change event.
    Change(ChangeEvent),
    /// Valid JSON that is not a change envelope; dropped by the writer.
    Unsupported {
        /// Why the message was rejected.
        reason: &'static str,
    },
}

/// Parses a raw message payload into a change event.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] if the payload is not valid JSON.
pub fn parse(
    data: &[u8],
    created_at: DateTime<Utc>,
    written_at: DateTime<Utc>,
) -> Result<Envelope, DecodeError> {
    let root: Value = serde_json::from_slice(data)?;

    let Value::Object(mut root) = root else {
        return Ok(unsupported("message is not a JSON object"));
    };

    let key = match root.remove("key") {
        Some(Value::Array(key)) => key,
        Some(_) => return Ok(unsupported("\"key\" is not an array")),
        None => return Ok(unsupported("missing \"key\" array")),
    };

    let erase = matches!(root.get("erase"), Some(Value::Bool(true) | Value::Object(_)));
    let (kind, payload) = if erase {
        (ChangeKind::Erase, None)
    } else {
        let image = match root.remove("newImage") {
            Some(Value::Null) | None => root.remove("update"),
            image => image,
        };
        match image {
            Some(Value::Object(payload)) => (ChangeKind::Update, Some(payload)),
            Some(Value::Null) | None => return Ok(unsupported("neither update nor erase marker")),
            Some(_) => return Ok(unsupported("update payload is not an object")),
        }
    };

    Ok(Envelope::Change(ChangeEvent {
        key,
        payload,
        kind,
        created_at,
        written_at,
    }))
}

fn unsupported(reason: &'static str) -> Envelope {
    Envelope::Unsupported { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_str(s: &str) -> Result<Envelope, DecodeError> {
        let now = Utc::now();
        parse(s.as_bytes(), now, now)
    }

    fn change(s: &str) -> ChangeEvent {
        match parse_str(s).unwrap() {
            Envelope::Change(event) => event,
            Envelope::Unsupported { reason } => panic!("unexpected drop: {reason}"),
        }
    }

    #[test]
    fn test_update() {
        let ev = change(r#"{"key":[1,"a"],"update":{"v":10}}"#);
        assert_eq!(ev.kind, ChangeKind::Update);
        assert_eq!(ev.key_value(0), Some(&json!(1)));
        assert_eq!(ev.key_value(1), Some(&json!("a")));
        assert_eq!(ev.column_value("v"), Some(&json!(10)));
        assert!(ev.column_value("missing").is_none());
    }

    #[test]
    fn test_new_image_wins_over_update() {
        let ev = change(r#"{"key":[1],"update":{},"newImage":{"v":"x"},"oldImage":{"v":"y"}}"#);
        assert_eq!(ev.column_value("v"), Some(&json!("x")));
    }

    #[test]
    fn test_erase() {
        let ev = change(r#"{"key":["42"],"erase":true}"#);
        assert!(ev.is_erase());
        assert!(ev.payload.is_none());
        assert_eq!(ev.key, vec![json!("42")]);

        let ev = change(r#"{"key":[7],"erase":{},"oldImage":{"v":1}}"#);
        assert!(ev.is_erase());
    }

    #[test]
    fn test_false_erase_is_not_a_deletion() {
        let ev = change(r#"{"key":[1],"erase":false,"update":{"v":2}}"#);
        assert!(!ev.is_erase());
        assert_eq!(ev.column_value("v"), Some(&json!(2)));
    }

    #[test]
    fn test_empty_update_is_valid() {
        let ev = change(r#"{"key":[1],"update":{}}"#);
        assert_eq!(ev.payload, Some(Map::new()));
    }

    #[test]
    fn test_unsupported_shapes() {
        for msg in [
            "[1,2]",
            r#"{"update":{"v":1}}"#,
            r#"{"key":1,"update":{}}"#,
            r#"{"key":[1]}"#,
            r#"{"key":[1],"erase":null}"#,
            r#"{"key":[1],"erase":false}"#,
            r#"{"key":[1],"erase":"yes"}"#,
            r#"{"key":[1],"update":[1]}"#,
        ] {
            assert!(
                matches!(parse_str(msg).unwrap(), Envelope::Unsupported { .. }),
                "{msg}"
            );
        }
    }

    #[test]
    fn test_invalid_json() {
        let err = parse_str("{\"key\":[1],").unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }
}
