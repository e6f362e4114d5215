//! Inbound message protocol
//!
//! Newline-delimited JSON, one message per line, tagged by `type`:
//!
//! ```text
//! {"type": "SCHEMA", "stream": "users", "schema": {...}, "key_properties": ["id"]}
//! {"type": "RECORD", "stream": "users", "record": {"id": 1}}
//! {"type": "DELETE", "stream": "users", "record": {"id": 1}}
//! {"type": "STATE", "value": {"bookmark": 42}}
//! ```
//!
//! Unknown message types deserialize to [`Message::Unknown`] and are skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for protocol parsing
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message on line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("Failed to read input: {0}")]
    Io(String),
}

/// Result type for protocol parsing
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Stream declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMessage {
    pub stream: String,
    /// JSON Schema of one record
    pub schema: Value,
    #[serde(default)]
    pub key_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaning_column: Option<String>,
    /// Replace the stream's tables instead of merging into them
    #[serde(default)]
    pub clean_first: bool,
}

/// Record or logical delete of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Value,
}

/// Checkpoint marker, echoed once everything before it is flushed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub value: Value,
}

/// Inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    Delete(RecordMessage),
    State(StateMessage),
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Stream the message belongs to, if any
    pub fn stream(&self) -> Option<&str> {
        match self {
            Message::Schema(m) => Some(&m.stream),
            Message::Record(m) | Message::Delete(m) => Some(&m.stream),
            Message::State(_) | Message::Unknown => None,
        }
    }
}

/// Parse one input line.
///
/// Returns `Ok(None)` for blank lines. `line_no` is 1-based and only used in
/// error messages.
pub fn parse_line(line: &str, line_no: usize) -> ProtocolResult<Option<Message>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed {
            line: line_no,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_schema() {
        let line = r#"{"type": "SCHEMA", "stream": "users", "schema": {"type": "object"}, "key_properties": ["id"], "clean_first": true}"#;
        match parse_line(line, 1).unwrap() {
            Some(Message::Schema(schema)) => {
                assert_eq!(schema.stream, "users");
                assert_eq!(schema.key_properties, vec!["id"]);
                assert!(schema.clean_first);
                assert!(schema.cleaning_column.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_record_delete_and_state() {
        let record = parse_line(r#"{"type":"RECORD","stream":"s","record":{"id":1}}"#, 1)
            .unwrap()
            .unwrap();
        assert_eq!(record.stream(), Some("s"));
        assert!(matches!(record, Message::Record(ref m) if m.record == json!({"id": 1})));

        let delete = parse_line(r#"{"type":"DELETE","stream":"s","record":{"id":1}}"#, 2)
            .unwrap()
            .unwrap();
        assert!(matches!(delete, Message::Delete(_)));

        let state = parse_line(r#"{"type":"STATE","value":{"bookmark":3}}"#, 3)
            .unwrap()
            .unwrap();
        assert_eq!(
            state,
            Message::State(StateMessage {
                value: json!({"bookmark": 3})
            })
        );
    }

    #[test]
    fn test_unknown_and_blank_lines() {
        assert_eq!(
            parse_line(r#"{"type":"ACTIVATE_VERSION","stream":"s"}"#, 1).unwrap(),
            Some(Message::Unknown)
        );
        assert_eq!(parse_line("   ", 2).unwrap(), None);
    }

    #[test]
    fn test_malformed_line_carries_line_number() {
        let err = parse_line("{not json", 7).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { line: 7, .. }));
        assert!(parse_line(r#"{"type":"RECORD","stream":"s"}"#, 8).is_err());
    }
}
