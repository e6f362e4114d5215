//! Shared fixtures for integration tests

#![allow(dead_code)]

use data_modelling_sink::cli::CliError;
use data_modelling_sink::cli::commands::run::run_sink;
use data_modelling_sink::config::IngestConfig;
use data_modelling_sink::orchestrator::{Sink, SinkReport};
use data_modelling_sink::store::MemoryStore;
use serde_json::{Value, json};
use std::sync::Arc;

/// Schema of the `users` stream: a scalar, an object array and a nested object
pub fn users_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer"},
            "name": {"type": "string"},
            "tags": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}}
                }
            }
        }
    })
}

/// SCHEMA line for `stream`
pub fn schema_line(stream: &str, schema: &Value, keys: &[&str]) -> String {
    json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": schema,
        "key_properties": keys,
    })
    .to_string()
}

/// SCHEMA line with explicit loading options
pub fn schema_line_with(
    stream: &str,
    schema: &Value,
    keys: &[&str],
    cleaning_column: Option<&str>,
    clean_first: bool,
) -> String {
    let mut line = json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": schema,
        "key_properties": keys,
        "clean_first": clean_first,
    });
    if let Some(column) = cleaning_column {
        line["cleaning_column"] = json!(column);
    }
    line.to_string()
}

pub fn record_line(stream: &str, record: Value) -> String {
    json!({"type": "RECORD", "stream": stream, "record": record}).to_string()
}

pub fn delete_line(stream: &str, record: Value) -> String {
    json!({"type": "DELETE", "stream": stream, "record": record}).to_string()
}

pub fn state_line(value: Value) -> String {
    json!({"type": "STATE", "value": value}).to_string()
}

/// Run `lines` through a sink over `store`, returning the report and the
/// echoed output
pub async fn run_lines(
    store: &Arc<MemoryStore>,
    config: IngestConfig,
    lines: &[String],
) -> (Result<SinkReport, CliError>, String) {
    let input = lines.join("\n");
    let mut output = Vec::new();
    let result = run_sink(Sink::new(Arc::clone(store), config), input.as_bytes(), &mut output).await;
    (result, String::from_utf8(output).unwrap())
}
