//! Message dispatcher over all streams

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::stream::{StreamOrchestrator, StreamSummary};
use super::{SinkError, SinkResult};
use crate::config::IngestConfig;
use crate::protocol::{Message, RecordMessage, SchemaMessage};
use crate::store::StoreClient;

/// Outcome of a whole run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkReport {
    /// Finalized streams
    pub streams: Vec<StreamSummary>,
    /// Failed streams with their error
    pub failures: BTreeMap<String, String>,
}

impl SinkReport {
    /// Whether every stream finalized
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Routes messages to per-stream orchestrators.
///
/// A failing stream is dropped and remembered: its further messages are
/// ignored, STATE messages are no longer echoed, and the final report lists
/// it. Surviving streams keep running.
pub struct Sink<S: StoreClient + ?Sized> {
    store: Arc<S>,
    config: IngestConfig,
    streams: BTreeMap<String, StreamOrchestrator<S>>,
    failures: BTreeMap<String, String>,
}

impl<S: StoreClient + ?Sized> Sink<S> {
    /// Create a sink over `store`
    pub fn new(store: Arc<S>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            streams: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Names of the active streams
    pub fn stream_names(&self) -> Vec<&str> {
        self.streams.keys().map(|s| s.as_str()).collect()
    }

    /// Failed streams with their error
    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failures
    }

    /// Handle one message.
    ///
    /// Returns the STATE value to echo once every stream has flushed.
    ///
    /// # Errors
    ///
    /// [`SinkError::UnknownStream`] for data arriving before its schema.
    /// Stream-level failures are recorded instead of returned.
    pub async fn handle(&mut self, message: Message) -> SinkResult<Option<Value>> {
        match message {
            Message::Schema(schema) => {
                self.declare(schema).await;
                Ok(None)
            }
            Message::Record(record) => {
                self.route(record, false).await?;
                Ok(None)
            }
            Message::Delete(record) => {
                self.route(record, true).await?;
                Ok(None)
            }
            Message::State(state) => Ok(self.checkpoint(state.value).await),
            Message::Unknown => {
                debug!("Skipping message of unknown type");
                Ok(None)
            }
        }
    }

    /// Finalize every surviving stream concurrently
    pub async fn finish(mut self) -> SinkReport {
        let streams = std::mem::take(&mut self.streams);
        let results = join_all(
            streams
                .into_iter()
                .map(|(name, orchestrator)| async move { (name, orchestrator.finalize().await) }),
        )
        .await;

        let mut report = SinkReport {
            streams: Vec::new(),
            failures: self.failures,
        };
        for (name, result) in results {
            match result {
                Ok(summary) => report.streams.push(summary),
                Err(e) => {
                    error!(stream = %name, "Finalization failed: {}", e);
                    report.failures.insert(name, e.to_string());
                }
            }
        }

        info!(
            finalized = report.streams.len(),
            failed = report.failures.len(),
            "Sink finished"
        );
        report
    }

    /// Wind down after the input stopped on a fatal error.
    ///
    /// Staged streams hold a partial replacement load, so their staging
    /// tables are discarded and the stream is reported as failed. Other
    /// streams are finalized as usual.
    pub async fn finish_interrupted(mut self) -> SinkReport {
        let (staged, merged): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(&mut self.streams)
                .into_iter()
                .partition(|(_, orchestrator)| orchestrator.is_staged());

        let discarded = join_all(staged.into_iter().map(|(name, orchestrator)| async move {
            (name, orchestrator.discard().await)
        }))
        .await;
        for (name, result) in discarded {
            if let Err(e) = &result {
                error!(stream = %name, "Failed to discard staging tables: {}", e);
            }
            self.failures
                .insert(name, "input ended before the staged load completed".to_string());
        }

        self.streams = merged;
        self.finish().await
    }

    async fn declare(&mut self, schema: SchemaMessage) {
        let name = schema.stream.clone();
        if self.streams.contains_key(&name) {
            warn!(stream = %name, "Ignoring repeated schema for stream");
            return;
        }
        if self.failures.contains_key(&name) {
            debug!(stream = %name, "Ignoring schema for failed stream");
            return;
        }

        match StreamOrchestrator::prepare(Arc::clone(&self.store), &schema, &self.config).await {
            Ok(orchestrator) => {
                self.streams.insert(name, orchestrator);
            }
            Err(e) => self.fail(name, e),
        }
    }

    async fn route(&mut self, message: RecordMessage, delete: bool) -> SinkResult<()> {
        let name = message.stream;
        let Some(orchestrator) = self.streams.get_mut(&name) else {
            if self.failures.contains_key(&name) {
                return Ok(());
            }
            return Err(SinkError::UnknownStream(name));
        };

        let result = if delete {
            orchestrator.push_delete(&message.record).await
        } else {
            orchestrator.push_record(&message.record).await
        };
        if let Err(e) = result {
            self.fail(name, e);
        }
        Ok(())
    }

    async fn checkpoint(&mut self, value: Value) -> Option<Value> {
        let results = join_all(self.streams.iter_mut().map(|(name, orchestrator)| async move {
            (name.clone(), orchestrator.checkpoint().await)
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                self.fail(name, e);
            }
        }

        if self.failures.is_empty() {
            Some(value)
        } else {
            warn!(
                failed = self.failures.len(),
                "Withholding state: streams have failed"
            );
            None
        }
    }

    fn fail(&mut self, name: String, error: SinkError) {
        error!(stream = %name, "Stream failed: {}", error);
        self.streams.remove(&name);
        self.failures.insert(name, error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StateMessage, parse_line};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn message(line: &str) -> Message {
        parse_line(line, 1).unwrap().unwrap()
    }

    fn schema_line(stream: &str) -> String {
        format!(
            r#"{{"type":"SCHEMA","stream":"{}","schema":{{"type":"object","properties":{{"id":{{"type":"integer"}}}}}},"key_properties":["id"]}}"#,
            stream
        )
    }

    #[tokio::test]
    async fn test_record_before_schema_is_fatal() {
        let mut sink = Sink::new(Arc::new(MemoryStore::default()), IngestConfig::default());
        let err = sink
            .handle(message(r#"{"type":"RECORD","stream":"s","record":{"id":1}}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::UnknownStream(ref s) if s == "s"));
    }

    #[tokio::test]
    async fn test_state_is_echoed_after_flush() {
        let store = Arc::new(MemoryStore::default());
        let mut sink = Sink::new(store.clone(), IngestConfig::default());

        sink.handle(message(&schema_line("a"))).await.unwrap();
        sink.handle(message(r#"{"type":"RECORD","stream":"a","record":{"id":1}}"#))
            .await
            .unwrap();
        let echoed = sink
            .handle(Message::State(StateMessage {
                value: json!({"pos": 1}),
            }))
            .await
            .unwrap();

        assert_eq!(echoed, Some(json!({"pos": 1})));
        assert_eq!(store.rows("a").len(), 1);

        let report = sink.finish().await;
        assert!(report.is_success());
        assert_eq!(report.streams[0].records, 1);
    }

    #[tokio::test]
    async fn test_repeated_schema_is_ignored() {
        let mut sink = Sink::new(Arc::new(MemoryStore::default()), IngestConfig::default());
        sink.handle(message(&schema_line("a"))).await.unwrap();
        sink.handle(message(&schema_line("a"))).await.unwrap();
        assert_eq!(sink.stream_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_stream_blocks_state() {
        let store = Arc::new(MemoryStore::default());
        let mut sink = Sink::new(store.clone(), IngestConfig::default());

        sink.handle(message(&schema_line("good"))).await.unwrap();
        sink.handle(message(&schema_line("bad"))).await.unwrap();
        sink.handle(message(r#"{"type":"RECORD","stream":"bad","record":{"name":"no key"}}"#))
            .await
            .unwrap();
        sink.handle(message(r#"{"type":"RECORD","stream":"bad","record":{"id":2}}"#))
            .await
            .unwrap();
        sink.handle(message(r#"{"type":"RECORD","stream":"good","record":{"id":1}}"#))
            .await
            .unwrap();

        assert!(sink.failures().contains_key("bad"));
        let echoed = sink
            .handle(message(r#"{"type":"STATE","value":1}"#))
            .await
            .unwrap();
        assert_eq!(echoed, None);

        let report = sink.finish().await;
        assert!(!report.is_success());
        assert_eq!(report.streams.len(), 1);
        assert_eq!(store.rows("good").len(), 1);
        assert!(store.rows("bad").is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_run_keeps_canonical_tables() {
        let store = Arc::new(MemoryStore::default());
        let mut seed = Sink::new(store.clone(), IngestConfig::default());
        seed.handle(message(&schema_line("a"))).await.unwrap();
        seed.handle(message(r#"{"type":"RECORD","stream":"a","record":{"id":9}}"#))
            .await
            .unwrap();
        assert!(seed.finish().await.is_success());

        let mut sink = Sink::new(store.clone(), IngestConfig::default());
        sink.handle(message(
            r#"{"type":"SCHEMA","stream":"a","schema":{"type":"object","properties":{"id":{"type":"integer"}}},"key_properties":["id"],"clean_first":true}"#,
        ))
        .await
        .unwrap();
        sink.handle(message(&schema_line("b"))).await.unwrap();
        sink.handle(message(r#"{"type":"RECORD","stream":"a","record":{"id":1}}"#))
            .await
            .unwrap();
        sink.handle(message(r#"{"type":"RECORD","stream":"b","record":{"id":2}}"#))
            .await
            .unwrap();

        let report = sink.finish_interrupted().await;
        assert!(report.failures.contains_key("a"));
        assert_eq!(report.streams.len(), 1);
        assert_eq!(store.row_values("a", &["id"]), vec![vec![json!(9)]]);
        assert_eq!(store.row_values("b", &["id"]), vec![vec![json!(2)]]);
        assert!(!store.table_names().iter().any(|t| t.starts_with("_tmp_")));
    }

    #[tokio::test]
    async fn test_invalid_schema_fails_stream_only() {
        let mut sink = Sink::new(Arc::new(MemoryStore::default()), IngestConfig::default());
        sink.handle(message(
            r#"{"type":"SCHEMA","stream":"x","schema":{"type":"object","properties":{"id":{"type":"integer"}}},"key_properties":["missing"]}"#,
        ))
        .await
        .unwrap();
        assert!(sink.failures().contains_key("x"));
        sink.handle(message(r#"{"type":"RECORD","stream":"x","record":{"id":1}}"#))
            .await
            .unwrap();
    }
}
