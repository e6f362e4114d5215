//! Streaming ingestion of records into a descriptor tree
//!
//! One [`IngestionEngine`] serves one stream for one checkpoint generation.
//! Each record is fanned out over the tree into rows (see [`rows`]), rows are
//! batched per table by a lazily created [`TableWriter`] and streamed to the
//! store. Logical deletes go through the [`DeletedRecordBatcher`].

pub mod deleted;
pub mod rows;
pub mod writer;

pub use deleted::DeletedRecordBatcher;
pub use rows::{PlannedRow, plan_rows};
pub use writer::{TableWriter, WriterStats};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::models::TableDescriptor;
use crate::store::{StoreClient, StoreError};

/// Error type for ingestion
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    /// A key column had no value in the record
    #[error("Missing value for key column '{column}' of table '{table}'")]
    MissingKey { table: String, column: String },

    /// Delete pushed for a table without OWN keys
    #[error("Cannot delete from '{table}': table has no key columns")]
    NoDeleteKey { table: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The writer was closed before the push
    #[error("Writer for '{0}' is closed")]
    WriterClosed(String),

    /// The idle timer task of a writer panicked
    #[error("Idle timer of '{table}' failed: {message}")]
    TimerFailed { table: String, message: String },

    /// An earlier failure aborted the engine
    #[error("Ingestion aborted: {0}")]
    Aborted(String),
}

/// Result type for ingestion
pub type IngestResult<T> = Result<T, IngestError>;

/// Callback invoked once per failure, before the failing call returns
pub type AbortCallback = Arc<dyn Fn(&IngestError) + Send + Sync>;

/// Batching and coercion settings of an engine
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    /// Rows per table before a flush
    pub batch_size: usize,
    /// Idle time after the last push before a partial batch is flushed
    pub idle_flush: Duration,
    /// Coerce values to their column types
    pub translate_values: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for IngestSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            idle_flush: config.idle_flush(),
            translate_values: config.translate_values,
        }
    }
}

/// Statistics of one engine generation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    /// Root records pushed
    pub records: u64,
    /// Per-table writer statistics
    pub tables: BTreeMap<String, WriterStats>,
}

impl IngestStats {
    /// Rows written across all tables
    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|s| s.rows).sum()
    }

    /// Rows written to `table`
    pub fn rows_for(&self, table: &str) -> u64 {
        self.tables.get(table).map(|s| s.rows).unwrap_or(0)
    }
}

/// Record fan-out and per-table batching for one stream generation
pub struct IngestionEngine<S: StoreClient + ?Sized> {
    store: Arc<S>,
    descriptor: Arc<TableDescriptor>,
    settings: IngestSettings,
    writers: BTreeMap<String, TableWriter>,
    version: u64,
    records: u64,
    on_abort: AbortCallback,
    failure: Option<IngestError>,
}

impl<S: StoreClient + ?Sized> IngestionEngine<S> {
    /// Create an engine.
    ///
    /// # Arguments
    ///
    /// * `store` - Store client shared with the orchestrator
    /// * `descriptor` - Tree the records are fanned out over
    /// * `settings` - Batching settings
    /// * `base_version` - Root version baseline; the first record gets `+1`
    /// * `on_abort` - Invoked on every ingestion failure
    pub fn new(
        store: Arc<S>,
        descriptor: Arc<TableDescriptor>,
        settings: IngestSettings,
        base_version: u64,
        on_abort: AbortCallback,
    ) -> Self {
        Self {
            store,
            descriptor,
            settings,
            writers: BTreeMap::new(),
            version: base_version,
            records: 0,
            on_abort,
            failure: None,
        }
    }

    /// Version assigned to the most recent record
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records pushed so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Rows buffered across all writers
    pub async fn pending_rows(&self) -> usize {
        let mut pending = 0;
        for writer in self.writers.values() {
            pending += writer.pending().await;
        }
        pending
    }

    /// Fan `record` out over the tree and push its rows.
    ///
    /// All rows are planned before any is pushed; a record with a missing key
    /// anywhere pushes nothing.
    pub async fn push_record(&mut self, record: &Value) -> IngestResult<()> {
        if let Some(failure) = &self.failure {
            return Err(IngestError::Aborted(failure.to_string()));
        }

        let version = self.version + 1;
        let rows = match plan_rows(
            &self.descriptor,
            record,
            version,
            self.settings.translate_values,
        ) {
            Ok(rows) => rows,
            Err(e) => return Err(self.abort(e)),
        };

        self.version = version;
        self.records += 1;

        for PlannedRow { table, values } in rows {
            if !self.writers.contains_key(&table) {
                let columns = self
                    .descriptor
                    .find(&table)
                    .map(|t| t.insert_columns())
                    .unwrap_or_default();
                debug!(table = %table, "Creating table writer");
                self.writers.insert(
                    table.clone(),
                    TableWriter::new(
                        table.clone(),
                        columns,
                        self.settings.clone(),
                        self.on_abort.clone(),
                    ),
                );
            }
            let Some(writer) = self.writers.get_mut(&table) else {
                continue;
            };
            if let Err(e) = writer.push(self.store.as_ref(), values).await {
                self.failure = Some(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flush every writer's pending batch without closing it
    pub async fn flush(&mut self) -> IngestResult<()> {
        for writer in self.writers.values_mut() {
            if let Err(e) = writer.flush().await {
                self.failure = Some(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flush, close and await every writer.
    ///
    /// Writers that never received a row were never created and produce no
    /// traffic.
    pub async fn end_ingestion(mut self) -> IngestResult<IngestStats> {
        if let Some(failure) = self.failure.take() {
            return Err(IngestError::Aborted(failure.to_string()));
        }

        let results = join_all(self.writers.values_mut().map(|w| w.end())).await;

        let mut stats = IngestStats {
            records: self.records,
            tables: BTreeMap::new(),
        };
        for result in results {
            let (table, writer_stats) = result?;
            stats.tables.insert(table, writer_stats);
        }

        info!(
            table = %self.descriptor.table_name,
            records = stats.records,
            rows = stats.total_rows(),
            "Ingestion generation finished"
        );
        Ok(stats)
    }

    fn abort(&mut self, error: IngestError) -> IngestError {
        (self.on_abort)(&error);
        self.failure = Some(error.clone());
        error
    }
}

/// Abort callback that does nothing
pub fn ignore_abort() -> AbortCallback {
    Arc::new(|_| {})
}
