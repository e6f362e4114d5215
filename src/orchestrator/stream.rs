//! Per-stream orchestration
//!
//! A [`StreamOrchestrator`] owns the compiled tree of one logical stream and
//! drives it through its lifecycle:
//!
//! 1. **Prepare**: compile, create tables, reconcile drift, read the version
//!    baseline. Clean-first runs load into freshly created `_tmp_` staging
//!    tables, or truncate the canonical tables when direct insert is
//!    configured.
//! 2. **Ingest**: records go through an [`IngestionEngine`]; the first record
//!    carrying a new cleaning-column value purges matching rows first.
//!    Deletes are batched and never overtake pending inserts.
//! 3. **Checkpoint**: ends the current engine generation and flushes deletes.
//! 4. **Finalize**: deduplicates the root, purges orphans, checks key
//!    integrity and swaps staging tables in.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

use super::reconcile::reconcile_tree;
use super::{SinkError, SinkResult};
use crate::config::IngestConfig;
use crate::ddl::{generate_create_statements, statements};
use crate::extract::{extract_value, navigate};
use crate::ingest::{
    AbortCallback, DeletedRecordBatcher, IngestSettings, IngestStats, IngestionEngine,
};
use crate::models::{KeyRole, TableDescriptor};
use crate::naming::sql_literal;
use crate::protocol::SchemaMessage;
use crate::schema::compile_schema;
use crate::store::{Query, StoreClient};

/// Table name prefix of staging tables
pub const STAGING_PREFIX: &str = "_tmp_";

/// Outcome of a finalized stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSummary {
    pub stream: String,
    /// Records ingested
    pub records: u64,
    /// Delete key tuples applied
    pub deletes: u64,
    /// Rows written per table
    pub rows: BTreeMap<String, u64>,
    /// Version of the last record
    pub version: u64,
    /// Engine generations, one per checkpoint plus the final one
    pub generations: u64,
}

impl StreamSummary {
    fn absorb(&mut self, stats: &IngestStats) {
        self.records += stats.records;
        for (table, writer) in &stats.tables {
            *self.rows.entry(table.clone()).or_default() += writer.rows;
        }
        self.generations += 1;
    }
}

/// Orchestrator of one logical stream
pub struct StreamOrchestrator<S: StoreClient + ?Sized> {
    stream: String,
    store: Arc<S>,
    config: IngestConfig,
    canonical: Arc<TableDescriptor>,
    /// Tree rows are written to: staging tables in staged runs
    target: Arc<TableDescriptor>,
    clean_first: bool,
    staged: bool,
    engine: Option<IngestionEngine<S>>,
    deletes: DeletedRecordBatcher,
    version: u64,
    seen_cleaning_values: HashSet<String>,
    summary: StreamSummary,
    aborted: Arc<AtomicBool>,
}

impl<S: StoreClient + ?Sized> StreamOrchestrator<S> {
    /// Compile the declared schema and prepare the stream's tables.
    ///
    /// # Arguments
    ///
    /// * `store` - Shared store client
    /// * `declaration` - SCHEMA message of the stream
    /// * `config` - Ingestion settings
    pub async fn prepare(
        store: Arc<S>,
        declaration: &SchemaMessage,
        config: &IngestConfig,
    ) -> SinkResult<Self> {
        let stream = declaration.stream.clone();
        let canonical = compile_schema(
            &stream,
            &declaration.schema,
            &declaration.key_properties,
            declaration.cleaning_column.as_deref(),
            &config.compile_options(),
        )?;

        let clean_first = declaration.clean_first;
        let staged = clean_first && !config.direct_insert;
        let target = if staged {
            canonical.with_name_prefix(STAGING_PREFIX)
        } else {
            canonical.clone()
        };

        for sql in generate_create_statements(&canonical) {
            store.run_query(&Query::idempotent(sql)).await?;
        }

        if staged {
            for table in target.walk() {
                store
                    .run_query(&Query::idempotent(statements::drop_table(&table.table_name)))
                    .await?;
            }
            for sql in generate_create_statements(&target) {
                store.run_query(&Query::idempotent(sql)).await?;
            }
        } else {
            let report = reconcile_tree(store.as_ref(), &canonical).await?;
            if report.has_changes() {
                info!(stream = %stream, ?report, "Applied schema drift");
            }
            if clean_first {
                for table in canonical.walk() {
                    store
                        .run_query(&Query::idempotent(statements::truncate_table(
                            &table.table_name,
                        )))
                        .await?;
                }
            }
        }

        let version = if clean_first
            || !(canonical.is_key_bearing() || canonical.cleaning_column.is_some())
        {
            0
        } else {
            read_max_version(store.as_ref(), &canonical).await?
        };

        info!(
            stream = %stream,
            tables = target.walk().len(),
            clean_first,
            staged,
            version,
            "Prepared stream"
        );

        let target = Arc::new(target);
        let deletes = DeletedRecordBatcher::new(&target, config.delete_batch_size);
        let mut orchestrator = Self {
            summary: StreamSummary {
                stream: stream.clone(),
                version,
                ..StreamSummary::default()
            },
            stream,
            store,
            config: config.clone(),
            canonical: Arc::new(canonical),
            target,
            clean_first,
            staged,
            engine: None,
            deletes,
            version,
            seen_cleaning_values: HashSet::new(),
            aborted: Arc::new(AtomicBool::new(false)),
        };
        orchestrator.engine = Some(orchestrator.new_engine());
        Ok(orchestrator)
    }

    /// Stream name
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Compiled canonical tree
    pub fn descriptor(&self) -> &TableDescriptor {
        &self.canonical
    }

    /// Whether rows go to staging tables
    pub fn is_staged(&self) -> bool {
        self.staged
    }

    /// Ingest one record
    pub async fn push_record(&mut self, record: &Value) -> SinkResult<()> {
        self.ensure_healthy()?;

        if self.deletes.pending() > 0 {
            self.flush_deletes().await?;
        }
        if !self.clean_first {
            self.purge_cleaning_value(record).await?;
        }

        let engine = self.engine_mut()?;
        engine.push_record(record).await?;
        Ok(())
    }

    /// Queue a logical delete.
    ///
    /// When the delete batch is full, pending inserts are completed before the
    /// batch is sent.
    pub async fn push_delete(&mut self, record: &Value) -> SinkResult<()> {
        self.ensure_healthy()?;
        if self.deletes.queue(record)? {
            self.flush_deletes().await?;
        }
        Ok(())
    }

    /// End the current engine generation and flush pending deletes
    pub async fn checkpoint(&mut self) -> SinkResult<()> {
        self.ensure_healthy()?;
        self.flush_deletes().await?;
        debug!(stream = %self.stream, version = self.version, "Checkpoint complete");
        Ok(())
    }

    /// Complete the stream: deduplicate, purge orphans, verify and swap
    pub async fn finalize(mut self) -> SinkResult<StreamSummary> {
        self.ensure_healthy()?;
        if let Some(engine) = self.engine.take() {
            self.finish_engine(engine).await?;
        }
        self.send_deletes().await?;

        let root = Arc::clone(&self.target);
        let written = self.summary.records > 0 || self.summary.deletes > 0;

        if root.is_key_bearing() && written {
            if self.summary.records > 0 {
                self.run(statements::optimize_final(&root.table_name)).await?;
            }
            self.purge_orphans(&root).await?;
        }

        self.check_integrity(&root).await?;

        if self.staged {
            self.swap_staging_tables().await?;
        }

        self.summary.version = self.version;
        info!(
            stream = %self.stream,
            records = self.summary.records,
            deletes = self.summary.deletes,
            version = self.version,
            "Finalized stream"
        );
        Ok(self.summary)
    }

    /// Abandon a staged load: uncommitted inserts are dropped and the staging
    /// tables removed, leaving the canonical tables untouched
    pub async fn discard(mut self) -> SinkResult<()> {
        drop(self.engine.take());
        for table in self.target.walk() {
            self.run(statements::drop_table(&table.table_name)).await?;
        }
        info!(stream = %self.stream, "Discarded staging tables");
        Ok(())
    }

    fn new_engine(&self) -> IngestionEngine<S> {
        let aborted = Arc::clone(&self.aborted);
        let stream = self.stream.clone();
        let on_abort: AbortCallback = Arc::new(move |e| {
            error!(stream = %stream, "Ingestion aborted: {}", e);
            aborted.store(true, Ordering::SeqCst);
        });
        IngestionEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.target),
            IngestSettings::from(&self.config),
            self.version,
            on_abort,
        )
    }

    fn engine_mut(&mut self) -> SinkResult<&mut IngestionEngine<S>> {
        self.engine
            .as_mut()
            .ok_or_else(|| SinkError::StreamFailed(self.stream.clone()))
    }

    fn ensure_healthy(&self) -> SinkResult<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(SinkError::StreamFailed(self.stream.clone()));
        }
        Ok(())
    }

    async fn finish_engine(&mut self, engine: IngestionEngine<S>) -> SinkResult<()> {
        self.version = engine.version();
        let stats = engine.end_ingestion().await?;
        self.summary.absorb(&stats);
        Ok(())
    }

    /// Close the current generation so every pushed row is committed
    async fn rotate_engine(&mut self) -> SinkResult<()> {
        if let Some(engine) = self.engine.take() {
            self.finish_engine(engine).await?;
        }
        self.engine = Some(self.new_engine());
        Ok(())
    }

    async fn flush_deletes(&mut self) -> SinkResult<()> {
        self.rotate_engine().await?;
        self.send_deletes().await
    }

    async fn send_deletes(&mut self) -> SinkResult<()> {
        if self.deletes.pending() > 0 {
            let before = self.deletes.deleted();
            self.deletes.flush(self.store.as_ref()).await?;
            self.summary.deletes += self.deletes.deleted() - before;
        }
        Ok(())
    }

    async fn purge_cleaning_value(&mut self, record: &Value) -> SinkResult<()> {
        let Some(column) = self.canonical.cleaning_column.clone() else {
            return Ok(());
        };

        let value = match self.canonical.column(&column) {
            Some(value_column) => {
                extract_value(record, value_column, self.config.translate_values)
            }
            None => navigate(record, &[&column]).cloned(),
        }
        .unwrap_or(Value::Null);

        if !self.seen_cleaning_values.insert(sql_literal(&value)) {
            return Ok(());
        }

        debug!(stream = %self.stream, column = %column, value = %value, "Purging rows for new cleaning value");
        let root = Arc::clone(&self.target);
        let root_columns = root_identity(&root);
        for child in root.descendants() {
            self.run(statements::delete_descendants_where(
                &child.table_name,
                &root_reference(child),
                &root.table_name,
                &root_columns,
                &column,
                &value,
            ))
            .await?;
        }
        self.run(statements::delete_where_equals(
            &root.table_name,
            &column,
            &value,
        ))
        .await
    }

    /// Delete descendant rows whose root key and version no longer exist
    async fn purge_orphans(&self, root: &TableDescriptor) -> SinkResult<()> {
        let root_columns = root_identity(root);
        for child in root.descendants() {
            let child_columns = root_reference(child);
            self.run(statements::delete_orphans(
                &child.table_name,
                &child_columns,
                &root.table_name,
                &root_columns,
            ))
            .await?;
        }
        Ok(())
    }

    /// Fail when any key-bearing table holds a key tuple more than once
    async fn check_integrity(&self, root: &TableDescriptor) -> SinkResult<()> {
        for table in root.walk().into_iter().filter(|t| t.is_key_bearing()) {
            let columns = table.order_by();
            let result = self
                .store
                .run_query(&Query::idempotent(statements::find_duplicate_keys(
                    &table.table_name,
                    &columns,
                )))
                .await?;

            if let Some(row) = result.rows.first() {
                let key: Vec<String> = columns
                    .iter()
                    .map(|c| row.get(c).map(|v| v.to_string()).unwrap_or_default())
                    .collect();
                return Err(SinkError::Integrity {
                    table: table.table_name.clone(),
                    key: format!("({})", key.join(", ")),
                });
            }
        }
        Ok(())
    }

    async fn swap_staging_tables(&self) -> SinkResult<()> {
        for (staging, canonical) in self.target.walk().into_iter().zip(self.canonical.walk()) {
            self.store
                .run_query(&Query::once(statements::exchange_tables(
                    &staging.table_name,
                    &canonical.table_name,
                )))
                .await?;
            self.run(statements::drop_table(&staging.table_name)).await?;
        }
        info!(stream = %self.stream, "Swapped staging tables into place");
        Ok(())
    }

    async fn run(&self, sql: String) -> SinkResult<()> {
        self.store.run_query(&Query::idempotent(sql)).await?;
        Ok(())
    }
}

/// Root OWN key columns followed by the root's version column
fn root_identity(root: &TableDescriptor) -> Vec<String> {
    root.own_keys()
        .iter()
        .map(|k| k.name.clone())
        .chain(std::iter::once(root.version_column().to_string()))
        .collect()
}

/// ROOT_REF columns of a descendant followed by its version column
fn root_reference(child: &TableDescriptor) -> Vec<String> {
    child
        .key_columns
        .iter()
        .filter(|k| k.role == KeyRole::RootRef)
        .map(|k| k.name.clone())
        .chain(std::iter::once(child.version_column().to_string()))
        .collect()
}

async fn read_max_version<S: StoreClient + ?Sized>(
    store: &S,
    root: &TableDescriptor,
) -> SinkResult<u64> {
    let result = store
        .run_query(&Query::idempotent(statements::max_version(
            &root.table_name,
            root.version_column(),
        )))
        .await?;
    let version = match result.first_value(statements::MAX_VERSION_ALIAS) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn declaration(clean_first: bool, cleaning: Option<&str>) -> SchemaMessage {
        SchemaMessage {
            stream: "users".to_string(),
            schema: json!({"type": "object", "properties": {
                "id": {"type": "integer"},
                "team": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }}),
            key_properties: vec!["id".to_string()],
            cleaning_column: cleaning.map(|c| c.to_string()),
            clean_first,
        }
    }

    #[tokio::test]
    async fn test_version_baseline_from_existing_rows() {
        let store = Arc::new(MemoryStore::default());
        let config = IngestConfig::default();

        let mut first = StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
            .await
            .unwrap();
        first.push_record(&json!({"id": 1, "team": "a"})).await.unwrap();
        first.push_record(&json!({"id": 2, "team": "a"})).await.unwrap();
        assert_eq!(first.finalize().await.unwrap().version, 2);

        let mut second = StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
            .await
            .unwrap();
        second.push_record(&json!({"id": 1, "team": "b"})).await.unwrap();
        let summary = second.finalize().await.unwrap();
        assert_eq!(summary.version, 3);
        assert_eq!(
            store.row_values("users", &["id", "team", "_ver"]),
            vec![
                vec![json!(1), json!("b"), json!(3)],
                vec![json!(2), json!("a"), json!(2)],
            ]
        );
    }

    #[tokio::test]
    async fn test_deletes_follow_pending_inserts() {
        let store = Arc::new(MemoryStore::default());
        let config = IngestConfig {
            delete_batch_size: 1,
            ..IngestConfig::default()
        };
        let mut orchestrator =
            StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
                .await
                .unwrap();

        orchestrator
            .push_record(&json!({"id": 1, "tags": ["x"]}))
            .await
            .unwrap();
        orchestrator.push_delete(&json!({"id": 1})).await.unwrap();
        let summary = orchestrator.finalize().await.unwrap();

        assert_eq!(summary.deletes, 1);
        assert!(store.rows("users").is_empty());
        assert!(store.rows("users__tags").is_empty());
    }

    #[tokio::test]
    async fn test_reinsert_after_delete_survives() {
        let store = Arc::new(MemoryStore::default());
        let mut orchestrator =
            StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &IngestConfig::default())
                .await
                .unwrap();

        orchestrator
            .push_record(&json!({"id": 1, "team": "old"}))
            .await
            .unwrap();
        orchestrator.push_delete(&json!({"id": 1})).await.unwrap();
        orchestrator
            .push_record(&json!({"id": 1, "team": "new"}))
            .await
            .unwrap();
        let summary = orchestrator.finalize().await.unwrap();

        assert_eq!(summary.deletes, 1);
        assert_eq!(
            store.row_values("users", &["id", "team"]),
            vec![vec![json!(1), json!("new")]]
        );
    }

    #[tokio::test]
    async fn test_cleaning_purge_removes_descendants() {
        let store = Arc::new(MemoryStore::default());
        let declaration = SchemaMessage {
            stream: "ev".to_string(),
            schema: json!({"type": "object", "properties": {
                "day": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }}),
            key_properties: Vec::new(),
            cleaning_column: Some("day".to_string()),
            clean_first: false,
        };

        for _ in 0..2 {
            let mut run = StreamOrchestrator::prepare(store.clone(), &declaration, &IngestConfig::default())
                .await
                .unwrap();
            run.push_record(&json!({"day": "mon", "tags": ["x", "y"]}))
                .await
                .unwrap();
            run.finalize().await.unwrap();
        }

        assert_eq!(store.row_values("ev", &["day", "_root_ver"]), vec![vec![json!("mon"), json!(2)]]);
        assert_eq!(
            store.row_values("ev__tags", &["value", "_root_ver"]),
            vec![vec![json!("x"), json!(2)], vec![json!("y"), json!(2)]]
        );
    }

    #[tokio::test]
    async fn test_cleaning_column_purges_once_per_value() {
        let store = Arc::new(MemoryStore::default());
        let config = IngestConfig::default();

        let mut seed = StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
            .await
            .unwrap();
        seed.push_record(&json!({"id": 1, "team": "red"})).await.unwrap();
        seed.push_record(&json!({"id": 2, "team": "blue"})).await.unwrap();
        seed.finalize().await.unwrap();

        let mut run = StreamOrchestrator::prepare(
            store.clone(),
            &declaration(false, Some("team")),
            &config,
        )
        .await
        .unwrap();
        run.push_record(&json!({"id": 3, "team": "red"})).await.unwrap();
        run.push_record(&json!({"id": 4, "team": "red"})).await.unwrap();
        run.finalize().await.unwrap();

        let purges = store
            .statements()
            .iter()
            .filter(|s| s.as_str() == "ALTER TABLE `users` DELETE WHERE `team` = 'red'")
            .count();
        assert_eq!(purges, 1);
        assert_eq!(
            store.row_values("users", &["id"]),
            vec![vec![json!(2)], vec![json!(3)], vec![json!(4)]]
        );
    }

    #[tokio::test]
    async fn test_staged_run_swaps_tables() {
        let store = Arc::new(MemoryStore::default());
        let config = IngestConfig::default();

        let mut seed = StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
            .await
            .unwrap();
        seed.push_record(&json!({"id": 9, "tags": ["old"]})).await.unwrap();
        seed.finalize().await.unwrap();

        let mut run = StreamOrchestrator::prepare(store.clone(), &declaration(true, None), &config)
            .await
            .unwrap();
        assert!(run.is_staged());
        run.push_record(&json!({"id": 1, "tags": ["new"]})).await.unwrap();
        assert_eq!(store.row_values("users", &["id"]), vec![vec![json!(9)]]);
        let summary = run.finalize().await.unwrap();

        assert_eq!(summary.version, 1);
        assert_eq!(store.row_values("users", &["id", "_ver"]), vec![vec![json!(1), json!(1)]]);
        assert_eq!(store.row_values("users__tags", &["value"]), vec![vec![json!("new")]]);
        assert!(!store.table_names().iter().any(|t| t.starts_with(STAGING_PREFIX)));
    }

    #[tokio::test]
    async fn test_direct_clean_first_truncates() {
        let store = Arc::new(MemoryStore::default());
        let config = IngestConfig {
            direct_insert: true,
            ..IngestConfig::default()
        };

        let mut seed = StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
            .await
            .unwrap();
        seed.push_record(&json!({"id": 9})).await.unwrap();
        seed.finalize().await.unwrap();

        let mut run = StreamOrchestrator::prepare(store.clone(), &declaration(true, None), &config)
            .await
            .unwrap();
        assert!(!run.is_staged());
        assert!(store.rows("users").is_empty());
        run.push_record(&json!({"id": 1})).await.unwrap();
        run.finalize().await.unwrap();
        assert_eq!(store.row_values("users", &["id"]), vec![vec![json!(1)]]);
    }

    #[tokio::test]
    async fn test_duplicate_keys_fail_integrity() {
        let store = Arc::new(MemoryStore::default().without_optimize());
        let config = IngestConfig::default();
        let mut orchestrator =
            StreamOrchestrator::prepare(store.clone(), &declaration(false, None), &config)
                .await
                .unwrap();
        orchestrator.push_record(&json!({"id": 1})).await.unwrap();
        orchestrator.push_record(&json!({"id": 1})).await.unwrap();

        let err = orchestrator.finalize().await.unwrap_err();
        assert!(matches!(err, SinkError::Integrity { ref table, .. } if table == "users"));
    }
}
