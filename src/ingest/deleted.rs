//! Batching of logical deletes into bulk delete mutations

use serde_json::Value;
use tracing::debug;

use super::{IngestError, IngestResult};
use crate::ddl::statements;
use crate::extract::navigate;
use crate::models::TableDescriptor;
use crate::store::{Query, StoreClient};

/// Accumulates OWN key tuples of deleted records.
///
/// Each flush issues one `ALTER TABLE … DELETE WHERE (keys) IN (…)`.
/// Descendant rows of deleted records become orphans and are purged at
/// finalization.
#[derive(Debug, Clone)]
pub struct DeletedRecordBatcher {
    table: String,
    key_columns: Vec<String>,
    batch_size: usize,
    pending: Vec<Vec<Value>>,
    deleted: u64,
}

impl DeletedRecordBatcher {
    /// Create a batcher for the root table of `descriptor`
    pub fn new(descriptor: &TableDescriptor, batch_size: usize) -> Self {
        Self {
            table: descriptor.table_name.clone(),
            key_columns: descriptor
                .own_keys()
                .iter()
                .map(|k| k.source.clone())
                .collect(),
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            deleted: 0,
        }
    }

    /// Key tuples waiting for the next flush
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Key tuples sent to the store so far
    pub fn deleted(&self) -> u64 {
        self.deleted
    }

    /// Queue the keys of `record`, flushing when the batch is full
    pub async fn push<S: StoreClient + ?Sized>(
        &mut self,
        store: &S,
        record: &Value,
    ) -> IngestResult<()> {
        if self.queue(record)? {
            self.flush(store).await?;
        }
        Ok(())
    }

    /// Queue the keys of `record` without flushing.
    ///
    /// Returns whether the batch is full.
    pub fn queue(&mut self, record: &Value) -> IngestResult<bool> {
        if self.key_columns.is_empty() {
            return Err(IngestError::NoDeleteKey {
                table: self.table.clone(),
            });
        }

        let mut tuple = Vec::with_capacity(self.key_columns.len());
        for column in &self.key_columns {
            let value = navigate(record, &[column]).ok_or_else(|| IngestError::MissingKey {
                table: self.table.clone(),
                column: column.clone(),
            })?;
            tuple.push(value.clone());
        }
        self.pending.push(tuple);
        Ok(self.pending.len() >= self.batch_size)
    }

    /// Send the pending key tuples as one delete mutation
    pub async fn flush<S: StoreClient + ?Sized>(&mut self, store: &S) -> IngestResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let sql = statements::delete_where_in(&self.table, &self.key_columns, &self.pending);
        store.run_query(&Query::idempotent(sql)).await?;

        let count = self.pending.len();
        self.deleted += count as u64;
        self.pending.clear();
        debug!(table = %self.table, count, "Flushed deletes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CompileOptions, compile_schema};
    use crate::store::{InsertStatement, MemoryStore, RowSink};
    use serde_json::json;

    fn tree(keys: &[&str]) -> TableDescriptor {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        compile_schema(
            "t",
            &json!({"type": "object", "properties": {
                "id": {"type": "integer"},
                "name": {"type": "string"}
            }}),
            &keys,
            None,
            &CompileOptions::default(),
        )
        .unwrap()
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::default();
        store
            .run_query(&Query::idempotent(
                "CREATE TABLE IF NOT EXISTS `t` (`id` Int32, `name` Nullable(String), `_ver` UInt64) ENGINE = ReplacingMergeTree(`_ver`) ORDER BY (`id`)",
            ))
            .await
            .unwrap();
        let mut sink = store
            .create_write_stream(&InsertStatement::new(
                "t",
                vec!["id".to_string(), "name".to_string(), "_ver".to_string()],
            ))
            .await
            .unwrap();
        sink.send("[1,\"a\",1]\n[2,\"b\",2]\n[3,\"c\",3]\n".to_string())
            .await
            .unwrap();
        sink.close().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_batches_deletes() {
        let store = seeded().await;
        let mut batcher = DeletedRecordBatcher::new(&tree(&["id"]), 2);

        batcher.push(&store, &json!({"id": 1})).await.unwrap();
        assert_eq!(batcher.pending(), 1);
        assert_eq!(store.rows("t").len(), 3);

        batcher.push(&store, &json!({"id": 3, "name": "c"})).await.unwrap();
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.deleted(), 2);
        assert_eq!(store.row_values("t", &["id"]), vec![vec![json!(2)]]);

        let deletes: Vec<String> = store
            .statements()
            .into_iter()
            .filter(|s| s.contains("DELETE"))
            .collect();
        assert_eq!(deletes, vec!["ALTER TABLE `t` DELETE WHERE (`id`) IN ((1), (3))"]);
    }

    #[tokio::test]
    async fn test_keyless_table_rejects_deletes() {
        let store = MemoryStore::default();
        let mut batcher = DeletedRecordBatcher::new(&tree(&[]), 10);
        assert!(matches!(
            batcher.push(&store, &json!({"id": 1})).await,
            Err(IngestError::NoDeleteKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_immediate_error() {
        let store = MemoryStore::default();
        let mut batcher = DeletedRecordBatcher::new(&tree(&["id"]), 10);
        assert!(matches!(
            batcher.push(&store, &json!({"name": "x"})).await,
            Err(IngestError::MissingKey { .. })
        ));
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_is_silent() {
        let store = MemoryStore::default();
        let mut batcher = DeletedRecordBatcher::new(&tree(&["id"]), 10);
        batcher.flush(&store).await.unwrap();
        assert!(store.statements().is_empty());
    }
}
