//! Per-table batching writer
//!
//! State machine: uninitialized → streaming → closed. The insert stream is
//! opened by the first row, which also starts the idle timer task. A batch is
//! flushed when it reaches the size threshold or when no row arrived for the
//! idle interval. The timer and [`TableWriter::end`] serialize on the writer
//! lock: whichever gets there first flushes, the other finds nothing to do.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use super::{AbortCallback, IngestError, IngestResult, IngestSettings};
use crate::store::{InsertStatement, RowSink, StoreClient};

/// Counters of one writer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriterStats {
    /// Rows sent to the store
    pub rows: u64,
    /// Batches sent to the store
    pub batches: u64,
    /// Batches flushed by the idle timer
    pub idle_flushes: u64,
}

enum WriterState {
    Uninitialized,
    Streaming(Box<dyn RowSink>),
    Closed,
}

struct WriterInner {
    table: String,
    state: WriterState,
    /// Serialized rows waiting for the next flush
    batch: Vec<String>,
    /// Idle deadline; `None` while the batch is empty
    deadline: Option<Instant>,
    /// Failure raised by the timer, reported on the next push or end
    failure: Option<IngestError>,
    stats: WriterStats,
}

impl WriterInner {
    async fn flush(&mut self) -> IngestResult<()> {
        self.deadline = None;
        if self.batch.is_empty() {
            return Ok(());
        }
        let WriterState::Streaming(sink) = &mut self.state else {
            return Err(IngestError::WriterClosed(self.table.clone()));
        };

        let rows = self.batch.len() as u64;
        let mut chunk = String::new();
        for row in self.batch.drain(..) {
            chunk.push_str(&row);
            chunk.push('\n');
        }
        sink.send(chunk).await?;

        self.stats.rows += rows;
        self.stats.batches += 1;
        debug!(table = %self.table, rows, "Flushed batch");
        Ok(())
    }

    /// Timer failures were reported to the abort callback when they happened
    fn check_failure(&self) -> IngestResult<()> {
        match &self.failure {
            Some(failure) => Err(IngestError::Aborted(failure.to_string())),
            None => Ok(()),
        }
    }
}

/// Batching writer of one table
pub struct TableWriter {
    table: String,
    insert: InsertStatement,
    settings: IngestSettings,
    inner: Arc<Mutex<WriterInner>>,
    rearm: Arc<Notify>,
    timer: Option<JoinHandle<()>>,
    on_abort: AbortCallback,
}

impl TableWriter {
    /// Create a writer; nothing is sent until the first row
    pub fn new(
        table: String,
        columns: Vec<String>,
        settings: IngestSettings,
        on_abort: AbortCallback,
    ) -> Self {
        Self {
            insert: InsertStatement::new(table.clone(), columns),
            inner: Arc::new(Mutex::new(WriterInner {
                table: table.clone(),
                state: WriterState::Uninitialized,
                batch: Vec::new(),
                deadline: None,
                failure: None,
                stats: WriterStats::default(),
            })),
            table,
            settings,
            rearm: Arc::new(Notify::new()),
            timer: None,
            on_abort,
        }
    }

    /// Table this writer inserts into
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Rows waiting for the next flush
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.batch.len()
    }

    /// Current counters
    pub async fn stats(&self) -> WriterStats {
        self.inner.lock().await.stats.clone()
    }

    /// Buffer one row, flushing when the batch reaches the threshold.
    ///
    /// The first row opens the insert stream and starts the idle timer.
    pub async fn push<S: StoreClient + ?Sized>(
        &mut self,
        store: &S,
        values: Vec<Value>,
    ) -> IngestResult<()> {
        let result = self.push_inner(store, values).await;
        self.report(&result);
        result
    }

    async fn push_inner<S: StoreClient + ?Sized>(
        &mut self,
        store: &S,
        values: Vec<Value>,
    ) -> IngestResult<()> {
        let row = serde_json::to_string(&Value::Array(values))
            .map_err(|e| IngestError::Serialization(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        inner.check_failure()?;

        match inner.state {
            WriterState::Closed => return Err(IngestError::WriterClosed(self.table.clone())),
            WriterState::Uninitialized => {
                let sink = store.create_write_stream(&self.insert).await?;
                inner.state = WriterState::Streaming(sink);
                debug!(table = %self.table, "Opened insert stream");
                self.timer = Some(self.spawn_timer());
            }
            WriterState::Streaming(_) => {}
        }

        inner.batch.push(row);
        if inner.batch.len() >= self.settings.batch_size {
            return inner.flush().await;
        }

        let was_idle = inner.deadline.is_none();
        inner.deadline = Some(Instant::now() + self.settings.idle_flush);
        if was_idle {
            self.rearm.notify_one();
        }
        Ok(())
    }

    /// Flush the pending batch, keeping the stream open
    pub async fn flush(&mut self) -> IngestResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_failure()?;
        let result = inner.flush().await;
        drop(inner);
        self.report(&result);
        result
    }

    /// Flush, close the stream and wait for the store to acknowledge it.
    ///
    /// Returns the table name with the final counters.
    pub async fn end(&mut self) -> IngestResult<(String, WriterStats)> {
        let mut result = self.end_inner().await;
        self.rearm.notify_one();
        if let Some(timer) = self.timer.take()
            && let Err(e) = join_timer(&self.table, timer).await
            && result.is_ok()
        {
            result = Err(e);
        }
        self.report(&result);
        result.map(|stats| (self.table.clone(), stats))
    }

    fn report<T>(&self, result: &IngestResult<T>) {
        if let Err(e) = result
            && !matches!(e, IngestError::Aborted(_))
        {
            (self.on_abort)(e);
        }
    }

    async fn end_inner(&mut self) -> IngestResult<WriterStats> {
        let mut inner = self.inner.lock().await;
        inner.check_failure()?;
        let flushed = inner.flush().await;
        let state = std::mem::replace(&mut inner.state, WriterState::Closed);
        flushed?;
        if let WriterState::Streaming(sink) = state {
            sink.close().await?;
            debug!(table = %self.table, "Closed insert stream");
        }
        Ok(inner.stats.clone())
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let rearm = Arc::clone(&self.rearm);
        let on_abort = Arc::clone(&self.on_abort);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let guard = inner.lock().await;
                    if matches!(guard.state, WriterState::Closed) || guard.failure.is_some() {
                        return;
                    }
                    guard.deadline
                };

                match deadline {
                    None => rearm.notified().await,
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            _ = rearm.notified() => continue,
                        }
                        let mut guard = inner.lock().await;
                        let expired = guard.deadline.is_some_and(|d| d <= Instant::now());
                        if !expired || !matches!(guard.state, WriterState::Streaming(_)) {
                            continue;
                        }
                        match guard.flush().await {
                            Ok(()) => guard.stats.idle_flushes += 1,
                            Err(e) => {
                                warn!(table = %guard.table, "Idle flush failed: {}", e);
                                on_abort(&e);
                                guard.failure = Some(e);
                                return;
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Wait for the idle timer task; a panic inside it fails the writer
async fn join_timer(table: &str, timer: JoinHandle<()>) -> IngestResult<()> {
    match timer.await {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            warn!(table = %table, "Idle timer task failed: {}", e);
            Err(IngestError::TimerFailed {
                table: table.to_string(),
                message: e.to_string(),
            })
        }
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::statements;
    use crate::ingest::ignore_abort;
    use crate::store::{MemoryStore, Query};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn store_with_table() -> MemoryStore {
        let store = MemoryStore::default();
        store
            .run_query(&Query::idempotent(
                "CREATE TABLE IF NOT EXISTS `t` (`id` Int32, `_root_ver` UInt64) ENGINE = MergeTree() ORDER BY (`id`)",
            ))
            .await
            .unwrap();
        store
    }

    fn writer(batch_size: usize, on_abort: AbortCallback) -> TableWriter {
        TableWriter::new(
            "t".to_string(),
            vec!["id".to_string(), "_root_ver".to_string()],
            IngestSettings {
                batch_size,
                idle_flush: Duration::from_millis(500),
                translate_values: true,
            },
            on_abort,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flushes_exact_batch() {
        let store = store_with_table().await;
        let mut writer = writer(2, ignore_abort());

        for id in 1..=3 {
            writer.push(&store, vec![json!(id), json!(1)]).await.unwrap();
        }
        let stats = writer.stats().await;
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.batches, 1);
        assert_eq!(writer.pending().await, 1);

        let (table, stats) = writer.end().await.unwrap();
        assert_eq!(table, "t");
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.batches, 2);
        assert_eq!(store.rows("t").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_flushes_partial_batch() {
        let store = store_with_table().await;
        let mut writer = writer(100, ignore_abort());

        writer.push(&store, vec![json!(1), json!(1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        writer.push(&store, vec![json!(2), json!(1)]).await.unwrap();

        // Re-armed by the second push: nothing flushed yet
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writer.pending().await, 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writer.pending().await, 0);
        let stats = writer.stats().await;
        assert_eq!(stats.idle_flushes, 1);
        assert_eq!(stats.rows, 2);

        let (_, stats) = writer.end().await.unwrap();
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test]
    async fn test_unused_writer_sends_nothing() {
        let store = store_with_table().await;
        let mut writer = writer(10, ignore_abort());
        let (_, stats) = writer.end().await.unwrap();
        assert_eq!(stats, WriterStats::default());
        assert!(
            !store
                .statements()
                .iter()
                .any(|s| s.starts_with("INSERT"))
        );
    }

    #[tokio::test]
    async fn test_push_after_end_fails() {
        let store = store_with_table().await;
        let mut writer = writer(10, ignore_abort());
        writer.push(&store, vec![json!(1), json!(1)]).await.unwrap();
        writer.end().await.unwrap();
        assert!(matches!(
            writer.push(&store, vec![json!(2), json!(1)]).await,
            Err(IngestError::WriterClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_failure_invokes_abort() {
        let store = store_with_table().await.with_failing_inserts();
        let aborts = Arc::new(AtomicUsize::new(0));
        let counter = aborts.clone();
        let mut writer = writer(
            10,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        writer.push(&store, vec![json!(1), json!(1)]).await.unwrap();
        assert!(writer.end().await.is_err());
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
        assert!(store.rows("t").is_empty());
        assert!(
            store
                .statements()
                .contains(&statements::insert_rows("t", &["id", "_root_ver"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_before_deadline_flushes_once() {
        let store = store_with_table().await;
        let mut writer = writer(100, ignore_abort());

        writer.push(&store, vec![json!(1), json!(1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        let (_, stats) = writer.end().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.idle_flushes, 0);
        assert_eq!(stats.rows, 1);
        assert_eq!(store.rows("t").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_after_idle_flush_sends_nothing_more() {
        let store = store_with_table().await;
        let mut writer = writer(100, ignore_abort());

        writer.push(&store, vec![json!(1), json!(1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let (_, stats) = writer.end().await.unwrap();

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.idle_flushes, 1);
        assert_eq!(store.rows("t").len(), 1);
    }

    #[tokio::test]
    async fn test_timer_panic_is_reported() {
        let timer: JoinHandle<()> = tokio::spawn(async { panic!("timer bug") });
        let err = join_timer("t", timer).await.unwrap_err();
        assert!(matches!(err, IngestError::TimerFailed { ref table, .. } if table == "t"));

        let cancelled = tokio::spawn(std::future::pending::<()>());
        cancelled.abort();
        assert!(join_timer("t", cancelled).await.is_ok());
    }
}
