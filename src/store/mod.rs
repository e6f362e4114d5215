//! Store client abstraction
//!
//! The sink talks to the columnar store only through [`StoreClient`]:
//! statements, streaming inserts, column introspection and the three column
//! change primitives drift reconciliation is built from.
//!
//! Two implementations ship with the crate:
//! - [`ClickHouseStore`]: the ClickHouse HTTP interface
//! - [`MemoryStore`]: an in-process store used by tests and dry runs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod clickhouse;
pub mod memory;
pub mod retry;

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::MemoryStore;
pub use crate::ddl::{ColumnSpec, ExistingColumn};
pub use retry::RetryPolicy;

use crate::ddl::statements;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Statement was rejected
    #[error("Query failed: {message} (statement: {statement})")]
    QueryFailed {
        statement: String,
        message: String,
        /// Store-specific error code, when reported
        code: Option<u32>,
        /// Whether repeating the statement may succeed
        transient: bool,
    },

    /// Insert stream failed; inserts are never retried
    #[error("Insert stream into '{table}' failed: {message}")]
    StreamFailed { table: String, message: String },

    /// Store answered with something unparsable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StoreError {
    /// Whether the failure may go away on retry
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) => true,
            StoreError::QueryFailed { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Refused column change, carrying the column involved
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ColumnChangeError {
    #[error("Cannot add column '{}' to '{table}': {reason}", .column.name)]
    Add {
        table: String,
        column: ColumnSpec,
        reason: String,
    },

    #[error("Cannot change column '{}' of '{table}' from {} to {}: {reason}", .existing.name, .existing.type_name, .desired.type_name)]
    Update {
        table: String,
        existing: ExistingColumn,
        desired: ColumnSpec,
        reason: String,
    },

    #[error("Cannot remove column '{}' from '{table}': {reason}", .column.name)]
    Remove {
        table: String,
        column: ExistingColumn,
        reason: String,
    },
}

/// A statement plus its retry classification
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    /// Safe to repeat after a transient failure
    pub idempotent: bool,
}

impl Query {
    /// Statement that may be retried
    pub fn idempotent(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            idempotent: true,
        }
    }

    /// Statement that must run at most once
    pub fn once(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            idempotent: false,
        }
    }

    /// Whether the statement returns rows
    pub fn is_select(&self) -> bool {
        self.sql
            .trim_start()
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("select"))
    }
}

/// Target of a streaming insert
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    /// Columns in row serialization order
    pub columns: Vec<String>,
}

impl InsertStatement {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// Statement header sent before the rows
    pub fn sql(&self) -> String {
        statements::insert_rows(&self.table, &self.columns)
    }
}

/// Query result row as a JSON object keyed by column name
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
    /// Number of rows affected, when reported
    pub rows_affected: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the first row
    pub fn first_value(&self, column: &str) -> Option<&serde_json::Value> {
        self.rows.first().and_then(|row| row.get(column))
    }
}

/// Open insert stream; rows are sent as newline-terminated chunks
#[async_trait]
pub trait RowSink: Send {
    /// Send a chunk of serialized rows
    async fn send(&mut self, chunk: String) -> StoreResult<()>;

    /// Finish the insert and wait for the store to acknowledge it
    async fn close(self: Box<Self>) -> StoreResult<()>;
}

/// Store client contract
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Execute a statement
    ///
    /// Idempotent queries are retried on transient failures; errors carry the
    /// statement.
    async fn run_query(&self, query: &Query) -> StoreResult<QueryResult>;

    /// Open a streaming insert
    async fn create_write_stream(&self, insert: &InsertStatement)
    -> StoreResult<Box<dyn RowSink>>;

    /// Columns of `table` in table order; empty when the table does not exist
    async fn list_columns(&self, table: &str) -> StoreResult<Vec<ExistingColumn>>;

    /// Add a column
    async fn add_column(&self, table: &str, column: &ColumnSpec)
    -> Result<(), ColumnChangeError>;

    /// Change the type of a column
    async fn update_column(
        &self,
        table: &str,
        existing: &ExistingColumn,
        desired: &ColumnSpec,
    ) -> Result<(), ColumnChangeError>;

    /// Drop a column
    async fn remove_column(
        &self,
        table: &str,
        column: &ExistingColumn,
    ) -> Result<(), ColumnChangeError>;
}
