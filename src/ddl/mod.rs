//! DDL and drift translation
//!
//! Pure functions from descriptor trees to the statements the sink issues,
//! plus the column diff used to reconcile an existing table with its
//! descriptor. Nothing here talks to a store.

pub mod create;
pub mod drift;
pub mod statements;

pub use create::{
    ParsedCreate, TableEngine, create_table_statement, generate_create_statements,
    parse_create_statement,
};
pub use drift::{ColumnSpec, ExistingColumn, SchemaDrift, compute_drift, expected_columns};

/// Error type for statement parsing
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DdlError {
    /// Statement does not have the expected shape
    #[error("Cannot parse statement: {0}")]
    Parse(String),
}

/// Result type for DDL operations
pub type DdlResult<T> = Result<T, DdlError>;
