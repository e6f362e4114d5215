//! Schema compilation
//!
//! Turns a stream's JSON Schema plus its declared key properties into a tree
//! of [`TableDescriptor`](crate::models::TableDescriptor)s. Compilation is
//! pure: no I/O, no logging side effects beyond a summary line.

pub mod compiler;
pub mod types;

pub use compiler::{SchemaCompiler, compile_schema};

/// Default total digits of `number` columns
pub const DEFAULT_DECIMAL_PRECISION: u8 = 10;
/// Default fractional digits of `number` columns
pub const DEFAULT_DECIMAL_SCALE: u8 = 2;

/// Error type for schema compilation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Type/format combination without a storage mapping
    #[error("Unsupported type '{type_name}'{} at '{path}'", format_suffix(.format))]
    UnsupportedType {
        path: String,
        type_name: String,
        format: Option<String>,
    },

    /// Declared key property cannot be used as a key
    #[error("Invalid key property '{property}': {reason}")]
    InvalidKey { property: String, reason: String },

    /// Table without key and value columns
    #[error("Table '{path}' has no columns")]
    EmptyTable { path: String },

    /// Two nodes produced the same table name
    #[error("Duplicate table name '{0}'")]
    DuplicateTable(String),

    /// Two columns of one table share a name
    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    /// Cleaning column requested together with direct insert
    #[error("Cleaning column '{column}' cannot be combined with direct insert")]
    ConflictingCleaning { column: String },

    /// Cleaning column is not a root column
    #[error("Cleaning column '{0}' is not a column of the root table")]
    UnknownCleaningColumn(String),

    /// Structurally invalid schema
    #[error("Invalid schema at '{path}': {reason}")]
    InvalidSchema { path: String, reason: String },
}

fn format_suffix(format: &Option<String>) -> String {
    format
        .as_ref()
        .map(|f| format!(" with format '{}'", f))
        .unwrap_or_default()
}

/// Result type for schema compilation
pub type CompileResult<T> = Result<T, CompileError>;

/// Options controlling compilation
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    /// Insert straight into canonical tables for clean-first runs
    pub direct_insert: bool,
    /// Precision of `number` columns without a `precision` keyword
    pub decimal_precision: u8,
    /// Scale of `number` columns without a `scale` keyword
    pub decimal_scale: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            direct_insert: false,
            decimal_precision: DEFAULT_DECIMAL_PRECISION,
            decimal_scale: DEFAULT_DECIMAL_SCALE,
        }
    }
}
