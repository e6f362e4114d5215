//! Table descriptor model
//!
//! A [`TableDescriptor`] is one node of the tree the schema compiler produces:
//! one node per destination table, children for every array-typed property.
//! Trees are built once per schema message and never mutated afterwards;
//! staging variants are derived with [`TableDescriptor::with_name_prefix`].

use serde::{Deserialize, Serialize};

use super::column::{KeyColumn, ValueColumn};
use super::enums::KeyRole;
use crate::naming::{MAX_TABLE_NAME_LENGTH, bound_identifier};

/// Version column of a key-bearing root table
pub const ROOT_VERSION_COLUMN: &str = "_ver";
/// Version column of every other table
pub const DESCENDANT_VERSION_COLUMN: &str = "_root_ver";

/// Descriptor of one destination table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDescriptor {
    /// Dotted path of the originating schema node
    pub source_path: String,
    /// Escaped, length-bounded table name
    pub table_name: String,
    /// Property path from the parent element to this table's array.
    /// Empty for the root and for items of a directly nested array.
    pub array_path: Vec<String>,
    /// Array nesting depth (0 for the root)
    pub depth: usize,
    /// Key columns in their fixed order
    pub key_columns: Vec<KeyColumn>,
    /// Value columns in schema order
    pub columns: Vec<ValueColumn>,
    /// Child tables, one per array-typed property
    #[serde(default)]
    pub children: Vec<TableDescriptor>,
    /// Column whose newly observed values purge matching rows before insert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaning_column: Option<String>,
}

impl TableDescriptor {
    /// Whether this is the root table of a stream
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Whether the table declares at least one OWN key column
    pub fn is_key_bearing(&self) -> bool {
        self.key_columns.iter().any(|k| k.role == KeyRole::Own)
    }

    /// OWN key columns in declaration order
    pub fn own_keys(&self) -> Vec<&KeyColumn> {
        self.key_columns
            .iter()
            .filter(|k| k.role == KeyRole::Own)
            .collect()
    }

    /// Whether rows are deduplicated by version (`ReplacingMergeTree`)
    pub fn is_versioned_root(&self) -> bool {
        self.is_root() && self.is_key_bearing()
    }

    /// Name of the version column
    pub fn version_column(&self) -> &'static str {
        if self.is_versioned_root() {
            ROOT_VERSION_COLUMN
        } else {
            DESCENDANT_VERSION_COLUMN
        }
    }

    /// Sorting key columns
    ///
    /// OWN columns at a key-bearing root, otherwise all key columns in their
    /// fixed order. Empty means `tuple()`.
    pub fn order_by(&self) -> Vec<String> {
        if self.is_versioned_root() {
            self.own_keys().iter().map(|k| k.name.clone()).collect()
        } else {
            self.key_columns.iter().map(|k| k.name.clone()).collect()
        }
    }

    /// Columns in row serialization order: keys, values, version
    pub fn insert_columns(&self) -> Vec<String> {
        self.key_columns
            .iter()
            .map(|k| k.name.clone())
            .chain(self.columns.iter().map(|c| c.name.clone()))
            .chain(std::iter::once(self.version_column().to_string()))
            .collect()
    }

    /// Look up a value column by name
    pub fn column(&self, name: &str) -> Option<&ValueColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// All tables of the tree, depth-first, parents before children
    pub fn walk(&self) -> Vec<&TableDescriptor> {
        let mut tables = vec![self];
        for child in &self.children {
            tables.extend(child.walk());
        }
        tables
    }

    /// All tables below this one
    pub fn descendants(&self) -> Vec<&TableDescriptor> {
        self.walk().into_iter().skip(1).collect()
    }

    /// Find a table of the tree by name
    pub fn find(&self, table_name: &str) -> Option<&TableDescriptor> {
        self.walk().into_iter().find(|t| t.table_name == table_name)
    }

    /// Derive a copy of the tree whose table names carry `prefix`.
    ///
    /// The original tree is left untouched; names are re-bounded after
    /// prefixing.
    pub fn with_name_prefix(&self, prefix: &str) -> TableDescriptor {
        TableDescriptor {
            table_name: bound_identifier(
                &format!("{}{}", prefix, self.table_name),
                MAX_TABLE_NAME_LENGTH,
            ),
            children: self
                .children
                .iter()
                .map(|c| c.with_name_prefix(prefix))
                .collect(),
            ..self.clone()
        }
    }
}
