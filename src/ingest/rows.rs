//! Row planning: one record to rows across the descriptor tree
//!
//! Rows are emitted parents first. Each row holds the key columns in their
//! fixed order, then the value columns, then the record's version.

use serde_json::Value;

use super::{IngestError, IngestResult};
use crate::extract::{extract_value, navigate};
use crate::models::{KeyColumn, KeyRole, TableDescriptor};

/// A row destined for one table
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRow {
    pub table: String,
    /// Values in insert column order
    pub values: Vec<Value>,
}

/// Where the current element sits in the record
struct RowContext<'a> {
    /// Element at each depth, the record itself at 0
    elements: Vec<&'a Value>,
    /// Position within the parent array at each depth from 1
    positions: Vec<usize>,
}

impl<'a> RowContext<'a> {
    fn root(record: &'a Value) -> Self {
        Self {
            elements: vec![record],
            positions: Vec::new(),
        }
    }

    fn descend(&self, element: &'a Value, position: usize) -> Self {
        let mut elements = self.elements.clone();
        elements.push(element);
        let mut positions = self.positions.clone();
        positions.push(position);
        Self {
            elements,
            positions,
        }
    }

    fn element(&self) -> &'a Value {
        self.elements[self.elements.len() - 1]
    }

    fn key_value(&self, key: &KeyColumn) -> Option<Value> {
        match key.role {
            KeyRole::LevelIndex => key
                .depth
                .checked_sub(1)
                .and_then(|i| self.positions.get(i))
                .map(|p| Value::from(*p as u64)),
            KeyRole::RootRef => self.own_key_at(0, &key.source),
            KeyRole::ParentRef | KeyRole::Own => self.own_key_at(key.depth, &key.source),
        }
    }

    fn own_key_at(&self, depth: usize, source: &str) -> Option<Value> {
        self.elements
            .get(depth)
            .and_then(|element| navigate(element, &[source]))
            .cloned()
    }
}

/// Plan every row `record` produces.
///
/// # Arguments
///
/// * `root` - Root descriptor of the stream
/// * `record` - Incoming record
/// * `version` - Version stamped on every row of the record
/// * `translate` - Coerce values to their column types
///
/// # Errors
///
/// [`IngestError::MissingKey`] for the first key column without a value.
pub fn plan_rows(
    root: &TableDescriptor,
    record: &Value,
    version: u64,
    translate: bool,
) -> IngestResult<Vec<PlannedRow>> {
    let mut rows = Vec::new();
    visit(root, &RowContext::root(record), version, translate, &mut rows)?;
    Ok(rows)
}

fn visit(
    table: &TableDescriptor,
    ctx: &RowContext<'_>,
    version: u64,
    translate: bool,
    rows: &mut Vec<PlannedRow>,
) -> IngestResult<()> {
    let element = ctx.element();
    let mut values = Vec::with_capacity(table.key_columns.len() + table.columns.len() + 1);

    for key in &table.key_columns {
        let value = ctx
            .key_value(key)
            .ok_or_else(|| IngestError::MissingKey {
                table: table.table_name.clone(),
                column: key.name.clone(),
            })?;
        values.push(value);
    }
    for column in &table.columns {
        values.push(extract_value(element, column, translate).unwrap_or(Value::Null));
    }
    values.push(Value::from(version));

    rows.push(PlannedRow {
        table: table.table_name.clone(),
        values,
    });

    for child in &table.children {
        let Some(Value::Array(items)) = navigate(element, &child.array_path) else {
            continue;
        };
        for (position, item) in items.iter().enumerate() {
            visit(child, &ctx.descend(item, position), version, translate, rows)?;
        }
    }
    Ok(())
}
