//! Column drift between a descriptor and an existing table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{StorageType, TableDescriptor};

/// Column as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingColumn {
    pub name: String,
    /// Type name as reported, e.g. `Nullable(String)`
    pub type_name: String,
    /// Whether the column is part of the sorting key
    pub is_key: bool,
}

/// Column as the descriptor expects it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub type_name: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Column operations needed to bring a table in line with its descriptor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDrift {
    /// Columns missing from the table
    pub add: Vec<ColumnSpec>,
    /// Columns present with a different type
    pub update: Vec<(ExistingColumn, ColumnSpec)>,
    /// Columns the descriptor no longer has
    pub remove: Vec<ExistingColumn>,
}

impl SchemaDrift {
    /// Whether no column operation is needed
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// Expected columns of a table: keys, values, version.
///
/// Key columns are never nullable; value columns are `Nullable(..)` wrapped
/// when the descriptor says so.
pub fn expected_columns(table: &TableDescriptor) -> Vec<ColumnSpec> {
    table
        .key_columns
        .iter()
        .map(|k| ColumnSpec::new(&k.name, k.sql_type()))
        .chain(
            table
                .columns
                .iter()
                .map(|c| ColumnSpec::new(&c.name, c.sql_type())),
        )
        .chain(std::iter::once(ColumnSpec::new(
            table.version_column(),
            StorageType::UInt64.sql_type(false),
        )))
        .collect()
}

/// Compute the drift between a descriptor and the store's columns.
///
/// Both sides are keyed by name, so results come out sorted by column name.
/// Types are compared with all whitespace removed.
pub fn compute_drift(table: &TableDescriptor, existing: &[ExistingColumn]) -> SchemaDrift {
    let expected: BTreeMap<String, ColumnSpec> = expected_columns(table)
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();
    let actual: BTreeMap<&str, &ExistingColumn> =
        existing.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut drift = SchemaDrift::default();
    for (name, spec) in &expected {
        match actual.get(name.as_str()) {
            None => drift.add.push(spec.clone()),
            Some(current) if !same_type(&current.type_name, &spec.type_name) => {
                drift.update.push(((*current).clone(), spec.clone()))
            }
            Some(_) => {}
        }
    }
    for (name, current) in &actual {
        if !expected.contains_key(*name) {
            drift.remove.push((*current).clone());
        }
    }
    drift
}

fn same_type(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    strip(a) == strip(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CompileOptions, compile_schema};
    use serde_json::json;

    fn users() -> TableDescriptor {
        let schema = json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": ["null", "string"]},
                "score": {"type": "number"}
            }
        });
        compile_schema(
            "users",
            &schema,
            &["id".to_string()],
            None,
            &CompileOptions::default(),
        )
        .unwrap()
    }

    fn existing(name: &str, type_name: &str) -> ExistingColumn {
        ExistingColumn {
            name: name.to_string(),
            type_name: type_name.to_string(),
            is_key: false,
        }
    }

    #[test]
    fn test_expected_columns() {
        let columns = expected_columns(&users());
        let rendered: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.type_name))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "id Int32",
                "name Nullable(String)",
                "score Decimal(10, 2)",
                "_ver UInt64"
            ]
        );
    }

    #[test]
    fn test_no_drift_ignores_whitespace() {
        let current = vec![
            existing("_ver", "UInt64"),
            existing("id", "Int32"),
            existing("name", "Nullable(String)"),
            existing("score", "Decimal(10,2)"),
        ];
        assert!(compute_drift(&users(), &current).is_empty());
    }

    #[test]
    fn test_add_update_remove() {
        let current = vec![
            existing("id", "Int32"),
            existing("name", "String"),
            existing("legacy", "String"),
            existing("_ver", "UInt64"),
        ];
        let drift = compute_drift(&users(), &current);

        assert_eq!(drift.add, vec![ColumnSpec::new("score", "Decimal(10, 2)")]);
        assert_eq!(drift.update.len(), 1);
        assert_eq!(drift.update[0].0.name, "name");
        assert_eq!(drift.update[0].1.type_name, "Nullable(String)");
        assert_eq!(drift.remove, vec![existing("legacy", "String")]);
    }

    #[test]
    fn test_drift_is_sorted_by_name() {
        let drift = compute_drift(&users(), &[]);
        let names: Vec<&str> = drift.add.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_ver", "id", "name", "score"]);
    }
}
