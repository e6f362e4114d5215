//! Statements issued during ingestion and finalization
//!
//! Every function returns a single-line statement with quoted identifiers and
//! escaped literals. The in-memory store interprets exactly these shapes.

use serde_json::Value;

use crate::naming::{identifier_tuple, quote_identifier, sql_literal, sql_tuple};

/// Alias of the value returned by [`max_version`]
pub const MAX_VERSION_ALIAS: &str = "max_version";

/// Alias of the count returned by [`find_duplicate_keys`]
pub const DUPLICATES_ALIAS: &str = "duplicates";

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_identifier(table))
}

pub fn truncate_table(table: &str) -> String {
    format!("TRUNCATE TABLE IF EXISTS {}", quote_identifier(table))
}

/// Atomically swap the contents of two tables
pub fn exchange_tables(a: &str, b: &str) -> String {
    format!(
        "EXCHANGE TABLES {} AND {}",
        quote_identifier(a),
        quote_identifier(b)
    )
}

/// Highest version stored in `table`; NULL/0 when empty
pub fn max_version(table: &str, version_column: &str) -> String {
    format!(
        "SELECT max({}) AS {} FROM {}",
        quote_identifier(version_column),
        MAX_VERSION_ALIAS,
        quote_identifier(table)
    )
}

/// Force deduplication of a `ReplacingMergeTree` table
pub fn optimize_final(table: &str) -> String {
    format!("OPTIMIZE TABLE {} FINAL", quote_identifier(table))
}

fn equals_condition(column: &str, value: &Value) -> String {
    match value {
        Value::Null => format!("{} IS NULL", quote_identifier(column)),
        other => format!("{} = {}", quote_identifier(column), sql_literal(other)),
    }
}

/// Delete every row whose `column` equals `value` (`IS NULL` for null)
pub fn delete_where_equals(table: &str, column: &str, value: &Value) -> String {
    format!(
        "ALTER TABLE {} DELETE WHERE {}",
        quote_identifier(table),
        equals_condition(column, value)
    )
}

/// Delete descendant rows of the root rows whose `column` equals `value`.
///
/// Column lists pair up as in [`delete_orphans`].
pub fn delete_descendants_where<S: AsRef<str>>(
    child: &str,
    child_columns: &[S],
    root: &str,
    root_columns: &[S],
    column: &str,
    value: &Value,
) -> String {
    let selected: Vec<String> = root_columns
        .iter()
        .map(|c| quote_identifier(c.as_ref()))
        .collect();
    format!(
        "ALTER TABLE {} DELETE WHERE {} IN (SELECT {} FROM {} WHERE {})",
        quote_identifier(child),
        identifier_tuple(child_columns),
        selected.join(", "),
        quote_identifier(root),
        equals_condition(column, value)
    )
}

/// Delete every row whose key tuple is one of `tuples`
pub fn delete_where_in<S: AsRef<str>>(table: &str, columns: &[S], tuples: &[Vec<Value>]) -> String {
    let rendered: Vec<String> = tuples.iter().map(|t| sql_tuple(t)).collect();
    format!(
        "ALTER TABLE {} DELETE WHERE {} IN ({})",
        quote_identifier(table),
        identifier_tuple(columns),
        rendered.join(", ")
    )
}

/// Delete descendant rows whose root key and version no longer exist.
///
/// # Arguments
///
/// * `child` - Descendant table
/// * `child_columns` - ROOT_REF columns followed by `_root_ver`
/// * `root` - Root table
/// * `root_columns` - Root OWN columns followed by `_ver`, same order
pub fn delete_orphans<S: AsRef<str>>(
    child: &str,
    child_columns: &[S],
    root: &str,
    root_columns: &[S],
) -> String {
    let selected: Vec<String> = root_columns
        .iter()
        .map(|c| quote_identifier(c.as_ref()))
        .collect();
    format!(
        "ALTER TABLE {} DELETE WHERE {} NOT IN (SELECT {} FROM {})",
        quote_identifier(child),
        identifier_tuple(child_columns),
        selected.join(", "),
        quote_identifier(root)
    )
}

/// Probe for one key tuple occurring more than once
pub fn find_duplicate_keys<S: AsRef<str>>(table: &str, columns: &[S]) -> String {
    let quoted: Vec<String> = columns
        .iter()
        .map(|c| quote_identifier(c.as_ref()))
        .collect();
    let list = quoted.join(", ");
    format!(
        "SELECT {}, count() AS {} FROM {} GROUP BY {} HAVING {} > 1 LIMIT 1",
        list,
        DUPLICATES_ALIAS,
        quote_identifier(table),
        list,
        DUPLICATES_ALIAS
    )
}

/// Header of a streaming insert; rows follow as one JSON array per line
pub fn insert_rows<S: AsRef<str>>(table: &str, columns: &[S]) -> String {
    format!(
        "INSERT INTO {} {} FORMAT JSONCompactEachRow",
        quote_identifier(table),
        identifier_tuple(columns)
    )
}

pub fn add_column(table: &str, column: &str, type_name: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        quote_identifier(table),
        quote_identifier(column),
        type_name
    )
}

pub fn modify_column(table: &str, column: &str, type_name: &str) -> String {
    format!(
        "ALTER TABLE {} MODIFY COLUMN {} {}",
        quote_identifier(table),
        quote_identifier(column),
        type_name
    )
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_identifier(table),
        quote_identifier(column)
    )
}
