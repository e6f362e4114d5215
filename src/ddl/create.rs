//! CREATE TABLE generation and parsing

use once_cell::sync::Lazy;
use regex::Regex;

use super::drift::{ExistingColumn, expected_columns};
use super::{DdlError, DdlResult};
use crate::models::TableDescriptor;
use crate::naming::{identifier_tuple, quote_identifier, unquote_identifier};

static CREATE_TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^CREATE TABLE IF NOT EXISTS (`(?:[^`\\]|\\.)*`) \((.*)\) ENGINE = (MergeTree|ReplacingMergeTree)\((.*?)\) ORDER BY (tuple\(\)|\(.*\))$",
    )
    .expect("create table pattern is valid")
});

/// Table engine of a generated table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEngine {
    MergeTree,
    ReplacingMergeTree { version_column: String },
}

/// A create statement parsed back into its parts
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCreate {
    pub table_name: String,
    pub columns: Vec<ExistingColumn>,
    pub engine: TableEngine,
    pub order_by: Vec<String>,
}

/// Render the `CREATE TABLE IF NOT EXISTS` statement of one table.
///
/// A key-bearing root uses `ReplacingMergeTree(_ver)` sorted by its OWN
/// keys; every other table is a plain `MergeTree` sorted by all key columns,
/// or `tuple()` when it has none.
pub fn create_table_statement(table: &TableDescriptor) -> String {
    let columns: Vec<String> = expected_columns(table)
        .iter()
        .map(|c| format!("{} {}", quote_identifier(&c.name), c.type_name))
        .collect();

    let engine = if table.is_versioned_root() {
        format!(
            "ReplacingMergeTree({})",
            quote_identifier(table.version_column())
        )
    } else {
        "MergeTree()".to_string()
    };

    let order_by = table.order_by();
    let order_by = if order_by.is_empty() {
        "tuple()".to_string()
    } else {
        identifier_tuple(&order_by)
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY {}",
        quote_identifier(&table.table_name),
        columns.join(", "),
        engine,
        order_by
    )
}

/// Create statements for every table of a tree, parents first
pub fn generate_create_statements(root: &TableDescriptor) -> Vec<String> {
    root.walk().into_iter().map(create_table_statement).collect()
}

/// Parse a statement produced by [`create_table_statement`].
pub fn parse_create_statement(sql: &str) -> DdlResult<ParsedCreate> {
    let caps = CREATE_TABLE_RE
        .captures(sql.trim())
        .ok_or_else(|| DdlError::Parse(sql.to_string()))?;

    let table_name = unquote_identifier(&caps[1]).ok_or_else(|| DdlError::Parse(sql.to_string()))?;

    let order_by = match &caps[5] {
        "tuple()" => Vec::new(),
        list => parse_identifier_list(&list[1..list.len() - 1])
            .ok_or_else(|| DdlError::Parse(sql.to_string()))?,
    };

    let engine = match &caps[3] {
        "ReplacingMergeTree" => TableEngine::ReplacingMergeTree {
            version_column: unquote_identifier(caps[4].trim())
                .ok_or_else(|| DdlError::Parse(sql.to_string()))?,
        },
        _ => TableEngine::MergeTree,
    };

    let mut columns = Vec::new();
    for definition in split_top_level(&caps[2]) {
        let (name, type_name) =
            split_column_definition(definition).ok_or_else(|| DdlError::Parse(sql.to_string()))?;
        columns.push(ExistingColumn {
            is_key: order_by.contains(&name),
            name,
            type_name,
        });
    }

    Ok(ParsedCreate {
        table_name,
        columns,
        engine,
        order_by,
    })
}

/// Split a comma separated list at depth zero, outside quotes
pub(crate) fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in list.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '`' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = list[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Parse a comma separated list of quoted identifiers
pub(crate) fn parse_identifier_list(list: &str) -> Option<Vec<String>> {
    split_top_level(list)
        .into_iter()
        .map(unquote_identifier)
        .collect()
}

/// Split `` `name` Type `` into its name and type
fn split_column_definition(definition: &str) -> Option<(String, String)> {
    let mut escaped = false;
    let end = definition
        .char_indices()
        .skip(1)
        .find(|(_, c)| {
            if escaped {
                escaped = false;
                return false;
            }
            if *c == '\\' {
                escaped = true;
                return false;
            }
            *c == '`'
        })
        .map(|(i, _)| i)?;

    let name = unquote_identifier(&definition[..=end])?;
    let type_name = definition[end + 1..].trim();
    if type_name.is_empty() {
        return None;
    }
    Some((name, type_name.to_string()))
}
