//! In-memory store implementation
//!
//! Interprets exactly the statements the DDL translator generates against
//! tables held in process memory. `ReplacingMergeTree` tables keep duplicate
//! rows until `OPTIMIZE … FINAL`, like the real engine, so deduplication and
//! orphan purging can be observed end to end.
//!
//! Clones share state, which lets tests keep a handle for inspection while
//! the sink owns another.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{
    ColumnChangeError, ColumnSpec, ExistingColumn, InsertStatement, Query, QueryResult, RowSink,
    StoreClient, StoreError, StoreResult,
};
use crate::ddl::create::{parse_identifier_list, split_top_level};
use crate::ddl::statements::{self, DUPLICATES_ALIAS, MAX_VERSION_ALIAS};
use crate::ddl::{TableEngine, parse_create_statement};
use crate::naming::{sql_literal, sql_tuple, unquote_identifier};

/// Error code reported for unknown tables
const UNKNOWN_TABLE: u32 = 60;
/// Error code reported for statements the store cannot interpret
const SYNTAX_ERROR: u32 = 62;
/// Error code reported for unknown columns
const NO_SUCH_COLUMN: u32 = 16;

macro_rules! statement_re {
    ($pattern:expr) => {
        Lazy::new(|| {
            Regex::new(&$pattern.replace("IDENT", r"`(?:[^`\\]|\\.)*`"))
                .expect("statement pattern is valid")
        })
    };
}

static DROP_RE: Lazy<Regex> = statement_re!(r"^DROP TABLE IF EXISTS (IDENT)$");
static TRUNCATE_RE: Lazy<Regex> = statement_re!(r"^TRUNCATE TABLE IF EXISTS (IDENT)$");
static EXCHANGE_RE: Lazy<Regex> = statement_re!(r"^EXCHANGE TABLES (IDENT) AND (IDENT)$");
static MAX_VERSION_RE: Lazy<Regex> =
    statement_re!(r"^SELECT max\((IDENT)\) AS max_version FROM (IDENT)$");
static OPTIMIZE_RE: Lazy<Regex> = statement_re!(r"^OPTIMIZE TABLE (IDENT) FINAL$");
static DELETE_EQUALS_RE: Lazy<Regex> =
    statement_re!(r"^ALTER TABLE (IDENT) DELETE WHERE (IDENT) (?:= (.+)|IS NULL)$");
static DELETE_ORPHANS_RE: Lazy<Regex> = statement_re!(
    r"^ALTER TABLE (IDENT) DELETE WHERE \((.+?)\) NOT IN \(SELECT (.+) FROM (IDENT)\)$"
);
static DELETE_DESCENDANTS_RE: Lazy<Regex> = statement_re!(
    r"^ALTER TABLE (IDENT) DELETE WHERE \((.+?)\) IN \(SELECT (.+?) FROM (IDENT) WHERE (IDENT) (?:= (.+)|IS NULL)\)$"
);
static DELETE_IN_RE: Lazy<Regex> =
    statement_re!(r"^ALTER TABLE (IDENT) DELETE WHERE \((.+?)\) IN \((.*)\)$");
static DUPLICATES_RE: Lazy<Regex> = statement_re!(
    r"^SELECT (.+), count\(\) AS duplicates FROM (IDENT) GROUP BY .+ HAVING duplicates > 1 LIMIT 1$"
);
static ADD_COLUMN_RE: Lazy<Regex> =
    statement_re!(r"^ALTER TABLE (IDENT) ADD COLUMN IF NOT EXISTS (IDENT) (.+)$");
static MODIFY_COLUMN_RE: Lazy<Regex> =
    statement_re!(r"^ALTER TABLE (IDENT) MODIFY COLUMN (IDENT) (.+)$");
static DROP_COLUMN_RE: Lazy<Regex> = statement_re!(r"^ALTER TABLE (IDENT) DROP COLUMN (IDENT)$");

/// Stored row keyed by column name
pub type Row = Map<String, Value>;

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ExistingColumn>,
    engine: TableEngine,
    rows: Vec<Row>,
    order_by: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    statements: Vec<String>,
    refuse_type_changes: bool,
    fail_inserts: bool,
    skip_optimize: bool,
}

/// In-process store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every column type change
    pub fn with_refused_type_changes(self) -> Self {
        self.lock().refuse_type_changes = true;
        self
    }

    /// Fail every insert stream on close
    pub fn with_failing_inserts(self) -> Self {
        self.lock().fail_inserts = true;
        self
    }

    /// Accept `OPTIMIZE … FINAL` without deduplicating
    pub fn without_optimize(self) -> Self {
        self.lock().skip_optimize = true;
        self
    }

    /// Names of all tables
    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    /// Rows of `table` in storage order; empty when it does not exist
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Rows of `table` projected onto `columns`, one array per row
    pub fn row_values(&self, table: &str, columns: &[&str]) -> Vec<Vec<Value>> {
        self.rows(table)
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect()
    }

    /// Every statement executed so far, inserts included
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn execute(&self, sql: &str) -> StoreResult<QueryResult> {
        let mut state = self.lock();
        state.statements.push(sql.to_string());
        debug!("Memory store executing: {}", sql);

        if sql.starts_with("CREATE TABLE") {
            let parsed = parse_create_statement(sql).map_err(|e| syntax_error(sql, &e.to_string()))?;
            state
                .tables
                .entry(parsed.table_name)
                .or_insert_with(|| MemoryTable {
                    columns: parsed.columns,
                    engine: parsed.engine,
                    rows: Vec::new(),
                    order_by: parsed.order_by,
                });
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DROP_RE.captures(sql) {
            state.tables.remove(&ident(sql, &caps[1])?);
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = TRUNCATE_RE.captures(sql) {
            if let Some(table) = state.tables.get_mut(&ident(sql, &caps[1])?) {
                table.rows.clear();
            }
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = EXCHANGE_RE.captures(sql) {
            let a = ident(sql, &caps[1])?;
            let b = ident(sql, &caps[2])?;
            let first = state.tables.remove(&a).ok_or_else(|| unknown_table(sql, &a))?;
            let Some(second) = state.tables.remove(&b) else {
                state.tables.insert(a, first);
                return Err(unknown_table(sql, &b));
            };
            state.tables.insert(a, second);
            state.tables.insert(b, first);
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = MAX_VERSION_RE.captures(sql) {
            let column = ident(sql, &caps[1])?;
            let table = table_ref(&state, sql, &ident(sql, &caps[2])?)?;
            let max = table
                .rows
                .iter()
                .filter_map(|r| r.get(&column).and_then(|v| v.as_u64()))
                .max()
                .unwrap_or(0);
            let mut row = Map::new();
            row.insert(MAX_VERSION_ALIAS.to_string(), Value::from(max));
            return Ok(QueryResult::new(
                vec![MAX_VERSION_ALIAS.to_string()],
                vec![Value::Object(row)],
            ));
        }

        if let Some(caps) = OPTIMIZE_RE.captures(sql) {
            let name = ident(sql, &caps[1])?;
            let skip = state.skip_optimize;
            let table = table_mut(&mut state, sql, &name)?;
            if !skip && let TableEngine::ReplacingMergeTree { version_column } = &table.engine {
                table.rows = deduplicate(&table.rows, &table.order_by, version_column);
            }
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DELETE_EQUALS_RE.captures(sql) {
            let column = ident(sql, &caps[2])?;
            let literal = caps.get(3).map(|m| m.as_str());
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            table
                .rows
                .retain(|row| !matches_equals(row, &column, literal));
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DELETE_DESCENDANTS_RE.captures(sql) {
            let child_columns = identifiers(sql, &caps[2])?;
            let root_columns = identifiers(sql, &caps[3])?;
            let column = ident(sql, &caps[5])?;
            let literal = caps.get(6).map(|m| m.as_str());
            let targets: HashSet<String> = table_ref(&state, sql, &ident(sql, &caps[4])?)?
                .rows
                .iter()
                .filter(|row| matches_equals(row, &column, literal))
                .map(|row| row_tuple(row, &root_columns))
                .collect();
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            table
                .rows
                .retain(|row| !targets.contains(&row_tuple(row, &child_columns)));
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DELETE_ORPHANS_RE.captures(sql) {
            let child_columns = identifiers(sql, &caps[2])?;
            let root_columns = identifiers(sql, &caps[3])?;
            let root_name = ident(sql, &caps[4])?;
            let surviving: HashSet<String> = table_ref(&state, sql, &root_name)?
                .rows
                .iter()
                .map(|row| row_tuple(row, &root_columns))
                .collect();
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            table
                .rows
                .retain(|row| surviving.contains(&row_tuple(row, &child_columns)));
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DELETE_IN_RE.captures(sql) {
            let columns = identifiers(sql, &caps[2])?;
            let targets: HashSet<&str> = split_top_level(&caps[3]).into_iter().collect();
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            table
                .rows
                .retain(|row| !targets.contains(row_tuple(row, &columns).as_str()));
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DUPLICATES_RE.captures(sql) {
            let columns = identifiers(sql, &caps[1])?;
            let table = table_ref(&state, sql, &ident(sql, &caps[2])?)?;
            let mut counts: HashMap<String, (usize, &Row)> = HashMap::new();
            for row in &table.rows {
                counts.entry(row_tuple(row, &columns)).or_insert((0, row)).0 += 1;
            }
            let rows = counts
                .values()
                .filter(|(count, _)| *count > 1)
                .take(1)
                .map(|(count, row)| {
                    let mut out = Map::new();
                    for column in &columns {
                        out.insert(
                            column.clone(),
                            row.get(column).cloned().unwrap_or(Value::Null),
                        );
                    }
                    out.insert(DUPLICATES_ALIAS.to_string(), Value::from(*count as u64));
                    Value::Object(out)
                })
                .collect();
            let mut names = columns.clone();
            names.push(DUPLICATES_ALIAS.to_string());
            return Ok(QueryResult::new(names, rows));
        }

        if let Some(caps) = ADD_COLUMN_RE.captures(sql) {
            let column = ident(sql, &caps[2])?;
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            if !table.columns.iter().any(|c| c.name == column) {
                table.columns.push(ExistingColumn {
                    name: column,
                    type_name: caps[3].to_string(),
                    is_key: false,
                });
            }
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = MODIFY_COLUMN_RE.captures(sql) {
            let column = ident(sql, &caps[2])?;
            let refuse = state.refuse_type_changes;
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            let existing = table
                .columns
                .iter_mut()
                .find(|c| c.name == column)
                .ok_or_else(|| no_such_column(sql, &column))?;
            if refuse || existing.is_key {
                return Err(StoreError::QueryFailed {
                    statement: sql.to_string(),
                    message: format!("cannot convert column '{}' to {}", column, &caps[3]),
                    code: Some(SYNTAX_ERROR),
                    transient: false,
                });
            }
            existing.type_name = caps[3].to_string();
            return Ok(QueryResult::empty());
        }

        if let Some(caps) = DROP_COLUMN_RE.captures(sql) {
            let column = ident(sql, &caps[2])?;
            let table = table_mut(&mut state, sql, &ident(sql, &caps[1])?)?;
            let position = table
                .columns
                .iter()
                .position(|c| c.name == column)
                .ok_or_else(|| no_such_column(sql, &column))?;
            table.columns.remove(position);
            for row in &mut table.rows {
                row.remove(&column);
            }
            return Ok(QueryResult::empty());
        }

        Err(syntax_error(sql, "statement not supported by the memory store"))
    }

    fn append_rows(&self, insert: &InsertStatement, body: &str) -> StoreResult<usize> {
        let mut state = self.lock();
        let stream_failed = |message: String| StoreError::StreamFailed {
            table: insert.table.clone(),
            message,
        };
        if state.fail_inserts {
            return Err(stream_failed("insert rejected".to_string()));
        }
        let table = state
            .tables
            .get_mut(&insert.table)
            .ok_or_else(|| stream_failed("unknown table".to_string()))?;
        if let Some(missing) = insert
            .columns
            .iter()
            .find(|c| !table.columns.iter().any(|e| &e.name == *c))
        {
            return Err(stream_failed(format!("no column '{}'", missing)));
        }

        let mut parsed = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let values: Vec<Value> = serde_json::from_str(line)
                .map_err(|e| stream_failed(format!("malformed row: {}", e)))?;
            if values.len() != insert.columns.len() {
                return Err(stream_failed(format!(
                    "expected {} values, got {}",
                    insert.columns.len(),
                    values.len()
                )));
            }
            parsed.push(insert.columns.iter().cloned().zip(values).collect::<Row>());
        }
        let count = parsed.len();
        table.rows.extend(parsed);
        Ok(count)
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn run_query(&self, query: &Query) -> StoreResult<QueryResult> {
        self.execute(query.sql.trim())
    }

    async fn create_write_stream(
        &self,
        insert: &InsertStatement,
    ) -> StoreResult<Box<dyn RowSink>> {
        self.lock().statements.push(insert.sql());
        Ok(Box::new(MemoryRowSink {
            store: self.clone(),
            insert: insert.clone(),
            body: String::new(),
        }))
    }

    async fn list_columns(&self, table: &str) -> StoreResult<Vec<ExistingColumn>> {
        Ok(self
            .lock()
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn add_column(
        &self,
        table: &str,
        column: &ColumnSpec,
    ) -> Result<(), ColumnChangeError> {
        self.execute(&statements::add_column(table, &column.name, &column.type_name))
            .map(|_| ())
            .map_err(|e| ColumnChangeError::Add {
                table: table.to_string(),
                column: column.clone(),
                reason: e.to_string(),
            })
    }

    async fn update_column(
        &self,
        table: &str,
        existing: &ExistingColumn,
        desired: &ColumnSpec,
    ) -> Result<(), ColumnChangeError> {
        self.execute(&statements::modify_column(
            table,
            &desired.name,
            &desired.type_name,
        ))
        .map(|_| ())
        .map_err(|e| ColumnChangeError::Update {
            table: table.to_string(),
            existing: existing.clone(),
            desired: desired.clone(),
            reason: e.to_string(),
        })
    }

    async fn remove_column(
        &self,
        table: &str,
        column: &ExistingColumn,
    ) -> Result<(), ColumnChangeError> {
        self.execute(&statements::drop_column(table, &column.name))
            .map(|_| ())
            .map_err(|e| ColumnChangeError::Remove {
                table: table.to_string(),
                column: column.clone(),
                reason: e.to_string(),
            })
    }
}

/// Buffers the insert body and applies it atomically on close
struct MemoryRowSink {
    store: MemoryStore,
    insert: InsertStatement,
    body: String,
}

#[async_trait]
impl RowSink for MemoryRowSink {
    async fn send(&mut self, chunk: String) -> StoreResult<()> {
        self.body.push_str(&chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        let count = self.store.append_rows(&self.insert, &self.body)?;
        debug!("Memory store inserted {} rows into {}", count, self.insert.table);
        Ok(())
    }
}

/// Keep the highest-version row per sorting key; later rows win ties
fn deduplicate(rows: &[Row], order_by: &[String], version_column: &str) -> Vec<Row> {
    let mut kept: Vec<Row> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let key = row_tuple(row, order_by);
        let version = row.get(version_column).and_then(|v| v.as_u64()).unwrap_or(0);
        match index.get(&key) {
            Some(&i) => {
                let current = kept[i]
                    .get(version_column)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if version >= current {
                    kept[i] = row.clone();
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(row.clone());
            }
        }
    }
    kept
}

/// Whether `row` satisfies `column = literal`, or `column IS NULL` without one
fn matches_equals(row: &Row, column: &str, literal: Option<&str>) -> bool {
    let value = row.get(column).unwrap_or(&Value::Null);
    match literal {
        Some(literal) => !value.is_null() && sql_literal(value) == literal,
        None => value.is_null(),
    }
}

fn row_tuple(row: &Row, columns: &[String]) -> String {
    let values: Vec<Value> = columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect();
    sql_tuple(&values)
}

fn ident(sql: &str, quoted: &str) -> StoreResult<String> {
    unquote_identifier(quoted).ok_or_else(|| syntax_error(sql, "malformed identifier"))
}

fn identifiers(sql: &str, list: &str) -> StoreResult<Vec<String>> {
    parse_identifier_list(list).ok_or_else(|| syntax_error(sql, "malformed identifier list"))
}

fn table_ref<'a>(state: &'a MemoryState, sql: &str, name: &str) -> StoreResult<&'a MemoryTable> {
    state
        .tables
        .get(name)
        .ok_or_else(|| unknown_table(sql, name))
}

fn table_mut<'a>(
    state: &'a mut MemoryState,
    sql: &str,
    name: &str,
) -> StoreResult<&'a mut MemoryTable> {
    state
        .tables
        .get_mut(name)
        .ok_or_else(|| unknown_table(sql, name))
}

fn syntax_error(sql: &str, message: &str) -> StoreError {
    StoreError::QueryFailed {
        statement: sql.to_string(),
        message: message.to_string(),
        code: Some(SYNTAX_ERROR),
        transient: false,
    }
}

fn unknown_table(sql: &str, name: &str) -> StoreError {
    StoreError::QueryFailed {
        statement: sql.to_string(),
        message: format!("Table {} does not exist", name),
        code: Some(UNKNOWN_TABLE),
        transient: false,
    }
}

fn no_such_column(sql: &str, name: &str) -> StoreError {
    StoreError::QueryFailed {
        statement: sql.to_string(),
        message: format!("There is no column {}", name),
        code: Some(NO_SUCH_COLUMN),
        transient: false,
    }
}
